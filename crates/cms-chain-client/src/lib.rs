//! # cms-chain-client -- Typed HTTP client for the ledger APIs
//!
//! Implements the [`ChainReader`] and [`ChainWriter`] ports from `cms-core`
//! against two REST services:
//!
//! | Method | Path | Operation |
//! |--------|------|-----------|
//! | GET    | `{reader}/tip` | Chain tip and sync flag |
//! | GET    | `{reader}/tx/{hash}` | Transaction details, 404 if unseen |
//! | POST   | `{submit}/tx/submit` | Submit CBOR transaction bytes |
//!
//! The submit endpoint selects inputs, balances fees and signs for the
//! source address passed in the `x-source-address` header. No keys are held
//! here.
//!
//! The two GETs are idempotent and retried with exponential backoff on
//! transport failures, 5xx and 429, up to `read_attempts` in total.
//! Submission is never retried: a lost response does not prove the node
//! rejected the transaction.

pub mod config;
pub mod error;
pub mod types;

pub use config::ChainClientConfig;
pub use error::ChainClientError;

use std::time::Duration;

use async_trait::async_trait;
use cms_core::{
    ChainError, ChainReader, ChainTip, ChainWriter, FinalityTier, OnChainTxDetails,
    SubmissionReceipt,
};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use url::Url;

use crate::types::{SubmitResponse, TipResponse, TxDetailsResponse};

const CBOR_CONTENT_TYPE: &str = "application/cbor";
const SOURCE_ADDRESS_HEADER: &str = "x-source-address";

/// HTTP client for the follower and submit APIs.
#[derive(Debug, Clone)]
pub struct ChainHttpClient {
    http: reqwest::Client,
    reader_url: Url,
    submit_url: Url,
    read_attempts: u32,
    retry_base: Duration,
}

impl ChainHttpClient {
    pub fn new(config: ChainClientConfig) -> Result<Self, ChainClientError> {
        let mut headers = HeaderMap::new();
        if let Some(key) = &config.api_key {
            headers.insert(
                "x-api-key",
                HeaderValue::from_str(key.as_str())
                    .map_err(|_| ChainClientError::Config(crate::config::ConfigError::InvalidApiKey))?,
            );
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| ChainClientError::Http {
                endpoint: "client_init".into(),
                source: e,
            })?;

        Ok(Self {
            http,
            reader_url: config.reader_url,
            submit_url: config.submit_url,
            read_attempts: config.read_attempts.max(1),
            retry_base: Duration::from_millis(config.retry_base_ms),
        })
    }

    fn url(base: &Url, path: &str) -> String {
        format!("{}/{path}", base.as_str().trim_end_matches('/'))
    }

    /// GET `url`, retrying transport failures and transient statuses. The
    /// final response is returned whatever its status.
    async fn get_idempotent(
        &self,
        endpoint: &str,
        url: &str,
    ) -> Result<reqwest::Response, ChainClientError> {
        let mut attempt = 1;
        loop {
            let outcome = self.http.get(url).send().await;
            let transient = match &outcome {
                Ok(resp) => {
                    resp.status().is_server_error()
                        || resp.status() == StatusCode::TOO_MANY_REQUESTS
                }
                Err(_) => true,
            };
            if !transient || attempt >= self.read_attempts {
                return outcome.map_err(|e| ChainClientError::Http {
                    endpoint: endpoint.into(),
                    source: e,
                });
            }

            let delay = self.retry_base * 2u32.saturating_pow(attempt - 1);
            match &outcome {
                Ok(resp) => tracing::warn!(
                    endpoint,
                    attempt,
                    status = resp.status().as_u16(),
                    "chain API read failed, retrying in {delay:?}"
                ),
                Err(e) => tracing::warn!(
                    endpoint,
                    attempt,
                    error = %e,
                    "chain API read failed, retrying in {delay:?}"
                ),
            }
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn api_error(endpoint: impl Into<String>, resp: reqwest::Response) -> ChainClientError {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        ChainClientError::ApiError {
            endpoint: endpoint.into(),
            status,
            body,
        }
    }

    /// Calls `GET {reader}/tip`.
    pub async fn tip(&self) -> Result<TipResponse, ChainClientError> {
        let endpoint = "GET /tip";
        let url = Self::url(&self.reader_url, "tip");

        let resp = self.get_idempotent(endpoint, &url).await?;
        if !resp.status().is_success() {
            return Err(Self::api_error(endpoint, resp).await);
        }

        resp.json().await.map_err(|e| ChainClientError::Deserialization {
            endpoint: endpoint.into(),
            source: e,
        })
    }

    /// Calls `GET {reader}/tx/{hash}`. `None` when the node has not seen it.
    pub async fn transaction(
        &self,
        transaction_hash: &str,
    ) -> Result<Option<TxDetailsResponse>, ChainClientError> {
        let endpoint = format!("GET /tx/{transaction_hash}");
        let url = Self::url(&self.reader_url, &format!("tx/{transaction_hash}"));

        let resp = self.get_idempotent(&endpoint, &url).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Self::api_error(endpoint, resp).await);
        }

        resp.json()
            .await
            .map(Some)
            .map_err(|e| ChainClientError::Deserialization {
                endpoint,
                source: e,
            })
    }

    /// Calls `POST {submit}/tx/submit` with the raw transaction bytes.
    pub async fn submit_bytes(
        &self,
        tx_bytes: &[u8],
        from_address: &str,
    ) -> Result<SubmitResponse, ChainClientError> {
        let endpoint = "POST /tx/submit";
        let url = Self::url(&self.submit_url, "tx/submit");

        let resp = self
            .http
            .post(&url)
            .header(CONTENT_TYPE, CBOR_CONTENT_TYPE)
            .header(SOURCE_ADDRESS_HEADER, from_address)
            .body(tx_bytes.to_vec())
            .send()
            .await
            .map_err(|e| ChainClientError::Http {
                endpoint: endpoint.into(),
                source: e,
            })?;

        if !resp.status().is_success() {
            return Err(Self::api_error(endpoint, resp).await);
        }

        resp.json().await.map_err(|e| ChainClientError::Deserialization {
            endpoint: endpoint.into(),
            source: e,
        })
    }
}

#[async_trait]
impl ChainReader for ChainHttpClient {
    async fn chain_tip(&self) -> Result<ChainTip, ChainError> {
        let tip = self.tip().await?;
        Ok(ChainTip {
            absolute_slot: tip.absolute_slot,
            synced: tip.synced,
        })
    }

    async fn tx_details(
        &self,
        transaction_hash: &str,
    ) -> Result<Option<OnChainTxDetails>, ChainError> {
        let Some(details) = self.transaction(transaction_hash).await? else {
            return Ok(None);
        };
        let finality = details
            .finality
            .parse::<FinalityTier>()
            .map_err(|e| ChainError::Malformed(e.to_string()))?;
        Ok(Some(OnChainTxDetails {
            transaction_hash: details.transaction_hash,
            absolute_slot: details.absolute_slot,
            finality,
        }))
    }
}

#[async_trait]
impl ChainWriter for ChainHttpClient {
    async fn submit(
        &self,
        tx_bytes: &[u8],
        from_address: &str,
    ) -> Result<SubmissionReceipt, ChainError> {
        let resp = self.submit_bytes(tx_bytes, from_address).await?;
        tracing::debug!(tx_hash = %resp.transaction_hash, bytes = tx_bytes.len(), "submit API accepted transaction");
        Ok(SubmissionReceipt {
            transaction_hash: resp.transaction_hash,
            absolute_slot: resp.absolute_slot,
        })
    }
}
