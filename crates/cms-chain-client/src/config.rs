//! Chain API client configuration.
//!
//! The reader (follower) and submit services may live on different hosts.
//! Both default to a local node. Override via environment variables or
//! explicit construction for tests.

use url::Url;
use zeroize::Zeroizing;

/// Configuration for the chain reader and submit APIs.
///
/// Custom `Debug` implementation redacts the `api_key` field
/// to prevent credential leakage in log output.
#[derive(Clone)]
pub struct ChainClientConfig {
    /// Base URL of the follower API (tip and transaction lookups).
    pub reader_url: Url,
    /// Base URL of the transaction submit API.
    pub submit_url: Url,
    /// Sent as `x-api-key` when present.
    pub api_key: Option<Zeroizing<String>>,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    /// Total attempts for tip and transaction lookups, at least 1.
    pub read_attempts: u32,
    /// First retry delay in milliseconds, doubled per further attempt.
    pub retry_base_ms: u64,
}

impl std::fmt::Debug for ChainClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainClientConfig")
            .field("reader_url", &self.reader_url)
            .field("submit_url", &self.submit_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("timeout_secs", &self.timeout_secs)
            .field("read_attempts", &self.read_attempts)
            .field("retry_base_ms", &self.retry_base_ms)
            .finish()
    }
}

impl ChainClientConfig {
    /// Load configuration from environment variables.
    ///
    /// Variables:
    /// - `CMS_CHAIN_READER_URL` (default: `http://127.0.0.1:8090`)
    /// - `CMS_CHAIN_SUBMIT_URL` (default: `http://127.0.0.1:8090`)
    /// - `CMS_CHAIN_API_KEY` (optional)
    /// - `CMS_CHAIN_TIMEOUT_SECS` (default: 30)
    /// - `CMS_CHAIN_READ_ATTEMPTS` (default: 4)
    /// - `CMS_CHAIN_RETRY_BASE_MS` (default: 200)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read_attempts: u32 = env_number(&lookup, "CMS_CHAIN_READ_ATTEMPTS", 4)?;
        if read_attempts == 0 {
            return Err(ConfigError::InvalidNumber(
                "CMS_CHAIN_READ_ATTEMPTS".into(),
                "0".into(),
            ));
        }
        Ok(Self {
            reader_url: env_url(&lookup, "CMS_CHAIN_READER_URL", "http://127.0.0.1:8090")?,
            submit_url: env_url(&lookup, "CMS_CHAIN_SUBMIT_URL", "http://127.0.0.1:8090")?,
            api_key: lookup("CMS_CHAIN_API_KEY")
                .filter(|key| !key.is_empty())
                .map(Zeroizing::new),
            timeout_secs: env_number(&lookup, "CMS_CHAIN_TIMEOUT_SECS", 30)?,
            read_attempts,
            retry_base_ms: env_number(&lookup, "CMS_CHAIN_RETRY_BASE_MS", 200)?,
        })
    }

    /// Both APIs served by one local mock server (for testing).
    pub fn local_mock(base_url: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(base_url)
            .map_err(|e| ConfigError::InvalidUrl(base_url.to_string(), e.to_string()))?;
        Ok(Self {
            reader_url: url.clone(),
            submit_url: url,
            api_key: None,
            timeout_secs: 5,
            read_attempts: 3,
            retry_base_ms: 10,
        })
    }
}

fn env_url<F>(lookup: &F, var: &str, default: &str) -> Result<Url, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(var).unwrap_or_else(|| default.to_string());
    Url::parse(&raw).map_err(|e| ConfigError::InvalidUrl(var.to_string(), e.to_string()))
}

fn env_number<F, T>(lookup: &F, var: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(var) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidNumber(var.to_string(), raw)),
        None => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid URL for {0}: {1}")]
    InvalidUrl(String, String),
    #[error("{0} must be a whole number, got {1:?}")]
    InvalidNumber(String, String),
    #[error("invalid API key header value")]
    InvalidApiKey,
}
