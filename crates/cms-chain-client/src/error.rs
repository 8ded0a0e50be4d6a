//! Chain API client error types.

use cms_core::ChainError;

/// Errors from chain API calls.
#[derive(Debug, thiserror::Error)]
pub enum ChainClientError {
    /// HTTP transport error.
    #[error("HTTP error calling {endpoint}: {source}")]
    Http {
        endpoint: String,
        source: reqwest::Error,
    },
    /// The API returned a non-2xx status.
    #[error("chain API {endpoint} returned {status}: {body}")]
    ApiError {
        endpoint: String,
        status: u16,
        body: String,
    },
    /// Response deserialization failed.
    #[error("failed to deserialize response from {endpoint}: {source}")]
    Deserialization {
        endpoint: String,
        source: reqwest::Error,
    },
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl From<ChainClientError> for ChainError {
    fn from(err: ChainClientError) -> Self {
        match &err {
            ChainClientError::ApiError { status, .. } if (400..500).contains(status) => {
                ChainError::Rejected(err.to_string())
            }
            ChainClientError::Deserialization { .. } => ChainError::Malformed(err.to_string()),
            _ => ChainError::Unavailable(err.to_string()),
        }
    }
}
