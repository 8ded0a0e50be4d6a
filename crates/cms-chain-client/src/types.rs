//! Wire types of the follower and submit APIs.
//!
//! Fields use `#[serde(default)]` where the services may omit them.

use serde::{Deserialize, Serialize};

/// `GET /tip` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TipResponse {
    pub absolute_slot: u64,
    pub synced: bool,
}

/// `GET /tx/{hash}` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxDetailsResponse {
    pub transaction_hash: String,
    #[serde(default)]
    pub absolute_slot: Option<u64>,
    /// Finality tier name, e.g. `VERY_LOW` or `FINAL`.
    pub finality: String,
}

/// `POST /tx/submit` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub transaction_hash: String,
    #[serde(default)]
    pub absolute_slot: Option<u64>,
}
