//! # Chain Collaborator Ports
//!
//! The publisher never talks to a ledger node directly. It reads the chain
//! tip and per-transaction details through [`ChainReader`] and hands built
//! transactions to a [`ChainWriter`]. Signing happens behind the writer.
//!
//! [`MockLedger`] implements both ports in memory with scriptable tip,
//! sync state, transaction visibility and failure injection. It provides
//! NO ledger semantics beyond what tests configure.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::digest::sha256_hex;
use crate::status::FinalityTier;

/// Errors from chain collaborators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// The node or API could not be reached or answered with a server error.
    #[error("chain service unavailable: {0}")]
    Unavailable(String),

    /// The submission endpoint refused the transaction.
    #[error("transaction rejected: {0}")]
    Rejected(String),

    /// The response could not be interpreted.
    #[error("malformed chain response: {0}")]
    Malformed(String),
}

/// Most recent slot known to the reading node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTip {
    /// Slot of the tip block.
    pub absolute_slot: u64,
    /// Whether the node has caught up with the network.
    pub synced: bool,
}

/// What the reading node knows about one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnChainTxDetails {
    /// Hex transaction hash.
    pub transaction_hash: String,
    /// Inclusion slot, when the node reports one.
    pub absolute_slot: Option<u64>,
    /// Current finality tier.
    pub finality: FinalityTier,
}

/// Result of handing a transaction to the submission endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    /// Hash the endpoint assigned to the transaction.
    pub transaction_hash: String,
    /// Present only when the endpoint already knows the inclusion slot.
    pub absolute_slot: Option<u64>,
}

/// Read access to ledger state.
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Current tip and sync flag.
    async fn chain_tip(&self) -> Result<ChainTip, ChainError>;

    /// Details for `transaction_hash`, or `None` if the node has not seen it.
    async fn tx_details(
        &self,
        transaction_hash: &str,
    ) -> Result<Option<OnChainTxDetails>, ChainError>;
}

/// Transaction submission.
#[async_trait]
pub trait ChainWriter: Send + Sync {
    /// Submit serialized transaction bytes paid for by `from_address`.
    async fn submit(
        &self,
        tx_bytes: &[u8],
        from_address: &str,
    ) -> Result<SubmissionReceipt, ChainError>;
}

/// A transaction accepted by [`MockLedger`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedTx {
    /// Hash handed back to the submitter.
    pub transaction_hash: String,
    /// Bytes exactly as submitted.
    pub tx_bytes: Vec<u8>,
    /// Paying address.
    pub from_address: String,
}

#[derive(Debug, Default)]
struct MockLedgerState {
    tip: u64,
    synced: bool,
    details: HashMap<String, OnChainTxDetails>,
    submitted: Vec<SubmittedTx>,
    failing_submissions: u32,
    details_unavailable: bool,
    tip_unavailable: bool,
    auto_confirm: Option<FinalityTier>,
}

/// In-memory ledger for tests and local runs.
#[derive(Debug)]
pub struct MockLedger {
    state: Mutex<MockLedgerState>,
}

impl MockLedger {
    /// A synced ledger at `tip`.
    pub fn new(tip: u64) -> Self {
        Self {
            state: Mutex::new(MockLedgerState {
                tip,
                synced: true,
                ..MockLedgerState::default()
            }),
        }
    }

    /// Move the tip to `tip`.
    pub fn set_tip(&self, tip: u64) {
        self.state.lock().tip = tip;
    }

    /// Move the tip forward by `slots`.
    pub fn advance(&self, slots: u64) {
        let mut state = self.state.lock();
        state.tip = state.tip.saturating_add(slots);
    }

    /// Set the sync flag reported with the tip.
    pub fn set_synced(&self, synced: bool) {
        self.state.lock().synced = synced;
    }

    /// Make `transaction_hash` visible at `finality`.
    pub fn confirm(&self, transaction_hash: &str, finality: FinalityTier, absolute_slot: u64) {
        self.state.lock().details.insert(
            transaction_hash.to_string(),
            OnChainTxDetails {
                transaction_hash: transaction_hash.to_string(),
                absolute_slot: Some(absolute_slot),
                finality,
            },
        );
    }

    /// Drop a transaction from the ledger's view.
    pub fn forget(&self, transaction_hash: &str) {
        self.state.lock().details.remove(transaction_hash);
    }

    /// Fail the next `count` submissions with [`ChainError::Rejected`].
    pub fn fail_next_submissions(&self, count: u32) {
        self.state.lock().failing_submissions = count;
    }

    /// Fail every transaction lookup with [`ChainError::Unavailable`].
    pub fn set_details_unavailable(&self, unavailable: bool) {
        self.state.lock().details_unavailable = unavailable;
    }

    /// Fail every tip query with [`ChainError::Unavailable`].
    pub fn set_tip_unavailable(&self, unavailable: bool) {
        self.state.lock().tip_unavailable = unavailable;
    }

    /// Make every accepted submission immediately visible at `finality`.
    pub fn auto_confirm(&self, finality: Option<FinalityTier>) {
        self.state.lock().auto_confirm = finality;
    }

    /// Every accepted submission, oldest first.
    pub fn submitted(&self) -> Vec<SubmittedTx> {
        self.state.lock().submitted.clone()
    }
}

#[async_trait]
impl ChainReader for MockLedger {
    async fn chain_tip(&self) -> Result<ChainTip, ChainError> {
        let state = self.state.lock();
        if state.tip_unavailable {
            return Err(ChainError::Unavailable("mock tip disabled".into()));
        }
        Ok(ChainTip {
            absolute_slot: state.tip,
            synced: state.synced,
        })
    }

    async fn tx_details(
        &self,
        transaction_hash: &str,
    ) -> Result<Option<OnChainTxDetails>, ChainError> {
        let state = self.state.lock();
        if state.details_unavailable {
            return Err(ChainError::Unavailable("mock tx details disabled".into()));
        }
        Ok(state.details.get(transaction_hash).cloned())
    }
}

#[async_trait]
impl ChainWriter for MockLedger {
    async fn submit(
        &self,
        tx_bytes: &[u8],
        from_address: &str,
    ) -> Result<SubmissionReceipt, ChainError> {
        let mut state = self.state.lock();
        if state.failing_submissions > 0 {
            state.failing_submissions -= 1;
            return Err(ChainError::Rejected("mock submission failure".into()));
        }
        let mut preimage = tx_bytes.to_vec();
        preimage.extend_from_slice(&(state.submitted.len() as u64).to_be_bytes());
        let transaction_hash = sha256_hex(&preimage);

        state.submitted.push(SubmittedTx {
            transaction_hash: transaction_hash.clone(),
            tx_bytes: tx_bytes.to_vec(),
            from_address: from_address.to_string(),
        });
        if let Some(finality) = state.auto_confirm {
            let slot = state.tip;
            state.details.insert(
                transaction_hash.clone(),
                OnChainTxDetails {
                    transaction_hash: transaction_hash.clone(),
                    absolute_slot: Some(slot),
                    finality,
                },
            );
        }
        tracing::debug!(tx_hash = %transaction_hash, bytes = tx_bytes.len(), "mock ledger accepted transaction");
        Ok(SubmissionReceipt {
            transaction_hash,
            absolute_slot: None,
        })
    }
}
