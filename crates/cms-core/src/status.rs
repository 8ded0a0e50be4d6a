//! # Publish Status State Machine
//!
//! ```text
//!   STORED ──(dispatcher)──▶ SUBMITTED ──▶ VISIBLE_ON_CHAIN ──▶ COMPLETED ──▶ FINALIZED
//!      ▲                         │  (watchdog, any order between unfinalized states)
//!      │                         ▼
//!      └──────(operator)──── ROLLBACKED
//! ```
//!
//! `FINALIZED` and `ROLLBACKED` are terminal for automatic processing.
//! The only way out of `ROLLBACKED` is an explicit operator requeue.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{TransitionError, ValidationError};

/// Lifecycle status of a consignment version with respect to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PublishStatus {
    /// Waiting for dispatch.
    Stored,
    /// Sent to the ledger, not yet observed.
    Submitted,
    /// Observed on chain with low finality.
    VisibleOnChain,
    /// Observed with high finality.
    Completed,
    /// Irreversible.
    Finalized,
    /// Presumed discarded by the ledger.
    Rollbacked,
}

impl PublishStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [PublishStatus; 6] = [
        Self::Stored,
        Self::Submitted,
        Self::VisibleOnChain,
        Self::Completed,
        Self::Finalized,
        Self::Rollbacked,
    ];

    /// Statuses the watchdog re-evaluates: dispatched but not terminal.
    pub const UNFINALIZED: [PublishStatus; 3] =
        [Self::Submitted, Self::VisibleOnChain, Self::Completed];

    /// Stable storage and wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stored => "STORED",
            Self::Submitted => "SUBMITTED",
            Self::VisibleOnChain => "VISIBLE_ON_CHAIN",
            Self::Completed => "COMPLETED",
            Self::Finalized => "FINALIZED",
            Self::Rollbacked => "ROLLBACKED",
        }
    }

    /// Dispatched and awaiting further finality.
    pub fn is_unfinalized(&self) -> bool {
        Self::UNFINALIZED.contains(self)
    }

    /// No automatic transition leaves this status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized | Self::Rollbacked)
    }

    /// Whether a record in this status must carry a submission sub-record.
    pub fn requires_submission(&self) -> bool {
        !matches!(self, Self::Stored | Self::Rollbacked)
    }

    /// Downstream dispatch status announced in events.
    pub fn ledger_dispatch_status(&self) -> LedgerDispatchStatus {
        match self {
            Self::Stored => LedgerDispatchStatus::MarkDispatch,
            Self::Submitted | Self::VisibleOnChain => LedgerDispatchStatus::Dispatched,
            Self::Completed => LedgerDispatchStatus::Completed,
            Self::Finalized => LedgerDispatchStatus::Finalized,
            Self::Rollbacked => LedgerDispatchStatus::NotDispatched,
        }
    }
}

impl fmt::Display for PublishStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PublishStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownStatus(s.to_string()))
    }
}

/// Confidence that a ledger transaction is irreversible, low to high.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalityTier {
    /// Just submitted or barely visible.
    VeryLow,
    /// Visible.
    Low,
    /// Visible.
    Medium,
    /// Unlikely to roll back.
    High,
    /// Unlikely to roll back.
    VeryHigh,
    /// Practically final.
    UltraHigh,
    /// Final.
    Final,
}

impl FinalityTier {
    /// All tiers, lowest first.
    pub const ALL: [FinalityTier; 7] = [
        Self::VeryLow,
        Self::Low,
        Self::Medium,
        Self::High,
        Self::VeryHigh,
        Self::UltraHigh,
        Self::Final,
    ];

    /// Tier assigned to a submission that is not yet visible.
    pub const LOWEST: FinalityTier = Self::VeryLow;

    /// Stable storage and wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VeryLow => "VERY_LOW",
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::VeryHigh => "VERY_HIGH",
            Self::UltraHigh => "ULTRA_HIGH",
            Self::Final => "FINAL",
        }
    }

    /// Publish status implied by observing a transaction at this tier.
    pub fn publish_status(&self) -> PublishStatus {
        match self {
            Self::VeryLow | Self::Low | Self::Medium => PublishStatus::VisibleOnChain,
            Self::High | Self::VeryHigh => PublishStatus::Completed,
            Self::UltraHigh | Self::Final => PublishStatus::Finalized,
        }
    }
}

impl fmt::Display for FinalityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FinalityTier {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|tier| tier.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownFinalityTier(s.to_string()))
    }
}

/// Dispatch status as seen by downstream subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerDispatchStatus {
    /// Not on the ledger (rolled back).
    NotDispatched,
    /// Stored, waiting for a dispatcher run.
    MarkDispatch,
    /// Submitted or visible on chain.
    Dispatched,
    /// At high finality.
    Completed,
    /// Final.
    Finalized,
}

/// The component requesting a status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionAuthority {
    /// The periodic dispatcher.
    Dispatcher,
    /// The watchdog reconciler.
    Watchdog,
    /// A human operator acting through an administrative command.
    Operator,
}

impl fmt::Display for TransitionAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Dispatcher => "dispatcher",
            Self::Watchdog => "watchdog",
            Self::Operator => "operator",
        })
    }
}

/// Who owns the edge `from -> to`, or `None` if no such edge exists.
fn edge_owner(from: PublishStatus, to: PublishStatus) -> Option<TransitionAuthority> {
    use PublishStatus::*;
    match (from, to) {
        (Stored, Submitted) => Some(TransitionAuthority::Dispatcher),
        (f, Submitted | VisibleOnChain | Completed | Finalized | Rollbacked)
            if f.is_unfinalized() =>
        {
            Some(TransitionAuthority::Watchdog)
        }
        (Rollbacked, Stored) => Some(TransitionAuthority::Operator),
        _ => None,
    }
}

/// Check that `authority` may move a record from `from` to `to`.
pub fn check_transition(
    authority: TransitionAuthority,
    from: PublishStatus,
    to: PublishStatus,
) -> Result<(), TransitionError> {
    match edge_owner(from, to) {
        Some(owner) if owner == authority => Ok(()),
        Some(_) => Err(TransitionError::Unauthorized {
            authority,
            from,
            to,
        }),
        None => Err(TransitionError::Illegal { from, to }),
    }
}
