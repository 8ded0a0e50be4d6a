//! # Error Types
//!
//! Three families, matching how callers react to them:
//!
//! - [`ValidationError`]: malformed input at a construction boundary.
//! - [`IntegrityError`]: data that contradicts its own content address or
//!   its status invariants. Never coerced to a default.
//! - [`TransitionError`]: a status change the state machine forbids.

use thiserror::Error;

use crate::status::{PublishStatus, TransitionAuthority};

/// Top-level error type for core operations.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Input failed validation.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Content integrity violation.
    #[error("integrity error: {0}")]
    Integrity(#[from] IntegrityError),

    /// State machine transition rejected.
    #[error("invalid state transition: {0}")]
    Transition(#[from] TransitionError),
}

/// Input rejected at a construction boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// An identifier was empty or whitespace.
    #[error("{kind} must not be empty")]
    EmptyIdentifier {
        /// Which identifier kind was rejected.
        kind: &'static str,
    },

    /// An identifier contained the digest field separator.
    #[error("{kind} must not contain the '::' separator: {value:?}")]
    ForbiddenSeparator {
        /// Which identifier kind was rejected.
        kind: &'static str,
        /// The offending value.
        value: String,
    },

    /// A digest string was not 64 lowercase hex characters.
    #[error("{kind} is not a 64-character lowercase hex digest: {value:?}")]
    MalformedDigest {
        /// Which identifier kind was rejected.
        kind: &'static str,
        /// The offending value.
        value: String,
    },

    /// A timestamp string could not be parsed.
    #[error("invalid dispatch timestamp {value:?}: {reason}")]
    InvalidTimestamp {
        /// The offending value.
        value: String,
        /// Parser message.
        reason: String,
    },

    /// Versions start at 1.
    #[error("consignment version must be positive")]
    ZeroVersion,

    /// An unknown publish status string.
    #[error("unknown publish status: {0:?}")]
    UnknownStatus(String),

    /// An unknown finality tier string.
    #[error("unknown finality tier: {0:?}")]
    UnknownFinalityTier(String),

    /// Geolocation outside the valid coordinate range.
    #[error("geolocation out of range: latitude {latitude}, longitude {longitude}")]
    GeolocationOutOfRange {
        /// Latitude in degrees.
        latitude: f64,
        /// Longitude in degrees.
        longitude: f64,
    },
}

/// Data contradicts its content address or status invariants.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    /// A declared id does not match the id recomputed from the record fields.
    #[error("declared id {declared} does not match computed id {computed} (version group {version_group_key}, version {version})")]
    IdMismatch {
        /// The id carried by the record (e.g. from ledger metadata).
        declared: String,
        /// The id recomputed locally.
        computed: String,
        /// Version group of the record.
        version_group_key: String,
        /// Version used for the recomputation.
        version: u32,
    },

    /// A stored version group key does not match the recomputed key.
    #[error("stored version group key {stored} does not match computed key {computed}")]
    VersionGroupMismatch {
        /// The stored value.
        stored: String,
        /// The recomputed value.
        computed: String,
    },

    /// The submission sub-record is present or absent against the status.
    #[error("record {id} in status {status} {problem}")]
    SubmissionStatusMismatch {
        /// Record id.
        id: String,
        /// Current status.
        status: PublishStatus,
        /// Description of the mismatch.
        problem: &'static str,
    },
}

/// Rejected status transition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    /// No edge exists between the two states.
    #[error("illegal transition from {from} to {to}")]
    Illegal {
        /// Current state.
        from: PublishStatus,
        /// Attempted target state.
        to: PublishStatus,
    },

    /// The edge exists but the caller is not allowed to take it.
    #[error("{authority} may not move a record from {from} to {to}")]
    Unauthorized {
        /// Who attempted the transition.
        authority: TransitionAuthority,
        /// Current state.
        from: PublishStatus,
        /// Attempted target state.
        to: PublishStatus,
    },

    /// A reconciliation was attempted on a record that was never submitted.
    #[error("record {id} has no submission to reconcile")]
    NotSubmitted {
        /// Record id.
        id: String,
    },
}
