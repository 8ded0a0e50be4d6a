//! Publisher error types.
//!
//! Each pipeline stage has its own enum so callers can tell a transient
//! chain failure from a data integrity failure without string matching.
//! [`PublisherError`] wraps them all for the scheduler boundary.

use std::time::Duration;

use cms_core::{ChainError, ConsignmentId, CoreError, TransitionError, ValidationError};
use thiserror::Error;

use crate::config::ConfigError;

/// Metadata could not be encoded or decoded.
#[derive(Error, Debug)]
pub enum CodecError {
    /// A required key is absent from decoded metadata.
    #[error("metadata is missing required field '{0}'")]
    MissingField(String),

    /// A key is present with the wrong type or an unparseable value.
    #[error("metadata field '{field}' is invalid: {reason}")]
    InvalidField {
        /// Dotted path of the field.
        field: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A decoded value failed domain validation.
    #[error("metadata value rejected: {0}")]
    Validation(#[from] ValidationError),

    /// CBOR serialization failed.
    #[error("CBOR serialization failed: {0}")]
    Cbor(#[from] serde_cbor::Error),
}

/// A batch could not be packed.
#[derive(Error, Debug)]
pub enum PackError {
    /// One record alone already reaches the size ceiling.
    #[error("consignment {id} encodes to {size} bytes on its own, ceiling is {max_tx_bytes}")]
    OversizedRecord {
        /// The record that can never be packed.
        id: ConsignmentId,
        /// Its encoded size.
        size: usize,
        /// The configured ceiling.
        max_tx_bytes: usize,
    },

    /// Encoding failed for a batch ending at `id`.
    #[error("encoding failed at consignment {id}: {source}")]
    Codec {
        /// The record whose addition failed.
        id: ConsignmentId,
        /// Underlying codec failure.
        #[source]
        source: CodecError,
    },

    /// The transaction envelope could not be built.
    #[error("transaction build failed: {0}")]
    Build(String),
}

/// A sealed batch could not be submitted.
#[derive(Error, Debug)]
pub enum SubmissionError {
    /// The chain writer failed.
    #[error("submission failed: {0}")]
    Chain(#[from] ChainError),

    /// A hash was obtained but the transaction was not seen in time.
    #[error("transaction {transaction_hash} not confirmed within {waited:?}")]
    ConfirmationTimeout {
        /// Hash returned by the submission endpoint.
        transaction_hash: String,
        /// How long we waited.
        waited: Duration,
    },
}

/// Record store failure.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backing store failed.
    #[error("store backend error: {0}")]
    Backend(String),

    /// A stored row does not decode to a valid record.
    #[error("stored record {id} is corrupt: {reason}")]
    Corrupt {
        /// Row id.
        id: String,
        /// Decode failure.
        reason: String,
    },
}

/// Event delivery failure.
#[derive(Error, Debug)]
pub enum EventError {
    /// The sink refused or could not accept the event.
    #[error("event sink error: {0}")]
    Sink(String),
}

/// A dispatcher cycle, or one batch of it, failed.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Submission(#[from] SubmissionError),

    #[error("chain tip unavailable: {0}")]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// The record does not exist or another run holds its lock.
    #[error("consignment {id} not found or locked by another run")]
    Unavailable {
        /// Requested id.
        id: String,
    },
}

/// A watchdog run failed. No writes were applied.
#[derive(Error, Debug)]
pub enum WatchdogError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("chain tip unavailable: {0}")]
    Tip(#[source] ChainError),

    /// Fetching details for a transaction failed; the whole run aborts.
    #[error("failed to fetch details for transaction {transaction_hash}: {source}")]
    TxDetails {
        /// The transaction being checked.
        transaction_hash: String,
        /// Underlying chain error.
        #[source]
        source: ChainError,
    },

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// An on-chain batch could not be ingested. Nothing was stored.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Top-level error type for the publisher.
#[derive(Error, Debug)]
pub enum PublisherError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("packing error: {0}")]
    Pack(#[from] PackError),

    #[error("submission error: {0}")]
    Submission(#[from] SubmissionError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("event error: {0}")]
    Event(#[from] EventError),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("watchdog error: {0}")]
    Watchdog(#[from] WatchdogError),

    #[error("ingest error: {0}")]
    Ingest(#[from] IngestError),

    #[error("transition error: {0}")]
    Transition(#[from] TransitionError),
}
