#![deny(missing_docs)]

//! # cms-core -- Foundational Types for the Consignment Ledger Publisher
//!
//! Defines the domain model shared by the dispatcher, the watchdog
//! reconciler and every storage or chain adapter. It depends on nothing
//! internal.
//!
//! ## Key Design Principles
//!
//! 1. **Content-addressed identifiers.** `ConsignmentId` and
//!    `VersionGroupKey` are only produced by the derivation functions in
//!    [`digest`], or parsed from an already-derived hex digest.
//!
//! 2. **Millisecond dispatch timestamps.** [`DispatchTimestamp`] truncates
//!    at construction so the local copy and the on-chain copy of a record
//!    hash identically.
//!
//! 3. **Whole-value submissions.** Every status transition on a
//!    [`ConsignmentRecord`] replaces its [`Submission`] wholesale or clears
//!    it. Fields are never patched one at a time.
//!
//! 4. **Injected collaborators.** Chain access goes through the
//!    [`ChainReader`] / [`ChainWriter`] ports and time through [`Clock`],
//!    so reconciliation logic runs deterministically in tests.
//!
//! ## Crate Policy
//!
//! - No dependencies on other `cms-*` crates.
//! - No `unsafe` code.
//! - No `panic!()` or `.unwrap()` outside tests.

pub mod chain;
pub mod clock;
pub mod consignment;
pub mod digest;
pub mod error;
pub mod identity;
pub mod status;
pub mod temporal;

pub use chain::{
    ChainError, ChainReader, ChainTip, ChainWriter, MockLedger, OnChainTxDetails,
    SubmissionReceipt, SubmittedTx,
};
pub use clock::{Clock, FixedClock, SystemClock};
pub use consignment::{
    ConsignmentPayload, ConsignmentRecord, Geolocation, Organisation, RecordParts, Submission,
};
pub use digest::{
    derive_consignment_id, derive_version_group_key, sha256_hex, verify_declared_id,
};
pub use error::{CoreError, IntegrityError, TransitionError, ValidationError};
pub use identity::{ConsignmentId, OrganisationId, VersionGroupKey};
pub use status::{
    check_transition, FinalityTier, LedgerDispatchStatus, PublishStatus, TransitionAuthority,
};
pub use temporal::DispatchTimestamp;
