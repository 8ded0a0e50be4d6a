//! # cms-publisher -- Publish and Reconcile Pipeline
//!
//! Moves STORED consignments onto the ledger and keeps their local status
//! in line with what the ledger reports.
//!
//! ## Flow
//!
//! ```text
//! ConsignmentStore ──▶ Dispatcher ──▶ BatchPacker ──▶ TransactionSubmitter ──▶ ChainWriter
//!        ▲                 │
//!        │                 └──────────────▶ EventPublisher ──▶ EventSink
//!        │                                        ▲
//!        └────────────── Watchdog ◀── ChainReader ┘
//! ```
//!
//! The dispatcher only touches STORED records and the watchdog only
//! touches dispatched, unfinalized ones. The two jobs run on independent
//! fixed-delay schedules ([`scheduler`]) and never race on a record.
//!
//! ## Crate Policy
//!
//! - Depends on `cms-core` only.
//! - Chain access, storage, and event delivery are trait objects injected
//!   at construction.
//! - No `.unwrap()` outside tests.

pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod ingest;
pub mod packer;
pub mod scheduler;
pub mod store;
pub mod strategy;
pub mod submission;
pub mod watchdog;

pub use codec::{
    BatchEncoder, CborMetadataCodec, DecodedBatch, DecodedConsignment, EncodedMetadata,
    MetadataHeader,
};
pub use config::{
    ConfigError, ConfirmationTimeoutPolicy, DispatcherConfig, EventConfig, PublisherConfig,
    SubmissionConfig, WatchdogConfig,
};
pub use dispatcher::{DispatchReport, Dispatcher, OrganisationSource};
pub use error::PublisherError;
pub use events::{
    BlockchainReceipt, ChannelEventSink, ConsignmentStatusUpdate, ConsignmentsLedgerUpdatedEvent,
    EventPublisher, EventSink, InMemoryEventSink, TracingEventSink,
};
pub use ingest::{IngestReport, Ingestor, OnChainBatch};
pub use packer::{BatchPacker, MetadataEnvelopeBuilder, SealedBatch, TransactionBuilder};
pub use scheduler::{Job, ScheduledJob};
pub use store::{memory::InMemoryConsignmentStore, ConsignmentStore, StoreTransaction};
pub use strategy::{DispatchStrategy, ImmediateDispatch};
pub use submission::TransactionSubmitter;
pub use watchdog::{classify_observation, Reconciliation, Watchdog, WatchdogOutcome, WatchdogReport};
