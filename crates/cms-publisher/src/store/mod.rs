//! # Record Store Port
//!
//! The store is the only shared mutable resource. Mutations go through a
//! [`StoreTransaction`]: rows are locked when selected, writes are applied
//! together on commit, and dropping an uncommitted transaction applies
//! nothing and releases its locks.
//!
//! Lock methods skip rows already locked by another open transaction, so
//! two concurrent dispatcher runs (in one process or several) never pick
//! the same record. Selections are ordered by `(created_at, id)`.

pub mod memory;

use async_trait::async_trait;
use cms_core::{ConsignmentId, ConsignmentRecord, OrganisationId, VersionGroupKey};

use crate::error::StoreError;

#[async_trait]
pub trait ConsignmentStore: Send + Sync {
    /// Open a transaction.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;

    async fn find_by_id(&self, id: &ConsignmentId) -> Result<Option<ConsignmentRecord>, StoreError>;

    /// Highest version stored for `key`.
    async fn find_latest_by_group(
        &self,
        key: &VersionGroupKey,
    ) -> Result<Option<ConsignmentRecord>, StoreError>;

    /// Store the records whose ids are not yet present. Returns what was inserted.
    async fn insert_new(
        &self,
        records: Vec<ConsignmentRecord>,
    ) -> Result<Vec<ConsignmentRecord>, StoreError>;

    /// Senders with at least one STORED record.
    async fn dispatch_organisations(&self) -> Result<Vec<OrganisationId>, StoreError>;

    /// Cheap liveness check for readiness probes.
    async fn ping(&self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait StoreTransaction: Send {
    /// Lock up to `limit` STORED records sent by `organisation_id`.
    ///
    /// With `latest_only`, a record is skipped when a higher version exists
    /// in its version group.
    async fn lock_dispatchable(
        &mut self,
        organisation_id: &OrganisationId,
        limit: usize,
        latest_only: bool,
    ) -> Result<Vec<ConsignmentRecord>, StoreError>;

    /// Lock up to `limit` SUBMITTED, VISIBLE_ON_CHAIN or COMPLETED records
    /// across all organisations.
    async fn lock_unfinalized(&mut self, limit: usize) -> Result<Vec<ConsignmentRecord>, StoreError>;

    /// Lock one record by id. `None` if absent or locked elsewhere.
    async fn lock_by_id(&mut self, id: &ConsignmentId)
        -> Result<Option<ConsignmentRecord>, StoreError>;

    /// Stage inserts or updates, keyed by id.
    async fn upsert_all(&mut self, records: &[ConsignmentRecord]) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
