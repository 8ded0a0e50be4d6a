//! In-memory [`ConsignmentStore`] for tests and database-less runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use cms_core::{ConsignmentId, ConsignmentRecord, OrganisationId, PublishStatus, VersionGroupKey};
use parking_lot::Mutex;

use super::{ConsignmentStore, StoreTransaction};
use crate::error::StoreError;

#[derive(Debug, Default)]
struct MemoryState {
    records: BTreeMap<ConsignmentId, ConsignmentRecord>,
    locked: HashSet<ConsignmentId>,
}

impl MemoryState {
    /// Unlocked records matching `keep`, in `(created_at, id)` order.
    fn select(
        &self,
        limit: usize,
        keep: impl Fn(&ConsignmentRecord) -> bool,
    ) -> Vec<ConsignmentRecord> {
        let mut matching: Vec<&ConsignmentRecord> = self
            .records
            .values()
            .filter(|r| !self.locked.contains(r.id()) && keep(r))
            .collect();
        matching.sort_by(|a, b| (a.created_at(), a.id()).cmp(&(b.created_at(), b.id())));
        matching.into_iter().take(limit).cloned().collect()
    }

    fn latest_versions(&self) -> HashMap<&VersionGroupKey, u32> {
        let mut latest = HashMap::new();
        for record in self.records.values() {
            let entry = latest.entry(record.version_group_key()).or_insert(0);
            *entry = (*entry).max(record.version());
        }
        latest
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryConsignmentStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryConsignmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace records outside any transaction.
    pub fn seed(&self, records: impl IntoIterator<Item = ConsignmentRecord>) {
        let mut state = self.state.lock();
        for record in records {
            state.records.insert(record.id().clone(), record);
        }
    }

    /// Every stored record, ordered by id.
    pub fn all(&self) -> Vec<ConsignmentRecord> {
        self.state.lock().records.values().cloned().collect()
    }

    pub fn get(&self, id: &ConsignmentId) -> Option<ConsignmentRecord> {
        self.state.lock().records.get(id).cloned()
    }

    pub fn locked_count(&self) -> usize {
        self.state.lock().locked.len()
    }
}

#[async_trait]
impl ConsignmentStore for InMemoryConsignmentStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        Ok(Box::new(MemoryTransaction {
            state: Arc::clone(&self.state),
            held: Vec::new(),
            staged: BTreeMap::new(),
        }))
    }

    async fn find_by_id(&self, id: &ConsignmentId) -> Result<Option<ConsignmentRecord>, StoreError> {
        Ok(self.get(id))
    }

    async fn find_latest_by_group(
        &self,
        key: &VersionGroupKey,
    ) -> Result<Option<ConsignmentRecord>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .records
            .values()
            .filter(|r| r.version_group_key() == key)
            .max_by_key(|r| r.version())
            .cloned())
    }

    async fn insert_new(
        &self,
        records: Vec<ConsignmentRecord>,
    ) -> Result<Vec<ConsignmentRecord>, StoreError> {
        let mut state = self.state.lock();
        let mut inserted = Vec::new();
        for record in records {
            if state.records.contains_key(record.id()) {
                continue;
            }
            state.records.insert(record.id().clone(), record.clone());
            inserted.push(record);
        }
        Ok(inserted)
    }

    async fn dispatch_organisations(&self) -> Result<Vec<OrganisationId>, StoreError> {
        let state = self.state.lock();
        let mut organisations: Vec<OrganisationId> = state
            .records
            .values()
            .filter(|r| r.publish_status() == PublishStatus::Stored)
            .map(|r| r.sender_id().clone())
            .collect();
        organisations.sort();
        organisations.dedup();
        Ok(organisations)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

struct MemoryTransaction {
    state: Arc<Mutex<MemoryState>>,
    held: Vec<ConsignmentId>,
    staged: BTreeMap<ConsignmentId, ConsignmentRecord>,
}

impl MemoryTransaction {
    fn hold(&mut self, state: &mut MemoryState, records: &[ConsignmentRecord]) {
        for record in records {
            state.locked.insert(record.id().clone());
            self.held.push(record.id().clone());
        }
    }

    fn release(&mut self, state: &mut MemoryState) {
        for id in self.held.drain(..) {
            state.locked.remove(&id);
        }
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn lock_dispatchable(
        &mut self,
        organisation_id: &OrganisationId,
        limit: usize,
        latest_only: bool,
    ) -> Result<Vec<ConsignmentRecord>, StoreError> {
        let state = Arc::clone(&self.state);
        let mut state = state.lock();
        let selected = {
            let latest = state.latest_versions();
            state.select(limit, |r| {
                r.publish_status() == PublishStatus::Stored
                    && r.sender_id() == organisation_id
                    && (!latest_only
                        || latest.get(r.version_group_key()).copied() == Some(r.version()))
            })
        };
        self.hold(&mut state, &selected);
        Ok(selected)
    }

    async fn lock_unfinalized(&mut self, limit: usize) -> Result<Vec<ConsignmentRecord>, StoreError> {
        let state = Arc::clone(&self.state);
        let mut state = state.lock();
        let selected = state.select(limit, |r| r.publish_status().is_unfinalized());
        self.hold(&mut state, &selected);
        Ok(selected)
    }

    async fn lock_by_id(
        &mut self,
        id: &ConsignmentId,
    ) -> Result<Option<ConsignmentRecord>, StoreError> {
        let state = Arc::clone(&self.state);
        let mut state = state.lock();
        if state.locked.contains(id) {
            return Ok(None);
        }
        let Some(record) = state.records.get(id).cloned() else {
            return Ok(None);
        };
        self.hold(&mut state, std::slice::from_ref(&record));
        Ok(Some(record))
    }

    async fn upsert_all(&mut self, records: &[ConsignmentRecord]) -> Result<(), StoreError> {
        for record in records {
            self.staged.insert(record.id().clone(), record.clone());
        }
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        let state = Arc::clone(&self.state);
        let mut state = state.lock();
        let staged = std::mem::take(&mut self.staged);
        for (id, record) in staged {
            // created_at is fixed by the first write.
            let record = match state.records.get(&id) {
                Some(existing) if existing.created_at() != record.created_at() => {
                    let mut parts = record.into_parts();
                    parts.created_at = existing.created_at();
                    ConsignmentRecord::from_parts(parts).map_err(|e| StoreError::Corrupt {
                        id: id.to_string(),
                        reason: e.to_string(),
                    })?
                }
                _ => record,
            };
            state.records.insert(id, record);
        }
        self.release(&mut state);
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let state = Arc::clone(&self.state);
        let mut state = state.lock();
        self.release(&mut state);
    }
}
