//! # Dispatcher
//!
//! One run walks every organisation with pending work:
//!
//! 1. Read the chain tip; its slot is the creation slot of every batch
//!    built for that organisation in this run.
//! 2. Lock up to `pull_batch_size` STORED records, oldest first.
//! 3. Let the [`DispatchStrategy`] choose what goes out now.
//! 4. Pack, then submit batch by batch. Each batch runs in its own store
//!    transaction: its records are locked again, submitted, moved to
//!    SUBMITTED and committed before the next batch starts. A batch that
//!    fails to pack or submit is logged and its records stay STORED for the
//!    next run.
//! 5. Publish one set of status events for the organisation.
//!
//! Failures are isolated per batch and per organisation: nothing here ever
//! aborts the whole run.

use std::sync::Arc;

use cms_core::{ChainReader, Clock, ConsignmentId, ConsignmentRecord, OrganisationId};

use crate::codec::MetadataHeader;
use crate::config::DispatcherConfig;
use crate::error::{DispatchError, PublisherError};
use crate::events::EventPublisher;
use crate::packer::{BatchPacker, SealedBatch};
use crate::store::ConsignmentStore;
use crate::strategy::{DispatchStrategy, ImmediateDispatch};
use crate::submission::TransactionSubmitter;

/// Which organisations a run visits.
#[derive(Debug, Clone, Default)]
pub enum OrganisationSource {
    /// Every sender with STORED records.
    #[default]
    Discovered,
    /// A fixed list.
    Static(Vec<OrganisationId>),
}

/// Counters for one dispatcher run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Organisations visited.
    pub organisations: usize,
    /// Organisations whose selection could not be made (tip or store unavailable).
    pub organisations_failed: usize,
    /// Batches submitted and recorded as SUBMITTED.
    pub batches_submitted: usize,
    /// Batches that failed to pack, submit or persist.
    pub batches_failed: usize,
    /// Batches dropped because another run took their records first.
    pub batches_skipped: usize,
    /// Records moved to SUBMITTED.
    pub records_submitted: usize,
}

#[derive(Debug, Default)]
struct OrganisationOutcome {
    batches_submitted: usize,
    batches_failed: usize,
    batches_skipped: usize,
    records_submitted: usize,
}

/// Moves STORED records onto the ledger, one organisation at a time.
pub struct Dispatcher {
    store: Arc<dyn ConsignmentStore>,
    reader: Arc<dyn ChainReader>,
    submitter: TransactionSubmitter,
    packer: BatchPacker,
    strategy: Arc<dyn DispatchStrategy>,
    events: Arc<EventPublisher>,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
    organisations: OrganisationSource,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn ConsignmentStore>,
        reader: Arc<dyn ChainReader>,
        submitter: TransactionSubmitter,
        packer: BatchPacker,
        events: Arc<EventPublisher>,
        clock: Arc<dyn Clock>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            reader,
            submitter,
            packer,
            strategy: Arc::new(ImmediateDispatch),
            events,
            clock,
            config,
            organisations: OrganisationSource::default(),
        }
    }

    /// Replace the default "everything now" selection.
    pub fn with_strategy(mut self, strategy: Arc<dyn DispatchStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Restrict or widen the organisations a run visits.
    pub fn with_organisations(mut self, organisations: OrganisationSource) -> Self {
        self.organisations = organisations;
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// One dispatcher cycle over every organisation.
    ///
    /// Only a failure to list organisations is returned as an error;
    /// per-organisation and per-batch failures are counted in the report.
    pub async fn run_once(&self) -> Result<DispatchReport, DispatchError> {
        let organisations = match &self.organisations {
            OrganisationSource::Discovered => self.store.dispatch_organisations().await?,
            OrganisationSource::Static(list) => list.clone(),
        };

        tracing::info!(organisations = organisations.len(), "dispatcher run started");
        let mut report = DispatchReport::default();
        for organisation_id in &organisations {
            report.organisations += 1;
            match self.dispatch_organisation(organisation_id).await {
                Ok(outcome) => {
                    report.batches_submitted += outcome.batches_submitted;
                    report.batches_failed += outcome.batches_failed;
                    report.batches_skipped += outcome.batches_skipped;
                    report.records_submitted += outcome.records_submitted;
                }
                Err(e) => {
                    report.organisations_failed += 1;
                    tracing::error!(
                        organisation_id = %organisation_id,
                        error = %e,
                        "dispatch failed for organisation"
                    );
                }
            }
        }

        tracing::info!(
            organisations = report.organisations,
            organisations_failed = report.organisations_failed,
            batches_submitted = report.batches_submitted,
            batches_failed = report.batches_failed,
            batches_skipped = report.batches_skipped,
            records_submitted = report.records_submitted,
            "dispatcher run done"
        );
        Ok(report)
    }

    async fn dispatch_organisation(
        &self,
        organisation_id: &OrganisationId,
    ) -> Result<OrganisationOutcome, DispatchError> {
        let mut outcome = OrganisationOutcome::default();
        let tip = self.reader.chain_tip().await?;

        let mut selecting = self.store.begin().await?;
        let selection = selecting
            .lock_dispatchable(
                organisation_id,
                self.config.pull_batch_size,
                self.config.latest_version_only,
            )
            .await?;
        // Each batch locks its records again in its own transaction.
        drop(selecting);
        if selection.is_empty() {
            return Ok(outcome);
        }
        let selected = self.strategy.select(organisation_id, selection);
        tracing::debug!(
            organisation_id = %organisation_id,
            selected = selected.len(),
            creation_slot = tip.absolute_slot,
            "dispatching"
        );

        let header = MetadataHeader {
            creation_slot: tip.absolute_slot,
            timestamp: self.clock.now(),
        };
        let packed: Vec<_> = self
            .packer
            .batches(organisation_id, &selected, &header)
            .collect();
        let mut submitted: Vec<ConsignmentRecord> = Vec::new();

        for packed in packed {
            let batch = match packed {
                Ok(batch) => batch,
                Err(e) => {
                    outcome.batches_failed += 1;
                    metrics::counter!("cms_dispatch_batches_total", "outcome" => "pack_failed")
                        .increment(1);
                    tracing::error!(organisation_id = %organisation_id, error = %e, "batch packing failed");
                    continue;
                }
            };

            match self.dispatch_batch(batch).await {
                Ok(Some(records)) => {
                    outcome.batches_submitted += 1;
                    outcome.records_submitted += records.len();
                    metrics::counter!("cms_dispatch_batches_total", "outcome" => "submitted")
                        .increment(1);
                    metrics::counter!("cms_dispatch_records_submitted_total")
                        .increment(records.len() as u64);
                    submitted.extend(records);
                }
                Ok(None) => {
                    outcome.batches_skipped += 1;
                    metrics::counter!("cms_dispatch_batches_total", "outcome" => "skipped")
                        .increment(1);
                }
                Err(e) => {
                    outcome.batches_failed += 1;
                    metrics::counter!("cms_dispatch_batches_total", "outcome" => "failed")
                        .increment(1);
                    tracing::error!(organisation_id = %organisation_id, error = %e, "batch dispatch failed");
                }
            }
        }

        if let Err(e) = self.events.publish(organisation_id, &submitted).await {
            tracing::error!(organisation_id = %organisation_id, error = %e, "status event publication failed");
        }
        Ok(outcome)
    }

    /// Submit one sealed batch in its own store transaction.
    ///
    /// The batch's records are locked again and must still be STORED and
    /// unchanged since selection; otherwise another run owns them and the
    /// batch is skipped (`Ok(None)`). A committed batch is never undone by a
    /// later batch of the same run.
    async fn dispatch_batch(
        &self,
        batch: SealedBatch,
    ) -> Result<Option<Vec<ConsignmentRecord>>, DispatchError> {
        let mut tx = self.store.begin().await?;
        for record in &batch.consignments {
            let current = tx.lock_by_id(record.id()).await?;
            if current.as_ref() != Some(record) {
                tracing::debug!(
                    consignment_id = %record.id(),
                    "record changed or locked since selection, skipping batch"
                );
                return Ok(None);
            }
        }

        let receipt = self.submitter.submit(&batch).await?;

        let now = self.clock.now();
        let creation_slot = batch.creation_slot;
        let mut records = batch.consignments;
        let persisted = async {
            for record in &mut records {
                record.mark_submitted(
                    receipt.transaction_hash.clone(),
                    receipt.absolute_slot,
                    creation_slot,
                    now,
                )?;
            }
            tx.upsert_all(&records).await?;
            tx.commit().await?;
            Ok::<_, DispatchError>(())
        };
        if let Err(e) = persisted.await {
            tracing::error!(
                transaction_hash = %receipt.transaction_hash,
                count = records.len(),
                error = %e,
                "batch is on chain but its submission was not recorded"
            );
            return Err(e);
        }
        Ok(Some(records))
    }

    /// Operator action: make a ROLLBACKED record dispatchable again.
    pub async fn requeue(&self, id: &ConsignmentId) -> Result<ConsignmentRecord, PublisherError> {
        let mut tx = self.store.begin().await?;
        let mut record = tx
            .lock_by_id(id)
            .await?
            .ok_or_else(|| DispatchError::Unavailable { id: id.to_string() })?;
        record.requeue(self.clock.now())?;
        tx.upsert_all(std::slice::from_ref(&record)).await?;
        tx.commit().await?;

        tracing::warn!(consignment_id = %id, "consignment requeued by operator");
        self.events
            .publish(record.sender_id(), std::slice::from_ref(&record))
            .await?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use chrono::{DateTime, TimeZone, Utc};
    use cms_core::{
        ConsignmentPayload, DispatchTimestamp, FixedClock, LedgerDispatchStatus, MockLedger,
        Organisation, PublishStatus,
    };

    use crate::codec::CborMetadataCodec;
    use crate::config::{EventConfig, SubmissionConfig};
    use crate::events::InMemoryEventSink;
    use crate::packer::MetadataEnvelopeBuilder;
    use crate::error::StoreError;
    use crate::store::memory::InMemoryConsignmentStore;
    use crate::store::StoreTransaction;
    use async_trait::async_trait;
    use cms_core::VersionGroupKey;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory store whose `fail_on`-th `upsert_all` call fails.
    struct FailingUpsertStore {
        inner: InMemoryConsignmentStore,
        upserts: Arc<AtomicUsize>,
        fail_on: usize,
    }

    struct FailingUpsertTx {
        inner: Box<dyn StoreTransaction>,
        upserts: Arc<AtomicUsize>,
        fail_on: usize,
    }

    #[async_trait]
    impl ConsignmentStore for FailingUpsertStore {
        async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
            Ok(Box::new(FailingUpsertTx {
                inner: self.inner.begin().await?,
                upserts: self.upserts.clone(),
                fail_on: self.fail_on,
            }))
        }

        async fn find_by_id(
            &self,
            id: &ConsignmentId,
        ) -> Result<Option<ConsignmentRecord>, StoreError> {
            self.inner.find_by_id(id).await
        }

        async fn find_latest_by_group(
            &self,
            key: &VersionGroupKey,
        ) -> Result<Option<ConsignmentRecord>, StoreError> {
            self.inner.find_latest_by_group(key).await
        }

        async fn insert_new(
            &self,
            records: Vec<ConsignmentRecord>,
        ) -> Result<Vec<ConsignmentRecord>, StoreError> {
            self.inner.insert_new(records).await
        }

        async fn dispatch_organisations(&self) -> Result<Vec<OrganisationId>, StoreError> {
            self.inner.dispatch_organisations().await
        }

        async fn ping(&self) -> Result<(), StoreError> {
            self.inner.ping().await
        }
    }

    #[async_trait]
    impl StoreTransaction for FailingUpsertTx {
        async fn lock_dispatchable(
            &mut self,
            organisation_id: &OrganisationId,
            limit: usize,
            latest_only: bool,
        ) -> Result<Vec<ConsignmentRecord>, StoreError> {
            self.inner
                .lock_dispatchable(organisation_id, limit, latest_only)
                .await
        }

        async fn lock_unfinalized(
            &mut self,
            limit: usize,
        ) -> Result<Vec<ConsignmentRecord>, StoreError> {
            self.inner.lock_unfinalized(limit).await
        }

        async fn lock_by_id(
            &mut self,
            id: &ConsignmentId,
        ) -> Result<Option<ConsignmentRecord>, StoreError> {
            self.inner.lock_by_id(id).await
        }

        async fn upsert_all(&mut self, records: &[ConsignmentRecord]) -> Result<(), StoreError> {
            if self.upserts.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
                return Err(StoreError::Backend("connection reset".into()));
            }
            self.inner.upsert_all(records).await
        }

        async fn commit(self: Box<Self>) -> Result<(), StoreError> {
            self.inner.commit().await
        }
    }

    struct Fixture {
        ledger: Arc<MockLedger>,
        store: InMemoryConsignmentStore,
        sink: InMemoryEventSink,
        clock: Arc<FixedClock>,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap()
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                ledger: Arc::new(MockLedger::new(5_000)),
                store: InMemoryConsignmentStore::new(),
                sink: InMemoryEventSink::new(),
                clock: Arc::new(FixedClock::new(t0())),
            }
        }

        fn dispatcher(&self, max_tx_bytes: usize) -> Dispatcher {
            self.dispatcher_over(Arc::new(self.store.clone()), max_tx_bytes)
        }

        fn dispatcher_over(
            &self,
            store: Arc<dyn ConsignmentStore>,
            max_tx_bytes: usize,
        ) -> Dispatcher {
            let config = DispatcherConfig {
                max_tx_bytes,
                source_address: "addr_test1".into(),
                ..DispatcherConfig::default()
            };
            let submitter = TransactionSubmitter::new(
                self.ledger.clone(),
                self.ledger.clone(),
                SubmissionConfig {
                    confirmation_timeout: Duration::ZERO,
                    ..SubmissionConfig::default()
                },
            );
            let packer = BatchPacker::new(
                Arc::new(CborMetadataCodec),
                Arc::new(MetadataEnvelopeBuilder::new(1448)),
                config.max_tx_bytes,
                config.source_address.clone(),
            );
            let events = Arc::new(EventPublisher::new(
                Arc::new(self.sink.clone()),
                self.clock.clone(),
                EventConfig::default(),
            ));
            Dispatcher::new(
                store,
                self.ledger.clone(),
                submitter,
                packer,
                events,
                self.clock.clone(),
                config,
            )
        }

        fn seed(&self, sender: &str, count: u32) -> Vec<ConsignmentRecord> {
            let records: Vec<_> = (0..count)
                .map(|i| {
                    let payload = ConsignmentPayload {
                        sender: Organisation::new(OrganisationId::new(sender).unwrap()),
                        receiver: Organisation::new(OrganisationId::new("port-authority").unwrap()),
                        goods: BTreeMap::from([("containers".to_string(), u64::from(i) + 1)]),
                        tracking_status: Some("LOADED".into()),
                        geolocation: None,
                        dispatched_at: DispatchTimestamp::parse(&format!(
                            "2024-07-01T08:{i:02}:00.250"
                        ))
                        .unwrap(),
                    };
                    ConsignmentRecord::new(payload, 1, t0()).unwrap()
                })
                .collect();
            self.store.seed(records.clone());
            records
        }

        fn status(&self, record: &ConsignmentRecord) -> PublishStatus {
            self.store.get(record.id()).unwrap().publish_status()
        }
    }

    #[tokio::test]
    async fn stored_records_become_submitted_with_events() {
        let fx = Fixture::new();
        let records = fx.seed("org-a", 3);

        let report = fx.dispatcher(16_000).run_once().await.unwrap();
        assert_eq!(report.batches_submitted, 1);
        assert_eq!(report.records_submitted, 3);

        let tx_hash = fx.ledger.submitted()[0].transaction_hash.clone();
        for record in &records {
            let stored = fx.store.get(record.id()).unwrap();
            assert_eq!(stored.publish_status(), PublishStatus::Submitted);
            let submission = stored.submission().unwrap();
            assert_eq!(submission.transaction_hash, tx_hash);
            assert_eq!(submission.creation_slot, 5_000);
            assert_eq!(submission.finality, None);
        }

        let events = fx.sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status_updates.len(), 3);
        assert!(events[0]
            .status_updates
            .iter()
            .all(|u| u.status == LedgerDispatchStatus::Dispatched && u.receipts.len() == 1));
    }

    #[tokio::test]
    async fn failed_submission_leaves_records_stored_until_next_run() {
        let fx = Fixture::new();
        let records = fx.seed("org-a", 2);
        fx.ledger.fail_next_submissions(1);

        let dispatcher = fx.dispatcher(16_000);
        let report = dispatcher.run_once().await.unwrap();
        assert_eq!(report.batches_failed, 1);
        assert!(records.iter().all(|r| fx.status(r) == PublishStatus::Stored));
        assert!(fx.sink.events().is_empty());
        assert_eq!(fx.store.locked_count(), 0);

        let report = dispatcher.run_once().await.unwrap();
        assert_eq!(report.records_submitted, 2);
        assert!(records.iter().all(|r| fx.status(r) == PublishStatus::Submitted));
    }

    #[tokio::test]
    async fn one_organisation_failing_does_not_stop_another() {
        let fx = Fixture::new();
        let a = fx.seed("org-a", 1);
        let b = fx.seed("org-b", 1);
        fx.ledger.fail_next_submissions(1);

        let report = fx.dispatcher(16_000).run_once().await.unwrap();
        assert_eq!(report.organisations, 2);
        assert_eq!(fx.status(&a[0]), PublishStatus::Stored);
        assert_eq!(fx.status(&b[0]), PublishStatus::Submitted);
    }

    #[tokio::test]
    async fn unavailable_tip_is_isolated_per_organisation() {
        let fx = Fixture::new();
        let records = fx.seed("org-a", 1);
        fx.ledger.set_tip_unavailable(true);

        let report = fx.dispatcher(16_000).run_once().await.unwrap();
        assert_eq!(report.organisations_failed, 1);
        assert_eq!(fx.status(&records[0]), PublishStatus::Stored);
    }

    #[tokio::test]
    async fn small_ceiling_splits_into_several_transactions() {
        let fx = Fixture::new();
        fx.seed("org-a", 6);

        let report = fx.dispatcher(700).run_once().await.unwrap();
        assert!(report.batches_submitted > 1);
        assert_eq!(report.records_submitted, 6);
        assert_eq!(fx.ledger.submitted().len(), report.batches_submitted);
    }

    #[tokio::test]
    async fn persistence_failure_only_affects_its_own_batch() {
        let fx = Fixture::new();
        let records = fx.seed("org-a", 6);
        let store = Arc::new(FailingUpsertStore {
            inner: fx.store.clone(),
            upserts: Arc::new(AtomicUsize::new(0)),
            fail_on: 2,
        });

        let report = fx.dispatcher_over(store, 700).run_once().await.unwrap();
        let on_chain = fx.ledger.submitted();
        assert!(on_chain.len() >= 2);
        assert_eq!(report.organisations_failed, 0);
        assert_eq!(report.batches_failed, 1);
        assert_eq!(report.batches_submitted, on_chain.len() - 1);

        let recorded: Vec<String> = records
            .iter()
            .filter_map(|r| fx.store.get(r.id())?.transaction_hash().map(str::to_string))
            .collect();
        assert!(recorded.contains(&on_chain[0].transaction_hash));
        assert!(!recorded.contains(&on_chain[1].transaction_hash));

        let still_stored = records
            .iter()
            .filter(|r| fx.status(r) == PublishStatus::Stored)
            .count();
        assert!(still_stored > 0);
        assert_eq!(still_stored, 6 - report.records_submitted);
        assert_eq!(fx.store.locked_count(), 0);
    }

    #[tokio::test]
    async fn batch_is_skipped_when_another_run_submitted_it_first() {
        let fx = Fixture::new();
        let records = fx.seed("org-a", 2);
        let store = fx.store.clone();
        // Another run submits the selection right after this run selected it.
        let other_run = move |_: &OrganisationId, pending: Vec<ConsignmentRecord>| {
            let mut taken = pending[0].clone();
            taken.mark_submitted("tx-other".into(), None, 1, t0()).unwrap();
            store.seed([taken]);
            pending
        };

        let report = fx
            .dispatcher(16_000)
            .with_strategy(Arc::new(other_run))
            .run_once()
            .await
            .unwrap();
        assert_eq!(report.batches_skipped, 1);
        assert_eq!(report.batches_submitted, 0);
        assert!(fx.ledger.submitted().is_empty());
        assert_eq!(fx.status(&records[1]), PublishStatus::Stored);
        assert_eq!(fx.store.locked_count(), 0);
    }

    #[tokio::test]
    async fn oversized_records_are_left_stored() {
        let fx = Fixture::new();
        let records = fx.seed("org-a", 2);

        let report = fx.dispatcher(10).run_once().await.unwrap();
        assert_eq!(report.batches_failed, 2);
        assert_eq!(report.batches_submitted, 0);
        assert!(fx.ledger.submitted().is_empty());
        assert!(records.iter().all(|r| fx.status(r) == PublishStatus::Stored));
    }

    #[tokio::test]
    async fn static_organisations_restrict_the_run() {
        let fx = Fixture::new();
        let a = fx.seed("org-a", 1);
        let b = fx.seed("org-b", 1);

        fx.dispatcher(16_000)
            .with_organisations(OrganisationSource::Static(vec![OrganisationId::new("org-b").unwrap()]))
            .run_once()
            .await
            .unwrap();
        assert_eq!(fx.status(&a[0]), PublishStatus::Stored);
        assert_eq!(fx.status(&b[0]), PublishStatus::Submitted);
    }

    #[tokio::test]
    async fn strategy_can_hold_records_back() {
        let fx = Fixture::new();
        let records = fx.seed("org-a", 3);
        let first_only = |_: &OrganisationId, mut pending: Vec<ConsignmentRecord>| {
            pending.truncate(1);
            pending
        };

        fx.dispatcher(16_000)
            .with_strategy(Arc::new(first_only))
            .run_once()
            .await
            .unwrap();
        let submitted = records
            .iter()
            .filter(|r| fx.status(r) == PublishStatus::Submitted)
            .count();
        assert_eq!(submitted, 1);
    }

    #[tokio::test]
    async fn requeue_moves_rolled_back_record_to_stored() {
        let fx = Fixture::new();
        let mut record = fx.seed("org-a", 1).remove(0);
        record.mark_submitted("tx".into(), None, 1, t0()).unwrap();
        record.mark_rolled_back(t0()).unwrap();
        fx.store.seed([record.clone()]);

        let requeued = fx.dispatcher(16_000).requeue(record.id()).await.unwrap();
        assert_eq!(requeued.publish_status(), PublishStatus::Stored);
        assert_eq!(fx.status(&record), PublishStatus::Stored);
        assert_eq!(
            fx.sink.events()[0].status_updates[0].status,
            LedgerDispatchStatus::MarkDispatch
        );
    }

    #[tokio::test]
    async fn requeue_refuses_records_that_are_not_rolled_back() {
        let fx = Fixture::new();
        let record = fx.seed("org-a", 1).remove(0);

        let err = fx.dispatcher(16_000).requeue(record.id()).await.unwrap_err();
        assert!(matches!(err, PublisherError::Transition(_)));
        assert_eq!(fx.store.locked_count(), 0);
    }
}
