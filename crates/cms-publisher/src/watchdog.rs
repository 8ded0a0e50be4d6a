//! # Watchdog Reconciler
//!
//! Brings dispatched records in line with what the ledger reports.
//!
//! Each run:
//!
//! 1. Reads the chain tip. An unsynced node makes the run a no-op.
//! 2. Locks up to `tx_limit` unfinalized records (SUBMITTED,
//!    VISIBLE_ON_CHAIN, COMPLETED), oldest first. FINALIZED and ROLLBACKED
//!    records are never selected.
//! 3. Looks up each record's transaction. Reported details map to a
//!    status through the finality tier. Missing details either keep the
//!    record SUBMITTED at the lowest tier, or roll it back once its age
//!    in slots exceeds the grace period.
//! 4. Writes every changed record in one commit.
//! 5. Publishes status events grouped by sender.
//!
//! A failed transaction lookup aborts the run before anything is written.

use std::collections::BTreeMap;
use std::sync::Arc;

use cms_core::{
    ChainReader, ChainTip, Clock, ConsignmentRecord, FinalityTier, OnChainTxDetails,
    OrganisationId, Submission,
};

use crate::config::WatchdogConfig;
use crate::error::WatchdogError;
use crate::events::EventPublisher;
use crate::store::ConsignmentStore;

/// What the ledger says about one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// Seen on chain at this tier.
    Observed {
        finality: FinalityTier,
        absolute_slot: Option<u64>,
    },
    /// Not seen yet, still inside the grace period.
    Pending,
    /// Not seen and older than the grace period.
    RolledBack,
}

/// Classify a submission from the tip and the optional transaction details.
///
/// Age is `tip - creation_slot`; only an age strictly greater than
/// `grace_slots` rolls back.
pub fn classify_observation(
    submission: &Submission,
    details: Option<&OnChainTxDetails>,
    tip: &ChainTip,
    grace_slots: u64,
) -> Reconciliation {
    match details {
        Some(details) => Reconciliation::Observed {
            finality: details.finality,
            absolute_slot: details.absolute_slot,
        },
        None => {
            let age = tip.absolute_slot.saturating_sub(submission.creation_slot);
            if age > grace_slots {
                Reconciliation::RolledBack
            } else {
                Reconciliation::Pending
            }
        }
    }
}

/// Counters for one reconciliation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchdogReport {
    /// Unfinalized records locked and checked.
    pub examined: usize,
    /// Records whose status or submission changed, rollbacks included.
    pub updated: usize,
    /// Records moved to ROLLBACKED.
    pub rolled_back: usize,
    /// Status events emitted.
    pub events: usize,
}

/// What a watchdog run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogOutcome {
    /// The chain reader was not synced; nothing was examined.
    NotSynced {
        /// Tip slot reported at the time.
        tip: u64,
    },
    /// Records were reconciled and committed.
    Reconciled(WatchdogReport),
}

/// Reconciles dispatched records against what the ledger reports.
pub struct Watchdog {
    store: Arc<dyn ConsignmentStore>,
    reader: Arc<dyn ChainReader>,
    events: Arc<EventPublisher>,
    clock: Arc<dyn Clock>,
    config: WatchdogConfig,
}

impl Watchdog {
    pub fn new(
        store: Arc<dyn ConsignmentStore>,
        reader: Arc<dyn ChainReader>,
        events: Arc<EventPublisher>,
        clock: Arc<dyn Clock>,
        config: WatchdogConfig,
    ) -> Self {
        Self {
            store,
            reader,
            events,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<WatchdogOutcome, WatchdogError> {
        let tip = self.reader.chain_tip().await.map_err(WatchdogError::Tip)?;
        if !tip.synced {
            tracing::info!(tip = tip.absolute_slot, "chain reader not synced, skipping watchdog run");
            metrics::counter!("cms_watchdog_runs_total", "outcome" => "not_synced").increment(1);
            return Ok(WatchdogOutcome::NotSynced {
                tip: tip.absolute_slot,
            });
        }

        let grace_slots = self.config.rollback_grace_slots();
        let mut tx = self.store.begin().await?;
        let records = tx.lock_unfinalized(self.config.tx_limit).await?;
        tracing::debug!(tip = tip.absolute_slot, records = records.len(), "watchdog run started");

        let mut report = WatchdogReport {
            examined: records.len(),
            ..WatchdogReport::default()
        };
        let mut changed: Vec<ConsignmentRecord> = Vec::new();

        for mut record in records {
            let Some(submission) = record.submission().cloned() else {
                tracing::warn!(consignment_id = %record.id(), "unfinalized record without submission");
                continue;
            };
            let details = match self.reader.tx_details(&submission.transaction_hash).await {
                Ok(details) => details,
                Err(source) => {
                    metrics::counter!("cms_watchdog_runs_total", "outcome" => "failed")
                        .increment(1);
                    return Err(WatchdogError::TxDetails {
                        transaction_hash: submission.transaction_hash,
                        source,
                    });
                }
            };

            let now = self.clock.now();
            let updated = match classify_observation(&submission, details.as_ref(), &tip, grace_slots) {
                Reconciliation::Observed {
                    finality,
                    absolute_slot,
                } => record.reconcile_observed(finality, absolute_slot, now)?,
                Reconciliation::Pending => record.reconcile_pending(now)?,
                Reconciliation::RolledBack => {
                    tracing::warn!(
                        consignment_id = %record.id(),
                        tx_hash = %submission.transaction_hash,
                        creation_slot = submission.creation_slot,
                        tip = tip.absolute_slot,
                        "transaction not found past grace period, rolling back"
                    );
                    record.mark_rolled_back(now)?;
                    report.rolled_back += 1;
                    true
                }
            };
            if updated {
                changed.push(record);
            }
        }

        if !changed.is_empty() {
            tx.upsert_all(&changed).await?;
        }
        tx.commit().await?;
        report.updated = changed.len();

        let mut by_sender: BTreeMap<OrganisationId, Vec<ConsignmentRecord>> = BTreeMap::new();
        for record in changed {
            by_sender
                .entry(record.sender_id().clone())
                .or_default()
                .push(record);
        }
        for (organisation_id, records) in &by_sender {
            match self.events.publish(organisation_id, records).await {
                Ok(sent) => report.events += sent,
                Err(e) => {
                    tracing::error!(organisation_id = %organisation_id, error = %e, "status event publication failed")
                }
            }
        }

        metrics::counter!("cms_watchdog_runs_total", "outcome" => "reconciled").increment(1);
        metrics::counter!("cms_watchdog_rollbacks_total").increment(report.rolled_back as u64);
        tracing::info!(
            tip = tip.absolute_slot,
            examined = report.examined,
            updated = report.updated,
            rolled_back = report.rolled_back,
            "watchdog run done"
        );
        Ok(WatchdogOutcome::Reconciled(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use chrono::{DateTime, TimeZone, Utc};
    use cms_core::{
        ConsignmentPayload, DispatchTimestamp, FixedClock, MockLedger, Organisation,
        PublishStatus,
    };

    use crate::config::EventConfig;
    use crate::events::InMemoryEventSink;
    use crate::store::memory::InMemoryConsignmentStore;

    const GRACE_SLOTS: u64 = 900;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 8, 1, 0, 0, 0).unwrap()
    }

    struct Fixture {
        ledger: Arc<MockLedger>,
        store: InMemoryConsignmentStore,
        sink: InMemoryEventSink,
        watchdog: Watchdog,
    }

    fn fixture(tip: u64) -> Fixture {
        let ledger = Arc::new(MockLedger::new(tip));
        let store = InMemoryConsignmentStore::new();
        let sink = InMemoryEventSink::new();
        let clock = Arc::new(FixedClock::new(t0()));
        let events = Arc::new(EventPublisher::new(
            Arc::new(sink.clone()),
            clock.clone(),
            EventConfig::default(),
        ));
        let watchdog = Watchdog::new(
            Arc::new(store.clone()),
            ledger.clone(),
            events,
            clock,
            WatchdogConfig {
                rollback_grace_minutes: 15,
                slot_duration: Duration::from_secs(1),
                ..WatchdogConfig::default()
            },
        );
        Fixture {
            ledger,
            store,
            sink,
            watchdog,
        }
    }

    fn submitted(sender: &str, minute: u32, tx_hash: &str, creation_slot: u64) -> ConsignmentRecord {
        let payload = ConsignmentPayload {
            sender: Organisation::new(OrganisationId::new(sender).unwrap()),
            receiver: Organisation::new(OrganisationId::new("warehouse").unwrap()),
            goods: BTreeMap::from([("drums".to_string(), 4)]),
            tracking_status: None,
            geolocation: None,
            dispatched_at: DispatchTimestamp::parse(&format!("2024-07-31T23:{minute:02}:00.000"))
                .unwrap(),
        };
        let mut record = ConsignmentRecord::new(payload, 1, t0()).unwrap();
        record
            .mark_submitted(tx_hash.into(), None, creation_slot, t0())
            .unwrap();
        record
    }

    fn reconciled(outcome: WatchdogOutcome) -> WatchdogReport {
        match outcome {
            WatchdogOutcome::Reconciled(report) => report,
            other => panic!("expected a reconciled run, got {other:?}"),
        }
    }

    #[test]
    fn grace_boundary_is_exclusive() {
        let submission = Submission {
            transaction_hash: "tx".into(),
            absolute_slot: None,
            creation_slot: 1_000,
            finality: None,
        };
        let tip = |slot| ChainTip {
            absolute_slot: slot,
            synced: true,
        };
        assert_eq!(
            classify_observation(&submission, None, &tip(1_000 + GRACE_SLOTS - 1), GRACE_SLOTS),
            Reconciliation::Pending
        );
        assert_eq!(
            classify_observation(&submission, None, &tip(1_000 + GRACE_SLOTS), GRACE_SLOTS),
            Reconciliation::Pending
        );
        assert_eq!(
            classify_observation(&submission, None, &tip(1_000 + GRACE_SLOTS + 1), GRACE_SLOTS),
            Reconciliation::RolledBack
        );
        // Tip behind creation slot counts as age zero.
        assert_eq!(
            classify_observation(&submission, None, &tip(10), GRACE_SLOTS),
            Reconciliation::Pending
        );
    }

    #[test]
    fn details_win_over_age() {
        let submission = Submission {
            transaction_hash: "tx".into(),
            absolute_slot: None,
            creation_slot: 0,
            finality: None,
        };
        let details = OnChainTxDetails {
            transaction_hash: "tx".into(),
            absolute_slot: Some(12),
            finality: FinalityTier::High,
        };
        let tip = ChainTip {
            absolute_slot: 1_000_000,
            synced: true,
        };
        assert_eq!(
            classify_observation(&submission, Some(&details), &tip, GRACE_SLOTS),
            Reconciliation::Observed {
                finality: FinalityTier::High,
                absolute_slot: Some(12),
            }
        );
    }

    #[tokio::test]
    async fn unsynced_tip_skips_the_run() {
        let fx = fixture(10_000);
        let record = submitted("org-a", 1, "tx-1", 1);
        fx.store.seed([record.clone()]);
        fx.ledger.set_synced(false);

        let outcome = fx.watchdog.run_once().await.unwrap();
        assert_eq!(outcome, WatchdogOutcome::NotSynced { tip: 10_000 });
        assert_eq!(fx.store.get(record.id()).unwrap(), record);
        assert!(fx.sink.events().is_empty());
    }

    #[tokio::test]
    async fn missing_transaction_past_grace_rolls_back() {
        let creation_slot = 1_000;
        let fx = fixture(creation_slot + GRACE_SLOTS + 1);
        let record = submitted("org-a", 1, "tx-1", creation_slot);
        fx.store.seed([record.clone()]);

        let report = reconciled(fx.watchdog.run_once().await.unwrap());
        assert_eq!(report.rolled_back, 1);

        let stored = fx.store.get(record.id()).unwrap();
        assert_eq!(stored.publish_status(), PublishStatus::Rollbacked);
        assert!(stored.submission().is_none());
        assert!(fx.sink.events()[0].status_updates[0].receipts.is_empty());
    }

    #[tokio::test]
    async fn missing_transaction_inside_grace_stays_submitted_at_lowest_tier() {
        let creation_slot = 1_000;
        let fx = fixture(creation_slot + GRACE_SLOTS - 1);
        let record = submitted("org-a", 1, "tx-1", creation_slot);
        fx.store.seed([record.clone()]);

        let report = reconciled(fx.watchdog.run_once().await.unwrap());
        assert_eq!(report.updated, 1);
        let stored = fx.store.get(record.id()).unwrap();
        assert_eq!(stored.publish_status(), PublishStatus::Submitted);
        assert_eq!(stored.submission().unwrap().finality, Some(FinalityTier::VeryLow));

        // A second pass changes nothing and emits nothing new.
        fx.sink.clear();
        let report = reconciled(fx.watchdog.run_once().await.unwrap());
        assert_eq!(report.updated, 0);
        assert!(fx.sink.events().is_empty());
    }

    #[tokio::test]
    async fn finality_advances_and_finalized_records_drop_out() {
        let fx = fixture(2_000);
        let record = submitted("org-a", 1, "tx-1", 1_990);
        fx.store.seed([record.clone()]);

        fx.ledger.confirm("tx-1", FinalityTier::Low, 1_995);
        fx.watchdog.run_once().await.unwrap();
        let stored = fx.store.get(record.id()).unwrap();
        assert_eq!(stored.publish_status(), PublishStatus::VisibleOnChain);
        assert_eq!(stored.submission().unwrap().absolute_slot, Some(1_995));

        fx.ledger.confirm("tx-1", FinalityTier::High, 1_995);
        fx.watchdog.run_once().await.unwrap();
        assert_eq!(
            fx.store.get(record.id()).unwrap().publish_status(),
            PublishStatus::Completed
        );

        fx.ledger.confirm("tx-1", FinalityTier::Final, 1_995);
        fx.watchdog.run_once().await.unwrap();
        assert_eq!(
            fx.store.get(record.id()).unwrap().publish_status(),
            PublishStatus::Finalized
        );

        // Finalized records are never re-examined, even if the ledger forgets them.
        fx.ledger.forget("tx-1");
        fx.ledger.advance(GRACE_SLOTS * 10);
        let report = reconciled(fx.watchdog.run_once().await.unwrap());
        assert_eq!(report.examined, 0);
        assert_eq!(
            fx.store.get(record.id()).unwrap().publish_status(),
            PublishStatus::Finalized
        );
    }

    #[tokio::test]
    async fn detail_lookup_failure_aborts_without_writes() {
        let fx = fixture(5_000);
        let record = submitted("org-a", 1, "tx-1", 1);
        fx.store.seed([record.clone()]);
        fx.ledger.set_details_unavailable(true);

        let err = fx.watchdog.run_once().await.unwrap_err();
        assert!(matches!(err, WatchdogError::TxDetails { .. }));
        assert_eq!(fx.store.get(record.id()).unwrap(), record);
        assert!(fx.sink.events().is_empty());
        assert_eq!(fx.store.locked_count(), 0);
    }

    #[tokio::test]
    async fn events_are_grouped_by_sender() {
        let fx = fixture(3_000);
        fx.store.seed([
            submitted("org-a", 1, "tx-a1", 2_990),
            submitted("org-b", 2, "tx-b1", 2_990),
            submitted("org-a", 3, "tx-a2", 2_990),
        ]);
        for hash in ["tx-a1", "tx-b1", "tx-a2"] {
            fx.ledger.confirm(hash, FinalityTier::Medium, 2_995);
        }

        let report = reconciled(fx.watchdog.run_once().await.unwrap());
        assert_eq!(report.updated, 3);
        let events = fx.sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].organisation_id.as_str(), "org-a");
        assert_eq!(events[0].status_updates.len(), 2);
        assert_eq!(events[1].organisation_id.as_str(), "org-b");
    }

    #[tokio::test]
    async fn tx_limit_bounds_the_run() {
        let fx = fixture(3_000);
        fx.store.seed((0..5).map(|m| submitted("org-a", m, &format!("tx-{m}"), 2_999)));
        let watchdog = Watchdog::new(
            Arc::new(fx.store.clone()),
            fx.ledger.clone(),
            Arc::new(EventPublisher::new(
                Arc::new(fx.sink.clone()),
                Arc::new(FixedClock::new(t0())),
                EventConfig::default(),
            )),
            Arc::new(FixedClock::new(t0())),
            WatchdogConfig {
                tx_limit: 2,
                ..WatchdogConfig::default()
            },
        );
        let report = reconciled(watchdog.run_once().await.unwrap());
        assert_eq!(report.examined, 2);
    }
}
