//! # On-Chain Ingestion
//!
//! Records consignments that were published to the ledger but are unknown
//! locally, for example after restoring from an empty database or when
//! another publisher instance wrote them.
//!
//! Each decoded consignment gets the next version in its version group
//! (latest stored + 1, or 1) and its declared id must match the id
//! recomputed for that version. One mismatch rejects the whole batch.
//! Known ids are skipped. New records enter as SUBMITTED so the watchdog
//! reconciles them like any other dispatched record.

use std::collections::HashMap;
use std::sync::Arc;

use cms_core::{
    Clock, ConsignmentId, ConsignmentRecord, CoreError, OrganisationId, Submission,
    VersionGroupKey,
};

use crate::codec::CborMetadataCodec;
use crate::error::IngestError;
use crate::events::EventPublisher;
use crate::store::ConsignmentStore;

/// A ledger transaction carrying consignment metadata.
#[derive(Debug, Clone)]
pub struct OnChainBatch {
    pub transaction_hash: String,
    pub absolute_slot: Option<u64>,
    /// CBOR metadata map, as stored under the metadata label.
    pub metadata: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// The metadata was not a consignments payload.
    pub foreign: bool,
    pub decoded: usize,
    pub already_known: usize,
    pub inserted: usize,
}

pub struct Ingestor {
    store: Arc<dyn ConsignmentStore>,
    codec: CborMetadataCodec,
    events: Arc<EventPublisher>,
    clock: Arc<dyn Clock>,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn ConsignmentStore>,
        events: Arc<EventPublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            codec: CborMetadataCodec,
            events,
            clock,
        }
    }

    pub async fn ingest(&self, batch: &OnChainBatch) -> Result<IngestReport, IngestError> {
        let Some(decoded) = self.codec.decode(&batch.metadata)? else {
            tracing::debug!(tx_hash = %batch.transaction_hash, "metadata is not a consignments payload");
            return Ok(IngestReport {
                foreign: true,
                ..IngestReport::default()
            });
        };

        let mut report = IngestReport {
            decoded: decoded.consignments.len(),
            ..IngestReport::default()
        };
        let now = self.clock.now();
        let mut latest: HashMap<VersionGroupKey, u32> = HashMap::new();
        let mut fresh = Vec::new();

        for consignment in decoded.consignments {
            let declared = ConsignmentId::from_hex(&consignment.declared_id).map_err(CoreError::from)?;
            if self.store.find_by_id(&declared).await?.is_some() {
                report.already_known += 1;
                continue;
            }

            let key = consignment.version_group_key();
            let current = match latest.get(&key) {
                Some(version) => *version,
                None => self
                    .store
                    .find_latest_by_group(&key)
                    .await?
                    .map_or(0, |r| r.version()),
            };
            let version = current + 1;

            let submission = Submission {
                transaction_hash: batch.transaction_hash.clone(),
                absolute_slot: batch.absolute_slot,
                creation_slot: decoded.creation_slot,
                finality: None,
            };
            let record = ConsignmentRecord::observed_on_chain(
                consignment.payload,
                version,
                &consignment.declared_id,
                submission,
                now,
            )?;
            latest.insert(key, version);
            fresh.push(record);
        }

        let inserted = self.store.insert_new(fresh).await?;
        report.inserted = inserted.len();

        let mut by_sender: HashMap<OrganisationId, Vec<ConsignmentRecord>> = HashMap::new();
        for record in inserted {
            by_sender
                .entry(record.sender_id().clone())
                .or_default()
                .push(record);
        }
        for (organisation_id, records) in &by_sender {
            if let Err(e) = self.events.publish(organisation_id, records).await {
                tracing::error!(organisation_id = %organisation_id, error = %e, "status event publication failed");
            }
        }

        tracing::info!(
            tx_hash = %batch.transaction_hash,
            decoded = report.decoded,
            inserted = report.inserted,
            already_known = report.already_known,
            "ingested on-chain batch"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use chrono::{DateTime, TimeZone, Utc};
    use cms_core::{
        ConsignmentPayload, DispatchTimestamp, FixedClock, IntegrityError, Organisation,
        PublishStatus,
    };
    use serde_cbor::Value;

    use crate::codec::{BatchEncoder, MetadataHeader};
    use crate::config::EventConfig;
    use crate::events::InMemoryEventSink;
    use crate::store::memory::InMemoryConsignmentStore;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 9, 9, 0, 0).unwrap()
    }

    fn org() -> OrganisationId {
        OrganisationId::new("org-a").unwrap()
    }

    fn payload(minute: u32) -> ConsignmentPayload {
        ConsignmentPayload {
            sender: Organisation::new(org()).with_name("Acme Freight"),
            receiver: Organisation::new(OrganisationId::new("depot-7").unwrap()),
            goods: BTreeMap::from([("bags".to_string(), 40)]),
            tracking_status: Some("IN_TRANSIT".into()),
            geolocation: None,
            dispatched_at: DispatchTimestamp::parse(&format!("2024-09-09T08:{minute:02}:00.125"))
                .unwrap(),
        }
    }

    fn on_chain(records: &[ConsignmentRecord]) -> OnChainBatch {
        let header = MetadataHeader {
            creation_slot: 777,
            timestamp: t0(),
        };
        let encoded = CborMetadataCodec.encode(&org(), records, &header).unwrap();
        OnChainBatch {
            transaction_hash: "f00d".into(),
            absolute_slot: Some(780),
            metadata: encoded.bytes,
        }
    }

    fn ingestor(store: &InMemoryConsignmentStore, sink: &InMemoryEventSink) -> Ingestor {
        let clock = Arc::new(FixedClock::new(t0()));
        Ingestor::new(
            Arc::new(store.clone()),
            Arc::new(EventPublisher::new(
                Arc::new(sink.clone()),
                clock.clone(),
                EventConfig::default(),
            )),
            clock,
        )
    }

    #[tokio::test]
    async fn unknown_records_are_stored_as_submitted() {
        let store = InMemoryConsignmentStore::new();
        let sink = InMemoryEventSink::new();
        let originals = vec![
            ConsignmentRecord::new(payload(1), 1, t0()).unwrap(),
            ConsignmentRecord::new(payload(2), 1, t0()).unwrap(),
        ];

        let report = ingestor(&store, &sink).ingest(&on_chain(&originals)).await.unwrap();
        assert_eq!(report.inserted, 2);

        for original in &originals {
            let stored = store.get(original.id()).unwrap();
            assert_eq!(stored.publish_status(), PublishStatus::Submitted);
            assert_eq!(stored.payload(), original.payload());
            let submission = stored.submission().unwrap();
            assert_eq!(submission.transaction_hash, "f00d");
            assert_eq!(submission.creation_slot, 777);
            assert_eq!(submission.absolute_slot, Some(780));
        }
        assert_eq!(sink.events().len(), 1);
        assert_eq!(sink.events()[0].status_updates[0].receipts[0].hash, "f00d");
    }

    #[tokio::test]
    async fn known_ids_are_skipped() {
        let store = InMemoryConsignmentStore::new();
        let sink = InMemoryEventSink::new();
        let original = ConsignmentRecord::new(payload(1), 1, t0()).unwrap();
        store.seed([original.clone()]);

        let report = ingestor(&store, &sink)
            .ingest(&on_chain(std::slice::from_ref(&original)))
            .await
            .unwrap();
        assert_eq!(report.already_known, 1);
        assert_eq!(report.inserted, 0);
        assert_eq!(store.get(original.id()).unwrap(), original);
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn version_follows_latest_stored_version() {
        let store = InMemoryConsignmentStore::new();
        let sink = InMemoryEventSink::new();
        store.seed([ConsignmentRecord::new(payload(1), 1, t0()).unwrap()]);
        let second = ConsignmentRecord::new(payload(1), 2, t0()).unwrap();

        ingestor(&store, &sink)
            .ingest(&on_chain(std::slice::from_ref(&second)))
            .await
            .unwrap();
        assert_eq!(store.get(second.id()).unwrap().version(), 2);
    }

    #[tokio::test]
    async fn id_mismatch_rejects_the_whole_batch() {
        let store = InMemoryConsignmentStore::new();
        let sink = InMemoryEventSink::new();
        let good = ConsignmentRecord::new(payload(1), 1, t0()).unwrap();
        // Version 3 with nothing stored: recomputed id is for version 1.
        let skipped_ahead = ConsignmentRecord::new(payload(2), 3, t0()).unwrap();

        let err = ingestor(&store, &sink)
            .ingest(&on_chain(&[good, skipped_ahead]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IngestError::Core(CoreError::Integrity(IntegrityError::IdMismatch { .. }))
        ));
        assert!(store.all().is_empty());
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn foreign_metadata_is_ignored() {
        let store = InMemoryConsignmentStore::new();
        let sink = InMemoryEventSink::new();
        let metadata = serde_cbor::to_vec(&Value::Map(
            [(Value::Text("type".into()), Value::Text("INVOICES".into()))]
                .into_iter()
                .collect(),
        ))
        .unwrap();

        let report = ingestor(&store, &sink)
            .ingest(&OnChainBatch {
                transaction_hash: "beef".into(),
                absolute_slot: None,
                metadata,
            })
            .await
            .unwrap();
        assert!(report.foreign);
        assert!(store.all().is_empty());
    }
}
