//! # Status Events
//!
//! Downstream consumers learn about publication progress through
//! `ConsignmentsLedgerUpdated` events. [`EventPublisher::publish`] splits
//! an organisation's changed records into fixed-size chunks and emits one
//! event per chunk. Delivery guarantees belong to the [`EventSink`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cms_core::{Clock, ConsignmentId, ConsignmentRecord, LedgerDispatchStatus, OrganisationId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::EventConfig;
use crate::error::EventError;

pub const EVENT_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub id: Uuid,
    pub version: String,
    pub at: DateTime<Utc>,
}

/// Where a status change was recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockchainReceipt {
    #[serde(rename = "type")]
    pub chain_type: String,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsignmentStatusUpdate {
    pub consignment_id: ConsignmentId,
    pub status: LedgerDispatchStatus,
    /// Empty until the record has a transaction hash.
    pub receipts: Vec<BlockchainReceipt>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsignmentsLedgerUpdatedEvent {
    pub metadata: EventMetadata,
    pub organisation_id: OrganisationId,
    pub status_updates: Vec<ConsignmentStatusUpdate>,
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, event: ConsignmentsLedgerUpdatedEvent) -> Result<(), EventError>;
}

/// Collects events in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventSink {
    events: Arc<Mutex<Vec<ConsignmentsLedgerUpdatedEvent>>>,
}

impl InMemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ConsignmentsLedgerUpdatedEvent> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl EventSink for InMemoryEventSink {
    async fn send(&self, event: ConsignmentsLedgerUpdatedEvent) -> Result<(), EventError> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Forwards events to an in-process consumer task.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::Sender<ConsignmentsLedgerUpdatedEvent>,
}

impl ChannelEventSink {
    pub fn new(tx: mpsc::Sender<ConsignmentsLedgerUpdatedEvent>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn send(&self, event: ConsignmentsLedgerUpdatedEvent) -> Result<(), EventError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| EventError::Sink("event channel closed".into()))
    }
}

/// Writes each event as a JSON log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn send(&self, event: ConsignmentsLedgerUpdatedEvent) -> Result<(), EventError> {
        let body = serde_json::to_string(&event).map_err(|e| EventError::Sink(e.to_string()))?;
        tracing::info!(
            target: "cms_events",
            event_id = %event.metadata.id,
            organisation_id = %event.organisation_id,
            updates = event.status_updates.len(),
            %body,
            "consignments ledger updated"
        );
        Ok(())
    }
}

pub struct EventPublisher {
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    config: EventConfig,
}

impl EventPublisher {
    pub fn new(sink: Arc<dyn EventSink>, clock: Arc<dyn Clock>, config: EventConfig) -> Self {
        Self {
            sink,
            clock,
            config,
        }
    }

    pub fn status_update(&self, record: &ConsignmentRecord) -> ConsignmentStatusUpdate {
        ConsignmentStatusUpdate {
            consignment_id: record.id().clone(),
            status: record.publish_status().ledger_dispatch_status(),
            receipts: record
                .transaction_hash()
                .map(|hash| BlockchainReceipt {
                    chain_type: self.config.chain_type.clone(),
                    hash: hash.to_string(),
                })
                .into_iter()
                .collect(),
        }
    }

    /// Emit one event per chunk of `records`. Returns the number of events sent.
    pub async fn publish(
        &self,
        organisation_id: &OrganisationId,
        records: &[ConsignmentRecord],
    ) -> Result<usize, EventError> {
        let mut sent = 0;
        for chunk in records.chunks(self.config.chunk_size.max(1)) {
            let event = ConsignmentsLedgerUpdatedEvent {
                metadata: EventMetadata {
                    id: Uuid::new_v4(),
                    version: EVENT_VERSION.to_string(),
                    at: self.clock.now(),
                },
                organisation_id: organisation_id.clone(),
                status_updates: chunk.iter().map(|r| self.status_update(r)).collect(),
            };
            self.sink.send(event).await?;
            sent += 1;
        }
        if sent > 0 {
            metrics::counter!("cms_events_published_total").increment(sent as u64);
            tracing::debug!(
                organisation_id = %organisation_id,
                events = sent,
                records = records.len(),
                "published status events"
            );
        }
        Ok(sent)
    }
}
