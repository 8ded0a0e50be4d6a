//! Consignment persistence operations.
//!
//! [`PgConsignmentStore`] implements the publisher's store port on the
//! `consignments` table. Locking selections use `FOR UPDATE SKIP LOCKED`, so
//! concurrent dispatcher or watchdog runs, in this process or another one,
//! each get a disjoint set of rows. Status transitions are checked by the
//! record itself before anything reaches SQL.
//!
//! Every row read goes through [`ConsignmentRow::into_record`], which
//! re-derives the content-addressed id and rejects rows whose submission
//! columns disagree with their status.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cms_core::{
    ConsignmentId, ConsignmentPayload, ConsignmentRecord, FinalityTier, OrganisationId,
    PublishStatus, RecordParts, Submission, VersionGroupKey,
};
use cms_publisher::error::StoreError;
use cms_publisher::{ConsignmentStore, StoreTransaction};
use sqlx::{PgPool, Postgres, Transaction};

/// Every selection shares one column list and aliases the table as `c`.
macro_rules! select_consignments {
    ($rest:literal) => {
        concat!(
            "SELECT c.id, c.version_group_key, c.version, c.payload, c.publish_status,
                    c.transaction_hash, c.absolute_slot, c.creation_slot, c.finality_tier,
                    c.created_at, c.updated_at
             FROM consignments c ",
            $rest
        )
    };
}

const INSERT_NEW: &str =
    "INSERT INTO consignments (id, version_group_key, version, sender_id, receiver_id, payload,
                               publish_status, transaction_hash, absolute_slot, creation_slot,
                               finality_tier, created_at, updated_at)
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
     ON CONFLICT DO NOTHING";

const UPSERT: &str =
    "INSERT INTO consignments (id, version_group_key, version, sender_id, receiver_id, payload,
                               publish_status, transaction_hash, absolute_slot, creation_slot,
                               finality_tier, created_at, updated_at)
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
     ON CONFLICT (id) DO UPDATE SET
         payload = EXCLUDED.payload,
         publish_status = EXCLUDED.publish_status,
         transaction_hash = EXCLUDED.transaction_hash,
         absolute_slot = EXCLUDED.absolute_slot,
         creation_slot = EXCLUDED.creation_slot,
         finality_tier = EXCLUDED.finality_tier,
         updated_at = EXCLUDED.updated_at";

fn backend(e: sqlx::Error) -> StoreError {
    tracing::error!(error = %e, "consignment store query failed");
    StoreError::Backend(e.to_string())
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Postgres-backed record store.
#[derive(Debug, Clone)]
pub struct PgConsignmentStore {
    pool: PgPool,
}

impl PgConsignmentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ConsignmentStore for PgConsignmentStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let tx = self.pool.begin().await.map_err(backend)?;
        Ok(Box::new(PgStoreTransaction { tx }))
    }

    async fn find_by_id(&self, id: &ConsignmentId) -> Result<Option<ConsignmentRecord>, StoreError> {
        let row = sqlx::query_as::<_, ConsignmentRow>(select_consignments!("WHERE c.id = $1"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(ConsignmentRow::into_record).transpose()
    }

    async fn find_latest_by_group(
        &self,
        key: &VersionGroupKey,
    ) -> Result<Option<ConsignmentRecord>, StoreError> {
        let row = sqlx::query_as::<_, ConsignmentRow>(select_consignments!(
            "WHERE c.version_group_key = $1 ORDER BY c.version DESC LIMIT 1"
        ))
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.map(ConsignmentRow::into_record).transpose()
    }

    async fn insert_new(
        &self,
        records: Vec<ConsignmentRecord>,
    ) -> Result<Vec<ConsignmentRecord>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let mut inserted = Vec::with_capacity(records.len());
        for record in records {
            let row = RowValues::encode(&record)?;
            let result = row
                .bind_to(sqlx::query(INSERT_NEW))
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
            if result.rows_affected() > 0 {
                inserted.push(record);
            }
        }
        tx.commit().await.map_err(backend)?;
        Ok(inserted)
    }

    async fn dispatch_organisations(&self) -> Result<Vec<OrganisationId>, StoreError> {
        let senders: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT sender_id FROM consignments
             WHERE publish_status = 'STORED' ORDER BY sender_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        senders
            .into_iter()
            .map(|raw| {
                OrganisationId::new(raw.clone()).map_err(|e| StoreError::Corrupt {
                    id: raw,
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }
}

/// An open Postgres transaction. Dropping it rolls back.
pub struct PgStoreTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PgStoreTransaction {
    async fn fetch_locked(
        &mut self,
        query: sqlx::query::QueryAs<'_, Postgres, ConsignmentRow, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<ConsignmentRecord>, StoreError> {
        let rows = query.fetch_all(&mut *self.tx).await.map_err(backend)?;
        rows.into_iter().map(ConsignmentRow::into_record).collect()
    }
}

#[async_trait]
impl StoreTransaction for PgStoreTransaction {
    async fn lock_dispatchable(
        &mut self,
        organisation_id: &OrganisationId,
        limit: usize,
        latest_only: bool,
    ) -> Result<Vec<ConsignmentRecord>, StoreError> {
        let query = sqlx::query_as::<_, ConsignmentRow>(select_consignments!(
            "WHERE c.sender_id = $1
               AND c.publish_status = 'STORED'
               AND (NOT $3 OR NOT EXISTS (
                     SELECT 1 FROM consignments n
                     WHERE n.version_group_key = c.version_group_key
                       AND n.version > c.version))
             ORDER BY c.created_at, c.id
             LIMIT $2
             FOR UPDATE OF c SKIP LOCKED"
        ))
        .bind(organisation_id.as_str())
        .bind(sql_limit(limit))
        .bind(latest_only);
        self.fetch_locked(query).await
    }

    async fn lock_unfinalized(&mut self, limit: usize) -> Result<Vec<ConsignmentRecord>, StoreError> {
        let query = sqlx::query_as::<_, ConsignmentRow>(select_consignments!(
            "WHERE c.publish_status IN ('SUBMITTED', 'VISIBLE_ON_CHAIN', 'COMPLETED')
             ORDER BY c.created_at, c.id
             LIMIT $1
             FOR UPDATE OF c SKIP LOCKED"
        ))
        .bind(sql_limit(limit));
        self.fetch_locked(query).await
    }

    async fn lock_by_id(
        &mut self,
        id: &ConsignmentId,
    ) -> Result<Option<ConsignmentRecord>, StoreError> {
        let query = sqlx::query_as::<_, ConsignmentRow>(select_consignments!(
            "WHERE c.id = $1 FOR UPDATE OF c SKIP LOCKED"
        ))
        .bind(id.as_str());
        Ok(self.fetch_locked(query).await?.into_iter().next())
    }

    async fn upsert_all(&mut self, records: &[ConsignmentRecord]) -> Result<(), StoreError> {
        for record in records {
            let row = RowValues::encode(record)?;
            row.bind_to(sqlx::query(UPSERT))
                .execute(&mut *self.tx)
                .await
                .map_err(backend)?;
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(backend)
    }
}

/// Column values for one record, ready to bind.
#[derive(Debug, PartialEq)]
struct RowValues {
    id: String,
    version_group_key: String,
    version: i32,
    sender_id: String,
    receiver_id: String,
    payload: serde_json::Value,
    publish_status: &'static str,
    transaction_hash: Option<String>,
    absolute_slot: Option<i64>,
    creation_slot: Option<i64>,
    finality_tier: Option<&'static str>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RowValues {
    fn encode(record: &ConsignmentRecord) -> Result<Self, StoreError> {
        let id = record.id().to_string();
        let out_of_range = |field: &str| StoreError::Corrupt {
            id: id.clone(),
            reason: format!("{field} does not fit its column"),
        };

        let payload = serde_json::to_value(record.payload()).map_err(|e| StoreError::Corrupt {
            id: id.clone(),
            reason: format!("payload does not serialize: {e}"),
        })?;
        let version = i32::try_from(record.version()).map_err(|_| out_of_range("version"))?;

        let submission = record.submission();
        let absolute_slot = submission
            .and_then(|s| s.absolute_slot)
            .map(|slot| i64::try_from(slot).map_err(|_| out_of_range("absolute_slot")))
            .transpose()?;
        let creation_slot = submission
            .map(|s| i64::try_from(s.creation_slot).map_err(|_| out_of_range("creation_slot")))
            .transpose()?;

        Ok(Self {
            version_group_key: record.version_group_key().to_string(),
            version,
            sender_id: record.sender_id().to_string(),
            receiver_id: record.payload().receiver.id.to_string(),
            payload,
            publish_status: record.publish_status().as_str(),
            transaction_hash: submission.map(|s| s.transaction_hash.clone()),
            absolute_slot,
            creation_slot,
            finality_tier: submission.and_then(|s| s.finality).map(|f| f.as_str()),
            created_at: record.created_at(),
            updated_at: record.updated_at(),
            id,
        })
    }

    fn bind_to<'q>(
        self,
        query: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
    ) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
        query
            .bind(self.id)
            .bind(self.version_group_key)
            .bind(self.version)
            .bind(self.sender_id)
            .bind(self.receiver_id)
            .bind(self.payload)
            .bind(self.publish_status)
            .bind(self.transaction_hash)
            .bind(self.absolute_slot)
            .bind(self.creation_slot)
            .bind(self.finality_tier)
            .bind(self.created_at)
            .bind(self.updated_at)
    }
}

/// Internal row type for SQLx mapping.
#[derive(Debug, Clone, sqlx::FromRow)]
struct ConsignmentRow {
    id: String,
    version_group_key: String,
    version: i32,
    payload: serde_json::Value,
    publish_status: String,
    transaction_hash: Option<String>,
    absolute_slot: Option<i64>,
    creation_slot: Option<i64>,
    finality_tier: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ConsignmentRow {
    /// Decode and re-verify a stored row. Nothing is defaulted.
    fn into_record(self) -> Result<ConsignmentRecord, StoreError> {
        let row_id = self.id.clone();
        let corrupt = |reason: String| StoreError::Corrupt {
            id: row_id.clone(),
            reason,
        };

        let id = ConsignmentId::from_hex(self.id).map_err(|e| corrupt(e.to_string()))?;
        let version_group_key =
            VersionGroupKey::from_hex(self.version_group_key).map_err(|e| corrupt(e.to_string()))?;
        let version = u32::try_from(self.version)
            .map_err(|_| corrupt(format!("negative version {}", self.version)))?;
        let payload: ConsignmentPayload = serde_json::from_value(self.payload)
            .map_err(|e| corrupt(format!("payload does not decode: {e}")))?;
        let publish_status = self
            .publish_status
            .parse::<PublishStatus>()
            .map_err(|e| corrupt(e.to_string()))?;

        let slot = |value: Option<i64>, column: &str| {
            value
                .map(|v| u64::try_from(v).map_err(|_| corrupt(format!("negative {column} {v}"))))
                .transpose()
        };
        let absolute_slot = slot(self.absolute_slot, "absolute_slot")?;
        let creation_slot = slot(self.creation_slot, "creation_slot")?;
        let finality = self
            .finality_tier
            .as_deref()
            .map(str::parse::<FinalityTier>)
            .transpose()
            .map_err(|e| corrupt(e.to_string()))?;

        let submission = match (self.transaction_hash, creation_slot) {
            (Some(transaction_hash), Some(creation_slot)) => Some(Submission {
                transaction_hash,
                absolute_slot,
                creation_slot,
                finality,
            }),
            (None, None) if absolute_slot.is_none() && finality.is_none() => None,
            _ => return Err(corrupt("submission columns are partially set".to_string())),
        };

        ConsignmentRecord::from_parts(RecordParts {
            id,
            version_group_key,
            version,
            payload,
            publish_status,
            submission,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
        .map_err(|e| corrupt(e.to_string()))
    }
}
