//! # Consignment Records
//!
//! A [`ConsignmentRecord`] is one version of a logical consignment plus
//! its publication state. Its id and version group key are derived from
//! the payload at construction and re-verified whenever a record is
//! rebuilt from storage.
//!
//! Status changes go through the transition methods, each of which checks
//! the state machine in [`crate::status`] and then writes a complete new
//! [`Submission`] (or clears it). No caller can patch a single submission
//! field in place.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::{derive_consignment_id, derive_version_group_key, verify_declared_id};
use crate::error::{CoreError, IntegrityError, TransitionError, ValidationError};
use crate::identity::{ConsignmentId, OrganisationId, VersionGroupKey};
use crate::status::{check_transition, FinalityTier, PublishStatus, TransitionAuthority};
use crate::temporal::DispatchTimestamp;

/// A sending or receiving organisation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organisation {
    /// Stable organisation id.
    pub id: OrganisationId,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Tax registration number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax_id_number: Option<String>,
    /// Currency code the organisation trades in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency_id: Option<String>,
    /// Country code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
}

impl Organisation {
    /// An organisation known only by id.
    pub fn new(id: OrganisationId) -> Self {
        Self {
            id,
            name: None,
            tax_id_number: None,
            currency_id: None,
            country_code: None,
        }
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the tax registration number.
    pub fn with_tax_id_number(mut self, tax_id_number: impl Into<String>) -> Self {
        self.tax_id_number = Some(tax_id_number.into());
        self
    }

    /// Set the currency code.
    pub fn with_currency_id(mut self, currency_id: impl Into<String>) -> Self {
        self.currency_id = Some(currency_id.into());
        self
    }

    /// Set the country code.
    pub fn with_country_code(mut self, country_code: impl Into<String>) -> Self {
        self.country_code = Some(country_code.into());
        self
    }
}

/// Last reported position of a consignment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geolocation {
    latitude: f64,
    longitude: f64,
}

impl Geolocation {
    /// Validate coordinates in decimal degrees.
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, ValidationError> {
        let in_range = (-90.0..=90.0).contains(&latitude) && (-180.0..=180.0).contains(&longitude);
        if !in_range {
            return Err(ValidationError::GeolocationOutOfRange {
                latitude,
                longitude,
            });
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    /// Latitude in decimal degrees.
    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    /// Longitude in decimal degrees.
    pub fn longitude(&self) -> f64 {
        self.longitude
    }
}

/// Business content of a consignment version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsignmentPayload {
    /// Sending organisation; owns the record for dispatch.
    pub sender: Organisation,
    /// Receiving organisation.
    pub receiver: Organisation,
    /// Item name to quantity.
    pub goods: BTreeMap<String, u64>,
    /// Free-form tracking note.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_status: Option<String>,
    /// Last known position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geolocation: Option<Geolocation>,
    /// When the consignment left the sender.
    pub dispatched_at: DispatchTimestamp,
}

impl ConsignmentPayload {
    /// Key shared by every version of this consignment.
    pub fn version_group_key(&self) -> VersionGroupKey {
        derive_version_group_key(&self.sender.id, &self.receiver.id, &self.dispatched_at)
    }

    /// Id of `version` of this consignment.
    pub fn consignment_id(&self, version: u32) -> ConsignmentId {
        derive_consignment_id(
            &self.sender.id,
            &self.receiver.id,
            &self.dispatched_at,
            version,
        )
    }
}

/// Ledger-side facts about a dispatched consignment.
///
/// Replaced as a whole on every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    /// Hash of the carrying transaction.
    pub transaction_hash: String,
    /// Slot the transaction was observed in, once known.
    pub absolute_slot: Option<u64>,
    /// Chain tip slot when the transaction was built.
    pub creation_slot: u64,
    /// Last observed tier; `None` until the first reconciliation.
    pub finality: Option<FinalityTier>,
}

/// Every field of a record, for storage adapters.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordParts {
    /// See [`ConsignmentRecord::id`].
    pub id: ConsignmentId,
    /// See [`ConsignmentRecord::version_group_key`].
    pub version_group_key: VersionGroupKey,
    /// Version number, 1 or higher.
    pub version: u32,
    /// Business content.
    pub payload: ConsignmentPayload,
    /// Current status.
    pub publish_status: PublishStatus,
    /// Present exactly when the status is on the ledger side.
    pub submission: Option<Submission>,
    /// When the record was first stored.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

/// One version of a consignment and its publication state.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsignmentRecord {
    id: ConsignmentId,
    version_group_key: VersionGroupKey,
    version: u32,
    payload: ConsignmentPayload,
    publish_status: PublishStatus,
    submission: Option<Submission>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ConsignmentRecord {
    /// A new version awaiting dispatch.
    pub fn new(
        payload: ConsignmentPayload,
        version: u32,
        now: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        if version == 0 {
            return Err(ValidationError::ZeroVersion);
        }
        Ok(Self {
            id: payload.consignment_id(version),
            version_group_key: payload.version_group_key(),
            version,
            payload,
            publish_status: PublishStatus::Stored,
            submission: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// A version first learned about from the ledger.
    ///
    /// The declared id must match the id recomputed for `version`.
    pub fn observed_on_chain(
        payload: ConsignmentPayload,
        version: u32,
        declared_id: &str,
        submission: Submission,
        now: DateTime<Utc>,
    ) -> Result<Self, CoreError> {
        if version == 0 {
            return Err(ValidationError::ZeroVersion.into());
        }
        let id = verify_declared_id(
            declared_id,
            &payload.sender.id,
            &payload.receiver.id,
            &payload.dispatched_at,
            version,
        )?;
        Ok(Self {
            id,
            version_group_key: payload.version_group_key(),
            version,
            payload,
            publish_status: PublishStatus::Submitted,
            submission: Some(submission),
            created_at: now,
            updated_at: now,
        })
    }

    /// Rebuild a record from storage, re-checking every derived field.
    pub fn from_parts(parts: RecordParts) -> Result<Self, CoreError> {
        if parts.version == 0 {
            return Err(ValidationError::ZeroVersion.into());
        }
        let computed_key = parts.payload.version_group_key();
        if computed_key != parts.version_group_key {
            return Err(IntegrityError::VersionGroupMismatch {
                stored: parts.version_group_key.to_string(),
                computed: computed_key.to_string(),
            }
            .into());
        }
        verify_declared_id(
            parts.id.as_str(),
            &parts.payload.sender.id,
            &parts.payload.receiver.id,
            &parts.payload.dispatched_at,
            parts.version,
        )?;
        let required = parts.publish_status.requires_submission();
        match (&parts.submission, required) {
            (None, true) => {
                return Err(IntegrityError::SubmissionStatusMismatch {
                    id: parts.id.to_string(),
                    status: parts.publish_status,
                    problem: "has no submission",
                }
                .into())
            }
            (Some(_), false) => {
                return Err(IntegrityError::SubmissionStatusMismatch {
                    id: parts.id.to_string(),
                    status: parts.publish_status,
                    problem: "still carries a submission",
                }
                .into())
            }
            _ => {}
        }
        Ok(Self {
            id: parts.id,
            version_group_key: parts.version_group_key,
            version: parts.version,
            payload: parts.payload,
            publish_status: parts.publish_status,
            submission: parts.submission,
            created_at: parts.created_at,
            updated_at: parts.updated_at,
        })
    }

    /// Split into plain fields.
    pub fn into_parts(self) -> RecordParts {
        RecordParts {
            id: self.id,
            version_group_key: self.version_group_key,
            version: self.version,
            payload: self.payload,
            publish_status: self.publish_status,
            submission: self.submission,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Content-addressed id of this version.
    pub fn id(&self) -> &ConsignmentId {
        &self.id
    }

    /// Key shared with the other versions.
    pub fn version_group_key(&self) -> &VersionGroupKey {
        &self.version_group_key
    }

    /// Version number.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Business content.
    pub fn payload(&self) -> &ConsignmentPayload {
        &self.payload
    }

    /// Id of the sending organisation.
    pub fn sender_id(&self) -> &OrganisationId {
        &self.payload.sender.id
    }

    /// Current status.
    pub fn publish_status(&self) -> PublishStatus {
        self.publish_status
    }

    /// Ledger-side facts, if dispatched.
    pub fn submission(&self) -> Option<&Submission> {
        self.submission.as_ref()
    }

    /// Hash of the carrying transaction, if dispatched.
    pub fn transaction_hash(&self) -> Option<&str> {
        self.submission
            .as_ref()
            .map(|s| s.transaction_hash.as_str())
    }

    /// When the record was first stored.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Last status change.
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn transition(
        &mut self,
        authority: TransitionAuthority,
        to: PublishStatus,
        submission: Option<Submission>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        check_transition(authority, self.publish_status, to)?;
        self.publish_status = to;
        self.submission = submission;
        self.updated_at = now;
        Ok(())
    }

    fn current_submission(&self) -> Result<&Submission, TransitionError> {
        self.submission
            .as_ref()
            .ok_or_else(|| TransitionError::NotSubmitted {
                id: self.id.to_string(),
            })
    }

    /// Dispatcher: the record was accepted by the submission endpoint.
    pub fn mark_submitted(
        &mut self,
        transaction_hash: String,
        absolute_slot: Option<u64>,
        creation_slot: u64,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        let submission = Submission {
            transaction_hash,
            absolute_slot,
            creation_slot,
            finality: None,
        };
        self.transition(
            TransitionAuthority::Dispatcher,
            PublishStatus::Submitted,
            Some(submission),
            now,
        )
    }

    /// Watchdog: the transaction was seen on chain at `finality`.
    ///
    /// Returns whether anything changed.
    pub fn reconcile_observed(
        &mut self,
        finality: FinalityTier,
        absolute_slot: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<bool, TransitionError> {
        let current = self.current_submission()?;
        let next = Submission {
            transaction_hash: current.transaction_hash.clone(),
            absolute_slot: absolute_slot.or(current.absolute_slot),
            creation_slot: current.creation_slot,
            finality: Some(finality),
        };
        let status = finality.publish_status();
        if status == self.publish_status && Some(&next) == self.submission.as_ref() {
            return Ok(false);
        }
        self.transition(TransitionAuthority::Watchdog, status, Some(next), now)?;
        Ok(true)
    }

    /// Watchdog: not visible yet, but still inside the grace period.
    ///
    /// Returns whether anything changed.
    pub fn reconcile_pending(&mut self, now: DateTime<Utc>) -> Result<bool, TransitionError> {
        let current = self.current_submission()?;
        let next = Submission {
            finality: Some(FinalityTier::LOWEST),
            ..current.clone()
        };
        if self.publish_status == PublishStatus::Submitted
            && Some(&next) == self.submission.as_ref()
        {
            return Ok(false);
        }
        self.transition(
            TransitionAuthority::Watchdog,
            PublishStatus::Submitted,
            Some(next),
            now,
        )?;
        Ok(true)
    }

    /// Watchdog: the transaction is presumed discarded. Clears the submission.
    pub fn mark_rolled_back(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(
            TransitionAuthority::Watchdog,
            PublishStatus::Rollbacked,
            None,
            now,
        )
    }

    /// Operator: make a rolled-back record dispatchable again.
    pub fn requeue(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(TransitionAuthority::Operator, PublishStatus::Stored, None, now)
    }
}
