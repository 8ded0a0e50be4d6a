//! # Batch Packer
//!
//! Greedy, order-preserving partition of pending records into ledger
//! transactions whose encoded metadata stays strictly below a byte ceiling.
//!
//! Before a record joins the current batch, "current batch + candidate" is
//! encoded speculatively:
//!
//! - under the ceiling: the candidate joins and packing continues;
//! - at or over the ceiling: the current batch is sealed without the
//!   candidate, and the candidate starts the next batch.
//!
//! Every sealed batch holds at least one record. A record that reaches the
//! ceiling on its own can never be packed; [`Packing`] yields
//! [`PackError::OversizedRecord`] for it and moves past it, so packing
//! always makes progress.

use std::sync::Arc;

use cms_core::{ConsignmentId, ConsignmentRecord, OrganisationId};
use serde_cbor::Value;

use crate::codec::{BatchEncoder, EncodedMetadata, MetadataHeader};
use crate::error::PackError;

/// One transaction's worth of records.
#[derive(Debug, Clone)]
pub struct SealedBatch {
    /// Organisation the batch was packed for.
    pub organisation_id: OrganisationId,
    /// Records carried, in selection order.
    pub consignments: Vec<ConsignmentRecord>,
    /// Records after this batch in the input, left for later batches or cycles.
    pub remaining: Vec<ConsignmentId>,
    /// Chain tip slot written into the metadata header.
    pub creation_slot: u64,
    /// Encoded metadata size that passed the limit check.
    pub metadata_size: usize,
    /// Transaction bytes handed to the submit endpoint.
    pub tx_bytes: Vec<u8>,
    /// Address paying for the transaction.
    pub source_address: String,
}

/// Wraps encoded metadata into submittable transaction bytes.
pub trait TransactionBuilder: Send + Sync {
    /// Produce transaction bytes carrying `metadata`, paid by `source_address`.
    fn build(&self, metadata: &EncodedMetadata, source_address: &str) -> Result<Vec<u8>, PackError>;
}

/// Unsigned metadata envelope: `{ "from": address, "metadata": { label: map } }`.
///
/// The submit endpoint selects inputs, balances fees and signs.
#[derive(Debug, Clone, Copy)]
pub struct MetadataEnvelopeBuilder {
    metadata_label: u64,
}

impl MetadataEnvelopeBuilder {
    /// Envelope placing the metadata under `metadata_label`.
    pub fn new(metadata_label: u64) -> Self {
        Self { metadata_label }
    }
}

impl TransactionBuilder for MetadataEnvelopeBuilder {
    fn build(&self, metadata: &EncodedMetadata, source_address: &str) -> Result<Vec<u8>, PackError> {
        let labelled = [(
            Value::Integer(i128::from(self.metadata_label)),
            metadata.value.clone(),
        )];
        let envelope = [
            (
                Value::Text("from".into()),
                Value::Text(source_address.to_string()),
            ),
            (
                Value::Text("metadata".into()),
                Value::Map(labelled.into_iter().collect()),
            ),
        ];
        serde_cbor::to_vec(&Value::Map(envelope.into_iter().collect()))
            .map_err(|e| PackError::Build(e.to_string()))
    }
}

/// Greedy packer over an encoder and a transaction builder.
#[derive(Clone)]
pub struct BatchPacker {
    encoder: Arc<dyn BatchEncoder>,
    builder: Arc<dyn TransactionBuilder>,
    max_tx_bytes: usize,
    source_address: String,
}

impl std::fmt::Debug for BatchPacker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchPacker")
            .field("max_tx_bytes", &self.max_tx_bytes)
            .field("source_address", &self.source_address)
            .finish_non_exhaustive()
    }
}

impl BatchPacker {
    pub fn new(
        encoder: Arc<dyn BatchEncoder>,
        builder: Arc<dyn TransactionBuilder>,
        max_tx_bytes: usize,
        source_address: impl Into<String>,
    ) -> Self {
        Self {
            encoder,
            builder,
            max_tx_bytes,
            source_address: source_address.into(),
        }
    }

    /// Exclusive ceiling on encoded metadata size.
    pub fn max_tx_bytes(&self) -> usize {
        self.max_tx_bytes
    }

    /// Lazily pack `records`, yielding one result per batch.
    pub fn batches<'a>(
        &'a self,
        organisation_id: &'a OrganisationId,
        records: &'a [ConsignmentRecord],
        header: &'a MetadataHeader,
    ) -> Packing<'a> {
        Packing {
            packer: self,
            organisation_id,
            records,
            header,
            start: 0,
            next: 0,
            current: None,
        }
    }

    /// Pack everything, failing on the first error.
    pub fn pack(
        &self,
        organisation_id: &OrganisationId,
        records: &[ConsignmentRecord],
        header: &MetadataHeader,
    ) -> Result<Vec<SealedBatch>, PackError> {
        self.batches(organisation_id, records, header).collect()
    }
}

/// Iterator over sealed batches. See [`BatchPacker::batches`].
pub struct Packing<'a> {
    packer: &'a BatchPacker,
    organisation_id: &'a OrganisationId,
    records: &'a [ConsignmentRecord],
    header: &'a MetadataHeader,
    /// First record of the current batch.
    start: usize,
    /// Next candidate.
    next: usize,
    /// Encoding of `records[start..next]`, if non-empty.
    current: Option<EncodedMetadata>,
}

impl<'a> Packing<'a> {
    fn seal(&mut self, end: usize, metadata: EncodedMetadata) -> Result<SealedBatch, PackError> {
        let range = self.start..end;
        self.start = end;
        let tx_bytes = self
            .packer
            .builder
            .build(&metadata, &self.packer.source_address)?;
        let batch = SealedBatch {
            organisation_id: self.organisation_id.clone(),
            consignments: self.records[range].to_vec(),
            remaining: self.records[end..].iter().map(|r| r.id().clone()).collect(),
            creation_slot: self.header.creation_slot,
            metadata_size: metadata.size(),
            tx_bytes,
            source_address: self.packer.source_address.clone(),
        };
        tracing::debug!(
            organisation_id = %batch.organisation_id,
            count = batch.consignments.len(),
            metadata_size = batch.metadata_size,
            remaining = batch.remaining.len(),
            "sealed batch"
        );
        Ok(batch)
    }

    /// Drop the lone candidate at `next` and report why.
    fn skip_candidate(&mut self, error: PackError) -> Result<SealedBatch, PackError> {
        self.next += 1;
        self.start = self.next;
        Err(error)
    }
}

impl<'a> Iterator for Packing<'a> {
    type Item = Result<SealedBatch, PackError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.next >= self.records.len() {
                let metadata = self.current.take()?;
                return Some(self.seal(self.records.len(), metadata));
            }

            let candidate = &self.records[self.next];
            let attempt = self.packer.encoder.encode(
                self.organisation_id,
                &self.records[self.start..=self.next],
                self.header,
            );

            match (attempt, self.current.take()) {
                (Ok(encoded), _) if encoded.size() < self.packer.max_tx_bytes => {
                    self.current = Some(encoded);
                    self.next += 1;
                }
                // Candidate does not fit (or breaks encoding): seal without it.
                (_, Some(metadata)) => return Some(self.seal(self.next, metadata)),
                (Ok(encoded), None) => {
                    let error = PackError::OversizedRecord {
                        id: candidate.id().clone(),
                        size: encoded.size(),
                        max_tx_bytes: self.packer.max_tx_bytes,
                    };
                    return Some(self.skip_candidate(error));
                }
                (Err(source), None) => {
                    let error = PackError::Codec {
                        id: candidate.id().clone(),
                        source,
                    };
                    return Some(self.skip_candidate(error));
                }
            }
        }
    }
}
