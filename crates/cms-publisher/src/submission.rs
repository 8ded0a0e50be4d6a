//! # Transaction Submission
//!
//! Submits a sealed batch and optionally waits for the ledger to report it.
//!
//! The wait polls [`ChainReader::tx_details`] until the transaction shows
//! up or `confirmation_timeout` elapses. A poll error is logged and the
//! poll continues. On timeout the configured
//! [`ConfirmationTimeoutPolicy`] decides whether the batch counts as
//! submitted (the watchdog takes over) or as failed (records stay STORED).

use std::sync::Arc;

use cms_core::{ChainReader, ChainWriter, SubmissionReceipt};

use crate::config::{ConfirmationTimeoutPolicy, SubmissionConfig};
use crate::error::SubmissionError;
use crate::packer::SealedBatch;

pub struct TransactionSubmitter {
    writer: Arc<dyn ChainWriter>,
    reader: Arc<dyn ChainReader>,
    config: SubmissionConfig,
}

impl TransactionSubmitter {
    pub fn new(
        writer: Arc<dyn ChainWriter>,
        reader: Arc<dyn ChainReader>,
        config: SubmissionConfig,
    ) -> Self {
        Self {
            writer,
            reader,
            config,
        }
    }

    /// Submit `batch`. The returned receipt carries the inclusion slot when
    /// the confirmation wait observed one.
    pub async fn submit(&self, batch: &SealedBatch) -> Result<SubmissionReceipt, SubmissionError> {
        let mut receipt = self
            .writer
            .submit(&batch.tx_bytes, &batch.source_address)
            .await?;

        tracing::info!(
            tx_hash = %receipt.transaction_hash,
            organisation_id = %batch.organisation_id,
            count = batch.consignments.len(),
            "batch submitted"
        );

        if self.config.confirmation_timeout.is_zero() {
            return Ok(receipt);
        }

        match tokio::time::timeout(
            self.config.confirmation_timeout,
            self.await_visible(&receipt.transaction_hash),
        )
        .await
        {
            Ok(slot) => {
                receipt.absolute_slot = slot.or(receipt.absolute_slot);
                Ok(receipt)
            }
            Err(_) => match self.config.timeout_policy {
                ConfirmationTimeoutPolicy::KeepSubmitted => {
                    tracing::warn!(
                        tx_hash = %receipt.transaction_hash,
                        waited = ?self.config.confirmation_timeout,
                        "transaction not yet visible, leaving it to the watchdog"
                    );
                    Ok(receipt)
                }
                ConfirmationTimeoutPolicy::RevertToStored => {
                    Err(SubmissionError::ConfirmationTimeout {
                        transaction_hash: receipt.transaction_hash,
                        waited: self.config.confirmation_timeout,
                    })
                }
            },
        }
    }

    /// Poll until the transaction is visible; yields its slot if reported.
    async fn await_visible(&self, transaction_hash: &str) -> Option<u64> {
        loop {
            match self.reader.tx_details(transaction_hash).await {
                Ok(Some(details)) => {
                    tracing::debug!(
                        tx_hash = %transaction_hash,
                        finality = %details.finality,
                        "transaction visible"
                    );
                    return details.absolute_slot;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(tx_hash = %transaction_hash, error = %e, "confirmation poll failed");
                }
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}
