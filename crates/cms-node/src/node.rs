//! Component assembly.
//!
//! [`Node::assemble`] turns configuration plus the three injected
//! collaborators (store, chain access, event sink) into a ready dispatcher
//! and watchdog. `main` supplies Postgres and the HTTP chain client; tests
//! supply the in-memory store and [`cms_core::MockLedger`].

use std::sync::Arc;

use cms_core::{ChainReader, ChainWriter, Clock};
use cms_publisher::{
    BatchPacker, CborMetadataCodec, ConsignmentStore, Dispatcher, EventPublisher, EventSink,
    MetadataEnvelopeBuilder, OrganisationSource, PublisherConfig, ScheduledJob,
    TransactionSubmitter, Watchdog,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::state::AppState;

/// An assembled dispatcher and watchdog sharing one store and chain reader.
pub struct Node {
    pub store: Arc<dyn ConsignmentStore>,
    pub reader: Arc<dyn ChainReader>,
    pub dispatcher: Arc<Dispatcher>,
    pub watchdog: Arc<Watchdog>,
    config: PublisherConfig,
}

impl Node {
    pub fn assemble(
        config: PublisherConfig,
        organisations: OrganisationSource,
        store: Arc<dyn ConsignmentStore>,
        reader: Arc<dyn ChainReader>,
        writer: Arc<dyn ChainWriter>,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let events = Arc::new(EventPublisher::new(
            sink,
            clock.clone(),
            config.events.clone(),
        ));
        let packer = BatchPacker::new(
            Arc::new(CborMetadataCodec),
            Arc::new(MetadataEnvelopeBuilder::new(
                config.submission.metadata_label,
            )),
            config.dispatcher.max_tx_bytes,
            config.dispatcher.source_address.clone(),
        );
        let submitter =
            TransactionSubmitter::new(writer, reader.clone(), config.submission.clone());

        let dispatcher = Dispatcher::new(
            store.clone(),
            reader.clone(),
            submitter,
            packer,
            events.clone(),
            clock.clone(),
            config.dispatcher.clone(),
        )
        .with_organisations(organisations);

        let watchdog = Watchdog::new(
            store.clone(),
            reader.clone(),
            events,
            clock,
            config.watchdog.clone(),
        );

        Self {
            store,
            reader,
            dispatcher: Arc::new(dispatcher),
            watchdog: Arc::new(watchdog),
            config,
        }
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// State for the operational HTTP surface.
    pub fn app_state(&self, metrics: Option<PrometheusHandle>) -> AppState {
        AppState {
            store: self.store.clone(),
            reader: self.reader.clone(),
            metrics,
        }
    }

    /// Spawn the dispatcher and watchdog loops. They stop once `shutdown`
    /// flips to `true`.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let jobs = [
            ScheduledJob::new(
                self.dispatcher.clone(),
                self.config.dispatcher.initial_delay,
                self.config.dispatcher.fixed_delay,
            ),
            ScheduledJob::new(
                self.watchdog.clone(),
                self.config.watchdog.initial_delay,
                self.config.watchdog.fixed_delay,
            ),
        ];
        jobs.into_iter()
            .map(|job| job.start(shutdown.clone()))
            .collect()
    }
}
