//! Shared state for the HTTP handlers.

use std::sync::Arc;

use cms_core::ChainReader;
use cms_publisher::ConsignmentStore;
use metrics_exporter_prometheus::PrometheusHandle;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ConsignmentStore>,
    pub reader: Arc<dyn ChainReader>,
    /// `None` disables `/metrics`.
    pub metrics: Option<PrometheusHandle>,
}
