//! # cms-node -- Consignment Ledger Publisher Node
//!
//! Runs the dispatcher and watchdog schedulers against a Postgres record
//! store and the chain APIs, and serves an operational HTTP surface:
//!
//! | Method | Path | Response |
//! |--------|------|----------|
//! | GET    | `/health/liveness` | `ok` while the process runs |
//! | GET    | `/health/readiness` | `ready`, or 503 naming the failing dependency |
//! | GET    | `/metrics` | Prometheus text exposition |
//!
//! There is no CRUD API. Records arrive through the store.

pub mod config;
pub mod db;
pub mod node;
pub mod state;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub use config::{DatabaseConfig, LogFormat, NodeConfig};
pub use node::Node;

/// Assemble the operational router.
pub fn app(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health/liveness", axum::routing::get(liveness))
        .route("/health/readiness", axum::routing::get(readiness));

    if state.metrics.is_some() {
        router = router.route("/metrics", axum::routing::get(prometheus_metrics));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Liveness probe: 200 while the process is running.
async fn liveness() -> &'static str {
    "ok"
}

/// Readiness probe: the store answers a ping and the chain reader answers a
/// tip query. An unsynced node is still ready; the watchdog skips its runs.
async fn readiness(State(state): State<AppState>) -> Response {
    if let Err(e) = state.store.ping().await {
        tracing::warn!(error = %e, "readiness: record store unavailable");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("record store unavailable: {e}"),
        )
            .into_response();
    }

    if let Err(e) = state.reader.chain_tip().await {
        tracing::warn!(error = %e, "readiness: chain reader unavailable");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("chain reader unavailable: {e}"),
        )
            .into_response();
    }

    (StatusCode::OK, "ready").into_response()
}

/// GET /metrics: Prometheus scrape endpoint.
async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(
                axum::http::header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
