//! # Integration Tests for cms-node
//!
//! Health probes, the metrics endpoint, and a dispatch/reconcile round trip
//! through a fully assembled node backed by the in-memory store and the
//! mock ledger.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{TimeZone, Utc};
use cms_core::{
    ConsignmentPayload, ConsignmentRecord, DispatchTimestamp, FinalityTier, FixedClock, MockLedger,
    Organisation, OrganisationId, PublishStatus,
};
use cms_node::Node;
use cms_publisher::{
    InMemoryConsignmentStore, InMemoryEventSink, OrganisationSource, PublisherConfig,
    WatchdogOutcome,
};
use http_body_util::BodyExt;
use metrics_exporter_prometheus::PrometheusBuilder;
use tower::ServiceExt;

struct TestNode {
    node: Node,
    ledger: Arc<MockLedger>,
    store: InMemoryConsignmentStore,
    sink: InMemoryEventSink,
}

fn test_node() -> TestNode {
    let ledger = Arc::new(MockLedger::new(10_000));
    let store = InMemoryConsignmentStore::new();
    let sink = InMemoryEventSink::new();
    let clock = Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2024, 9, 2, 10, 0, 0).unwrap(),
    ));

    let mut config = PublisherConfig::default();
    config.dispatcher.source_address = "addr_test1qnode".into();
    config.submission.confirmation_timeout = Duration::ZERO;

    let node = Node::assemble(
        config,
        OrganisationSource::Discovered,
        Arc::new(store.clone()),
        ledger.clone(),
        ledger.clone(),
        Arc::new(sink.clone()),
        clock,
    );
    TestNode {
        node,
        ledger,
        store,
        sink,
    }
}

fn consignment(sender: &str, n: u32) -> ConsignmentRecord {
    let payload = ConsignmentPayload {
        sender: Organisation::new(OrganisationId::new(sender).unwrap()),
        receiver: Organisation::new(OrganisationId::new("warehouse-9").unwrap()),
        goods: BTreeMap::from([("crates".to_string(), u64::from(n) + 1)]),
        tracking_status: None,
        geolocation: None,
        dispatched_at: DispatchTimestamp::from_utc(
            Utc.with_ymd_and_hms(2024, 9, 1, 8, 0, n).unwrap(),
        ),
    };
    ConsignmentRecord::new(
        payload,
        1,
        Utc.with_ymd_and_hms(2024, 9, 1, 9, 0, n).unwrap(),
    )
    .unwrap()
}

async fn get(app: axum::Router, uri: &str) -> (StatusCode, String) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

// -- Health Probes ------------------------------------------------------------

#[tokio::test]
async fn liveness_probe_is_ok() {
    let t = test_node();
    let (status, body) = get(cms_node::app(t.node.app_state(None)), "/health/liveness").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "ok");
}

#[tokio::test]
async fn readiness_probe_is_ready_with_healthy_dependencies() {
    let t = test_node();
    let (status, body) = get(cms_node::app(t.node.app_state(None)), "/health/readiness").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "ready");
}

#[tokio::test]
async fn readiness_probe_reports_chain_outage() {
    let t = test_node();
    t.ledger.set_tip_unavailable(true);
    let (status, body) = get(cms_node::app(t.node.app_state(None)), "/health/readiness").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body.contains("chain reader"), "body: {body}");
}

#[tokio::test]
async fn unsynced_chain_is_still_ready() {
    let t = test_node();
    t.ledger.set_synced(false);
    let (status, _) = get(cms_node::app(t.node.app_state(None)), "/health/readiness").await;
    assert_eq!(status, StatusCode::OK);
}

// -- Metrics ------------------------------------------------------------------

#[tokio::test]
async fn metrics_route_only_exists_with_a_recorder() {
    let t = test_node();
    let (status, _) = get(cms_node::app(t.node.app_state(None)), "/metrics").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let handle = PrometheusBuilder::new().build_recorder().handle();
    let response = cms_node::app(t.node.app_state(Some(handle)))
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "text/plain; version=0.0.4; charset=utf-8"
    );
}

// -- Assembled pipeline -------------------------------------------------------

#[tokio::test]
async fn assembled_node_dispatches_and_reconciles() {
    let t = test_node();
    let records: Vec<_> = (0..3).map(|n| consignment("org-north", n)).collect();
    t.store.seed(records.clone());

    let report = t.node.dispatcher.run_once().await.unwrap();
    assert_eq!(report.records_submitted, 3);
    assert_eq!(report.batches_submitted, 1);

    let submitted = t.ledger.submitted();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].from_address, "addr_test1qnode");

    t.ledger
        .confirm(&submitted[0].transaction_hash, FinalityTier::Final, 10_001);
    let outcome = t.node.watchdog.run_once().await.unwrap();
    assert!(matches!(outcome, WatchdogOutcome::Reconciled(ref r) if r.updated == 3));

    for record in &records {
        let stored = t.store.get(record.id()).unwrap();
        assert_eq!(stored.publish_status(), PublishStatus::Finalized);
    }
    assert_eq!(t.sink.events().len(), 2);
}

#[tokio::test]
async fn scheduled_jobs_stop_on_shutdown() {
    let t = test_node();
    let (tx, rx) = tokio::sync::watch::channel(false);
    let handles = t.node.start(rx);
    assert_eq!(handles.len(), 2);

    tx.send(true).unwrap();
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
    assert!(t.ledger.submitted().is_empty());
}
