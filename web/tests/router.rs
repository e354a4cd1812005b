//! Router tests: every route driven through `oneshot` against the in-memory bus.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use courier_core::bus::MessageBus;
use courier_runtime::{
    Correlator, PartitionPinner, ReplyHandler, ReplyListener, RepinPolicy, WorkerPool,
    WorkerPoolConfig,
};
use courier_testing::InMemoryBus;
use courier_web::{AppState, router};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tower::ServiceExt;

const REQUESTS: &str = "requests";
const REPLIES: &str = "replies";

struct Harness {
    app: Router,
    pinner: Arc<PartitionPinner>,
    _listener: Option<ReplyListener>,
    _replier: Option<JoinHandle<()>>,
}

fn pool(capacity: usize, latency: Duration) -> WorkerPool {
    WorkerPool::new(
        "backend",
        WorkerPoolConfig::default().capacity(capacity).latency(latency),
    )
}

/// Wire a front door; `listen` attaches the reply listener and waits for the
/// pin, `replier` runs a reply handler over `pool`.
async fn harness(pool: WorkerPool, listen: bool, replier: bool, timeout: Duration) -> Harness {
    let memory = InMemoryBus::new().with_default_partitions(2);
    let bus: Arc<dyn MessageBus> = Arc::new(memory);
    let pinner = Arc::new(PartitionPinner::new(REPLIES, RepinPolicy::Never));
    let correlator = Correlator::new(Arc::clone(&bus), Arc::clone(&pinner));

    let replier = if replier {
        let subscription = bus.subscribe(&[REQUESTS]).await.unwrap();
        let handler = ReplyHandler::new(Arc::clone(&bus), Arc::new(pool.clone()));
        Some(handler.spawn(subscription.records))
    } else {
        None
    };

    let listener = if listen {
        let listener = correlator.attach(bus.subscribe(&[REPLIES]).await.unwrap());
        tokio::time::timeout(Duration::from_secs(5), pinner.ready())
            .await
            .unwrap();
        Some(listener)
    } else {
        None
    };

    let state = AppState::new(correlator, pool, REQUESTS).with_reply_timeout(timeout);
    Harness {
        app: router(state),
        pinner,
        _listener: listener,
        _replier: replier,
    }
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let (status, body) = get(app, uri).await;
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_health_endpoint() {
    let h = harness(pool(3, Duration::ZERO), false, false, Duration::from_secs(1)).await;
    let (status, body) = get(&h.app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"ok");
}

#[tokio::test]
async fn readiness_follows_the_pin() {
    let h = harness(pool(3, Duration::ZERO), false, false, Duration::from_secs(1)).await;

    let (status, body) = get_json(&h.app, "/health/ready").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "SERVICE_UNAVAILABLE");

    h.pinner.observe(&[courier_core::bus::TopicPartition::new(REPLIES, 1)]);

    let (status, body) = get_json(&h.app, "/health/ready").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
    assert_eq!(body["reply_topic"], REPLIES);
    assert_eq!(body["reply_partition"], 1);
}

#[tokio::test]
async fn request_returns_the_reply_message() {
    let h = harness(pool(3, Duration::ZERO), true, true, Duration::from_secs(5)).await;

    let (status, body) = get_json(&h.app, "/request?value=7").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["value"], 7);
    assert_eq!(body["request"], 1);
    assert_eq!(body["status"], 200);
    assert!(body["backend"].is_i64());

    let (_, body) = get_json(&h.app, "/request?value=8").await;
    assert_eq!(body["request"], 2);
}

#[tokio::test]
async fn request_without_value_still_round_trips() {
    let h = harness(pool(3, Duration::ZERO), true, true, Duration::from_secs(5)).await;

    let (status, body) = get_json(&h.app, "/request").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.get("value").is_none());
    assert_eq!(body["status"], 200);
}

#[tokio::test]
async fn saturated_backend_surfaces_as_429() {
    let h = harness(pool(0, Duration::ZERO), true, true, Duration::from_secs(5)).await;

    let (status, body) = get_json(&h.app, "/request?value=3").await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["status"], 429);
    assert_eq!(body["value"], 3);
    assert!(body.get("backend").is_none());
}

#[tokio::test]
async fn request_before_pin_is_503() {
    let h = harness(pool(3, Duration::ZERO), false, true, Duration::from_secs(5)).await;

    let (status, body) = get_json(&h.app, "/request?value=1").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "SERVICE_UNAVAILABLE");
}

#[tokio::test(start_paused = true)]
async fn request_without_replier_is_504() {
    let h = harness(pool(3, Duration::ZERO), true, false, Duration::from_secs(2)).await;

    let (status, body) = get_json(&h.app, "/request?value=1").await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["code"], "GATEWAY_TIMEOUT");
}

#[tokio::test]
async fn malformed_value_is_400() {
    let h = harness(pool(3, Duration::ZERO), true, true, Duration::from_secs(5)).await;

    for uri in ["/request?value=seven", "/backend?value=seven"] {
        let (status, body) = get_json(&h.app, uri).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(body["code"], "BAD_REQUEST");
    }
}

#[tokio::test]
async fn backend_returns_work_ids_then_429() {
    let free = harness(pool(3, Duration::ZERO), false, false, Duration::from_secs(1)).await;
    let (status, first) = get_json(&free.app, "/backend?value=1").await;
    assert_eq!(status, StatusCode::OK);
    let (_, second) = get_json(&free.app, "/backend?value=1").await;
    assert_ne!(first, second);

    let full = harness(pool(0, Duration::ZERO), false, false, Duration::from_secs(1)).await;
    let (status, body) = get_json(&full.app, "/backend?value=1").await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], "TOO_MANY_REQUESTS");
}

#[tokio::test]
async fn metrics_without_exporter_is_503() {
    let h = harness(pool(3, Duration::ZERO), false, false, Duration::from_secs(1)).await;
    let (status, _) = get(&h.app, "/metrics").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}
