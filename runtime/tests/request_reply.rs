//! End-to-end request/reply over the in-memory bus
//!
//! Requester and replier run in one process, talking only through
//! `InMemoryBus`, the same way separate instances talk through Kafka.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use courier_core::bus::MessageBus;
use courier_core::headers::{REPLY_PARTITION, decode_partition};
use courier_core::message::{Message, STATUS_OK, STATUS_TOO_MANY_REQUESTS};
use courier_runtime::{
    Correlator, CorrelatorError, PartitionPinner, ReplyHandler, ReplyListener, RepinPolicy,
    WorkerPool, WorkerPoolConfig,
};
use courier_testing::InMemoryBus;
use courier_testing::properties::arb_message;
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

// ============================================================================
// Test Fixtures
// ============================================================================

const REQUESTS: &str = "requests";
const REPLIES: &str = "replies";
const LONG: Duration = Duration::from_secs(600);

struct Requester {
    correlator: Correlator,
    _listener: ReplyListener,
}

async fn requester(bus: &InMemoryBus) -> Requester {
    let bus: Arc<dyn MessageBus> = Arc::new(bus.clone());
    let pinner = Arc::new(PartitionPinner::new(REPLIES, RepinPolicy::Never));
    let correlator = Correlator::new(Arc::clone(&bus), Arc::clone(&pinner));
    let listener = correlator.attach(bus.subscribe(&[REPLIES]).await.unwrap());
    tokio::time::timeout(Duration::from_secs(5), pinner.ready())
        .await
        .unwrap();
    Requester {
        correlator,
        _listener: listener,
    }
}

async fn replier(bus: &InMemoryBus, pool: &WorkerPool) -> JoinHandle<()> {
    let handle: Arc<dyn MessageBus> = Arc::new(bus.clone());
    let subscription = handle.subscribe(&[REQUESTS]).await.unwrap();
    let handler = ReplyHandler::new(handle, Arc::new(pool.clone()));
    handler.spawn(subscription.records)
}

fn pool(capacity: usize, latency: Duration) -> WorkerPool {
    WorkerPool::new(
        "backend",
        WorkerPoolConfig::default().capacity(capacity).latency(latency),
    )
}

fn bus() -> InMemoryBus {
    let bus = InMemoryBus::new().with_default_partitions(4);
    bus.create_topic(REQUESTS, 2);
    bus
}

// ============================================================================
// Round trip
// ============================================================================

#[tokio::test]
async fn value_seven_round_trips_with_status_200() {
    let bus = bus();
    let pool = pool(3, Duration::ZERO);
    let _replier = replier(&bus, &pool).await;
    let requester = requester(&bus).await;

    let reply = requester
        .correlator
        .send_and_receive(REQUESTS, &Message::new().with_value(7).with_request(1), LONG)
        .await
        .unwrap();

    assert_eq!(reply.value, Some(7));
    assert_eq!(reply.request, Some(1));
    assert_eq!(reply.reply, Some(1));
    assert_eq!(reply.status, Some(STATUS_OK));
    assert_eq!(reply.backend, Some(1));
    assert_eq!(requester.correlator.pending_count(), 0);
    assert_eq!(pool.idle(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_complete_their_own_futures() {
    let bus = bus();
    let pool = pool(64, Duration::from_millis(5));
    let _replier = replier(&bus, &pool).await;
    let requester = requester(&bus).await;

    let handles: Vec<_> = (0..50)
        .map(|n| {
            let correlator = requester.correlator.clone();
            tokio::spawn(async move {
                let reply = correlator
                    .send_and_receive(REQUESTS, &Message::new().with_value(n), LONG)
                    .await
                    .unwrap();
                (n, reply)
            })
        })
        .collect();

    let mut backends = HashSet::new();
    for handle in handles {
        let (n, reply) = handle.await.unwrap();
        assert_eq!(reply.value, Some(n), "reply delivered to the wrong caller");
        backends.insert(reply.backend.unwrap());
    }
    assert_eq!(backends.len(), 50);
}

// ============================================================================
// Admission control
// ============================================================================

#[tokio::test(start_paused = true)]
async fn fourth_concurrent_request_is_rejected_with_429() {
    let bus = bus();
    let pool = pool(3, Duration::from_secs(1));
    let _replier = replier(&bus, &pool).await;
    let requester = requester(&bus).await;

    let in_flight: Vec<_> = (0..3)
        .map(|_| {
            let correlator = requester.correlator.clone();
            tokio::spawn(async move {
                correlator
                    .send_and_receive(REQUESTS, &Message::new().with_value(5), LONG)
                    .await
            })
        })
        .collect();

    // Let the three reach the pool
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(pool.idle(), 0);

    let fourth = requester
        .correlator
        .send_and_receive(REQUESTS, &Message::new().with_value(5), LONG)
        .await
        .unwrap();
    assert_eq!(fourth.status, Some(STATUS_TOO_MANY_REQUESTS));
    assert_eq!(fourth.backend, None);

    let mut backends = HashSet::new();
    for handle in in_flight {
        let reply = handle.await.unwrap().unwrap();
        assert_eq!(reply.status, Some(STATUS_OK));
        assert_eq!(reply.value, Some(5));
        backends.insert(reply.backend.unwrap());
    }
    assert_eq!(backends.len(), 3);
    assert_eq!(pool.idle(), 3);
}

// ============================================================================
// Timeouts and late replies
// ============================================================================

#[tokio::test(start_paused = true)]
async fn request_without_replier_times_out() {
    let bus = bus();
    let requester = requester(&bus).await;
    let timeout = Duration::from_secs(2);

    let started = tokio::time::Instant::now();
    let err = requester
        .correlator
        .send_and_receive(REQUESTS, &Message::new().with_value(1), timeout)
        .await
        .unwrap_err();

    assert_eq!(err, CorrelatorError::Timeout(timeout));
    assert!(started.elapsed() >= timeout);
    assert!(started.elapsed() < timeout + Duration::from_millis(100));
    assert_eq!(requester.correlator.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn late_reply_is_dropped_without_side_effects() {
    let bus = bus();
    let pool = pool(3, Duration::from_secs(5));
    let _replier = replier(&bus, &pool).await;
    let requester = requester(&bus).await;

    let err = requester
        .correlator
        .send_and_receive(REQUESTS, &Message::new().with_value(1), Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, CorrelatorError::Timeout(_)));

    // The backend finishes and replies into the void
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(bus.records(REPLIES).len(), 1);
    assert_eq!(requester.correlator.pending_count(), 0);
    assert_eq!(pool.idle(), 3);

    // The next request is unaffected
    let reply = requester
        .correlator
        .send_and_receive(REQUESTS, &Message::new().with_value(2), LONG)
        .await
        .unwrap();
    assert_eq!(reply.value, Some(2));
    assert_eq!(reply.reply, Some(2));
}

#[tokio::test(start_paused = true)]
async fn cancelled_request_does_not_disturb_others() {
    let bus = bus();
    let pool = pool(3, Duration::from_secs(1));
    let _replier = replier(&bus, &pool).await;
    let requester = requester(&bus).await;

    let mut cancelled = requester
        .correlator
        .send(REQUESTS, &Message::new().with_value(1), LONG)
        .await
        .unwrap();
    let kept = requester
        .correlator
        .send(REQUESTS, &Message::new().with_value(2), LONG)
        .await
        .unwrap();

    assert!(cancelled.cancel());
    assert_eq!(cancelled.await.unwrap_err(), CorrelatorError::Cancelled);

    let reply = kept.await.unwrap();
    assert_eq!(reply.value, Some(2));

    // Both replies were published; the cancelled one was dropped on arrival
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(bus.records(REPLIES).len(), 2);
    assert_eq!(requester.correlator.pending_count(), 0);
}

#[tokio::test]
async fn send_failure_surfaces_to_caller() {
    let bus = bus();
    let requester = requester(&bus).await;
    bus.fail_publishes(true);

    let err = requester
        .correlator
        .send_and_receive(REQUESTS, &Message::new(), LONG)
        .await
        .unwrap_err();
    assert!(matches!(err, CorrelatorError::SendFailure(_)));
    assert_eq!(requester.correlator.pending_count(), 0);
}

// ============================================================================
// Partition pinning across instances
// ============================================================================

#[tokio::test]
async fn instances_pin_distinct_partitions_and_get_their_own_replies() {
    let bus = bus();
    let pool = pool(8, Duration::ZERO);
    let _replier = replier(&bus, &pool).await;

    let first = requester(&bus).await;
    let second = requester(&bus).await;

    let first_pin = first.correlator.pinner().assigned_partition().unwrap();
    let second_pin = second.correlator.pinner().assigned_partition().unwrap();
    assert_eq!(first_pin.partition, 0);
    assert_eq!(second_pin.partition, 1);

    let first_msg = Message::new().with_value(10);
    let second_msg = Message::new().with_value(20);
    let (a, b) = tokio::join!(
        first
            .correlator
            .send_and_receive(REQUESTS, &first_msg, LONG),
        second
            .correlator
            .send_and_receive(REQUESTS, &second_msg, LONG),
    );
    assert_eq!(a.unwrap().value, Some(10));
    assert_eq!(b.unwrap().value, Some(20));

    let reply_partitions: HashSet<i32> = bus
        .records(REQUESTS)
        .iter()
        .map(|r| decode_partition(r.headers.get(REPLY_PARTITION).unwrap()).unwrap())
        .collect();
    assert_eq!(reply_partitions, HashSet::from([0, 1]));
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn reply_carries_value_and_request_through(message in arb_message()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let reply = runtime.block_on(async {
            let bus = bus();
            let pool = pool(3, Duration::ZERO);
            let _replier = replier(&bus, &pool).await;
            let requester = requester(&bus).await;
            requester
                .correlator
                .send_and_receive(REQUESTS, &message, LONG)
                .await
                .unwrap()
        });

        prop_assert_eq!(reply.value, message.value);
        prop_assert_eq!(reply.request, message.request);
        prop_assert_eq!(reply.reply, Some(1));
        prop_assert_eq!(reply.status, Some(STATUS_OK));
    }
}
