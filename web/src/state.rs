//! Application state for Axum handlers.

use courier_runtime::metrics::MetricsExporter;
use courier_runtime::{Correlator, PartitionPinner, WorkerPool};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

/// Default wait for a reply before a request fails.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(600);

/// Application state shared across all HTTP handlers.
///
/// Holds one instance of each collaborator for the process; handlers never
/// reach for globals.
///
/// # Examples
///
/// ```ignore
/// let state = AppState::new(correlator, pool, "request-topic")
///     .with_reply_timeout(Duration::from_secs(30))
///     .with_metrics(Arc::new(exporter));
/// let app = courier_web::router(state);
/// ```
#[derive(Clone)]
pub struct AppState {
    correlator: Correlator,
    pool: WorkerPool,
    request_topic: Arc<str>,
    reply_timeout: Duration,
    request_counter: Arc<AtomicI32>,
    metrics: Option<Arc<MetricsExporter>>,
}

impl AppState {
    /// Create the state with the default reply timeout and no metrics.
    #[must_use]
    pub fn new(correlator: Correlator, pool: WorkerPool, request_topic: impl Into<Arc<str>>) -> Self {
        Self {
            correlator,
            pool,
            request_topic: request_topic.into(),
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            request_counter: Arc::new(AtomicI32::new(0)),
            metrics: None,
        }
    }

    /// Set how long `/request` waits for a reply.
    #[must_use]
    pub const fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Serve `/metrics` from this exporter.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<MetricsExporter>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The correlator sending requests.
    #[must_use]
    pub const fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    /// The reply partition pinner.
    #[must_use]
    pub fn pinner(&self) -> &PartitionPinner {
        self.correlator.pinner()
    }

    /// The local worker pool behind `/backend`.
    #[must_use]
    pub const fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Topic requests are published to.
    #[must_use]
    pub fn request_topic(&self) -> &str {
        &self.request_topic
    }

    /// How long `/request` waits for a reply.
    #[must_use]
    pub const fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }

    /// The metrics exporter, if one is installed.
    #[must_use]
    pub fn metrics(&self) -> Option<&MetricsExporter> {
        self.metrics.as_deref()
    }

    /// Next front-door request number, starting at 1.
    #[must_use]
    pub fn next_request_id(&self) -> i32 {
        self.request_counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::bus::MessageBus;
    use courier_runtime::{RepinPolicy, WorkerPoolConfig};
    use courier_testing::InMemoryBus;

    fn state() -> AppState {
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
        let pinner = Arc::new(PartitionPinner::new("replies", RepinPolicy::Never));
        AppState::new(
            Correlator::new(bus, pinner),
            WorkerPool::new("backend", WorkerPoolConfig::default()),
            "requests",
        )
    }

    #[test]
    fn test_state_is_clone() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<AppState>();
    }

    #[test]
    fn request_ids_are_shared_between_clones() {
        let state = state();
        let clone = state.clone();
        assert_eq!(state.next_request_id(), 1);
        assert_eq!(clone.next_request_id(), 2);
        assert_eq!(state.next_request_id(), 3);
    }

    #[test]
    fn defaults() {
        let state = state();
        assert_eq!(state.reply_timeout(), DEFAULT_REPLY_TIMEOUT);
        assert_eq!(state.request_topic(), "requests");
        assert!(state.metrics().is_none());
        assert_eq!(state.pinner().topic(), "replies");
    }
}
