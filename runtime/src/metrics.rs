//! Prometheus metrics for the request/reply runtime.
//!
//! This module provides metric collection for every runtime component:
//! - Correlator: requests sent, replies matched, timeouts, cancellations
//! - Worker pool: admissions, rejections, idle slots
//! - Reply handler: replies published, dropped requests
//!
//! # Example
//!
//! ```rust,no_run
//! use courier_runtime::metrics::MetricsExporter;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut exporter = MetricsExporter::new();
//! exporter.install()?;
//!
//! // Serve `exporter.render()` from a `/metrics` route
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics exporter.
///
/// Installs the global recorder and renders the scrape body; the HTTP layer
/// decides where to serve it.
#[derive(Default)]
pub struct MetricsExporter {
    handle: Option<PrometheusHandle>,
}

impl MetricsExporter {
    /// Create an exporter that has not been installed yet.
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Register metric descriptions and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., in tests), this logs a
    /// warning and leaves the exporter without a handle.
    pub fn install(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!("Prometheus recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if this exporter did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Correlator
    describe_counter!(
        "correlator_requests_sent_total",
        "Requests published with a reply address"
    );
    describe_counter!(
        "correlator_replies_matched_total",
        "Replies matched to a pending request"
    );
    describe_counter!(
        "correlator_replies_unknown_total",
        "Replies dropped because no pending request matched"
    );
    describe_counter!(
        "correlator_timeouts_total",
        "Pending requests failed by their deadline"
    );
    describe_counter!(
        "correlator_cancellations_total",
        "Pending requests cancelled by the caller"
    );
    describe_counter!(
        "correlator_send_failures_total",
        "Requests that could not be published"
    );
    describe_gauge!(
        "correlator_pending_requests",
        "Requests currently awaiting a reply"
    );
    describe_histogram!(
        "correlator_round_trip_duration_seconds",
        "Time from publish to matched reply"
    );

    // Worker pool
    describe_counter!(
        "worker_pool_admitted_total",
        "Units of work admitted to a worker slot"
    );
    describe_counter!(
        "worker_pool_rejected_total",
        "Units of work rejected because the pool was saturated"
    );
    describe_gauge!("worker_pool_idle_slots", "Idle worker slots");
    describe_histogram!(
        "worker_pool_work_duration_seconds",
        "Time a slot was held by one unit of work"
    );

    // Reply handler
    describe_counter!(
        "reply_handler_replies_published_total",
        "Replies published back to requesters"
    );
    describe_counter!(
        "reply_handler_requests_dropped_total",
        "Requests that could not be answered"
    );
}

/// Correlator metrics recorder.
pub struct CorrelatorMetrics;

impl CorrelatorMetrics {
    /// Record a request registered and published.
    pub fn record_sent() {
        counter!("correlator_requests_sent_total").increment(1);
        gauge!("correlator_pending_requests").increment(1.0);
    }

    /// Record a pending entry leaving the registry for any reason.
    pub fn record_settled() {
        gauge!("correlator_pending_requests").decrement(1.0);
    }

    /// Record a matched reply.
    pub fn record_matched(round_trip: Duration) {
        counter!("correlator_replies_matched_total").increment(1);
        histogram!("correlator_round_trip_duration_seconds").record(round_trip.as_secs_f64());
    }

    /// Record a reply with no pending request.
    pub fn record_unknown() {
        counter!("correlator_replies_unknown_total").increment(1);
    }

    /// Record a timeout.
    pub fn record_timeout() {
        counter!("correlator_timeouts_total").increment(1);
    }

    /// Record a cancellation.
    pub fn record_cancellation() {
        counter!("correlator_cancellations_total").increment(1);
    }

    /// Record a publish failure.
    pub fn record_send_failure() {
        counter!("correlator_send_failures_total").increment(1);
    }
}

/// Worker pool metrics recorder.
pub struct WorkerPoolMetrics;

impl WorkerPoolMetrics {
    /// Record a slot handed out.
    pub fn record_admitted(pool: &str) {
        counter!("worker_pool_admitted_total", "pool" => pool.to_string()).increment(1);
        gauge!("worker_pool_idle_slots", "pool" => pool.to_string()).decrement(1.0);
    }

    /// Record a slot returned.
    pub fn record_released(pool: &str, held: Duration) {
        gauge!("worker_pool_idle_slots", "pool" => pool.to_string()).increment(1.0);
        histogram!("worker_pool_work_duration_seconds", "pool" => pool.to_string())
            .record(held.as_secs_f64());
    }

    /// Record a rejection.
    pub fn record_rejected(pool: &str) {
        counter!("worker_pool_rejected_total", "pool" => pool.to_string()).increment(1);
    }

    /// Record the initial idle count.
    #[allow(clippy::cast_precision_loss)] // slot counts are tiny
    pub fn record_capacity(pool: &str, capacity: usize) {
        gauge!("worker_pool_idle_slots", "pool" => pool.to_string()).set(capacity as f64);
    }
}

/// Reply handler metrics recorder.
pub struct ReplyHandlerMetrics;

impl ReplyHandlerMetrics {
    /// Record a reply published, labelled by status.
    pub fn record_published(status: i32) {
        counter!("reply_handler_replies_published_total", "status" => status.to_string())
            .increment(1);
    }

    /// Record a request that could not be answered.
    pub fn record_dropped() {
        counter!("reply_handler_requests_dropped_total").increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn exporter_starts_without_handle() {
        let exporter = MetricsExporter::new();
        assert!(exporter.render().is_none());
    }

    #[test]
    fn exporter_renders_recorded_metrics() {
        let mut exporter = MetricsExporter::new();
        exporter.install().unwrap();

        CorrelatorMetrics::record_sent();
        CorrelatorMetrics::record_matched(Duration::from_millis(20));
        WorkerPoolMetrics::record_rejected("backend");

        // Another test in this binary may have installed the recorder first
        if let Some(rendered) = exporter.render() {
            assert!(rendered.contains("correlator_requests_sent_total"));
            assert!(rendered.contains("worker_pool_rejected_total"));
        }
    }
}
