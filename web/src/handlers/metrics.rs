//! Prometheus scrape endpoint.

use crate::error::AppError;
use crate::state::AppState;
use axum::extract::State;

/// Render the process metrics in Prometheus text format.
///
/// ```text
/// GET /metrics
/// ```
///
/// # Errors
///
/// Returns 503 when no exporter was installed for this process.
#[allow(clippy::unused_async)]
pub async fn metrics(State(state): State<AppState>) -> Result<String, AppError> {
    state
        .metrics()
        .and_then(|exporter| exporter.render())
        .ok_or_else(|| AppError::unavailable("Metrics exporter not installed"))
}
