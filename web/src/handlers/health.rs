//! Health check endpoints.
//!
//! These endpoints are used by load balancers and monitoring systems
//! to verify service health.

use crate::error::AppError;
use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;

/// Simple health check endpoint (for basic liveness).
///
/// Returns 200 OK while the process is serving HTTP. Does not look at the bus.
///
/// # Endpoint
///
/// ```text
/// GET /health
/// ```
#[allow(clippy::unused_async)]
pub async fn health_check() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

/// Readiness body.
#[derive(Debug, Serialize)]
pub struct Readiness {
    /// Always `"ready"`.
    pub status: &'static str,
    /// Topic of the pinned reply partition.
    pub reply_topic: String,
    /// The pinned reply partition.
    pub reply_partition: i32,
}

/// Readiness check: the instance can only receive replies once a reply
/// partition is pinned.
///
/// # Status Codes
///
/// - 200 OK: partition pinned
/// - 503 Service Unavailable: no partition assigned yet
///
/// # Endpoint
///
/// ```text
/// GET /health/ready
/// ```
///
/// # Response
///
/// ```json
/// {
///   "status": "ready",
///   "reply_topic": "reply-topic",
///   "reply_partition": 0
/// }
/// ```
///
/// # Errors
///
/// Returns a 503 [`AppError`] until the pinner has a partition.
#[allow(clippy::unused_async)]
pub async fn readiness(State(state): State<AppState>) -> Result<Json<Readiness>, AppError> {
    let pinned = state
        .pinner()
        .assigned_partition()
        .map_err(|e| AppError::unavailable(e.to_string()))?;

    Ok(Json(Readiness {
        status: "ready",
        reply_topic: pinned.topic,
        reply_partition: pinned.partition,
    }))
}
