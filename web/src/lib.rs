//! HTTP facade for Courier.
//!
//! Exposes the request/reply correlator and the local worker pool over Axum:
//!
//! | route | handler |
//! |---|---|
//! | `GET /request?value=N` | [`handlers::request`] |
//! | `GET /backend?value=N` | [`handlers::backend`] |
//! | `GET /health` | [`handlers::health_check`] |
//! | `GET /health/ready` | [`handlers::readiness`] |
//! | `GET /metrics` | [`handlers::metrics`] |
//!
//! # Example
//!
//! ```ignore
//! let state = AppState::new(correlator, pool, "request-topic");
//! let app = courier_web::router(state);
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8181").await?;
//! axum::serve(listener, app).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod handlers;
pub mod state;

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

// Re-export key types for convenience
pub use error::AppError;
pub use state::AppState;

/// Result type alias for web handlers.
pub type WebResult<T> = Result<T, AppError>;

/// Build the router with every route and request tracing.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/request", get(handlers::request))
        .route("/backend", get(handlers::backend))
        .route("/health", get(handlers::health_check))
        .route("/health/ready", get(handlers::readiness))
        .route("/metrics", get(handlers::metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
