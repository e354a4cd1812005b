//! HTTP request handlers.

pub mod backend;
pub mod health;
pub mod metrics;
pub mod request;

use crate::error::AppError;
use axum::extract::{Query, rejection::QueryRejection};
use serde::Deserialize;

/// `?value=N` query string shared by `/request` and `/backend`.
#[derive(Debug, Default, Deserialize)]
pub struct ValueQuery {
    /// Caller value; absent is allowed.
    pub value: Option<i32>,
}

impl ValueQuery {
    /// Turn an extractor rejection into a 400 with the parser's message.
    pub(crate) fn parse(query: Result<Query<Self>, QueryRejection>) -> Result<Self, AppError> {
        query
            .map(|Query(q)| q)
            .map_err(|rejection| AppError::bad_request(rejection.body_text()))
    }
}

pub use backend::backend;
pub use health::{health_check, readiness};
pub use metrics::metrics;
pub use request::request;
