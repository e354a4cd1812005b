//! Local backend endpoint: one admission-controlled unit of work.

use super::ValueQuery;
use crate::error::AppError;
use crate::state::AppState;
use axum::{
    Json,
    extract::{Query, State, rejection::QueryRejection},
};

/// Run one cycle on the local worker pool.
///
/// ```text
/// GET /backend?value=N
/// ```
///
/// Responds 200 with the backend unit-of-work id, or 429 when every slot is
/// busy.
///
/// # Errors
///
/// 400 for a malformed query, 429 when the pool is saturated.
pub async fn backend(
    State(state): State<AppState>,
    query: Result<Query<ValueQuery>, QueryRejection>,
) -> Result<Json<i32>, AppError> {
    let ValueQuery { value } = ValueQuery::parse(query)?;

    match state.pool().run(value).await {
        Ok(id) => Ok(Json(id)),
        Err(rejected) => {
            tracing::debug!(pool = state.pool().name(), ?value, "Backend saturated");
            Err(AppError::too_many_requests(rejected.to_string()))
        }
    }
}
