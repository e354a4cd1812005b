//! Front door: turn an HTTP call into a request/reply exchange over the bus.

use super::ValueQuery;
use crate::error::AppError;
use crate::state::AppState;
use axum::{
    Json,
    extract::{Query, State, rejection::QueryRejection},
    http::StatusCode,
};
use courier_core::message::Message;

/// Send `value` to the request topic and wait for the matching reply.
///
/// ```text
/// GET /request?value=7
/// ```
///
/// ```json
/// {"value":7,"request":1,"reply":3,"backend":12,"status":200}
/// ```
///
/// The HTTP status mirrors the reply's `status`; a reply without one is a 500.
///
/// # Errors
///
/// 400 for a malformed query. Correlator failures map through
/// [`AppError::from`]: not ready 503, timeout 504, anything else 500.
pub async fn request(
    State(state): State<AppState>,
    query: Result<Query<ValueQuery>, QueryRejection>,
) -> Result<(StatusCode, Json<Message>), AppError> {
    let ValueQuery { value } = ValueQuery::parse(query)?;

    let mut message = Message::new().with_request(state.next_request_id());
    message.value = value;

    tracing::debug!(request = ?message.request, ?value, "Sending request");

    let reply = state
        .correlator()
        .send_and_receive(state.request_topic(), &message, state.reply_timeout())
        .await?;

    Ok((reply_status(&reply), Json(reply)))
}

/// HTTP status carried by a reply: its `status` when present and valid,
/// otherwise 500.
#[must_use]
pub fn reply_status(reply: &Message) -> StatusCode {
    reply
        .status
        .filter(|status| *status > 0)
        .and_then(|status| u16::try_from(status).ok())
        .and_then(|status| StatusCode::from_u16(status).ok())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}
