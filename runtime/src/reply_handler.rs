//! Far side of the request/reply exchange.
//!
//! Each inbound request goes `Received → Dispatched → Replied`:
//!
//! - stamp a diagnostic sequence number into `reply`
//! - dispatch to a [`Backend`] (by default the in-process [`WorkerPool`])
//! - set `status` and `backend` from the outcome
//! - publish to the request's `replyTopic`/`replyPartition`, echoing its
//!   `correlationId`
//!
//! A saturated backend is a normal outcome, answered with `status = 429`.

use crate::metrics::ReplyHandlerMetrics;
use crate::worker_pool::{AdmissionRejected, WorkerPool};
use courier_core::bus::{BusError, Delivery, InboundRecord, MessageBus, OutboundRecord, RecordStream};
use courier_core::headers::{HeaderError, RecordHeaders};
use courier_core::message::{Message, STATUS_OK, STATUS_TOO_MANY_REQUESTS};
use futures::StreamExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Why a backend did not process a request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// No capacity
    #[error("backend has no idle capacity")]
    Rejected,

    /// The backend could not be reached or answered with an error
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl From<AdmissionRejected> for BackendError {
    fn from(_: AdmissionRejected) -> Self {
        Self::Rejected
    }
}

/// Something that performs one unit of work per request.
pub trait Backend: Send + Sync {
    /// Process `request`, identified for diagnostics by `reply_id`, and
    /// return the backend-assigned id.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] when the work was not done.
    fn dispatch(
        &self,
        reply_id: i32,
        request: &Message,
    ) -> Pin<Box<dyn Future<Output = Result<i32, BackendError>> + Send + '_>>;
}

impl Backend for WorkerPool {
    fn dispatch(
        &self,
        reply_id: i32,
        _request: &Message,
    ) -> Pin<Box<dyn Future<Output = Result<i32, BackendError>> + Send + '_>> {
        Box::pin(async move { Ok(self.run(Some(reply_id)).await?) })
    }
}

/// Reasons a request could not be answered.
#[derive(Error, Debug)]
pub enum ReplyError {
    /// The request does not say where to reply
    #[error("request has no usable reply address: {0}")]
    MissingReplyAddress(#[from] HeaderError),

    /// The request payload is not a message
    #[error("invalid request payload: {0}")]
    InvalidRequest(String),

    /// The reply could not be published
    #[error("failed to publish reply: {0}")]
    Publish(#[from] BusError),
}

struct HandlerInner {
    bus: Arc<dyn MessageBus>,
    backend: Arc<dyn Backend>,
    sequence: AtomicI32,
}

/// Answers requests consumed from the request topic.
///
/// Cheap to clone; clones share the sequence counter.
#[derive(Clone)]
pub struct ReplyHandler {
    inner: Arc<HandlerInner>,
}

impl ReplyHandler {
    /// Create a handler publishing replies on `bus`.
    #[must_use]
    pub fn new(bus: Arc<dyn MessageBus>, backend: Arc<dyn Backend>) -> Self {
        Self {
            inner: Arc::new(HandlerInner {
                bus,
                backend,
                sequence: AtomicI32::new(0),
            }),
        }
    }

    /// Answer one request.
    ///
    /// # Errors
    ///
    /// Returns [`ReplyError`] if the request cannot be answered. Backend
    /// refusals are not errors; they produce a 429 reply.
    pub async fn handle(&self, record: &InboundRecord) -> Result<Delivery, ReplyError> {
        let address = record.headers.reply_address()?;
        let mut message = Message::from_bytes(&record.payload)
            .map_err(|e| ReplyError::InvalidRequest(e.to_string()))?;

        let reply_id = self.inner.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        message.reply = Some(reply_id);
        debug!(reply_id, request = %message, "Dispatching request");

        match self.inner.backend.dispatch(reply_id, &message).await {
            Ok(backend_id) => {
                message.status = Some(STATUS_OK);
                message.backend = Some(backend_id);
            }
            Err(e) => {
                info!(reply_id, error = %e, "Backend refused request");
                message.status = Some(STATUS_TOO_MANY_REQUESTS);
                message.backend = None;
            }
        }

        let payload = message
            .to_bytes()
            .map_err(|e| ReplyError::InvalidRequest(e.to_string()))?;
        let mut headers = RecordHeaders::new();
        match record.headers.correlation_id() {
            Some(correlation_id) => headers.set_correlation_id(&correlation_id),
            None => warn!(reply_id, "Request has no correlation id; requester cannot match the reply"),
        }

        let mut reply = OutboundRecord::new(address.topic, payload).with_headers(headers);
        if let Some(partition) = address.partition {
            reply = reply.with_partition(partition);
        }
        let delivery = self.inner.bus.publish(reply).await?;

        let status = message.status.unwrap_or_default();
        ReplyHandlerMetrics::record_published(status);
        info!(
            reply_id,
            status,
            backend = ?message.backend,
            partition = delivery.partition,
            "Reply published"
        );
        Ok(delivery)
    }

    /// Answer every request on a stream, each in its own task.
    pub fn spawn(&self, mut records: RecordStream) -> JoinHandle<()> {
        let handler = self.clone();
        tokio::spawn(async move {
            while let Some(next) = records.next().await {
                match next {
                    Ok(record) => {
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handler.handle(&record).await {
                                ReplyHandlerMetrics::record_dropped();
                                warn!(
                                    topic = %record.topic,
                                    partition = record.partition,
                                    offset = record.offset,
                                    error = %e,
                                    "Dropping request"
                                );
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Error receiving request"),
                }
            }
            info!("Request stream ended");
        })
    }
}
