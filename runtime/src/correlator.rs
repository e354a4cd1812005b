//! Synchronous request/reply on top of an asynchronous bus.
//!
//! The [`Correlator`] turns "publish a request" plus "somebody eventually
//! publishes a reply" into one awaitable call:
//!
//! 1. mint a correlation id unique among live entries
//! 2. read the pinned reply partition (fail fast with
//!    [`CorrelatorError::NotReady`] if there is none)
//! 3. register a pending entry with a deadline
//! 4. publish the request with `replyTopic`, `replyPartition` and
//!    `correlationId` headers
//! 5. hand back a [`PendingReply`]
//!
//! Every entry leaves the registry exactly once, through whichever of
//! {reply matched, deadline elapsed, caller cancelled} removes it first.
//! All three race on the same `DashMap::remove`, so only one wins.
//!
//! # Example
//!
//! ```ignore
//! let correlator = Correlator::new(bus, pinner);
//! let _listener = correlator.attach(bus.subscribe(&["reply-topic"]).await?);
//!
//! let reply = correlator
//!     .send_and_receive("request-topic", &Message::new().with_value(7), Duration::from_secs(10))
//!     .await?;
//! ```

use crate::metrics::CorrelatorMetrics;
use crate::pinner::{PartitionPinner, PinError};
use chrono::{DateTime, Utc};
use courier_core::bus::{InboundRecord, MessageBus, OutboundRecord, RecordStream, Subscription, TopicPartition};
use courier_core::correlation::CorrelationId;
use courier_core::environment::{Clock, SystemClock};
use courier_core::headers::RecordHeaders;
use courier_core::message::Message;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Failures reported to the caller of [`Correlator::send_and_receive`].
///
/// Admission rejection by the far side is not an error here: it arrives as an
/// ordinary reply carrying `status = 429`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorrelatorError {
    /// No reply partition is pinned yet
    #[error("correlator not ready: {0}")]
    NotReady(#[from] PinError),

    /// The request could not be published
    #[error("failed to send request: {0}")]
    SendFailure(String),

    /// No reply arrived before the deadline
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the request
    #[error("request cancelled")]
    Cancelled,

    /// A reply arrived but its payload could not be decoded
    #[error("invalid reply payload: {0}")]
    InvalidReply(String),
}

/// What happened to one inbound reply record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyDisposition {
    /// Completed a pending request
    Matched,
    /// No pending request with that id; dropped
    Unknown,
    /// No correlation header; dropped
    Uncorrelated,
}

type Completion = oneshot::Sender<Result<Message, CorrelatorError>>;

struct PendingEntry {
    reply_to: TopicPartition,
    created_at: DateTime<Utc>,
    started: Instant,
    completion: Completion,
    timer: Option<AbortHandle>,
}

impl PendingEntry {
    fn stop_timer(&self) {
        if let Some(timer) = &self.timer {
            timer.abort();
        }
    }
}

struct CorrelatorInner {
    bus: Arc<dyn MessageBus>,
    pinner: Arc<PartitionPinner>,
    clock: Arc<dyn Clock>,
    registry: DashMap<CorrelationId, PendingEntry>,
}

impl CorrelatorInner {
    /// Remove an entry on behalf of its caller. Returns the entry if this call
    /// won the race.
    fn withdraw(&self, correlation_id: &CorrelationId) -> Option<PendingEntry> {
        let (_, entry) = self.registry.remove(correlation_id)?;
        entry.stop_timer();
        CorrelatorMetrics::record_cancellation();
        CorrelatorMetrics::record_settled();
        Some(entry)
    }
}

/// Request/reply correlator.
///
/// Cheap to clone; clones share one registry.
#[derive(Clone)]
pub struct Correlator {
    inner: Arc<CorrelatorInner>,
}

impl Correlator {
    /// Create a correlator using the system clock.
    #[must_use]
    pub fn new(bus: Arc<dyn MessageBus>, pinner: Arc<PartitionPinner>) -> Self {
        Self::with_clock(bus, pinner, Arc::new(SystemClock))
    }

    /// Create a correlator with an injected clock.
    #[must_use]
    pub fn with_clock(
        bus: Arc<dyn MessageBus>,
        pinner: Arc<PartitionPinner>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(CorrelatorInner {
                bus,
                pinner,
                clock,
                registry: DashMap::new(),
            }),
        }
    }

    /// The pinner supplying this correlator's reply address.
    #[must_use]
    pub fn pinner(&self) -> &Arc<PartitionPinner> {
        &self.inner.pinner
    }

    /// Send a request and wait for its reply.
    ///
    /// # Errors
    ///
    /// See [`CorrelatorError`].
    pub async fn send_and_receive(
        &self,
        topic: &str,
        message: &Message,
        timeout: Duration,
    ) -> Result<Message, CorrelatorError> {
        self.send(topic, message, timeout).await?.await
    }

    /// Send a request and return a handle to its eventual reply.
    ///
    /// The entry is registered before the request is published, so a reply
    /// can never arrive ahead of it.
    ///
    /// # Errors
    ///
    /// Returns [`CorrelatorError::NotReady`] when no reply partition is
    /// pinned, and [`CorrelatorError::SendFailure`] when the request cannot be
    /// encoded or published. Neither leaves an entry behind.
    pub async fn send(
        &self,
        topic: &str,
        message: &Message,
        timeout: Duration,
    ) -> Result<PendingReply, CorrelatorError> {
        let reply_to = self.inner.pinner.assigned_partition()?;
        let payload = message
            .to_bytes()
            .map_err(|e| CorrelatorError::SendFailure(e.to_string()))?;

        let (completion, receiver) = oneshot::channel();
        let deadline = Instant::now() + timeout;
        let correlation_id = self.register(PendingEntry {
            reply_to: reply_to.clone(),
            created_at: self.inner.clock.now(),
            started: Instant::now(),
            completion,
            timer: None,
        });

        let timer = tokio::spawn(expire(
            Arc::downgrade(&self.inner),
            correlation_id.clone(),
            deadline,
            timeout,
        ));
        if let Some(mut entry) = self.inner.registry.get_mut(&correlation_id) {
            entry.timer = Some(timer.abort_handle());
        }
        CorrelatorMetrics::record_sent();

        let pending = PendingReply {
            correlation_id: correlation_id.clone(),
            receiver,
            correlator: Arc::downgrade(&self.inner),
            finished: false,
        };

        let mut headers = RecordHeaders::new();
        headers.set_reply_address(&reply_to, &correlation_id);
        let record = OutboundRecord::new(topic, payload).with_headers(headers);

        match self.inner.bus.publish(record).await {
            Ok(delivery) => {
                debug!(
                    correlation_id = %correlation_id,
                    topic = %topic,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    reply_to = %reply_to,
                    "Request published"
                );
                Ok(pending)
            }
            Err(e) => {
                if let Some((_, entry)) = self.inner.registry.remove(&correlation_id) {
                    entry.stop_timer();
                    CorrelatorMetrics::record_settled();
                }
                CorrelatorMetrics::record_send_failure();
                warn!(correlation_id = %correlation_id, topic = %topic, error = %e, "Failed to publish request");
                // The entry is already gone, so dropping the handle is a no-op
                drop(pending);
                Err(CorrelatorError::SendFailure(e.to_string()))
            }
        }
    }

    /// Insert an entry under a fresh id, re-rolling on collision.
    fn register(&self, entry: PendingEntry) -> CorrelationId {
        loop {
            let correlation_id = CorrelationId::random();
            match self.inner.registry.entry(correlation_id.clone()) {
                Entry::Occupied(_) => {
                    warn!(correlation_id = %correlation_id, "Correlation id collision, re-rolling");
                }
                Entry::Vacant(slot) => {
                    slot.insert(entry);
                    break correlation_id;
                }
            }
        }
    }

    /// Match one inbound reply against the registry.
    pub fn handle_reply(&self, record: &InboundRecord) -> ReplyDisposition {
        let Some(correlation_id) = record.headers.correlation_id() else {
            warn!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                "Reply without correlation id, dropping"
            );
            return ReplyDisposition::Uncorrelated;
        };

        let Some((_, entry)) = self.inner.registry.remove(&correlation_id) else {
            CorrelatorMetrics::record_unknown();
            info!(
                correlation_id = %correlation_id,
                partition = record.partition,
                offset = record.offset,
                "No pending request for reply, dropping"
            );
            return ReplyDisposition::Unknown;
        };
        entry.stop_timer();
        CorrelatorMetrics::record_settled();

        let result = Message::from_bytes(&record.payload)
            .map_err(|e| CorrelatorError::InvalidReply(e.to_string()));
        match &result {
            Ok(reply) => {
                CorrelatorMetrics::record_matched(entry.started.elapsed());
                debug!(
                    correlation_id = %correlation_id,
                    reply_to = %entry.reply_to,
                    created_at = %entry.created_at,
                    reply = %reply,
                    "Reply matched"
                );
            }
            Err(e) => {
                warn!(correlation_id = %correlation_id, error = %e, "Undecodable reply for pending request");
            }
        }

        // The caller may have stopped listening; that is their business
        let _ = entry.completion.send(result);
        ReplyDisposition::Matched
    }

    /// Consume a reply stream until it ends.
    pub fn spawn_listener(&self, mut records: RecordStream) -> JoinHandle<()> {
        let correlator = self.clone();
        tokio::spawn(async move {
            while let Some(next) = records.next().await {
                match next {
                    Ok(record) => {
                        correlator.handle_reply(&record);
                    }
                    Err(e) => warn!(error = %e, "Error receiving reply"),
                }
            }
            info!("Reply stream ended");
        })
    }

    /// Wire a reply-topic subscription into this correlator.
    ///
    /// Its assignment feeds the pinner and its records feed
    /// [`handle_reply`](Self::handle_reply).
    pub fn attach(&self, subscription: Subscription) -> ReplyListener {
        let (records, assignment) = subscription.into_parts();
        ReplyListener {
            assignment: Arc::clone(&self.inner.pinner).track(assignment),
            records: self.spawn_listener(records),
        }
    }

    /// Number of requests awaiting a reply.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Whether `correlation_id` is awaiting a reply.
    #[must_use]
    pub fn is_pending(&self, correlation_id: &CorrelationId) -> bool {
        self.inner.registry.contains_key(correlation_id)
    }
}

impl fmt::Debug for Correlator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Correlator")
            .field("reply_topic", &self.inner.pinner.topic())
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

async fn expire(
    correlator: Weak<CorrelatorInner>,
    correlation_id: CorrelationId,
    deadline: Instant,
    timeout: Duration,
) {
    tokio::time::sleep_until(deadline).await;
    let Some(correlator) = correlator.upgrade() else {
        return;
    };
    if let Some((_, entry)) = correlator.registry.remove(&correlation_id) {
        CorrelatorMetrics::record_timeout();
        CorrelatorMetrics::record_settled();
        warn!(
            correlation_id = %correlation_id,
            reply_to = %entry.reply_to,
            created_at = %entry.created_at,
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "Request timed out waiting for reply"
        );
        let _ = entry.completion.send(Err(CorrelatorError::Timeout(timeout)));
    }
}

/// Background tasks feeding one correlator from a subscription.
#[derive(Debug)]
pub struct ReplyListener {
    /// Reply record consumer
    pub records: JoinHandle<()>,
    /// Assignment tracker feeding the pinner
    pub assignment: JoinHandle<()>,
}

impl ReplyListener {
    /// Stop both tasks.
    pub fn abort(&self) {
        self.records.abort();
        self.assignment.abort();
    }
}

/// Handle to the eventual reply of one request.
///
/// Resolves exactly once to the reply or a [`CorrelatorError`]. Await it,
/// poll it with [`try_result`](Self::try_result), block on it with
/// [`wait`](Self::wait), chain continuations with `FutureExt`, or
/// [`cancel`](Self::cancel) it. Dropping an unfinished handle cancels it.
pub struct PendingReply {
    correlation_id: CorrelationId,
    receiver: oneshot::Receiver<Result<Message, CorrelatorError>>,
    correlator: Weak<CorrelatorInner>,
    finished: bool,
}

impl PendingReply {
    /// The id this request was published with.
    #[must_use]
    pub const fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Cancel the request.
    ///
    /// Returns `true` if this call removed the entry. The published request
    /// is not recalled; a reply to it will be dropped as unknown. Returns
    /// `false` if the request had already settled, in which case the outcome
    /// is still available.
    pub fn cancel(&mut self) -> bool {
        if self.finished {
            return false;
        }
        let Some(entry) = self
            .correlator
            .upgrade()
            .and_then(|correlator| correlator.withdraw(&self.correlation_id))
        else {
            return false;
        };
        debug!(correlation_id = %self.correlation_id, "Request cancelled");
        let _ = entry.completion.send(Err(CorrelatorError::Cancelled));
        true
    }

    /// Take the outcome if it is already known. Never blocks.
    pub fn try_result(&mut self) -> Option<Result<Message, CorrelatorError>> {
        if self.finished {
            return None;
        }
        match self.receiver.try_recv() {
            Ok(result) => {
                self.finished = true;
                Some(result)
            }
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.finished = true;
                Some(Err(CorrelatorError::Cancelled))
            }
        }
    }

    /// Block the current thread until the outcome is known.
    ///
    /// Must not be called from inside an async task; the deadline timer needs
    /// a runtime thread to make progress.
    ///
    /// # Errors
    ///
    /// See [`CorrelatorError`].
    pub fn wait(self) -> Result<Message, CorrelatorError> {
        futures::executor::block_on(self)
    }
}

impl Future for PendingReply {
    type Output = Result<Message, CorrelatorError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.finished {
            // Polled again after completion
            return Poll::Ready(Err(CorrelatorError::Cancelled));
        }
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(result) => {
                self.finished = true;
                Poll::Ready(result.unwrap_or(Err(CorrelatorError::Cancelled)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(correlator) = self.correlator.upgrade() {
            if correlator.withdraw(&self.correlation_id).is_some() {
                debug!(correlation_id = %self.correlation_id, "Pending reply dropped, request abandoned");
            }
        }
    }
}

impl fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingReply")
            .field("correlation_id", &self.correlation_id)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}
