//! Message bus abstraction for partitioned, append-log transports.
//!
//! This module provides the [`MessageBus`] trait used by every component that
//! talks to the outside world. A bus exposes topics split into partitions;
//! records are published to a topic (optionally to an explicit partition) and
//! consumed by subscriptions that belong to a consumer group.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   request + reply address    ┌───────────────┐
//! │  Correlator  │ ───────────────────────────► │ request-topic │
//! └──────▲───────┘                              └───────┬───────┘
//!        │                                              │
//!        │ reply (correlationId)                        ▼
//! ┌──────┴───────┐                              ┌───────────────┐
//! │ reply-topic  │ ◄─────────────────────────── │ Reply Handler │
//! │ partition N  │     publish to partition N   └───────────────┘
//! └──────────────┘
//! ```
//!
//! # Key Principles
//!
//! - **Partitioned**: ordering exists only within a partition
//! - **Group assignment**: each partition of a topic is owned by exactly one
//!   subscription per consumer group; the owner set changes on rebalance
//! - **Observable assignment**: subscriptions publish their current partition
//!   assignment so callers can pin a reply address
//!
//! # Implementations
//!
//! - `InMemoryBus` in `courier-testing` - For tests (partitioned, in-process)
//! - `RedpandaBus` in `courier-redpanda` - For production (Kafka-compatible)

use crate::headers::RecordHeaders;
use futures::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::watch;

/// Errors that can occur during bus operations.
#[derive(Error, Debug, Clone)]
pub enum BusError {
    /// Failed to connect to the bus
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a record to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// Topic or partition not found
    #[error("Unknown topic partition: {0}")]
    UnknownPartition(TopicPartition),

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// A single partition of a topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    /// Topic name
    pub topic: String,
    /// Partition number within the topic
    pub partition: i32,
}

impl TopicPartition {
    /// Create a new topic partition.
    #[must_use]
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// A record to be published.
#[derive(Debug, Clone, Default)]
pub struct OutboundRecord {
    /// Destination topic
    pub topic: String,
    /// Explicit destination partition; `None` lets the bus choose
    pub partition: Option<i32>,
    /// Optional partitioning key
    pub key: Option<Vec<u8>>,
    /// Encoded payload
    pub payload: Vec<u8>,
    /// Record headers
    pub headers: RecordHeaders,
}

impl OutboundRecord {
    /// Create a record for `topic` carrying `payload`.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            payload,
            ..Self::default()
        }
    }

    /// Target a specific partition.
    #[must_use]
    pub const fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    /// Set the partitioning key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Replace the record headers.
    #[must_use]
    pub fn with_headers(mut self, headers: RecordHeaders) -> Self {
        self.headers = headers;
        self
    }
}

/// A record received from a subscription.
#[derive(Debug, Clone)]
pub struct InboundRecord {
    /// Source topic
    pub topic: String,
    /// Source partition
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Partitioning key, if any
    pub key: Option<Vec<u8>>,
    /// Encoded payload
    pub payload: Vec<u8>,
    /// Record headers
    pub headers: RecordHeaders,
}

/// Where a published record landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// Partition the record was written to
    pub partition: i32,
    /// Offset assigned by the bus
    pub offset: i64,
}

/// Stream of records from a subscription.
pub type RecordStream = Pin<Box<dyn Stream<Item = Result<InboundRecord, BusError>> + Send>>;

/// An active subscription.
///
/// Holds the record stream and a watch over the partitions currently
/// assigned to this subscription. The assignment starts empty and is
/// replaced wholesale on every rebalance.
pub struct Subscription {
    /// Records delivered to this subscription
    pub records: RecordStream,
    /// Current partition assignment
    pub assignment: watch::Receiver<Vec<TopicPartition>>,
}

impl Subscription {
    /// Split into the record stream and the assignment watch.
    #[must_use]
    pub fn into_parts(self) -> (RecordStream, watch::Receiver<Vec<TopicPartition>>) {
        (self.records, self.assignment)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("assignment", &*self.assignment.borrow())
            .finish_non_exhaustive()
    }
}

/// Trait for message bus implementations.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`: the same bus handle is shared by
/// the correlator, the reply handler and the HTTP layer.
///
/// # Dyn Compatibility
///
/// Methods return `Pin<Box<dyn Future>>` instead of using `async fn` so the
/// trait can be used as `Arc<dyn MessageBus>`.
pub trait MessageBus: Send + Sync {
    /// Publish a record.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::PublishFailed`] if the bus does not acknowledge
    /// the record, or [`BusError::UnknownPartition`] if an explicit partition
    /// does not exist.
    fn publish(
        &self,
        record: OutboundRecord,
    ) -> Pin<Box<dyn Future<Output = Result<Delivery, BusError>> + Send + '_>>;

    /// Subscribe to one or more topics as a member of the bus's consumer group.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::SubscriptionFailed`] if the subscription cannot be
    /// created.
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<Subscription, BusError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_partition_orders_by_topic_then_partition() {
        let mut tps = vec![
            TopicPartition::new("replies", 2),
            TopicPartition::new("replies", 0),
            TopicPartition::new("alpha", 5),
        ];
        tps.sort();
        assert_eq!(tps[0], TopicPartition::new("alpha", 5));
        assert_eq!(tps[1], TopicPartition::new("replies", 0));
    }

    #[test]
    fn topic_partition_display() {
        assert_eq!(TopicPartition::new("replies", 3).to_string(), "replies[3]");
    }

    #[test]
    fn outbound_record_builder() {
        let record = OutboundRecord::new("requests", vec![1, 2])
            .with_partition(4)
            .with_key("k");
        assert_eq!(record.topic, "requests");
        assert_eq!(record.partition, Some(4));
        assert_eq!(record.key.as_deref(), Some(&b"k"[..]));
        assert!(record.headers.is_empty());
    }

    #[test]
    fn bus_error_messages() {
        let err = BusError::PublishFailed {
            topic: "requests".to_string(),
            reason: "broker down".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Publish failed for topic 'requests': broker down"
        );
        let err = BusError::UnknownPartition(TopicPartition::new("replies", 9));
        assert_eq!(err.to_string(), "Unknown topic partition: replies[9]");
    }
}
