//! Redpanda message bus for Courier.
//!
//! This crate provides a Kafka-compatible implementation of the
//! [`MessageBus`] trait from `courier-core`, built on rdkafka. It works
//! against Redpanda, Apache Kafka or any other broker speaking the Kafka
//! protocol.
//!
//! # What it adds over a plain producer/consumer
//!
//! - **Headers**: record headers travel both ways, so requests can carry
//!   `replyTopic`, `replyPartition` and `correlationId`
//! - **Explicit partitions**: replies are produced straight to the partition
//!   the requester pinned
//! - **Observable assignment**: every subscription's consumer reports its
//!   rebalances on a watch channel, which the partition pinner follows
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - Offsets are committed AFTER the record reaches the subscriber's channel
//! - If the process crashes before commit, records are redelivered
//! - Ordering is guaranteed within a partition only
//!
//! # Example
//!
//! ```no_run
//! use courier_redpanda::RedpandaBus;
//! use courier_core::bus::{MessageBus, OutboundRecord};
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = RedpandaBus::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("courier")
//!     .build()?;
//!
//! let subscription = bus.subscribe(&["reply-topic"]).await?;
//! let (mut records, assignment) = subscription.into_parts();
//!
//! bus.publish(OutboundRecord::new("request-topic", b"{\"value\":7}".to_vec())).await?;
//!
//! while let Some(record) = records.next().await {
//!     println!("{:?} (assigned: {:?})", record?.payload, *assignment.borrow());
//! }
//! # Ok(())
//! # }
//! ```

use courier_core::bus::{
    BusError, Delivery, InboundRecord, MessageBus, OutboundRecord, Subscription, TopicPartition,
};
use courier_core::headers::RecordHeaders;
use rdkafka::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::topic_partition_list::TopicPartitionList;
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::watch;

/// Consumer context publishing partition assignments.
///
/// Runs inside librdkafka's rebalance callback. An `Assign` publishes the
/// full new assignment; a `Revoke` publishes an empty one until the next
/// assignment lands.
struct AssignmentContext {
    group: String,
    assignment: watch::Sender<Vec<TopicPartition>>,
}

impl AssignmentContext {
    fn partitions(list: &TopicPartitionList) -> Vec<TopicPartition> {
        let mut partitions: Vec<TopicPartition> = list
            .elements()
            .iter()
            .map(|elem| TopicPartition::new(elem.topic(), elem.partition()))
            .collect();
        partitions.sort();
        partitions
    }
}

impl ClientContext for AssignmentContext {}

impl ConsumerContext for AssignmentContext {
    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(list) => {
                let partitions = Self::partitions(list);
                tracing::info!(
                    consumer_group = %self.group,
                    partitions = ?partitions,
                    "Partitions assigned"
                );
                self.assignment.send_replace(partitions);
            }
            Rebalance::Revoke(list) => {
                tracing::info!(
                    consumer_group = %self.group,
                    partitions = ?Self::partitions(list),
                    "Partitions revoked"
                );
                self.assignment.send_replace(Vec::new());
            }
            Rebalance::Error(e) => {
                tracing::error!(consumer_group = %self.group, error = %e, "Rebalance failed");
            }
        }
    }
}

/// Redpanda message bus.
///
/// One producer is shared by every publish; every [`subscribe`] call creates
/// its own consumer in the configured consumer group, driven by a background
/// task that forwards records through a bounded channel.
///
/// # Example
///
/// ```no_run
/// use courier_redpanda::RedpandaBus;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// // Basic configuration
/// let bus = RedpandaBus::new("localhost:9092")?;
///
/// // Custom configuration
/// let bus = RedpandaBus::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .consumer_group("courier")
///     .producer_acks("all")
///     .build()?;
/// # Ok(())
/// # }
/// ```
///
/// [`subscribe`]: MessageBus::subscribe
pub struct RedpandaBus {
    /// Kafka producer for publishing records
    producer: FutureProducer,
    /// Broker addresses (for creating consumers)
    brokers: String,
    /// Producer queue timeout
    timeout: Duration,
    /// Consumer group joined by every subscription
    consumer_group: String,
    /// Record buffer size per subscription
    buffer_size: usize,
    /// Auto offset reset policy
    auto_offset_reset: String,
}

impl RedpandaBus {
    /// Create a bus with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectionFailed`] if the producer cannot be
    /// created.
    pub fn new(brokers: &str) -> Result<Self, BusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the bus.
    #[must_use]
    pub fn builder() -> RedpandaBusBuilder {
        RedpandaBusBuilder::default()
    }

    /// Get a reference to the brokers string.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// The consumer group subscriptions join.
    #[must_use]
    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }
}

impl std::fmt::Debug for RedpandaBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedpandaBus")
            .field("brokers", &self.brokers)
            .field("consumer_group", &self.consumer_group)
            .finish_non_exhaustive()
    }
}

/// Builder for configuring a [`RedpandaBus`].
#[derive(Default)]
pub struct RedpandaBusBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
}

impl RedpandaBusBuilder {
    /// Set the broker addresses.
    ///
    /// # Parameters
    ///
    /// - `brokers`: Comma-separated list of broker addresses (e.g., "localhost:9092")
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the producer acknowledgment mode: "0", "1" or "all".
    ///
    /// Default: "1"
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: "none", "gzip", "snappy", "lz4", "zstd".
    ///
    /// Default: "none"
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the consumer group joined by every subscription.
    ///
    /// Instances sharing a group split the partitions of each topic between
    /// them, which is what gives each instance its own reply partition.
    ///
    /// Default: "courier"
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Set the record buffer size per subscription. Zero is treated as one.
    ///
    /// Default: 1000
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size.max(1));
        self
    }

    /// Set where new consumer groups start reading: "earliest", "latest"
    /// or "error".
    ///
    /// Default: "latest"
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the [`RedpandaBus`].
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectionFailed`] if:
    /// - Brokers not set
    /// - Cannot create producer
    /// - Invalid configuration
    pub fn build(self) -> Result<RedpandaBus, BusError> {
        let brokers = self
            .brokers
            .ok_or_else(|| BusError::ConnectionFailed("Brokers not configured".to_string()))?;

        let mut producer_config = ClientConfig::new();
        producer_config
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", self.producer_acks.as_deref().unwrap_or("1"))
            .set("compression.type", self.compression.as_deref().unwrap_or("none"));

        let producer: FutureProducer = producer_config
            .create()
            .map_err(|e| BusError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        let consumer_group = self.consumer_group.unwrap_or_else(|| "courier".to_string());
        let buffer_size = self.buffer_size.unwrap_or(1000);
        let auto_offset_reset = self.auto_offset_reset.unwrap_or_else(|| "latest".to_string());

        tracing::info!(
            brokers = %brokers,
            consumer_group = %consumer_group,
            acks = self.producer_acks.as_deref().unwrap_or("1"),
            compression = self.compression.as_deref().unwrap_or("none"),
            buffer_size,
            auto_offset_reset = %auto_offset_reset,
            "RedpandaBus created"
        );

        Ok(RedpandaBus {
            producer,
            brokers,
            timeout: self.timeout.unwrap_or(Duration::from_secs(5)),
            consumer_group,
            buffer_size,
            auto_offset_reset,
        })
    }
}

/// Convert our headers to Kafka headers, preserving order and repeats.
fn to_kafka_headers(headers: &RecordHeaders) -> OwnedHeaders {
    headers
        .iter()
        .fold(OwnedHeaders::new_with_capacity(headers.len()), |acc, (key, value)| {
            acc.insert(Header {
                key,
                value: Some(value),
            })
        })
}

/// Convert Kafka headers to ours. Null-valued headers become empty values.
fn from_kafka_headers<H: Headers>(headers: &H) -> RecordHeaders {
    let mut converted = RecordHeaders::new();
    for header in headers.iter() {
        converted.append(header.key, header.value.unwrap_or_default());
    }
    converted
}

fn to_inbound(message: &BorrowedMessage<'_>) -> InboundRecord {
    InboundRecord {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        headers: message
            .headers()
            .map(from_kafka_headers)
            .unwrap_or_default(),
    }
}

impl MessageBus for RedpandaBus {
    fn publish(
        &self,
        record: OutboundRecord,
    ) -> Pin<Box<dyn Future<Output = Result<Delivery, BusError>> + Send + '_>> {
        let timeout = self.timeout;

        Box::pin(async move {
            let OutboundRecord {
                topic,
                partition,
                key,
                payload,
                headers,
            } = record;

            let mut kafka_record: FutureRecord<'_, [u8], [u8]> = FutureRecord::to(&topic)
                .payload(payload.as_slice())
                .headers(to_kafka_headers(&headers));
            if let Some(key) = &key {
                kafka_record = kafka_record.key(key.as_slice());
            }
            if let Some(partition) = partition {
                kafka_record = kafka_record.partition(partition);
            }

            match self.producer.send(kafka_record, Timeout::After(timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %topic,
                        partition,
                        offset,
                        "Record published"
                    );
                    Ok(Delivery { partition, offset })
                }
                Err((kafka_error, _)) => {
                    tracing::error!(
                        topic = %topic,
                        partition = ?partition,
                        error = %kafka_error,
                        "Failed to publish record"
                    );
                    Err(BusError::PublishFailed {
                        topic,
                        reason: kafka_error.to_string(),
                    })
                }
            }
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<Subscription, BusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|s| (*s).to_string()).collect();
        let brokers = self.brokers.clone();
        let consumer_group = self.consumer_group.clone();
        let buffer_size = self.buffer_size;
        let auto_offset_reset = self.auto_offset_reset.clone();

        Box::pin(async move {
            let (assignment_tx, assignment) = watch::channel(Vec::new());
            let context = AssignmentContext {
                group: consumer_group.clone(),
                assignment: assignment_tx,
            };

            // Manual commit for at-least-once
            let consumer: StreamConsumer<AssignmentContext> = ClientConfig::new()
                .set("bootstrap.servers", &brokers)
                .set("group.id", &consumer_group)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create_with_context(context)
                .map_err(|e| BusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to create consumer: {e}"),
                })?;

            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topic_refs)
                .map_err(|e| BusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to subscribe to topics: {e}"),
                })?;

            tracing::info!(
                topics = ?topics,
                consumer_group = %consumer_group,
                buffer_size,
                auto_offset_reset = %auto_offset_reset,
                "Subscribed to topics"
            );

            let (tx, rx) = tokio::sync::mpsc::channel(buffer_size);

            // The task owns the consumer; rebalance callbacks fire while it polls
            tokio::spawn(async move {
                use futures::StreamExt;

                let mut stream = consumer.stream();
                while let Some(next) = stream.next().await {
                    match next {
                        Ok(message) => {
                            let record = to_inbound(&message);
                            tracing::trace!(
                                topic = %record.topic,
                                partition = record.partition,
                                offset = record.offset,
                                "Received record"
                            );

                            if tx.send(Ok(record)).await.is_err() {
                                tracing::debug!("Subscriber dropped, exiting consumer task");
                                break;
                            }

                            if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                                tracing::warn!(
                                    topic = message.topic(),
                                    partition = message.partition(),
                                    offset = message.offset(),
                                    error = %e,
                                    "Failed to commit offset (record may be redelivered)"
                                );
                            }
                        }
                        Err(e) => {
                            let err = BusError::TransportError(format!("Failed to receive record: {e}"));
                            if tx.send(Err(err)).await.is_err() {
                                break;
                            }
                        }
                    }
                }

                tracing::debug!("Consumer task exiting");
            });

            let records = async_stream::stream! {
                let mut rx = rx;
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };

            Ok(Subscription {
                records: Box::pin(records),
                assignment,
            })
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use courier_core::correlation::CorrelationId;
    use courier_core::headers::decode_partition;

    #[test]
    fn redpanda_bus_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedpandaBus>();
        assert_sync::<RedpandaBus>();
    }

    #[test]
    fn build_requires_brokers() {
        let err = RedpandaBus::builder().build().unwrap_err();
        assert!(matches!(err, BusError::ConnectionFailed(_)));
    }

    #[test]
    fn builder_applies_defaults() {
        // Creating a producer does not connect, so this works without a broker
        let bus = RedpandaBus::new("localhost:9092").unwrap();
        assert_eq!(bus.brokers(), "localhost:9092");
        assert_eq!(bus.consumer_group(), "courier");
        assert_eq!(bus.buffer_size, 1000);
        assert_eq!(bus.auto_offset_reset, "latest");
    }

    #[test]
    fn headers_survive_conversion() {
        let mut headers = RecordHeaders::new();
        let id = CorrelationId::random();
        headers.set_reply_address(&TopicPartition::new("replies", 3), &id);

        let converted = from_kafka_headers(&to_kafka_headers(&headers));
        assert_eq!(converted, headers);
        assert_eq!(converted.correlation_id(), Some(id));
        assert_eq!(
            decode_partition(converted.get("replyPartition").unwrap()).unwrap(),
            3
        );
    }

    #[test]
    fn assignment_lists_are_sorted() {
        let mut list = TopicPartitionList::new();
        list.add_partition("replies", 3);
        list.add_partition("replies", 1);
        list.add_partition("alpha", 0);

        let partitions = AssignmentContext::partitions(&list);
        assert_eq!(
            partitions,
            vec![
                TopicPartition::new("alpha", 0),
                TopicPartition::new("replies", 1),
                TopicPartition::new("replies", 3),
            ]
        );
    }
}
