//! In-process partitioned message bus.
//!
//! [`InMemoryBus`] models the parts of a Kafka-style broker the request/reply
//! runtime depends on:
//!
//! - topics split into a fixed number of partitions, each an append-only log
//! - explicit-partition, keyed and round-robin publishing
//! - consumer groups: each partition of a topic is owned by exactly one member
//!   per group, reassigned round-robin whenever a member joins or leaves
//! - every subscription publishes its current assignment on a watch channel
//!
//! Handles created with [`InMemoryBus::for_group`] share the broker state, so
//! several "instances" can run in one test. Records published to a partition
//! with no owner in a group are kept in the log but not delivered to that
//! group later.
//!
//! # Example
//!
//! ```
//! use courier_testing::InMemoryBus;
//! use courier_core::bus::{MessageBus, OutboundRecord};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = InMemoryBus::new().with_default_partitions(4);
//! let subscription = bus.subscribe(&["replies"]).await?;
//! assert_eq!(subscription.assignment.borrow().len(), 4);
//!
//! bus.publish(OutboundRecord::new("replies", b"{}".to_vec()).with_partition(2)).await?;
//! assert_eq!(bus.records("replies").len(), 1);
//! # Ok(())
//! # }
//! ```

use courier_core::bus::{
    BusError, Delivery, InboundRecord, MessageBus, OutboundRecord, Subscription, TopicPartition,
};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tracing::debug;

type Delivered = Result<InboundRecord, BusError>;

struct TopicState {
    logs: Vec<Vec<InboundRecord>>,
    next_round_robin: usize,
}

impl TopicState {
    fn new(partitions: usize) -> Self {
        Self {
            logs: (0..partitions).map(|_| Vec::new()).collect(),
            next_round_robin: 0,
        }
    }
}

struct Member {
    topics: Vec<String>,
    records: mpsc::UnboundedSender<Delivered>,
    assignment: watch::Sender<Vec<TopicPartition>>,
}

#[derive(Default)]
struct GroupState {
    members: BTreeMap<u64, Member>,
    owners: HashMap<TopicPartition, u64>,
}

#[derive(Default)]
struct BusState {
    topics: HashMap<String, TopicState>,
    groups: HashMap<String, GroupState>,
    next_member: u64,
    failing: bool,
}

impl BusState {
    fn ensure_topic(&mut self, topic: &str, partitions: usize) -> &mut TopicState {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicState::new(partitions))
    }

    /// Reassign every subscribed partition round-robin over the group's
    /// members, in member join order.
    fn rebalance(&mut self, group: &str) {
        let Self { topics, groups, .. } = self;
        let Some(group_state) = groups.get_mut(group) else {
            return;
        };

        let mut assignments: BTreeMap<u64, Vec<TopicPartition>> = group_state
            .members
            .keys()
            .map(|id| (*id, Vec::new()))
            .collect();
        let subscribed: BTreeSet<&String> = group_state
            .members
            .values()
            .flat_map(|m| m.topics.iter())
            .collect();

        group_state.owners.clear();
        for topic in subscribed {
            let subscribers: Vec<u64> = group_state
                .members
                .iter()
                .filter(|(_, m)| m.topics.contains(topic))
                .map(|(id, _)| *id)
                .collect();
            let partitions = topics.get(topic).map_or(0, |t| t.logs.len());
            for partition in 0..partitions {
                let owner = subscribers[partition % subscribers.len()];
                let tp = TopicPartition::new(topic.as_str(), partition_number(partition));
                group_state.owners.insert(tp.clone(), owner);
                if let Some(assigned) = assignments.get_mut(&owner) {
                    assigned.push(tp);
                }
            }
        }

        for (id, assigned) in assignments {
            if let Some(member) = group_state.members.get(&id) {
                debug!(group = %group, member = id, partitions = assigned.len(), "Rebalanced");
                member.assignment.send_if_modified(|current| {
                    if *current == assigned {
                        false
                    } else {
                        *current = assigned;
                        true
                    }
                });
            }
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)] // partition counts are small
const fn partition_number(index: usize) -> i32 {
    index as i32
}

/// Removes a member from its group when its record stream is dropped.
struct Membership {
    state: Arc<Mutex<BusState>>,
    group: String,
    id: u64,
}

impl Drop for Membership {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(group) = state.groups.get_mut(&self.group) {
            group.members.remove(&self.id);
        }
        state.rebalance(&self.group);
        debug!(group = %self.group, member = self.id, "Member left");
    }
}

/// Partitioned in-memory bus for tests.
///
/// Cheap to clone; clones share topics and groups.
#[derive(Clone)]
pub struct InMemoryBus {
    state: Arc<Mutex<BusState>>,
    group: String,
    default_partitions: usize,
}

impl InMemoryBus {
    /// Create a bus whose handle joins consumer group `courier`.
    /// Topics are created on first use with one partition.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState::default())),
            group: "courier".to_string(),
            default_partitions: 1,
        }
    }

    /// Partition count for topics created on first use.
    #[must_use]
    pub fn with_default_partitions(mut self, partitions: usize) -> Self {
        self.default_partitions = partitions.max(1);
        self
    }

    /// Another handle to the same broker, subscribing as `group`.
    #[must_use]
    pub fn for_group(&self, group: impl Into<String>) -> Self {
        Self {
            state: Arc::clone(&self.state),
            group: group.into(),
            default_partitions: self.default_partitions,
        }
    }

    /// Create `topic` with an explicit partition count. No-op if it exists.
    pub fn create_topic(&self, topic: &str, partitions: usize) {
        self.lock().ensure_topic(topic, partitions.max(1));
    }

    /// Make every publish fail until switched back.
    pub fn fail_publishes(&self, failing: bool) {
        self.lock().failing = failing;
    }

    /// All records published to `topic`, by partition then offset.
    #[must_use]
    pub fn records(&self, topic: &str) -> Vec<InboundRecord> {
        self.lock()
            .topics
            .get(topic)
            .map(|t| t.logs.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of partitions of `topic`, if it exists.
    #[must_use]
    pub fn partition_count(&self, topic: &str) -> Option<usize> {
        self.lock().topics.get(topic).map(|t| t.logs.len())
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_now(&self, record: OutboundRecord) -> Result<Delivery, BusError> {
        let mut state = self.lock();
        if state.failing {
            return Err(BusError::PublishFailed {
                topic: record.topic,
                reason: "publishing disabled".to_string(),
            });
        }

        let topic = state.ensure_topic(&record.topic, self.default_partitions);
        let count = topic.logs.len();
        let index = match (record.partition, &record.key) {
            (Some(partition), _) => usize::try_from(partition)
                .ok()
                .filter(|p| *p < count)
                .ok_or_else(|| {
                    BusError::UnknownPartition(TopicPartition::new(record.topic.as_str(), partition))
                })?,
            (None, Some(key)) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                usize::try_from(hasher.finish() % count as u64).unwrap_or(0)
            }
            (None, None) => {
                topic.next_round_robin = topic.next_round_robin.wrapping_add(1);
                topic.next_round_robin % count
            }
        };

        let log = &mut topic.logs[index];
        let offset = i64::try_from(log.len()).unwrap_or(i64::MAX);
        let inbound = InboundRecord {
            topic: record.topic,
            partition: partition_number(index),
            offset,
            key: record.key,
            payload: record.payload,
            headers: record.headers,
        };
        log.push(inbound.clone());

        let tp = TopicPartition::new(inbound.topic.as_str(), inbound.partition);
        for group in state.groups.values() {
            let member = group.owners.get(&tp).and_then(|id| group.members.get(id));
            if let Some(member) = member {
                // A closed receiver means the member is leaving; its guard rebalances
                let _ = member.records.send(Ok(inbound.clone()));
            }
        }

        Ok(Delivery {
            partition: inbound.partition,
            offset,
        })
    }

    fn subscribe_now(&self, topics: &[&str]) -> Result<Subscription, BusError> {
        if topics.is_empty() {
            return Err(BusError::SubscriptionFailed {
                topics: Vec::new(),
                reason: "no topics given".to_string(),
            });
        }

        let (records_tx, mut records_rx) = mpsc::unbounded_channel();
        let (assignment_tx, assignment) = watch::channel(Vec::new());

        let id = {
            let mut state = self.lock();
            for topic in topics {
                state.ensure_topic(topic, self.default_partitions);
            }
            let id = state.next_member;
            state.next_member += 1;
            state
                .groups
                .entry(self.group.clone())
                .or_default()
                .members
                .insert(
                    id,
                    Member {
                        topics: topics.iter().map(ToString::to_string).collect(),
                        records: records_tx,
                        assignment: assignment_tx,
                    },
                );
            state.rebalance(&self.group);
            id
        };
        debug!(group = %self.group, member = id, ?topics, "Member joined");

        let membership = Membership {
            state: Arc::clone(&self.state),
            group: self.group.clone(),
            id,
        };
        let records = async_stream::stream! {
            let _membership = membership;
            while let Some(record) = records_rx.recv().await {
                yield record;
            }
        };

        Ok(Subscription {
            records: Box::pin(records),
            assignment,
        })
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBus")
            .field("group", &self.group)
            .field("default_partitions", &self.default_partitions)
            .finish_non_exhaustive()
    }
}

impl MessageBus for InMemoryBus {
    fn publish(
        &self,
        record: OutboundRecord,
    ) -> Pin<Box<dyn Future<Output = Result<Delivery, BusError>> + Send + '_>> {
        Box::pin(async move { self.publish_now(record) })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<Subscription, BusError>> + Send + '_>> {
        let result = self.subscribe_now(topics);
        Box::pin(async move { result })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn tp(topic: &str, partition: i32) -> TopicPartition {
        TopicPartition::new(topic, partition)
    }

    #[tokio::test]
    async fn sole_member_owns_every_partition() {
        let bus = InMemoryBus::new().with_default_partitions(3);
        let subscription = bus.subscribe(&["t"]).await.unwrap();
        assert_eq!(
            *subscription.assignment.borrow(),
            vec![tp("t", 0), tp("t", 1), tp("t", 2)]
        );
    }

    #[tokio::test]
    async fn members_split_partitions_and_rebalance_on_leave() {
        let bus = InMemoryBus::new().with_default_partitions(4);
        let first = bus.subscribe(&["t"]).await.unwrap();
        let second = bus.for_group("courier").subscribe(&["t"]).await.unwrap();

        assert_eq!(*first.assignment.borrow(), vec![tp("t", 0), tp("t", 2)]);
        assert_eq!(*second.assignment.borrow(), vec![tp("t", 1), tp("t", 3)]);

        let (_records, assignment) = first.into_parts();
        drop(second);
        assert_eq!(assignment.borrow().len(), 4);
    }

    #[tokio::test]
    async fn records_reach_the_partition_owner_in_each_group() {
        let bus = InMemoryBus::new().with_default_partitions(2);
        let mut a = bus.subscribe(&["t"]).await.unwrap();
        let mut b = bus.subscribe(&["t"]).await.unwrap();
        let mut other = bus.for_group("other").subscribe(&["t"]).await.unwrap();

        bus.publish(OutboundRecord::new("t", b"x".to_vec()).with_partition(1))
            .await
            .unwrap();

        let received = b.records.next().await.unwrap().unwrap();
        assert_eq!(received.partition, 1);
        assert_eq!(received.payload, b"x");
        assert_eq!(other.records.next().await.unwrap().unwrap().offset, 0);
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(20), a.records.next())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn unknown_partition_is_rejected() {
        let bus = InMemoryBus::new();
        bus.create_topic("t", 2);
        let err = bus
            .publish(OutboundRecord::new("t", Vec::new()).with_partition(5))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::UnknownPartition(_)));
    }

    #[tokio::test]
    async fn keyed_records_stick_to_one_partition() {
        let bus = InMemoryBus::new().with_default_partitions(8);
        let mut partitions = BTreeSet::new();
        for _ in 0..5 {
            let delivery = bus
                .publish(OutboundRecord::new("t", Vec::new()).with_key(b"same".to_vec()))
                .await
                .unwrap();
            partitions.insert(delivery.partition);
        }
        assert_eq!(partitions.len(), 1);
        assert_eq!(bus.records("t").len(), 5);
    }

    #[tokio::test]
    async fn publish_failure_toggle() {
        let bus = InMemoryBus::new();
        bus.fail_publishes(true);
        assert!(bus.publish(OutboundRecord::new("t", Vec::new())).await.is_err());
        bus.fail_publishes(false);
        assert!(bus.publish(OutboundRecord::new("t", Vec::new())).await.is_ok());
    }
}
