//! Reply partition pinning.
//!
//! An instance can only receive replies on partitions its consumer owns, so
//! before sending any request it picks one owned partition of the reply topic
//! and advertises it in every request's `replyPartition` header.
//!
//! The pinner watches the reply subscription's assignment. The first
//! non-empty assignment pins the lowest-numbered partition and fires the
//! ready signal exactly once. What happens on later rebalances is governed by
//! [`RepinPolicy`].

use courier_core::bus::TopicPartition;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What to do when a rebalance moves the pinned partition away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepinPolicy {
    /// Keep the first pin for the lifetime of the process.
    #[default]
    Never,
    /// Re-pin to the lowest assigned partition once the pinned one is revoked.
    /// Requests addressed to the old partition time out.
    OnRevoke,
}

impl FromStr for RepinPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "never" => Ok(Self::Never),
            "on-revoke" | "on_revoke" => Ok(Self::OnRevoke),
            other => Err(format!("unknown repin policy '{other}' (expected never or on-revoke)")),
        }
    }
}

impl fmt::Display for RepinPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => write!(f, "never"),
            Self::OnRevoke => write!(f, "on-revoke"),
        }
    }
}

/// Errors from the pinner.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PinError {
    /// No partition of the reply topic has been pinned yet
    #[error("no partition of reply topic '{topic}' is assigned to this instance")]
    PartitionUnassigned {
        /// The reply topic
        topic: String,
    },
}

/// Owns this instance's reply address.
#[derive(Debug)]
pub struct PartitionPinner {
    topic: String,
    policy: RepinPolicy,
    pinned: watch::Sender<Option<TopicPartition>>,
}

impl PartitionPinner {
    /// Create an unpinned pinner for `topic`.
    #[must_use]
    pub fn new(topic: impl Into<String>, policy: RepinPolicy) -> Self {
        let (pinned, _) = watch::channel(None);
        Self {
            topic: topic.into(),
            policy,
            pinned,
        }
    }

    /// The reply topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The configured policy.
    #[must_use]
    pub const fn policy(&self) -> RepinPolicy {
        self.policy
    }

    /// The pinned partition. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns [`PinError::PartitionUnassigned`] before the first assignment.
    pub fn assigned_partition(&self) -> Result<TopicPartition, PinError> {
        self.pinned
            .borrow()
            .clone()
            .ok_or_else(|| PinError::PartitionUnassigned {
                topic: self.topic.clone(),
            })
    }

    /// Whether a partition has been pinned.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.pinned.borrow().is_some()
    }

    /// Wait for the ready signal and return the pinned partition.
    pub async fn ready(&self) -> TopicPartition {
        let mut rx = self.pinned.subscribe();
        loop {
            if let Some(pinned) = rx.borrow_and_update().clone() {
                return pinned;
            }
            // The sender lives in `self`, so the channel cannot close while we wait
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Apply a new assignment.
    ///
    /// Returns the newly pinned partition when the pin changed.
    pub fn observe(&self, assignment: &[TopicPartition]) -> Option<TopicPartition> {
        let candidate = assignment
            .iter()
            .filter(|tp| tp.topic == self.topic)
            .min_by_key(|tp| tp.partition)
            .cloned();
        let policy = self.policy;
        let topic = &self.topic;
        let mut repinned = None;

        self.pinned.send_if_modified(|current| match (current.as_ref(), candidate) {
            (None, Some(candidate)) => {
                info!(reply_partition = %candidate, "Pinned reply partition");
                repinned = Some(candidate.clone());
                *current = Some(candidate);
                true
            }
            (None, None) => {
                debug!(topic = %topic, "Assignment holds no reply partition yet");
                false
            }
            (Some(pinned), candidate) => {
                if assignment.contains(pinned) || assignment.is_empty() {
                    return false;
                }
                match (policy, candidate) {
                    (RepinPolicy::OnRevoke, Some(candidate)) => {
                        warn!(
                            previous = %pinned,
                            reply_partition = %candidate,
                            "Pinned reply partition revoked, re-pinning"
                        );
                        repinned = Some(candidate.clone());
                        *current = Some(candidate);
                        true
                    }
                    _ => {
                        warn!(
                            reply_partition = %pinned,
                            "Pinned reply partition no longer assigned; keeping pin, replies may be lost"
                        );
                        false
                    }
                }
            }
        });

        repinned
    }

    /// Follow an assignment watch until it closes.
    pub fn track(self: Arc<Self>, mut assignment: watch::Receiver<Vec<TopicPartition>>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let current = assignment.borrow_and_update().clone();
                self.observe(&current);
                if assignment.changed().await.is_err() {
                    debug!(topic = %self.topic, "Assignment watch closed");
                    break;
                }
            }
        })
    }
}
