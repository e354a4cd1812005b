//! Record headers and the request/reply addressing conventions.
//!
//! Requests carry three headers that tell the far side where to answer:
//!
//! | header           | encoding                    |
//! |------------------|-----------------------------|
//! | `replyTopic`     | UTF-8 topic name            |
//! | `replyPartition` | `i32`, 4 bytes, big-endian  |
//! | `correlationId`  | opaque bytes                |
//!
//! Replies carry `correlationId` only.

use crate::bus::TopicPartition;
use crate::correlation::CorrelationId;
use thiserror::Error;

/// Header naming the topic replies must be published to.
pub const REPLY_TOPIC: &str = "replyTopic";

/// Header naming the partition of the reply topic, big-endian `i32`.
pub const REPLY_PARTITION: &str = "replyPartition";

/// Header carrying the correlation id.
pub const CORRELATION_ID: &str = "correlationId";

/// Errors decoding addressing headers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    /// A required header is absent
    #[error("missing header '{0}'")]
    Missing(&'static str),

    /// A header is present but malformed
    #[error("malformed header '{name}': {reason}")]
    Malformed {
        /// Header name
        name: &'static str,
        /// What was wrong with it
        reason: String,
    },
}

/// Ordered multi-map of record headers.
///
/// Kafka allows repeated keys; lookups return the last value for a key, which
/// is what producers that overwrite a header expect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordHeaders {
    entries: Vec<(String, Vec<u8>)>,
}

impl RecordHeaders {
    /// Create an empty header set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Append a header, keeping earlier values for the same key.
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.entries.push((key.into(), value.into()));
    }

    /// Set a header, dropping any earlier values for the same key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        let key = key.into();
        self.entries.retain(|(k, _)| *k != key);
        self.entries.push((key, value.into()));
    }

    /// Last value recorded for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    /// Iterate headers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Number of header entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no headers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stamp the reply address and correlation id onto a request.
    pub fn set_reply_address(&mut self, reply_to: &TopicPartition, correlation_id: &CorrelationId) {
        self.insert(REPLY_TOPIC, reply_to.topic.as_bytes());
        self.insert(REPLY_PARTITION, encode_partition(reply_to.partition));
        self.set_correlation_id(correlation_id);
    }

    /// Stamp a correlation id.
    pub fn set_correlation_id(&mut self, correlation_id: &CorrelationId) {
        self.insert(CORRELATION_ID, correlation_id.as_bytes());
    }

    /// Read the correlation id, if present.
    #[must_use]
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.get(CORRELATION_ID).map(CorrelationId::from_bytes)
    }

    /// Read the reply address of a request.
    ///
    /// The topic is mandatory. The partition is optional; without it the
    /// reply is left to the bus's partitioner.
    ///
    /// # Errors
    ///
    /// Returns [`HeaderError::Missing`] without a reply topic and
    /// [`HeaderError::Malformed`] for a non UTF-8 topic or a partition that is
    /// not exactly four bytes.
    pub fn reply_address(&self) -> Result<ReplyAddress, HeaderError> {
        let topic = self
            .get(REPLY_TOPIC)
            .ok_or(HeaderError::Missing(REPLY_TOPIC))?;
        let topic = std::str::from_utf8(topic).map_err(|e| HeaderError::Malformed {
            name: REPLY_TOPIC,
            reason: e.to_string(),
        })?;
        let partition = self.get(REPLY_PARTITION).map(decode_partition).transpose()?;

        Ok(ReplyAddress {
            topic: topic.to_string(),
            partition,
        })
    }
}

/// Where a reply should be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyAddress {
    /// Reply topic
    pub topic: String,
    /// Reply partition, when the requester pinned one
    pub partition: Option<i32>,
}

/// Encode a partition number as four big-endian bytes.
#[must_use]
pub const fn encode_partition(partition: i32) -> [u8; 4] {
    partition.to_be_bytes()
}

/// Decode a big-endian partition number.
///
/// # Errors
///
/// Returns [`HeaderError::Malformed`] unless `bytes` is exactly four long.
pub fn decode_partition(bytes: &[u8]) -> Result<i32, HeaderError> {
    let raw: [u8; 4] = bytes.try_into().map_err(|_| HeaderError::Malformed {
        name: REPLY_PARTITION,
        reason: format!("expected 4 bytes, got {}", bytes.len()),
    })?;
    Ok(i32::from_be_bytes(raw))
}
