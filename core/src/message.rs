//! The request/reply payload exchanged over the bus.
//!
//! # Design
//!
//! Every field is optional: absence means "not assigned yet", and the reply
//! handler fills fields in rather than building a new message. The wire format
//! is JSON so non-Rust services on the same topics can read it:
//!
//! ```json
//! {"value":7,"request":1,"reply":3,"backend":12,"status":200}
//! ```
//!
//! Unset fields are omitted on output and unknown fields are ignored on input.
//!
//! # Example
//!
//! ```
//! use courier_core::message::Message;
//!
//! let request = Message::new().with_value(7).with_request(1);
//! let bytes = request.to_bytes().unwrap();
//! assert_eq!(bytes, br#"{"value":7,"request":1}"#);
//! assert_eq!(Message::from_bytes(&bytes).unwrap(), request);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Status stamped on a reply whose backend work succeeded.
pub const STATUS_OK: i32 = 200;

/// Status stamped on a reply whose backend rejected the work.
pub const STATUS_TOO_MANY_REQUESTS: i32 = 429;

/// Error types for message encoding.
#[derive(Error, Debug)]
pub enum MessageError {
    /// Failed to serialize message to bytes.
    #[error("Failed to serialize message: {0}")]
    SerializationError(String),

    /// Failed to deserialize message from bytes.
    #[error("Failed to deserialize message: {0}")]
    DeserializationError(String),
}

/// Request/reply payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Caller-provided value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<i32>,

    /// Front-door request sequence number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<i32>,

    /// Reply handler sequence number (diagnostic only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<i32>,

    /// Backend unit-of-work id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<i32>,

    /// Outcome status (HTTP semantics)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<i32>,
}

impl Message {
    /// Create an empty message.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            value: None,
            request: None,
            reply: None,
            backend: None,
            status: None,
        }
    }

    /// Set the caller value.
    #[must_use]
    pub const fn with_value(mut self, value: i32) -> Self {
        self.value = Some(value);
        self
    }

    /// Set the request sequence number.
    #[must_use]
    pub const fn with_request(mut self, request: i32) -> Self {
        self.request = Some(request);
        self
    }

    /// Encode as JSON.
    ///
    /// # Errors
    ///
    /// Returns `MessageError::SerializationError` if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        serde_json::to_vec(self).map_err(|e| MessageError::SerializationError(e.to_string()))
    }

    /// Decode from JSON.
    ///
    /// # Errors
    ///
    /// Returns `MessageError::DeserializationError` if the bytes are not a
    /// JSON object with integer (or absent) fields.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
        serde_json::from_slice(bytes).map_err(|e| MessageError::DeserializationError(e.to_string()))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn field(v: Option<i32>) -> String {
            v.map_or_else(|| "-".to_string(), |v| v.to_string())
        }
        write!(
            f,
            "Message {{ value: {}, request: {}, reply: {}, backend: {}, status: {} }}",
            field(self.value),
            field(self.request),
            field(self.reply),
            field(self.backend),
            field(self.status),
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn empty_message_encodes_as_empty_object() {
        assert_eq!(Message::new().to_bytes().unwrap(), b"{}");
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let message = Message::from_bytes(br#"{"value":5,"colour":"red","status":429}"#).unwrap();
        assert_eq!(message.value, Some(5));
        assert_eq!(message.status, Some(STATUS_TOO_MANY_REQUESTS));
        assert_eq!(message.backend, None);
    }

    #[test]
    fn non_integer_field_is_rejected() {
        let err = Message::from_bytes(br#"{"value":"seven"}"#).unwrap_err();
        assert!(matches!(err, MessageError::DeserializationError(_)));
    }

    #[test]
    fn display_marks_absent_fields() {
        let message = Message::new().with_value(7).with_request(2);
        assert_eq!(
            message.to_string(),
            "Message { value: 7, request: 2, reply: -, backend: -, status: - }"
        );
    }
}
