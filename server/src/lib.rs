//! Courier service wiring.
//!
//! The `courier` binary runs both halves of the exchange in one process: the
//! HTTP front door that sends requests and waits for replies, and the reply
//! handler that consumes the request topic. Any number of instances can share
//! the same topics.

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]

pub mod backend;
pub mod config;

pub use backend::HttpBackend;
pub use config::{ConfigError, ServiceConfig};
