//! # Courier Core
//!
//! Core traits and types for request/reply over a partitioned message bus.
//!
//! This crate provides the vocabulary shared by every other Courier crate:
//!
//! - [`bus`]: the [`MessageBus`](bus::MessageBus) trait, records, partitions
//! - [`message`]: the JSON payload exchanged between requester and replier
//! - [`headers`]: record headers and the reply-addressing convention
//! - [`correlation`]: correlation ids
//! - [`environment`]: injected dependencies such as the clock
//!
//! ## Architecture Principles
//!
//! - The bus is a trait object; production and tests plug different buses
//! - Addressing lives in headers, never in the payload
//! - No global state; every collaborator is constructed and passed explicitly

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

pub mod bus;
pub mod correlation;
pub mod headers;
pub mod message;

/// Environment module - Dependency injection traits
///
/// All time-dependent behaviour is abstracted behind traits and injected so
/// tests can pin the clock.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts wall-clock reads for testability
    ///
    /// # Examples
    ///
    /// ```ignore
    /// // Test - fixed time for deterministic tests
    /// struct FixedClock { time: DateTime<Utc> }
    /// impl Clock for FixedClock {
    ///     fn now(&self) -> DateTime<Utc> {
    ///         self.time
    ///     }
    /// }
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::environment::{Clock, SystemClock};

    #[test]
    fn system_clock_moves_forward() {
        let clock = SystemClock;
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }
}
