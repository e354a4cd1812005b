//! # Courier Testing
//!
//! Testing utilities for Courier.
//!
//! This crate provides:
//! - [`InMemoryBus`]: a partitioned, consumer-group aware bus living in the
//!   test process
//! - [`FixedClock`]: deterministic time
//! - proptest strategies for messages
//!
//! ## Example
//!
//! ```ignore
//! use courier_testing::InMemoryBus;
//! use courier_runtime::{Correlator, PartitionPinner, RepinPolicy};
//!
//! #[tokio::test]
//! async fn round_trip() {
//!     let bus = Arc::new(InMemoryBus::new().with_default_partitions(4));
//!     let pinner = Arc::new(PartitionPinner::new("replies", RepinPolicy::Never));
//!     let correlator = Correlator::new(bus.clone(), pinner.clone());
//!     let _listener = correlator.attach(bus.subscribe(&["replies"]).await.unwrap());
//!     pinner.ready().await;
//!     // ...
//! }
//! ```

use chrono::{DateTime, Utc};
use courier_core::environment::Clock;

/// In-memory message bus
pub mod bus;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use courier_testing::mocks::FixedClock;
    /// use courier_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2);
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::days(20_089))
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use courier_core::message::Message;
    use proptest::prelude::*;

    /// Any message, with each field independently present or absent.
    pub fn arb_message() -> impl Strategy<Value = Message> {
        (
            proptest::option::of(any::<i32>()),
            proptest::option::of(any::<i32>()),
            proptest::option::of(any::<i32>()),
            proptest::option::of(any::<i32>()),
            proptest::option::of(any::<i32>()),
        )
            .prop_map(|(value, request, reply, backend, status)| Message {
                value,
                request,
                reply,
                backend,
                status,
            })
    }
}

// Re-export commonly used items
pub use bus::InMemoryBus;
pub use mocks::{FixedClock, test_clock};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
        assert_eq!(time1.to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }
}
