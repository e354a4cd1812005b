//! # Courier Runtime
//!
//! Synchronous request/reply over a partitioned message bus.
//!
//! ## Core Components
//!
//! - **Correlator**: sends requests tagged with a reply address and completes
//!   the caller's future when the matching reply arrives
//! - **Partition Pinner**: fixes this instance's reply partition from the
//!   reply subscription's assignment
//! - **Worker Pool**: bounded slots with immediate admission control
//! - **Reply Handler**: answers requests through a backend, echoing the
//!   correlation id to the requested partition
//!
//! ## Example
//!
//! ```ignore
//! use courier_runtime::{Correlator, PartitionPinner, RepinPolicy};
//!
//! let pinner = Arc::new(PartitionPinner::new("reply-topic", RepinPolicy::Never));
//! let correlator = Correlator::new(bus.clone(), pinner.clone());
//! let _listener = correlator.attach(bus.subscribe(&["reply-topic"]).await?);
//! pinner.ready().await;
//!
//! let reply = correlator
//!     .send_and_receive("request-topic", &Message::new().with_value(7), timeout)
//!     .await?;
//! ```

/// Request/reply correlation
pub mod correlator;

/// Prometheus metrics for observability
pub mod metrics;

/// Reply partition pinning
pub mod pinner;

/// Request answering
pub mod reply_handler;

/// Bounded worker slots
pub mod worker_pool;

pub use correlator::{Correlator, CorrelatorError, PendingReply, ReplyDisposition, ReplyListener};
pub use pinner::{PartitionPinner, PinError, RepinPolicy};
pub use reply_handler::{Backend, BackendError, ReplyError, ReplyHandler};
pub use worker_pool::{AdmissionRejected, PoolState, SlotGuard, SlotId, WorkerPool, WorkerPoolConfig};
