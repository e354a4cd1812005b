//! Bounded worker pool with immediate admission control.
//!
//! A pool owns N named slots (`S1`, `S2`, ...). Work must hold a slot while it
//! runs. When no slot is idle the work is rejected on the spot; there is no
//! wait queue.
//!
//! ## Release discipline
//!
//! [`WorkerPool::try_acquire`] hands out a [`SlotGuard`]. The slot goes back
//! to the idle set when the guard drops, which covers success, early return,
//! panic unwind and cancellation of the future holding it.
//!
//! ## Usage
//!
//! ```ignore
//! let pool = WorkerPool::new("backend", WorkerPoolConfig::default());
//!
//! match pool.run(Some(7)).await {
//!     Ok(backend_id) => println!("processed as {backend_id}"),
//!     Err(AdmissionRejected) => println!("saturated"),
//! }
//! ```

use crate::metrics::WorkerPoolMetrics;
use crossbeam::queue::ArrayQueue;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of slots
    pub capacity: usize,
    /// Simulated processing time of one unit of work
    pub latency: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            capacity: 3,
            latency: Duration::from_secs(1),
        }
    }
}

impl WorkerPoolConfig {
    /// Set the slot count.
    #[must_use]
    pub const fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the simulated processing time.
    #[must_use]
    pub const fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

/// Returned when every slot is borrowed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("no idle worker slot")]
pub struct AdmissionRejected;

/// Pool-level state, derived from the idle count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// At least one slot is idle
    Available,
    /// Every slot is borrowed
    Saturated,
}

/// Stable name of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(usize);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

struct PoolInner {
    name: String,
    capacity: usize,
    latency: Duration,
    idle: ArrayQueue<SlotId>,
    next_backend_id: AtomicI32,
}

/// Fixed-capacity pool of worker slots.
///
/// Cheap to clone; clones share the same slots.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Create a pool with every slot idle.
    ///
    /// A capacity of zero yields a pool that rejects everything.
    #[must_use]
    pub fn new(name: impl Into<String>, config: WorkerPoolConfig) -> Self {
        let name = name.into();
        // ArrayQueue cannot be zero-sized
        let idle = ArrayQueue::new(config.capacity.max(1));
        for n in 1..=config.capacity {
            let _ = idle.push(SlotId(n));
        }
        WorkerPoolMetrics::record_capacity(&name, config.capacity);

        Self {
            inner: Arc::new(PoolInner {
                name,
                capacity: config.capacity,
                latency: config.latency,
                idle,
                next_backend_id: AtomicI32::new(0),
            }),
        }
    }

    /// Borrow an idle slot without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionRejected`] if every slot is borrowed.
    pub fn try_acquire(&self) -> Result<SlotGuard, AdmissionRejected> {
        let Some(slot) = self.inner.idle.pop() else {
            WorkerPoolMetrics::record_rejected(&self.inner.name);
            return Err(AdmissionRejected);
        };
        WorkerPoolMetrics::record_admitted(&self.inner.name);
        debug!(pool = %self.inner.name, slot = %slot, "Worker slot acquired");

        Ok(SlotGuard {
            pool: Arc::clone(&self.inner),
            slot,
            acquired_at: Instant::now(),
        })
    }

    /// Perform one unit of work on a borrowed slot.
    ///
    /// Sleeps for the configured latency and returns a backend id unique
    /// within this pool. Never fails.
    pub async fn process(&self, slot: &SlotGuard, value: Option<i32>) -> i32 {
        if !self.inner.latency.is_zero() {
            tokio::time::sleep(self.inner.latency).await;
        }
        let backend_id = self.inner.next_backend_id.fetch_add(1, Ordering::SeqCst) + 1;

        info!(
            pool = %self.inner.name,
            slot = %slot.slot(),
            value = ?value,
            backend_id,
            "Unit of work completed"
        );
        backend_id
    }

    /// Acquire, process and release in one call.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionRejected`] if the pool is saturated.
    pub async fn run(&self, value: Option<i32>) -> Result<i32, AdmissionRejected> {
        let slot = self.try_acquire().inspect_err(|_| {
            info!(pool = %self.inner.name, value = ?value, "Worker pool saturated, rejecting");
        })?;
        Ok(self.process(&slot, value).await)
    }

    /// Number of idle slots.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.inner.idle.len()
    }

    /// Number of borrowed slots.
    #[must_use]
    pub fn borrowed(&self) -> usize {
        self.inner.capacity - self.idle()
    }

    /// Total slot count.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Current pool state.
    #[must_use]
    pub fn state(&self) -> PoolState {
        if self.idle() == 0 {
            PoolState::Saturated
        } else {
            PoolState::Available
        }
    }

    /// Pool name used in logs and metrics.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.inner.name)
            .field("capacity", &self.inner.capacity)
            .field("idle", &self.idle())
            .finish()
    }
}

/// A borrowed slot. Dropping it returns the slot to the pool.
pub struct SlotGuard {
    pool: Arc<PoolInner>,
    slot: SlotId,
    acquired_at: Instant,
}

impl SlotGuard {
    /// The borrowed slot.
    #[must_use]
    pub const fn slot(&self) -> SlotId {
        self.slot
    }
}

impl fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotGuard")
            .field("pool", &self.pool.name)
            .field("slot", &self.slot)
            .finish()
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        // Cannot overflow: only slots popped from this queue come back
        let _ = self.pool.idle.push(self.slot);
        WorkerPoolMetrics::record_released(&self.pool.name, self.acquired_at.elapsed());
        debug!(pool = %self.pool.name, slot = %self.slot, "Worker slot released");
    }
}
