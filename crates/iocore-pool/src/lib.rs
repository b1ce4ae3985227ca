//! iocore Pool - CPU-partitioned resource pools and semaphores
//!
//! This crate provides:
//! - An owned LIFO free list whose nodes cannot sit on two lists at once
//! - Lock-guarded and per-CPU partitioned free lists
//! - A backpressure pool that queues requests instead of failing them
//! - Plain and per-CPU partitioned counting semaphores with FIFO waiters

pub mod backpressure;
pub mod lifo;
pub mod locked;
pub mod partitioned;
pub mod partitioned_semaphore;
pub mod semaphore;
pub mod stats;
pub mod waiter;

pub use backpressure::{Allocation, BackpressurePool, PoolResource, PoolStats};
pub use lifo::{LifoList, Node, Pooled};
pub use locked::LockedFreeList;
pub use partitioned::PartitionedFreeList;
pub use partitioned_semaphore::PartitionedSemaphore;
pub use semaphore::{CountingSemaphore, SemaphoreStats};
pub use stats::{WaitHistogram, WaitPercentiles, WaitStats, WaitStatsSnapshot};
pub use waiter::{
    Admission, CancelToken, FnWaiter, QueuedWaiter, SignalFn, WaitQueue, WaitStatus, Waiter,
};
