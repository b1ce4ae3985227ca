//! Backpressure resource pool
//!
//! A [`PartitionedFreeList`] of fixed resources plus one global FIFO of
//! requests that found the pool empty. Allocation never blocks: either a
//! resource is started right away or the request is queued and started
//! later by whichever thread frees a resource.
//!
//! # Bounded recursion
//!
//! Starting a resource often completes synchronously and frees it again,
//! which would start the next waiter, which frees... Without care that chain
//! recurses once per cycle. The waiter state carries an `active` flag: the
//! thread that is draining sets it before running a start callback with the
//! lock released, and any `free()` that arrives while it is set just parks
//! its resource in the free list and returns. The draining loop picks that
//! resource up on its next iteration, so a chain of any length runs at
//! constant stack depth.
//!
//! # Lost wakeups
//!
//! `free()` peeks the waiter count without the lock. The peek is ordered
//! against enqueue by a SeqCst fence on both sides: the freeing thread
//! publishes its resource then reads the count, the queueing thread
//! publishes the count then re-checks the free list. At least one of them
//! sees the other.

use crate::lifo::{Node, Pooled};
use crate::partitioned::PartitionedFreeList;
use crate::stats::{WaitStats, WaitStatsSnapshot};
use crate::waiter::{WaitQueue, WaitStatus, Waiter};
use iocore_common::{Affinity, CpuId, Ticket, cpu};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering, fence};
use tracing::{debug, trace};

/// A fixed-size resource managed by a [`BackpressurePool`]
pub trait PoolResource: Send + Sized + 'static {
    /// The work item a resource is started with
    type Request: Waiter;

    /// Begin work on `request` using `resource`.
    ///
    /// Called with no pool lock held. Implementations usually hand the
    /// resource back with [`BackpressurePool::free`] once the work is done,
    /// possibly before returning.
    fn start(resource: Pooled<Self>, request: Self::Request);
}

/// Outcome of [`BackpressurePool::allocate_and_start`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    /// A resource was available and has been started
    Started,
    /// The pool was empty; the request waits under this ticket
    Queued(Ticket),
    /// The request was canceled before it could be queued and has been
    /// signaled with [`WaitStatus::Canceled`]
    Canceled,
}

struct WaiterState<Q> {
    waiters: WaitQueue<Q>,
    /// Set while a drain loop runs a start callback with the lock released
    active: bool,
}

pub struct BackpressurePool<R: PoolResource> {
    name: String,
    free: PartitionedFreeList<R>,
    state: Mutex<WaiterState<R::Request>>,
    /// Mirror of the waiter queue length for the unlocked peek in `free()`
    waiting: AtomicUsize,
    /// Resources ever added to the pool
    capacity: AtomicUsize,
    stats: WaitStats,
}

impl<R: PoolResource> BackpressurePool<R> {
    /// Create an empty pool with `partitions` free-list partitions
    pub fn new(name: impl Into<String>, partitions: usize) -> Self {
        Self {
            name: name.into(),
            free: PartitionedFreeList::new(partitions),
            state: Mutex::new(WaiterState {
                waiters: WaitQueue::new(),
                active: false,
            }),
            waiting: AtomicUsize::new(0),
            capacity: AtomicUsize::new(0),
            stats: WaitStats::new(),
        }
    }

    /// One partition per host CPU
    pub fn with_host_partitions(name: impl Into<String>) -> Self {
        Self::new(name, cpu::host_cpu_count())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add new resources, spread round-robin over the partitions.
    ///
    /// Resources added here may immediately start queued requests.
    pub fn fill(&self, resources: impl IntoIterator<Item = R>) {
        let partitions = self.free.partitions();
        let mut added = 0;
        for (idx, resource) in resources.into_iter().enumerate() {
            self.capacity.fetch_add(1, Ordering::Relaxed);
            self.free_on(idx % partitions, Node::new(resource));
            added += 1;
        }
        debug!(pool = %self.name, added, "pool filled");
    }

    /// Start `request` on a free resource, or queue it.
    ///
    /// `affinity` picks the partition tried first. High-priority requests go
    /// to the head of the queue; everyone else queues at the tail. A queued
    /// request may already have been started by the time this returns, in
    /// which case its ticket no longer cancels anything.
    pub fn allocate_and_start(
        &self,
        request: R::Request,
        affinity: Affinity,
        high_priority: bool,
    ) -> Allocation {
        let cpu = affinity.cpu().unwrap_or_else(cpu::current_cpu);
        if let Some(resource) = self.free.remove_head_from(cpu) {
            self.stats.record_immediate();
            R::start(resource, request);
            return Allocation::Started;
        }

        let mut state = self.state.lock();
        if request.is_canceled() {
            drop(state);
            self.stats.record_canceled();
            request.signal(WaitStatus::Canceled);
            return Allocation::Canceled;
        }

        let ticket = if high_priority {
            state.waiters.push_front(request)
        } else {
            state.waiters.push_back(request)
        };
        self.waiting.store(state.waiters.len(), Ordering::SeqCst);
        fence(Ordering::SeqCst);
        self.stats.record_queued();
        trace!(pool = %self.name, %ticket, high_priority, "request queued");

        // A free() that raced with the failed remove above may have seen no
        // waiters; pick its resource up here.
        self.drain(&mut state);
        Allocation::Queued(ticket)
    }

    /// Take a resource without queueing; `None` if the pool is empty
    pub fn try_allocate(&self) -> Option<Pooled<R>> {
        let resource = self.free.remove_head();
        if resource.is_some() {
            self.stats.record_immediate();
        }
        resource
    }

    /// Return a resource to the calling CPU's partition
    pub fn free(&self, resource: Pooled<R>) {
        self.free_on(cpu::current_cpu(), resource);
    }

    /// Return a resource to `cpu`'s partition and start waiters if any
    pub fn free_on(&self, cpu: CpuId, resource: Pooled<R>) {
        self.free.add_head_on(cpu, resource);
        fence(Ordering::SeqCst);
        if self.waiting.load(Ordering::SeqCst) == 0 {
            return;
        }

        let mut state = self.state.lock();
        self.drain(&mut state);
    }

    /// Start queued requests while resources last.
    ///
    /// Returns at once if another frame on any thread is already draining;
    /// that loop will see whatever this caller added.
    fn drain(&self, state: &mut MutexGuard<'_, WaiterState<R::Request>>) {
        while !state.active {
            let Some(head) = state.waiters.front() else {
                break;
            };
            let cpu = head.waiter.affinity().cpu().unwrap_or_else(cpu::current_cpu);
            let Some(resource) = self.free.remove_head_from(cpu) else {
                break;
            };
            let Some(entry) = state.waiters.pop_front() else {
                self.free.add_head_on(cpu, resource);
                break;
            };
            self.waiting.store(state.waiters.len(), Ordering::SeqCst);

            state.active = true;
            MutexGuard::unlocked(state, || {
                self.stats.record_signaled(entry.enqueued_at);
                trace!(pool = %self.name, ticket = %entry.ticket, "starting queued request");
                R::start(resource, entry.waiter);
            });
            state.active = false;
        }
    }

    /// Withdraw a queued request.
    ///
    /// Returns true if the request was still queued; it is then signaled
    /// with [`WaitStatus::Canceled`]. False means it already started or was
    /// canceled before.
    pub fn cancel(&self, ticket: Ticket) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.waiters.remove(ticket) else {
            return false;
        };
        self.waiting.store(state.waiters.len(), Ordering::SeqCst);
        drop(state);

        self.stats.record_canceled();
        debug!(pool = %self.name, %ticket, "queued request canceled");
        entry.waiter.signal(WaitStatus::Canceled);
        true
    }

    /// Free resources across all partitions (approximate)
    pub fn num_free(&self) -> usize {
        self.free.num_free()
    }

    pub fn num_waiters(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Resources ever added with [`fill`](Self::fill)
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    pub fn partitions(&self) -> &PartitionedFreeList<R> {
        &self.free
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            name: self.name.clone(),
            capacity: self.capacity(),
            free: self.free.num_free(),
            free_per_partition: self.free.free_per_partition(),
            lock_acquisitions: self.free.lock_acquisitions(),
            waiters: self.num_waiters(),
            requests: self.stats.snapshot(),
        }
    }
}

/// Snapshot of a pool's state
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub name: String,
    pub capacity: usize,
    pub free: usize,
    pub free_per_partition: Vec<usize>,
    pub lock_acquisitions: Vec<u64>,
    pub waiters: usize,
    pub requests: WaitStatsSnapshot,
}
