//! Per-CPU counting semaphore
//!
//! Each partition holds its own count behind its own lock, so releases and
//! small requests on different CPUs never touch shared state. Once a request
//! cannot be covered, the semaphore escalates: it takes every partition lock,
//! sweeps all counts into a shared reserve, flags every partition as having
//! waiters and queues the request. From then on releases go through the
//! reserve and waiters are served in strict FIFO order, exactly like
//! [`CountingSemaphore`](crate::CountingSemaphore). When the queue empties
//! the flags are cleared and the leftover reserve returns to a partition.
//!
//! # Lock order
//!
//! Partitions `0..n` ascending, then the shared state. Released in reverse.
//! [`AllLocks`] is the only way to hold more than one partition lock, and its
//! drop order releases shared first, then partitions from highest to lowest.
//! The shared lock may also be taken alone, but never while waiting for a
//! partition lock.

use crate::semaphore::SemaphoreStats;
use crate::stats::WaitStats;
use crate::waiter::{Admission, WaitQueue, WaitStatus, Waiter};
use crossbeam_utils::CachePadded;
use iocore_common::{CpuId, Error, RequestError, Ticket, cpu};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, trace};

#[derive(Debug, Default)]
struct Partition {
    count: u64,
    /// Set while the shared queue is non-empty; forces releases to escalate
    waiting: bool,
}

struct Shared<W> {
    reserve: u64,
    waiters: WaitQueue<W>,
    active: bool,
}

/// Every partition lock plus the shared lock.
///
/// Field order is drop order: `shared` goes first, then `partitions`, which
/// is stored highest partition first.
struct AllLocks<'a, W> {
    shared: MutexGuard<'a, Shared<W>>,
    partitions: Vec<MutexGuard<'a, Partition>>,
}

impl<W> AllLocks<'_, W> {
    fn partition(&mut self, index: usize) -> &mut Partition {
        let last = self.partitions.len() - 1;
        &mut self.partitions[last - index]
    }

    fn partitions_mut(&mut self) -> impl Iterator<Item = &mut Partition> {
        self.partitions.iter_mut().map(|guard| &mut **guard)
    }
}

pub struct PartitionedSemaphore<W: Waiter> {
    partitions: Box<[CachePadded<Mutex<Partition>>]>,
    shared: Mutex<Shared<W>>,
    /// Queue length as of the last change, for the release fast path
    waiting_hint: AtomicUsize,
    stats: WaitStats,
}

impl<W: Waiter> PartitionedSemaphore<W> {
    /// Create a semaphore with `partitions` empty partitions.
    ///
    /// # Panics
    ///
    /// Panics if `partitions` is zero.
    #[must_use]
    pub fn new(partitions: usize) -> Self {
        assert!(partitions > 0, "partition count must be > 0");
        Self {
            partitions: (0..partitions)
                .map(|_| CachePadded::new(Mutex::new(Partition::default())))
                .collect(),
            shared: Mutex::new(Shared {
                reserve: 0,
                waiters: WaitQueue::new(),
                active: false,
            }),
            waiting_hint: AtomicUsize::new(0),
            stats: WaitStats::new(),
        }
    }

    /// One partition per host CPU
    #[must_use]
    pub fn with_host_partitions() -> Self {
        Self::new(cpu::host_cpu_count())
    }

    pub fn partitions(&self) -> usize {
        self.partitions.len()
    }

    fn partition_of(&self, cpu: CpuId) -> usize {
        cpu % self.partitions.len()
    }

    /// Take every lock in canonical order: partitions ascending, then shared
    fn lock_all(&self) -> AllLocks<'_, W> {
        let mut partitions = Vec::with_capacity(self.partitions.len());
        for partition in self.partitions.iter() {
            partitions.push(partition.lock());
        }
        partitions.reverse();
        AllLocks {
            shared: self.shared.lock(),
            partitions,
        }
    }

    /// Return `n` units on the calling CPU
    pub fn release(&self, n: u64) {
        self.release_on(cpu::current_cpu(), n);
    }

    /// Return `n` units to `cpu`'s partition, or to the reserve if anyone
    /// is waiting
    pub fn release_on(&self, cpu: CpuId, n: u64) {
        let local = self.partition_of(cpu);
        {
            let mut partition = self.partitions[local].lock();
            if !partition.waiting && self.waiting_hint.load(Ordering::Acquire) == 0 {
                partition.count += n;
                return;
            }
        }

        // Lock order: all partitions ascending, then shared
        let mut locks = self.lock_all();
        locks.shared.reserve += n;
        trace!(n, reserve = locks.shared.reserve, "release escalated to reserve");
        self.drain(locks, local);
    }

    /// Serve waiters from the reserve.
    ///
    /// Every lock is dropped around each signal and retaken in canonical
    /// order afterwards. When the queue is empty the waiting flags are
    /// cleared and the leftover reserve goes to partition `local`.
    fn drain<'a>(&'a self, mut locks: AllLocks<'a, W>, local: usize) {
        loop {
            if locks.shared.active {
                return;
            }

            let Some(head) = locks.shared.waiters.front() else {
                for partition in locks.partitions_mut() {
                    partition.waiting = false;
                }
                let leftover = std::mem::take(&mut locks.shared.reserve);
                locks.partition(local).count += leftover;
                self.waiting_hint.store(0, Ordering::Release);
                return;
            };

            let needed = head.waiter.resources_needed();
            if needed > locks.shared.reserve {
                return;
            }
            let Some(entry) = locks.shared.waiters.pop_front() else {
                return;
            };
            locks.shared.reserve -= needed;
            locks.shared.active = true;
            self.waiting_hint
                .store(locks.shared.waiters.len(), Ordering::Release);
            drop(locks);

            self.stats.record_signaled(entry.enqueued_at);
            entry.waiter.signal(WaitStatus::Granted);

            // Lock order: all partitions ascending, then shared
            locks = self.lock_all();
            locks.shared.active = false;
        }
    }

    /// Ask for units on the calling CPU
    pub fn request(&self, waiter: W) -> Result<Admission<W>, RequestError<W>> {
        self.request_on(cpu::current_cpu(), waiter)
    }

    /// Ask for `waiter.resources_needed()` units, starting at `cpu`'s
    /// partition and then taking from the others in round-robin order.
    ///
    /// Units are gathered piecemeal, so a granted request may draw on
    /// several partitions. If the total falls short the gathered units go
    /// to the reserve and the waiter is queued.
    pub fn request_on(&self, cpu: CpuId, waiter: W) -> Result<Admission<W>, RequestError<W>> {
        let needed = waiter.resources_needed();
        if needed == 0 {
            return Err(RequestError::new(
                waiter,
                Error::invalid_waiter("resources needed must be at least 1"),
            ));
        }
        if waiter.is_canceled() {
            self.stats.record_canceled();
            return Err(RequestError::new(waiter, Error::Canceled));
        }

        let count = self.partitions.len();
        let local = self.partition_of(cpu);
        let mut got = 0;

        if self.waiting_hint.load(Ordering::Acquire) == 0 {
            for offset in 0..count {
                let mut partition = self.partitions[(local + offset) % count].lock();
                if partition.waiting {
                    break;
                }
                let take = partition.count.min(needed - got);
                partition.count -= take;
                got += take;
                if got == needed {
                    drop(partition);
                    self.stats.record_immediate();
                    return Ok(Admission::Granted(waiter));
                }
            }
        }

        // Lock order: all partitions ascending, then shared
        let mut locks = self.lock_all();
        if locks.shared.waiters.is_empty() {
            // Retry once: partitions may have been refilled behind the scan
            for partition in locks.partitions_mut() {
                let take = partition.count.min(needed - got);
                partition.count -= take;
                got += take;
            }
            let take = locks.shared.reserve.min(needed - got);
            locks.shared.reserve -= take;
            got += take;
            if got == needed {
                drop(locks);
                self.stats.record_immediate();
                return Ok(Admission::Granted(waiter));
            }
        }

        let mut swept = got;
        for partition in locks.partitions_mut() {
            swept += std::mem::take(&mut partition.count);
            partition.waiting = true;
        }
        locks.shared.reserve += swept;
        let ticket = locks.shared.waiters.push_back(waiter);
        let queued = locks.shared.waiters.len();
        self.waiting_hint.store(queued, Ordering::Release);
        self.stats.record_queued();
        debug!(
            %ticket,
            needed,
            reserve = locks.shared.reserve,
            queued,
            "semaphore request escalated and queued"
        );

        // The sweep may already cover the head of the queue
        self.drain(locks, local);
        Ok(Admission::Queued(ticket))
    }

    /// Withdraw a queued request; returns false if it was no longer queued.
    ///
    /// The waiters behind it are re-examined, and any units the reserve
    /// still holds stay available.
    pub fn cancel(&self, ticket: Ticket) -> bool {
        let local = self.partition_of(cpu::current_cpu());
        // Lock order: all partitions ascending, then shared
        let mut locks = self.lock_all();
        let Some(entry) = locks.shared.waiters.remove(ticket) else {
            return false;
        };
        self.waiting_hint
            .store(locks.shared.waiters.len(), Ordering::Release);
        self.drain(locks, local);

        self.stats.record_canceled();
        debug!(%ticket, "partitioned semaphore request canceled");
        entry.waiter.signal(WaitStatus::Canceled);
        true
    }

    /// Units held in the shared reserve
    pub fn reserve(&self) -> u64 {
        self.shared.lock().reserve
    }

    /// Units held by partition `index`
    pub fn partition_count(&self, index: usize) -> u64 {
        self.partitions[index].lock().count
    }

    /// Whether partition `index` is flagged as having waiters
    pub fn partition_waiting(&self, index: usize) -> bool {
        self.partitions[index].lock().waiting
    }

    /// Exact number of free units, taken under every lock
    pub fn total_available(&self) -> u64 {
        // Lock order: all partitions ascending, then shared
        let locks = self.lock_all();
        locks.partitions.iter().map(|p| p.count).sum::<u64>() + locks.shared.reserve
    }

    pub fn num_waiters(&self) -> usize {
        self.shared.lock().waiters.len()
    }

    pub fn stats(&self) -> SemaphoreStats {
        // Lock order: all partitions ascending, then shared
        let locks = self.lock_all();
        let per_partition: Vec<u64> = locks.partitions.iter().rev().map(|p| p.count).collect();
        let reserve = locks.shared.reserve;
        let waiters = locks.shared.waiters.len();
        drop(locks);

        SemaphoreStats {
            available: per_partition.iter().sum::<u64>() + reserve,
            reserve,
            per_partition,
            waiters,
            requests: self.stats.snapshot(),
        }
    }
}
