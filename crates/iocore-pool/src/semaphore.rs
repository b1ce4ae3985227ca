//! Counting semaphore with a strict FIFO waiter queue
//!
//! A request is granted on the spot only when nobody is queued ahead of it;
//! otherwise it joins the tail even if the count could cover it. Releases
//! serve waiters from the head and stop at the first one that does not fit,
//! so a large request is never starved by a stream of small ones.
//!
//! Draining uses the same `active` guard as the backpressure pool: a
//! `release()` made from inside a waiter's signal only bumps the count and
//! leaves the serving to the loop already running further up the stack.

use crate::stats::{WaitStats, WaitStatsSnapshot};
use crate::waiter::{Admission, WaitQueue, WaitStatus, Waiter};
use iocore_common::{Error, RequestError, Ticket};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use tracing::{debug, trace};

struct State<W> {
    count: u64,
    waiters: WaitQueue<W>,
    active: bool,
}

pub struct CountingSemaphore<W: Waiter> {
    state: Mutex<State<W>>,
    stats: WaitStats,
}

impl<W: Waiter> CountingSemaphore<W> {
    pub fn new(initial: u64) -> Self {
        Self {
            state: Mutex::new(State {
                count: initial,
                waiters: WaitQueue::new(),
                active: false,
            }),
            stats: WaitStats::new(),
        }
    }

    /// Ask for `waiter.resources_needed()` units.
    ///
    /// Returns the waiter inside [`Admission::Granted`] when the units were
    /// taken immediately, or a ticket when it was queued. A waiter asking for
    /// zero units, or one already canceled, comes back inside the error.
    pub fn request(&self, waiter: W) -> Result<Admission<W>, RequestError<W>> {
        let needed = waiter.resources_needed();
        if needed == 0 {
            return Err(RequestError::new(
                waiter,
                Error::invalid_waiter("resources needed must be at least 1"),
            ));
        }

        let mut state = self.state.lock();
        if waiter.is_canceled() {
            drop(state);
            self.stats.record_canceled();
            return Err(RequestError::new(waiter, Error::Canceled));
        }

        if state.waiters.is_empty() && state.count >= needed {
            state.count -= needed;
            drop(state);
            self.stats.record_immediate();
            return Ok(Admission::Granted(waiter));
        }

        let ticket = state.waiters.push_back(waiter);
        let queued = state.waiters.len();
        drop(state);
        self.stats.record_queued();
        trace!(%ticket, needed, queued, "semaphore request queued");
        Ok(Admission::Queued(ticket))
    }

    /// Return `n` units and serve whatever waiters they now cover
    pub fn release(&self, n: u64) {
        let mut state = self.state.lock();
        state.count += n;
        self.drain(&mut state);
    }

    fn drain(&self, state: &mut MutexGuard<'_, State<W>>) {
        while !state.active {
            let Some(head) = state.waiters.front() else {
                break;
            };
            let needed = head.waiter.resources_needed();
            if needed > state.count {
                // Head-of-line blocking: nobody behind may overtake
                break;
            }
            let Some(entry) = state.waiters.pop_front() else {
                break;
            };
            state.count -= needed;

            state.active = true;
            MutexGuard::unlocked(state, || {
                self.stats.record_signaled(entry.enqueued_at);
                entry.waiter.signal(WaitStatus::Granted);
            });
            state.active = false;
        }
    }

    /// Withdraw a queued request; see [`BackpressurePool::cancel`].
    ///
    /// Removing a blocked head lets the waiters behind it be served at once.
    ///
    /// [`BackpressurePool::cancel`]: crate::BackpressurePool::cancel
    pub fn cancel(&self, ticket: Ticket) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.waiters.remove(ticket) else {
            return false;
        };
        self.drain(&mut state);
        drop(state);

        self.stats.record_canceled();
        debug!(%ticket, "semaphore request canceled");
        entry.waiter.signal(WaitStatus::Canceled);
        true
    }

    /// Units not held by anyone
    pub fn available(&self) -> u64 {
        self.state.lock().count
    }

    pub fn num_waiters(&self) -> usize {
        self.state.lock().waiters.len()
    }

    pub fn stats(&self) -> SemaphoreStats {
        let state = self.state.lock();
        SemaphoreStats {
            available: state.count,
            reserve: 0,
            per_partition: Vec::new(),
            waiters: state.waiters.len(),
            requests: self.stats.snapshot(),
        }
    }
}

/// Snapshot of a semaphore's state
#[derive(Debug, Clone, Serialize)]
pub struct SemaphoreStats {
    /// Units free across partitions and reserve
    pub available: u64,
    /// Units parked in the shared reserve (partitioned semaphores only)
    pub reserve: u64,
    pub per_partition: Vec<u64>,
    pub waiters: usize,
    pub requests: WaitStatsSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waiter::{CancelToken, FnWaiter};
    use std::cell::Cell;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex, mpsc};
    use std::thread;

    type Log = Arc<StdMutex<Vec<String>>>;

    fn recorder(log: &Log, name: &'static str, needed: u64) -> FnWaiter {
        let log = Arc::clone(log);
        FnWaiter::boxed(needed, move |status| {
            log.lock().unwrap().push(format!("{name}:{status:?}"));
        })
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[test]
    fn test_immediate_grant() {
        let sem = CountingSemaphore::new(4);
        let log = Log::default();
        let admission = sem.request(recorder(&log, "a", 3)).unwrap();
        assert!(admission.is_granted());
        assert_eq!(sem.available(), 1);
        // Granted waiters are returned, not signaled
        assert!(entries(&log).is_empty());
    }

    #[test]
    fn test_head_of_line_blocking() {
        let sem = CountingSemaphore::new(0);
        let log = Log::default();

        assert!(!sem.request(recorder(&log, "big", 3)).unwrap().is_granted());
        assert!(!sem.request(recorder(&log, "small", 1)).unwrap().is_granted());

        // Enough for "small" but not for the head
        sem.release(2);
        assert!(entries(&log).is_empty());
        assert_eq!(sem.available(), 2);

        // A new arrival queues even though the count covers it
        assert!(!sem.request(recorder(&log, "late", 1)).unwrap().is_granted());

        sem.release(1);
        assert_eq!(entries(&log), vec!["big:Granted"]);
        assert_eq!(sem.available(), 0);

        sem.release(2);
        assert_eq!(
            entries(&log),
            vec!["big:Granted", "small:Granted", "late:Granted"]
        );
        assert_eq!(sem.num_waiters(), 0);
        assert_eq!(sem.available(), 0);
    }

    #[test]
    fn test_cancel_blocked_head_unblocks_rest() {
        let sem = CountingSemaphore::new(2);
        let log = Log::default();
        let ticket = sem
            .request(recorder(&log, "huge", 5))
            .unwrap()
            .ticket()
            .unwrap();
        sem.request(recorder(&log, "pair", 2)).unwrap();
        assert!(entries(&log).is_empty());

        assert!(sem.cancel(ticket));
        assert!(!sem.cancel(ticket));
        assert_eq!(entries(&log), vec!["pair:Granted", "huge:Canceled"]);
        assert_eq!(sem.available(), 0);

        // Units released later are not delivered to the canceled waiter
        sem.release(5);
        assert_eq!(entries(&log).len(), 2);
        assert_eq!(sem.available(), 5);
    }

    #[test]
    fn test_rejects_invalid_and_canceled_waiters() {
        let sem = CountingSemaphore::new(1);
        let log = Log::default();

        let err = sem.request(recorder(&log, "zero", 0)).unwrap_err();
        assert!(matches!(err.error(), Error::InvalidWaiter(_)));
        assert_eq!(err.into_inner().resources_needed(), 0);

        let token = CancelToken::new();
        token.cancel();
        let err = sem
            .request(recorder(&log, "gone", 1).with_cancel_token(token))
            .unwrap_err();
        assert!(err.error().is_canceled());

        assert_eq!(sem.available(), 1);
        assert_eq!(sem.num_waiters(), 0);
        assert!(entries(&log).is_empty());
    }

    thread_local! {
        static DEPTH: Cell<usize> = const { Cell::new(0) };
        static MAX_DEPTH: Cell<usize> = const { Cell::new(0) };
    }

    /// Gives its unit straight back from inside its signal
    struct Relay {
        sem: Arc<CountingSemaphore<Relay>>,
        served: Arc<AtomicUsize>,
    }

    impl Waiter for Relay {
        fn signal(self, status: WaitStatus) {
            assert_eq!(status, WaitStatus::Granted);
            let depth = DEPTH.with(|d| {
                d.set(d.get() + 1);
                d.get()
            });
            MAX_DEPTH.with(|m| m.set(m.get().max(depth)));
            self.served.fetch_add(1, Ordering::SeqCst);
            self.sem.release(1);
            DEPTH.with(|d| d.set(d.get() - 1));
        }
    }

    #[test]
    fn test_release_chain_has_bounded_depth() {
        const CHAIN: usize = 10_000;
        let sem = Arc::new(CountingSemaphore::new(0));
        let served = Arc::new(AtomicUsize::new(0));

        for _ in 0..CHAIN {
            let relay = Relay {
                sem: Arc::clone(&sem),
                served: Arc::clone(&served),
            };
            assert!(matches!(sem.request(relay), Ok(Admission::Queued(_))));
        }

        sem.release(1);

        assert_eq!(served.load(Ordering::SeqCst), CHAIN);
        assert_eq!(MAX_DEPTH.with(Cell::get), 1);
        assert_eq!(sem.available(), 1);
        assert_eq!(sem.num_waiters(), 0);
    }

    #[test]
    fn test_concurrent_conservation() {
        const PERMITS: u64 = 6;
        let sem = Arc::new(CountingSemaphore::new(PERMITS));

        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let sem = Arc::clone(&sem);
                thread::spawn(move || {
                    for round in 0..2_000u64 {
                        let needed = 1 + (t + round) % 3;
                        let (tx, rx) = mpsc::channel();
                        let waiter = FnWaiter::boxed(needed, move |status| {
                            let _ = tx.send(status);
                        });
                        match sem.request(waiter) {
                            Ok(Admission::Granted(_)) => {}
                            Ok(Admission::Queued(_)) => {
                                assert_eq!(rx.recv().unwrap(), WaitStatus::Granted);
                            }
                            Err(err) => panic!("unexpected rejection: {err}"),
                        }
                        sem.release(needed);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(sem.available(), PERMITS);
        assert_eq!(sem.num_waiters(), 0);
        let stats = sem.stats();
        assert_eq!(stats.requests.immediate + stats.requests.signaled, 8_000);
    }
}
