//! Starvation monitor
//!
//! Every CPU group has one maintenance thread running low-priority work.
//! When the group's workers run at real-time priority they can keep that
//! thread off the CPU indefinitely. The monitor samples each group's
//! maintenance progress and drives a two-state machine per group:
//!
//! ```text
//!   Normal --(work pending and nothing dequeued for starvation_threshold)--> Downgraded
//!   Downgraded --(dequeue since downgrade)----------> Normal [LowPriorityRan]
//!   Downgraded --(one item running >= ran_long)-----> Normal [RanLongTime]
//!   Downgraded --(downgrade_duration elapsed)-------> Normal [DowngradeExpired]
//! ```
//!
//! Registrants on the group are told about each transition and are expected
//! to back off while downgraded, usually through
//! `Dispatcher::block_if_low_priority_thread_starved`.

use crate::registrant::{Registry, RestoreReason};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use iocore_common::{CpuMask, MonitorConfig};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Maintenance progress as seen by one monitor poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSample {
    /// Since when queued work has waited without a dequeue; `None` if idle
    pub pending_since: Option<Instant>,
    pub last_dequeue: Instant,
    /// Start of the item currently running, if any
    pub busy_since: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Downgrade,
    Restore(RestoreReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Priority {
    Normal { since: Instant },
    Downgraded { since: Instant },
}

/// Per-group downgrade state machine.
///
/// Pure: fed with samples and explicit timestamps, so every transition can
/// be tested without threads or sleeps.
#[derive(Debug, Clone)]
pub struct StarvationTracker {
    starvation_threshold: Duration,
    downgrade_duration: Duration,
    ran_long_threshold: Duration,
    priority: Priority,
}

impl StarvationTracker {
    #[must_use]
    pub fn new(config: &MonitorConfig, now: Instant) -> Self {
        Self {
            starvation_threshold: config.starvation_threshold(),
            downgrade_duration: config.downgrade_duration(),
            ran_long_threshold: config.ran_long_threshold(),
            priority: Priority::Normal { since: now },
        }
    }

    #[must_use]
    pub const fn is_downgraded(&self) -> bool {
        matches!(self.priority, Priority::Downgraded { .. })
    }

    /// Feed one sample; returns the transition it caused, if any
    pub fn observe(&mut self, sample: ProgressSample, now: Instant) -> Option<Transition> {
        match self.priority {
            Priority::Normal { since } => {
                let pending = sample.pending_since?;
                let starved = now.saturating_duration_since(pending) >= self.starvation_threshold
                    && now.saturating_duration_since(sample.last_dequeue)
                        >= self.starvation_threshold
                    // No immediate re-downgrade after a restore
                    && now.saturating_duration_since(since) >= self.starvation_threshold;
                if !starved {
                    return None;
                }
                self.priority = Priority::Downgraded { since: now };
                Some(Transition::Downgrade)
            }
            Priority::Downgraded { since } => {
                let reason = if sample.last_dequeue > since {
                    RestoreReason::LowPriorityRan
                } else if sample.busy_since.is_some_and(|busy| {
                    now.saturating_duration_since(busy.max(since)) >= self.ran_long_threshold
                }) {
                    RestoreReason::RanLongTime
                } else if now.saturating_duration_since(since) >= self.downgrade_duration {
                    RestoreReason::DowngradeExpired
                } else {
                    return None;
                };
                self.priority = Priority::Normal { since: now };
                Some(Transition::Restore(reason))
            }
        }
    }
}

#[derive(Debug)]
struct GroupInner {
    queued: usize,
    pending_since: Option<Instant>,
    last_dequeue: Instant,
    busy_since: Option<Instant>,
    /// Items dequeued so far; waiters watch it for progress
    runs: u64,
    downgraded: bool,
}

/// Shared state of one CPU group: maintenance progress plus the downgrade
/// flag that blocked callers wait on.
#[derive(Debug)]
pub struct GroupState {
    group: usize,
    cpus: CpuMask,
    inner: Mutex<GroupInner>,
    progress: Condvar,
}

impl GroupState {
    pub fn new(group: usize, cpus: CpuMask) -> Self {
        Self {
            group,
            cpus,
            inner: Mutex::new(GroupInner {
                queued: 0,
                pending_since: None,
                last_dequeue: Instant::now(),
                busy_since: None,
                runs: 0,
                downgraded: false,
            }),
            progress: Condvar::new(),
        }
    }

    pub const fn group(&self) -> usize {
        self.group
    }

    pub const fn cpus(&self) -> &CpuMask {
        &self.cpus
    }

    pub fn note_enqueued(&self, now: Instant) {
        let mut inner = self.inner.lock();
        inner.queued += 1;
        if inner.pending_since.is_none() {
            inner.pending_since = Some(now);
        }
    }

    /// The maintenance thread took an item and starts running it
    pub fn note_dequeued(&self, now: Instant) {
        let mut inner = self.inner.lock();
        inner.queued = inner.queued.saturating_sub(1);
        inner.last_dequeue = now;
        inner.busy_since = Some(now);
        inner.pending_since = (inner.queued > 0).then_some(now);
        inner.runs += 1;
        drop(inner);
        self.progress.notify_all();
    }

    pub fn note_idle(&self) {
        self.inner.lock().busy_since = None;
    }

    pub fn sample(&self) -> ProgressSample {
        let inner = self.inner.lock();
        ProgressSample {
            pending_since: inner.pending_since,
            last_dequeue: inner.last_dequeue,
            busy_since: inner.busy_since,
        }
    }

    pub fn is_downgraded(&self) -> bool {
        self.inner.lock().downgraded
    }

    pub fn set_downgraded(&self, downgraded: bool) {
        self.inner.lock().downgraded = downgraded;
        if !downgraded {
            self.progress.notify_all();
        }
    }

    /// Block while the group is downgraded and the maintenance thread has
    /// not dequeued anything, for at most `timeout`.
    ///
    /// Returns false without blocking if the group is not downgraded.
    pub fn wait_for_progress(&self, timeout: Duration) -> bool {
        let mut inner = self.inner.lock();
        if !inner.downgraded {
            return false;
        }
        let runs = inner.runs;
        let result = self
            .progress
            .wait_while_for(&mut inner, |inner| inner.downgraded && inner.runs == runs, timeout);
        if result.timed_out() {
            debug!("group {} still starved after {:?}", self.group, timeout);
        }
        true
    }
}

/// Poll every group until `shutdown` fires or disconnects
pub(crate) fn run_monitor(
    groups: &[Arc<GroupState>],
    registry: &Registry,
    config: &MonitorConfig,
    shutdown: &Receiver<()>,
) {
    let start = Instant::now();
    let mut trackers: Vec<StarvationTracker> = groups
        .iter()
        .map(|_| StarvationTracker::new(config, start))
        .collect();

    info!(
        "priority monitor started: {} groups, poll every {:?}",
        groups.len(),
        config.poll_interval()
    );

    loop {
        match shutdown.recv_timeout(config.poll_interval()) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }

        let now = Instant::now();
        for (state, tracker) in groups.iter().zip(trackers.iter_mut()) {
            let Some(transition) = tracker.observe(state.sample(), now) else {
                continue;
            };
            apply_transition(state, registry, transition);
        }
    }

    info!("priority monitor stopped");
}

fn apply_transition(state: &GroupState, registry: &Registry, transition: Transition) {
    let group = state.group();
    match transition {
        Transition::Downgrade => {
            warn!("starvation detected on cpu group {}, downgrading", group);
            state.set_downgraded(true);
            for registrant in registry.interested(state.cpus()) {
                registrant.on_downgrade(group);
            }
        }
        Transition::Restore(reason) => {
            state.set_downgraded(false);
            if reason == RestoreReason::RanLongTime {
                info!("cpu group {} restored: {}", group, reason);
            } else {
                debug!("cpu group {} restored: {}", group, reason);
            }
            for registrant in registry.interested(state.cpus()) {
                registrant.on_restore(group, reason);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn config() -> MonitorConfig {
        MonitorConfig {
            poll_interval_ms: 10,
            starvation_threshold_ms: 100,
            downgrade_duration_ms: 500,
            ran_long_threshold_ms: 200,
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_idle_group_never_downgrades() {
        let t0 = Instant::now();
        let mut tracker = StarvationTracker::new(&config(), t0);
        let idle = ProgressSample {
            pending_since: None,
            last_dequeue: t0,
            busy_since: None,
        };
        assert_eq!(tracker.observe(idle, t0 + ms(10_000)), None);
        assert!(!tracker.is_downgraded());
    }

    #[test]
    fn test_downgrade_then_low_priority_ran() {
        let t0 = Instant::now();
        let mut tracker = StarvationTracker::new(&config(), t0);
        let starved = ProgressSample {
            pending_since: Some(t0),
            last_dequeue: t0,
            busy_since: None,
        };

        assert_eq!(tracker.observe(starved, t0 + ms(50)), None);
        assert_eq!(tracker.observe(starved, t0 + ms(100)), Some(Transition::Downgrade));
        assert!(tracker.is_downgraded());
        assert_eq!(tracker.observe(starved, t0 + ms(150)), None);

        let ran = ProgressSample {
            pending_since: None,
            last_dequeue: t0 + ms(160),
            busy_since: Some(t0 + ms(160)),
        };
        assert_eq!(
            tracker.observe(ran, t0 + ms(170)),
            Some(Transition::Restore(RestoreReason::LowPriorityRan))
        );
        assert!(!tracker.is_downgraded());
    }

    #[test]
    fn test_downgrade_expires() {
        let t0 = Instant::now();
        let mut tracker = StarvationTracker::new(&config(), t0);
        let starved = ProgressSample {
            pending_since: Some(t0),
            last_dequeue: t0,
            busy_since: None,
        };
        assert_eq!(tracker.observe(starved, t0 + ms(100)), Some(Transition::Downgrade));
        assert_eq!(tracker.observe(starved, t0 + ms(599)), None);
        assert_eq!(
            tracker.observe(starved, t0 + ms(600)),
            Some(Transition::Restore(RestoreReason::DowngradeExpired))
        );

        // Still starved, but no immediate re-downgrade
        assert_eq!(tracker.observe(starved, t0 + ms(650)), None);
        assert_eq!(tracker.observe(starved, t0 + ms(700)), Some(Transition::Downgrade));
    }

    #[test]
    fn test_ran_long_time() {
        let t0 = Instant::now();
        let mut tracker = StarvationTracker::new(&config(), t0);
        // Stuck inside one long item with more work queued behind it
        let stuck = ProgressSample {
            pending_since: Some(t0),
            last_dequeue: t0,
            busy_since: Some(t0),
        };
        assert_eq!(tracker.observe(stuck, t0 + ms(100)), Some(Transition::Downgrade));
        // Run time only counts from the downgrade onwards
        assert_eq!(tracker.observe(stuck, t0 + ms(250)), None);
        assert_eq!(
            tracker.observe(stuck, t0 + ms(300)),
            Some(Transition::Restore(RestoreReason::RanLongTime))
        );
    }

    #[test]
    fn test_group_progress_accounting() {
        let state = GroupState::new(0, CpuMask::first(2));
        let t0 = Instant::now();
        state.note_enqueued(t0);
        state.note_enqueued(t0 + ms(1));
        assert_eq!(state.sample().pending_since, Some(t0));

        state.note_dequeued(t0 + ms(5));
        let sample = state.sample();
        assert_eq!(sample.pending_since, Some(t0 + ms(5)));
        assert_eq!(sample.busy_since, Some(t0 + ms(5)));

        state.note_idle();
        state.note_dequeued(t0 + ms(6));
        state.note_idle();
        let sample = state.sample();
        assert_eq!(sample.pending_since, None);
        assert_eq!(sample.busy_since, None);
        assert_eq!(sample.last_dequeue, t0 + ms(6));
    }

    #[test]
    fn test_wait_for_progress() {
        let state = Arc::new(GroupState::new(0, CpuMask::first(1)));
        assert!(!state.wait_for_progress(ms(1)));

        state.set_downgraded(true);
        let waiter = {
            let state = Arc::clone(&state);
            thread::spawn(move || state.wait_for_progress(Duration::from_secs(30)))
        };
        while !waiter.is_finished() {
            state.note_dequeued(Instant::now());
            thread::sleep(ms(5));
        }
        assert!(waiter.join().unwrap());

        // Times out if nothing moves
        let started = Instant::now();
        assert!(state.wait_for_progress(ms(20)));
        assert!(started.elapsed() >= ms(20));
    }
}
