//! CPU-affine dispatcher
//!
//! One worker thread per CPU, each draining four class queues (urgent first).
//! Completions can run inline on the calling thread when it is already the
//! right worker and the inline nesting is still shallow; anything else is
//! queued to the target worker. CPUs are grouped, and each group has a
//! maintenance thread plus a monitor-driven downgrade flag, see
//! [`monitor`](crate::monitor).
//!
//! The dispatcher is an explicit object: build it once with
//! [`Dispatcher::start`], hand out the `Arc`, and call
//! [`Dispatcher::shutdown`] when done. Work items that hold the `Arc`
//! themselves keep it alive, so shutdown should not be left to `Drop`.

use crate::maintenance::MaintenanceWorker;
use crate::monitor::{GroupState, run_monitor};
use crate::registrant::{PriorityRegistrant, RegistrationId, Registry};
use crossbeam_channel::{Receiver, Select, Sender, TryRecvError, bounded, unbounded};
use iocore_common::{
    Affinity, CpuId, DispatcherConfig, Error, MonitorConfig, QueuingClass, Result, cpu,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// A unit of work handed to a worker or maintenance thread
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// How [`Dispatcher::complete`] delivered a continuation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Ran on the calling thread before `complete` returned
    Inline,
    /// Queued to a worker
    Queued,
}

thread_local! {
    /// Set on dispatcher worker threads
    static WORKER_CPU: Cell<Option<CpuId>> = const { Cell::new(None) };
    static INLINE_DEPTH: Cell<usize> = const { Cell::new(0) };
}

struct InlineDepth;

impl InlineDepth {
    fn enter() -> Self {
        INLINE_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self
    }
}

impl Drop for InlineDepth {
    fn drop(&mut self) {
        INLINE_DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}

/// Run a work item, containing any panic to the item itself
pub(crate) fn run_guarded(work: Work) -> bool {
    if panic::catch_unwind(AssertUnwindSafe(work)).is_ok() {
        true
    } else {
        error!("work item panicked on {:?}", thread::current().name());
        false
    }
}

pub struct Dispatcher {
    config: DispatcherConfig,
    monitor_config: MonitorConfig,
    workers: usize,
    /// Per worker, one sender per queuing class; `None` after shutdown
    queues: RwLock<Option<Vec<Vec<Sender<Work>>>>>,
    groups: Vec<Arc<GroupState>>,
    maintenance: Vec<MaintenanceWorker>,
    registry: Arc<Registry>,
    executed: Arc<[AtomicU64]>,
    inline_completions: AtomicU64,
    queued_completions: AtomicU64,
    monitor_tx: Mutex<Option<Sender<()>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl Dispatcher {
    /// Spawn the workers, one maintenance thread per CPU group and the
    /// priority monitor.
    pub fn start(config: DispatcherConfig, monitor_config: MonitorConfig) -> Result<Arc<Self>> {
        let workers = config.worker_count();
        if workers == 0 {
            return Err(Error::configuration("dispatcher needs at least one worker"));
        }
        if config.cpus_per_group == 0 {
            return Err(Error::configuration("cpus_per_group must be > 0"));
        }
        let per_group = config.cpus_per_group;

        let groups: Vec<Arc<GroupState>> = (0..config.group_count())
            .map(|group| {
                let first = group * per_group;
                let cpus = (first..(first + per_group).min(workers)).collect();
                Arc::new(GroupState::new(group, cpus))
            })
            .collect();
        let registry = Arc::new(Registry::default());
        let executed: Arc<[AtomicU64]> = (0..workers).map(|_| AtomicU64::new(0)).collect();

        let mut threads = Vec::with_capacity(workers);
        let mut queues = Vec::with_capacity(workers);
        for cpu_id in 0..workers {
            let mut senders = Vec::with_capacity(QueuingClass::COUNT);
            let mut receivers = Vec::with_capacity(QueuingClass::COUNT);
            for _ in QueuingClass::ALL {
                let (tx, rx) = unbounded();
                senders.push(tx);
                receivers.push(rx);
            }

            let worker = Worker {
                cpu: cpu_id,
                receivers,
                group: Arc::clone(&groups[cpu_id / per_group]),
                executed: Arc::clone(&executed),
                pin: config.pin_threads,
                realtime_priority: config.realtime.then_some(config.realtime_priority),
                yield_when_downgraded: config.yield_when_downgraded,
                downgrade_wait: monitor_config.downgrade_duration(),
            };
            let handle = thread::Builder::new()
                .name(format!("iocore-worker-{cpu_id}"))
                .spawn(move || worker.run())
                .map_err(|e| Error::Spawn(e.to_string()))?;
            threads.push(handle);
            queues.push(senders);
        }

        let maintenance = groups
            .iter()
            .map(|state| {
                let pin_to = if config.pin_threads {
                    state.cpus().iter().next()
                } else {
                    None
                };
                MaintenanceWorker::spawn(Arc::clone(state), pin_to)
            })
            .collect::<Result<Vec<_>>>()?;

        let (monitor_tx, monitor_rx) = bounded::<()>(1);
        let monitor = {
            let groups = groups.clone();
            let registry = Arc::clone(&registry);
            let monitor_config = monitor_config.clone();
            thread::Builder::new()
                .name("iocore-monitor".to_string())
                .spawn(move || run_monitor(&groups, &registry, &monitor_config, &monitor_rx))
                .map_err(|e| Error::Spawn(e.to_string()))?
        };

        info!(
            "dispatcher started: {} workers, {} cpu groups, realtime={}",
            workers,
            groups.len(),
            config.realtime
        );

        Ok(Arc::new(Self {
            config,
            monitor_config,
            workers,
            queues: RwLock::new(Some(queues)),
            groups,
            maintenance,
            registry,
            executed,
            inline_completions: AtomicU64::new(0),
            queued_completions: AtomicU64::new(0),
            monitor_tx: Mutex::new(Some(monitor_tx)),
            monitor: Mutex::new(Some(monitor)),
            threads: Mutex::new(threads),
            shut_down: AtomicBool::new(false),
        }))
    }

    pub const fn worker_count(&self) -> usize {
        self.workers
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// CPU group a CPU belongs to
    pub const fn group_of(&self, cpu: CpuId) -> usize {
        (cpu % self.workers) / self.config.cpus_per_group
    }

    /// Queue `work` on `cpu`'s worker
    pub fn run_on<F>(&self, cpu: CpuId, class: QueuingClass, work: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(cpu, class, Box::new(work))
    }

    fn enqueue(&self, cpu: CpuId, class: QueuingClass, work: Work) -> Result<()> {
        if cpu >= self.workers {
            return Err(Error::InvalidCpu {
                cpu,
                partitions: self.workers,
            });
        }
        let queues = self.queues.read();
        let Some(queues) = queues.as_ref() else {
            return Err(Error::ShutDown);
        };
        queues[cpu][class.index()]
            .send(work)
            .map_err(|_| Error::ShutDown)
    }

    /// Deliver a continuation.
    ///
    /// Runs it inline when the caller already is the target (any thread for
    /// [`Affinity::Any`], that CPU's worker for [`Affinity::Cpu`]) and fewer
    /// than `max_inline_depth` inline completions are nested on this thread.
    /// Otherwise it is queued, to the caller's CPU when no target is given.
    pub fn complete<F>(&self, target: Affinity, class: QueuingClass, work: F) -> Result<Completion>
    where
        F: FnOnce() + Send + 'static,
    {
        let here = WORKER_CPU.with(Cell::get);
        let on_target = match target {
            Affinity::Any => true,
            Affinity::Cpu(cpu) => here == Some(cpu),
        };

        if on_target && INLINE_DEPTH.with(Cell::get) < self.config.max_inline_depth {
            let _depth = InlineDepth::enter();
            work();
            self.inline_completions.fetch_add(1, Ordering::Relaxed);
            return Ok(Completion::Inline);
        }

        let cpu = match target {
            Affinity::Cpu(cpu) => cpu,
            Affinity::Any => here.unwrap_or_else(|| cpu::current_cpu() % self.workers),
        };
        self.enqueue(cpu, class, Box::new(work))?;
        self.queued_completions.fetch_add(1, Ordering::Relaxed);
        Ok(Completion::Queued)
    }

    /// Queue `work` on a CPU group's maintenance thread
    pub fn run_low_priority<F>(&self, group: usize, work: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(worker) = self.maintenance.get(group) else {
            return Err(Error::InvalidGroup {
                group,
                groups: self.groups.len(),
            });
        };
        worker.submit(Box::new(work))
    }

    /// Start telling `registrant` about downgrades of the groups its CPU mask
    /// touches. The dispatcher keeps only a weak reference.
    pub fn enable_priority_downgrade(
        &self,
        registrant: &Arc<dyn PriorityRegistrant>,
    ) -> RegistrationId {
        let id = self.registry.register(registrant);
        debug!("{} enabled priority downgrade", id);
        id
    }

    /// Returns false if `id` was not registered
    pub fn disable_priority_downgrade(&self, id: RegistrationId) -> bool {
        let removed = self.registry.unregister(id);
        if removed {
            debug!("{} disabled priority downgrade", id);
        }
        removed
    }

    /// If `cpu`'s group is downgraded, block until its maintenance thread
    /// makes progress, the downgrade ends, or `downgrade_duration` passes.
    ///
    /// Returns true if the caller was held back.
    pub fn block_if_low_priority_thread_starved(&self, cpu: CpuId) -> bool {
        let group = self.group_of(cpu);
        self.groups[group].wait_for_progress(self.monitor_config.downgrade_duration())
    }

    pub fn is_downgraded(&self, group: usize) -> bool {
        self.groups.get(group).is_some_and(|state| state.is_downgraded())
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            workers: self.workers,
            groups: self.groups.len(),
            executed_per_worker: self
                .executed
                .iter()
                .map(|count| count.load(Ordering::Relaxed))
                .collect(),
            inline_completions: self.inline_completions.load(Ordering::Relaxed),
            queued_completions: self.queued_completions.load(Ordering::Relaxed),
            downgraded_groups: self
                .groups
                .iter()
                .filter(|state| state.is_downgraded())
                .map(|state| state.group())
                .collect(),
            registrants: self.registry.len(),
        }
    }

    /// Stop accepting work, let queued work finish and join every thread.
    ///
    /// Safe to call more than once and from a work item; the calling thread
    /// is not joined.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("dispatcher shutting down");
        let me = thread::current().id();

        self.monitor_tx.lock().take();
        if let Some(handle) = self.monitor.lock().take() {
            join_thread(handle, me);
        }

        self.queues.write().take();
        for worker in &self.maintenance {
            worker.close();
        }
        // Nobody is left to restore these, release any blocked callers
        for state in &self.groups {
            state.set_downgraded(false);
        }

        let mut handles: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        handles.extend(self.maintenance.iter().filter_map(MaintenanceWorker::take_handle));
        for handle in handles {
            join_thread(handle, me);
        }
        info!("dispatcher stopped");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn join_thread(handle: JoinHandle<()>, me: thread::ThreadId) {
    if handle.thread().id() == me {
        return;
    }
    let name = handle.thread().name().map(str::to_owned);
    if handle.join().is_err() {
        warn!("dispatcher thread {:?} panicked", name);
    }
}

/// Snapshot of dispatcher activity
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStats {
    pub workers: usize,
    pub groups: usize,
    pub executed_per_worker: Vec<u64>,
    pub inline_completions: u64,
    pub queued_completions: u64,
    pub downgraded_groups: Vec<usize>,
    pub registrants: usize,
}

struct Worker {
    cpu: CpuId,
    /// Indexed by `QueuingClass::index`
    receivers: Vec<Receiver<Work>>,
    group: Arc<GroupState>,
    executed: Arc<[AtomicU64]>,
    pin: bool,
    realtime_priority: Option<i32>,
    yield_when_downgraded: bool,
    downgrade_wait: Duration,
}

impl Worker {
    fn run(self) {
        if self.pin {
            cpu::pin_current_thread(self.cpu);
        } else {
            cpu::set_current_cpu(self.cpu);
        }
        if let Some(priority) = self.realtime_priority {
            match set_realtime_priority(priority) {
                Ok(()) => debug!("worker {} running SCHED_FIFO at {}", self.cpu, priority),
                Err(e) => warn!("worker {} stays at normal priority: {}", self.cpu, e),
            }
        }
        WORKER_CPU.with(|c| c.set(Some(self.cpu)));

        while let Some(work) = self.next() {
            run_guarded(work);
            self.executed[self.cpu].fetch_add(1, Ordering::Relaxed);
            if self.yield_when_downgraded {
                self.group.wait_for_progress(self.downgrade_wait);
            }
        }
        debug!("worker {} exiting", self.cpu);
    }

    /// Next item by class order; blocks while all queues are empty and
    /// returns `None` once they are drained and disconnected
    fn next(&self) -> Option<Work> {
        loop {
            let mut disconnected = 0;
            for rx in &self.receivers {
                match rx.try_recv() {
                    Ok(work) => return Some(work),
                    Err(TryRecvError::Disconnected) => disconnected += 1,
                    Err(TryRecvError::Empty) => {}
                }
            }
            if disconnected == self.receivers.len() {
                return None;
            }

            let mut select = Select::new();
            for rx in &self.receivers {
                select.recv(rx);
            }
            select.ready();
        }
    }
}

#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn set_realtime_priority(priority: i32) -> std::io::Result<()> {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    // SAFETY: `param` is valid for the duration of the call; pid 0 is the
    // calling thread.
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_realtime_priority(_priority: i32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "real-time scheduling is only supported on Linux",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registrant::RestoreReason;
    use iocore_common::CpuMask;

    const WAIT: Duration = Duration::from_secs(10);

    fn test_config(workers: usize) -> DispatcherConfig {
        DispatcherConfig {
            workers: Some(workers),
            pin_threads: false,
            realtime: false,
            max_inline_depth: 2,
            cpus_per_group: 2,
            yield_when_downgraded: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_run_on_target_worker() {
        let dispatcher = Dispatcher::start(test_config(3), MonitorConfig::default()).unwrap();
        let (tx, rx) = unbounded();
        for cpu_id in 0..3 {
            let tx = tx.clone();
            dispatcher
                .run_on(cpu_id, QueuingClass::Normal, move || {
                    let _ = tx.send((cpu_id, cpu::current_cpu()));
                })
                .unwrap();
        }
        for _ in 0..3 {
            let (target, ran_on) = rx.recv_timeout(WAIT).unwrap();
            assert_eq!(target, ran_on);
        }
        dispatcher.shutdown();
        assert_eq!(dispatcher.stats().executed_per_worker, vec![1, 1, 1]);
    }

    #[test]
    fn test_classes_drain_most_urgent_first() {
        let dispatcher = Dispatcher::start(test_config(1), MonitorConfig::default()).unwrap();
        let (started_tx, started_rx) = bounded(1);
        let (gate_tx, gate_rx) = bounded::<()>(0);
        dispatcher
            .run_on(0, QueuingClass::Normal, move || {
                let _ = started_tx.send(());
                let _ = gate_rx.recv();
            })
            .unwrap();
        started_rx.recv_timeout(WAIT).unwrap();

        let (tx, rx) = unbounded();
        for class in [
            QueuingClass::Background,
            QueuingClass::Normal,
            QueuingClass::High,
            QueuingClass::Urgent,
        ] {
            let tx = tx.clone();
            dispatcher
                .run_on(0, class, move || {
                    let _ = tx.send(class);
                })
                .unwrap();
        }
        gate_tx.send(()).unwrap();

        let order: Vec<QueuingClass> = (0..4).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
        assert_eq!(order, QueuingClass::ALL.to_vec());
        dispatcher.shutdown();
    }

    #[test]
    fn test_complete_inline_depth_is_bounded() {
        let dispatcher = Dispatcher::start(test_config(2), MonitorConfig::default()).unwrap();
        let results = Arc::new(Mutex::new(Vec::new()));

        let d1 = Arc::clone(&dispatcher);
        let r1 = Arc::clone(&results);
        let outer = dispatcher
            .complete(Affinity::Any, QueuingClass::Normal, move || {
                let d2 = Arc::clone(&d1);
                let r2 = Arc::clone(&r1);
                let inner = d1
                    .complete(Affinity::Any, QueuingClass::Normal, move || {
                        let innermost = d2
                            .complete(Affinity::Any, QueuingClass::Normal, || {})
                            .unwrap();
                        r2.lock().push(innermost);
                    })
                    .unwrap();
                r1.lock().push(inner);
            })
            .unwrap();

        assert_eq!(outer, Completion::Inline);
        assert_eq!(*results.lock(), vec![Completion::Queued, Completion::Inline]);
        dispatcher.shutdown();
        let stats = dispatcher.stats();
        assert_eq!(stats.inline_completions, 2);
        assert_eq!(stats.queued_completions, 1);
    }

    #[test]
    fn test_complete_runs_inline_only_on_target_worker() {
        let dispatcher = Dispatcher::start(test_config(2), MonitorConfig::default()).unwrap();

        // The test thread is not a worker
        let off_target = dispatcher
            .complete(Affinity::Cpu(1), QueuingClass::Normal, || {})
            .unwrap();
        assert_eq!(off_target, Completion::Queued);

        let (tx, rx) = unbounded();
        let inner = Arc::clone(&dispatcher);
        dispatcher
            .run_on(1, QueuingClass::Normal, move || {
                let same = inner.complete(Affinity::Cpu(1), QueuingClass::Normal, || {});
                let other = inner.complete(Affinity::Cpu(0), QueuingClass::Normal, || {});
                let _ = tx.send((same.unwrap(), other.unwrap()));
            })
            .unwrap();
        assert_eq!(
            rx.recv_timeout(WAIT).unwrap(),
            (Completion::Inline, Completion::Queued)
        );
        dispatcher.shutdown();
    }

    #[test]
    fn test_rejects_unknown_cpu_and_group() {
        let dispatcher = Dispatcher::start(test_config(2), MonitorConfig::default()).unwrap();
        assert!(matches!(
            dispatcher.run_on(2, QueuingClass::Normal, || {}),
            Err(Error::InvalidCpu { cpu: 2, partitions: 2 })
        ));
        assert!(matches!(
            dispatcher.run_low_priority(1, || {}),
            Err(Error::InvalidGroup { group: 1, groups: 1 })
        ));
        assert_eq!(dispatcher.group_of(3), 0);
        dispatcher.shutdown();
    }

    #[test]
    fn test_low_priority_runs_on_maintenance_thread() {
        let dispatcher = Dispatcher::start(test_config(4), MonitorConfig::default()).unwrap();
        assert_eq!(dispatcher.group_count(), 2);
        let (tx, rx) = unbounded();
        dispatcher
            .run_low_priority(1, move || {
                let _ = tx.send(thread::current().name().map(str::to_owned));
            })
            .unwrap();
        assert_eq!(
            rx.recv_timeout(WAIT).unwrap().as_deref(),
            Some("iocore-maint-1")
        );
        dispatcher.shutdown();
    }

    #[test]
    fn test_shutdown_rejects_new_work() {
        let dispatcher = Dispatcher::start(test_config(1), MonitorConfig::default()).unwrap();
        dispatcher.shutdown();
        dispatcher.shutdown();
        assert!(matches!(
            dispatcher.run_on(0, QueuingClass::Normal, || {}),
            Err(Error::ShutDown)
        ));
        assert!(matches!(
            dispatcher.run_low_priority(0, || {}),
            Err(Error::ShutDown)
        ));
    }

    #[derive(Debug, PartialEq, Eq)]
    enum Event {
        Downgrade(usize),
        Restore(usize, RestoreReason),
    }

    struct Recorder {
        mask: CpuMask,
        events: Sender<Event>,
    }

    impl PriorityRegistrant for Recorder {
        fn cpu_mask(&self) -> CpuMask {
            self.mask.clone()
        }

        fn on_downgrade(&self, group: usize) {
            let _ = self.events.send(Event::Downgrade(group));
        }

        fn on_restore(&self, group: usize, reason: RestoreReason) {
            let _ = self.events.send(Event::Restore(group, reason));
        }
    }

    #[test]
    fn test_starved_maintenance_downgrades_and_restores() {
        let monitor = MonitorConfig {
            poll_interval_ms: 5,
            starvation_threshold_ms: 30,
            downgrade_duration_ms: 20_000,
            ran_long_threshold_ms: 10_000,
        };
        let dispatcher = Dispatcher::start(test_config(2), monitor).unwrap();
        let (events_tx, events) = unbounded();
        let registrant: Arc<dyn PriorityRegistrant> = Arc::new(Recorder {
            mask: CpuMask::first(2),
            events: events_tx,
        });
        let id = dispatcher.enable_priority_downgrade(&registrant);

        // Park the maintenance thread inside one item with another queued
        let (started_tx, started_rx) = bounded(1);
        let (release_tx, release_rx) = bounded::<()>(1);
        dispatcher
            .run_low_priority(0, move || {
                let _ = started_tx.send(());
                let _ = release_rx.recv();
            })
            .unwrap();
        started_rx.recv_timeout(WAIT).unwrap();
        dispatcher.run_low_priority(0, || {}).unwrap();

        assert_eq!(events.recv_timeout(WAIT).unwrap(), Event::Downgrade(0));
        assert!(dispatcher.is_downgraded(0));
        assert_eq!(dispatcher.stats().downgraded_groups, vec![0]);

        let blocker = {
            let dispatcher = Arc::clone(&dispatcher);
            thread::spawn(move || dispatcher.block_if_low_priority_thread_starved(1))
        };
        release_tx.send(()).unwrap();

        assert_eq!(
            events.recv_timeout(WAIT).unwrap(),
            Event::Restore(0, RestoreReason::LowPriorityRan)
        );
        blocker.join().unwrap();
        assert!(!dispatcher.is_downgraded(0));
        assert!(!dispatcher.block_if_low_priority_thread_starved(0));

        assert!(dispatcher.disable_priority_downgrade(id));
        assert!(!dispatcher.disable_priority_downgrade(id));
        dispatcher.shutdown();
    }
}
