//! iocore bench - Stress and validation tool
//!
//! Drives the backpressure pool, both semaphores and the dispatcher from
//! several threads, then checks that every resource and permit came back
//! and that no waiter was left queued.

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use iocore_common::{Affinity, CpuMask, IocoreConfig, QueuingClass, RequestError, cpu};
use iocore_dispatch::{Dispatcher, PriorityRegistrant, RestoreReason};
use iocore_pool::{
    Admission, BackpressurePool, CountingSemaphore, FnWaiter, PartitionedSemaphore, PoolResource,
    Pooled, SemaphoreStats, WaitStatus, Waiter,
};
use rand::Rng;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "iocore-bench")]
#[command(about = "iocore stress and validation bench")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print the final report as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Allocate from a backpressure pool, then free
    Pool {
        /// Requesting threads
        #[arg(long, default_value_t = 4)]
        threads: usize,
        /// Total allocations across all threads
        #[arg(long, default_value_t = 100_000)]
        ops: usize,
        /// Resources in the pool
        #[arg(long, default_value_t = 8)]
        resources: usize,
        /// Free-list partitions (overrides the config file)
        #[arg(long)]
        partitions: Option<usize>,
        /// Fraction of requests queued at the head
        #[arg(long, default_value_t = 0.05)]
        high_priority: f64,
    },
    /// Request random permit counts from a semaphore, then release them
    Semaphore {
        /// Requesting threads
        #[arg(long, default_value_t = 4)]
        threads: usize,
        /// Total requests across all threads
        #[arg(long, default_value_t = 100_000)]
        ops: usize,
        /// Permits in circulation
        #[arg(long, default_value_t = 16)]
        permits: u64,
        /// Largest single request
        #[arg(long, default_value_t = 4)]
        max_request: u64,
        /// Use the per-CPU partitioned semaphore
        #[arg(long)]
        partitioned: bool,
        /// Partitions (overrides the config file)
        #[arg(long)]
        partitions: Option<usize>,
    },
    /// Push work through the dispatcher and its maintenance threads
    Dispatch {
        /// Work items spread over the workers
        #[arg(long, default_value_t = 100_000)]
        items: usize,
        /// Items for the maintenance threads
        #[arg(long, default_value_t = 100)]
        low_priority: usize,
        /// Worker threads (overrides the config file)
        #[arg(long)]
        workers: Option<usize>,
        /// Run workers with SCHED_FIFO
        #[arg(long)]
        realtime: bool,
    },
}

#[derive(Debug, Serialize)]
struct Report {
    command: &'static str,
    operations: u64,
    elapsed_ms: u64,
    ops_per_sec: f64,
    stats: serde_json::Value,
}

impl Report {
    #[allow(clippy::cast_precision_loss)]
    fn new(
        command: &'static str,
        operations: u64,
        elapsed: Duration,
        stats: impl Serialize,
    ) -> Result<Self> {
        let secs = elapsed.as_secs_f64().max(f64::EPSILON);
        Ok(Self {
            command,
            operations,
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            ops_per_sec: operations as f64 / secs,
            stats: serde_json::to_value(stats)?,
        })
    }
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match &args.config {
        Some(path) => IocoreConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => IocoreConfig::default(),
    };

    let report = match args.command {
        Commands::Pool {
            threads,
            ops,
            resources,
            partitions,
            high_priority,
        } => {
            if partitions.is_some() {
                config.pool.partitions = partitions;
            }
            config.validate()?;
            run_pool(&config, threads, ops, resources, high_priority)?
        }
        Commands::Semaphore {
            threads,
            ops,
            permits,
            max_request,
            partitioned,
            partitions,
        } => {
            if partitions.is_some() {
                config.pool.partitions = partitions;
            }
            config.validate()?;
            run_semaphore(&config, threads, ops, permits, max_request, partitioned)?
        }
        Commands::Dispatch {
            items,
            low_priority,
            workers,
            realtime,
        } => {
            if workers.is_some() {
                config.dispatcher.workers = workers;
            }
            config.dispatcher.realtime |= realtime;
            config.validate()?;
            run_dispatch(&config, items, low_priority)?
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{} bench", report.command);
        println!("==============");
        println!("Operations: {}", report.operations);
        println!("Elapsed:    {} ms", report.elapsed_ms);
        println!("Throughput: {:.0} ops/s", report.ops_per_sec);
        println!("{}", serde_json::to_string_pretty(&report.stats)?);
    }
    Ok(())
}

fn join_all<T>(handles: Vec<JoinHandle<Result<T>>>) -> Result<Vec<T>> {
    handles
        .into_iter()
        .map(|handle| {
            handle
                .join()
                .map_err(|_| anyhow!("bench thread panicked"))?
        })
        .collect()
}

fn check_threads(threads: usize, ops: usize) -> Result<usize> {
    if threads == 0 {
        bail!("--threads must be > 0");
    }
    Ok(ops.div_ceil(threads))
}

// Pool bench

struct Buffer {
    id: u64,
}

struct BufferRequest {
    reply: mpsc::Sender<Pooled<Buffer>>,
}

impl Waiter for BufferRequest {
    fn signal(self, status: WaitStatus) {
        warn!("buffer request ended without a buffer: {:?}", status);
    }
}

impl PoolResource for Buffer {
    type Request = BufferRequest;

    fn start(resource: Pooled<Self>, request: BufferRequest) {
        // The requester is blocked on the other end until this arrives
        let _ = request.reply.send(resource);
    }
}

fn run_pool(
    config: &IocoreConfig,
    threads: usize,
    ops: usize,
    resources: usize,
    high_priority: f64,
) -> Result<Report> {
    let per_thread = check_threads(threads, ops)?;
    if resources == 0 {
        bail!("--resources must be > 0");
    }
    if !(0.0..=1.0).contains(&high_priority) {
        bail!("--high-priority must be within 0..=1");
    }

    let partitions = config.pool.partition_count();
    let pool = Arc::new(BackpressurePool::new("bench-buffers", partitions));
    pool.fill((0..resources as u64).map(|id| Buffer { id }));
    info!(
        "pool bench: {} threads x {} ops, {} resources over {} partitions",
        threads, per_thread, resources, partitions
    );

    let started = Instant::now();
    let handles = (0..threads)
        .map(|t| {
            let pool = Arc::clone(&pool);
            thread::Builder::new()
                .name(format!("bench-pool-{t}"))
                .spawn(move || -> Result<u64> {
                    cpu::set_current_cpu(t);
                    let mut rng = rand::thread_rng();
                    let (tx, rx) = mpsc::channel();
                    let mut checksum = 0;
                    for _ in 0..per_thread {
                        let request = BufferRequest { reply: tx.clone() };
                        pool.allocate_and_start(request, Affinity::Any, rng.gen_bool(high_priority));
                        let buffer = rx.recv().context("pool dropped a request")?;
                        checksum += buffer.id;
                        pool.free(buffer);
                    }
                    Ok(checksum)
                })
        })
        .collect::<std::io::Result<Vec<_>>>()?;
    join_all(handles)?;
    let elapsed = started.elapsed();

    let stats = pool.stats();
    if stats.free != resources || stats.waiters != 0 {
        bail!(
            "conservation violated: {} of {} resources free, {} waiters left",
            stats.free,
            resources,
            stats.waiters
        );
    }
    info!("pool bench done: all {} resources returned", resources);
    Report::new("pool", (threads * per_thread) as u64, elapsed, stats)
}

// Semaphore bench

/// The two semaphore flavors behind one interface
trait Permits: Send + Sync {
    fn request(&self, waiter: FnWaiter) -> Result<Admission<FnWaiter>, RequestError<FnWaiter>>;
    fn release(&self, n: u64);
    fn stats(&self) -> SemaphoreStats;
}

impl Permits for CountingSemaphore<FnWaiter> {
    fn request(&self, waiter: FnWaiter) -> Result<Admission<FnWaiter>, RequestError<FnWaiter>> {
        Self::request(self, waiter)
    }

    fn release(&self, n: u64) {
        Self::release(self, n);
    }

    fn stats(&self) -> SemaphoreStats {
        Self::stats(self)
    }
}

impl Permits for PartitionedSemaphore<FnWaiter> {
    fn request(&self, waiter: FnWaiter) -> Result<Admission<FnWaiter>, RequestError<FnWaiter>> {
        Self::request(self, waiter)
    }

    fn release(&self, n: u64) {
        Self::release(self, n);
    }

    fn stats(&self) -> SemaphoreStats {
        Self::stats(self)
    }
}

fn run_semaphore(
    config: &IocoreConfig,
    threads: usize,
    ops: usize,
    permits: u64,
    max_request: u64,
    partitioned: bool,
) -> Result<Report> {
    let per_thread = check_threads(threads, ops)?;
    if max_request == 0 || max_request > permits {
        bail!("--max-request must be within 1..={}", permits);
    }

    let semaphore: Arc<dyn Permits> = if partitioned {
        let partitions = config.pool.partition_count();
        let semaphore = PartitionedSemaphore::new(partitions);
        for permit in 0..permits {
            semaphore.release_on(usize::try_from(permit)? % partitions, 1);
        }
        Arc::new(semaphore)
    } else {
        Arc::new(CountingSemaphore::new(permits))
    };
    info!(
        "semaphore bench: {} threads x {} requests of 1..={} out of {} permits, partitioned={}",
        threads, per_thread, max_request, permits, partitioned
    );

    let started = Instant::now();
    let handles = (0..threads)
        .map(|t| {
            let semaphore = Arc::clone(&semaphore);
            thread::Builder::new()
                .name(format!("bench-sem-{t}"))
                .spawn(move || -> Result<()> {
                    cpu::set_current_cpu(t);
                    let mut rng = rand::thread_rng();
                    let (tx, rx) = mpsc::channel();
                    for _ in 0..per_thread {
                        let needed = rng.gen_range(1..=max_request);
                        let tx = tx.clone();
                        let waiter = FnWaiter::boxed(needed, move |status| {
                            let _ = tx.send(status);
                        });
                        match semaphore.request(waiter) {
                            Ok(Admission::Granted(_)) => {}
                            Ok(Admission::Queued(_)) => {
                                let status = rx.recv().context("semaphore dropped a waiter")?;
                                if status != WaitStatus::Granted {
                                    bail!("waiter ended with {:?}", status);
                                }
                            }
                            Err(err) => bail!("{}", err),
                        }
                        semaphore.release(needed);
                    }
                    Ok(())
                })
        })
        .collect::<std::io::Result<Vec<_>>>()?;
    join_all(handles)?;
    let elapsed = started.elapsed();

    let stats = semaphore.stats();
    if stats.available != permits || stats.waiters != 0 {
        bail!(
            "conservation violated: {} of {} permits available, {} waiters left",
            stats.available,
            permits,
            stats.waiters
        );
    }
    info!("semaphore bench done: all {} permits returned", permits);
    Report::new("semaphore", (threads * per_thread) as u64, elapsed, stats)
}

// Dispatch bench

/// Counts downgrade notifications for the whole machine
#[derive(Default)]
struct DowngradeCounter {
    mask: CpuMask,
    downgrades: AtomicU64,
    restores: AtomicU64,
}

impl PriorityRegistrant for DowngradeCounter {
    fn cpu_mask(&self) -> CpuMask {
        self.mask.clone()
    }

    fn on_downgrade(&self, group: usize) {
        self.downgrades.fetch_add(1, Ordering::Relaxed);
        warn!("cpu group {} downgraded", group);
    }

    fn on_restore(&self, group: usize, reason: RestoreReason) {
        self.restores.fetch_add(1, Ordering::Relaxed);
        if reason == RestoreReason::RanLongTime {
            info!("cpu group {} restored: {}", group, reason);
        }
    }
}

#[derive(Debug, Serialize)]
struct DispatchSummary {
    dispatcher: iocore_dispatch::DispatcherStats,
    downgrades: u64,
    restores: u64,
}

fn run_dispatch(config: &IocoreConfig, items: usize, low_priority: usize) -> Result<Report> {
    let dispatcher = Dispatcher::start(config.dispatcher.clone(), config.monitor.clone())?;
    let workers = dispatcher.worker_count();
    let groups = dispatcher.group_count();
    let counter = Arc::new(DowngradeCounter {
        mask: CpuMask::first(workers),
        ..Default::default()
    });
    let registrant: Arc<dyn PriorityRegistrant> = counter.clone();
    let id = dispatcher.enable_priority_downgrade(&registrant);
    info!(
        "dispatch bench: {} items over {} workers, {} low-priority items over {} groups",
        items, workers, low_priority, groups
    );

    let started = Instant::now();
    let (tx, rx) = mpsc::channel::<()>();
    for i in 0..items {
        let target = i % workers;
        let class = QueuingClass::ALL[i % QueuingClass::COUNT];
        let tx = tx.clone();
        let continuation = Arc::clone(&dispatcher);
        // The continuation targets the same worker, so it normally runs inline
        dispatcher.run_on(target, class, move || {
            let done = continuation.complete(Affinity::Cpu(target), class, move || {
                let _ = tx.send(());
            });
            if let Err(e) = done {
                warn!("continuation failed: {}", e);
            }
        })?;
    }
    for i in 0..low_priority {
        let tx = tx.clone();
        dispatcher.run_low_priority(i % groups, move || {
            let _ = tx.send(());
        })?;
    }
    drop(tx);

    let expected = items + low_priority;
    for done in 0..expected {
        rx.recv_timeout(Duration::from_secs(30))
            .with_context(|| format!("only {done} of {expected} work items completed"))?;
    }
    let elapsed = started.elapsed();

    dispatcher.disable_priority_downgrade(id);
    dispatcher.shutdown();
    let stats = dispatcher.stats();
    let executed: u64 = stats.executed_per_worker.iter().sum();
    if stats.inline_completions + stats.queued_completions != items as u64 || executed < items as u64 {
        bail!(
            "lost work: {} executed, {} inline and {} queued completions for {} items",
            executed,
            stats.inline_completions,
            stats.queued_completions,
            items
        );
    }
    info!("dispatch bench done: {} items executed", executed);

    let summary = DispatchSummary {
        dispatcher: stats,
        downgrades: counter.downgrades.load(Ordering::Relaxed),
        restores: counter.restores.load(Ordering::Relaxed),
    };
    Report::new("dispatch", expected as u64, elapsed, summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> IocoreConfig {
        let mut config = IocoreConfig::default();
        config.pool.partitions = Some(2);
        config.dispatcher.workers = Some(2);
        config.dispatcher.cpus_per_group = 1;
        config.dispatcher.pin_threads = false;
        config
    }

    #[test]
    fn test_pool_bench_conserves_resources() {
        let report = run_pool(&small_config(), 2, 2_000, 3, 0.1).unwrap();
        assert_eq!(report.command, "pool");
        assert_eq!(report.operations, 2_000);
        assert_eq!(report.stats["free"], 3);
    }

    #[test]
    fn test_semaphore_bench_both_flavors() {
        for partitioned in [false, true] {
            let report = run_semaphore(&small_config(), 2, 2_000, 6, 3, partitioned).unwrap();
            assert_eq!(report.stats["available"], 6);
            assert_eq!(report.stats["waiters"], 0);
        }
    }

    #[test]
    fn test_dispatch_bench_counts_every_item() {
        let report = run_dispatch(&small_config(), 1_000, 10).unwrap();
        assert_eq!(report.operations, 1_010);
        let dispatcher = &report.stats["dispatcher"];
        let inline = dispatcher["inline_completions"].as_u64().unwrap();
        let queued = dispatcher["queued_completions"].as_u64().unwrap();
        assert_eq!(inline + queued, 1_000);
        assert_eq!(dispatcher["registrants"], 0);
    }

    #[test]
    fn test_rejects_bad_arguments() {
        assert!(run_pool(&small_config(), 0, 10, 1, 0.0).is_err());
        assert!(run_pool(&small_config(), 1, 10, 1, 1.5).is_err());
        assert!(run_semaphore(&small_config(), 1, 10, 2, 3, false).is_err());
    }
}
