//! CPU topology helpers
//!
//! Partitioned structures index their shards by the CPU the caller is running
//! on. Threads that are pinned (dispatcher workers) or that want to act as a
//! given CPU (tests, benches) record an explicit CPU in a thread-local
//! override; everyone else falls back to asking the kernel.

use crate::types::CpuId;
use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

thread_local! {
    static CPU_OVERRIDE: Cell<Option<CpuId>> = const { Cell::new(None) };
    static FALLBACK_CPU: Cell<Option<CpuId>> = const { Cell::new(None) };
}

/// Round-robin source for threads on platforms without `sched_getcpu`
static NEXT_FALLBACK: AtomicUsize = AtomicUsize::new(0);

/// Number of logical CPUs on this host (at least 1)
#[must_use]
pub fn host_cpu_count() -> usize {
    num_cpus::get().max(1)
}

/// CPU the calling thread is running on (or acting as).
///
/// The value may be stale by the time it is used; callers only use it to
/// pick a cache-local shard.
#[must_use]
pub fn current_cpu() -> CpuId {
    if let Some(cpu) = CPU_OVERRIDE.with(Cell::get) {
        return cpu;
    }
    kernel_cpu().unwrap_or_else(fallback_cpu)
}

/// Current CPU folded into `0..partitions`
#[must_use]
pub fn current_partition(partitions: usize) -> usize {
    debug_assert!(partitions > 0, "partition count must be non-zero");
    current_cpu() % partitions
}

/// Make the calling thread report `cpu` from [`current_cpu`] until cleared
pub fn set_current_cpu(cpu: CpuId) {
    CPU_OVERRIDE.with(|c| c.set(Some(cpu)));
}

/// Drop any override installed by [`set_current_cpu`]
pub fn clear_current_cpu() {
    CPU_OVERRIDE.with(|c| c.set(None));
}

/// Run `f` while the calling thread acts as `cpu`, restoring the previous
/// override afterwards
pub fn with_cpu<R>(cpu: CpuId, f: impl FnOnce() -> R) -> R {
    let _guard = CpuGuard::enter(cpu);
    f()
}

/// Restores the previous CPU override on drop
pub struct CpuGuard {
    previous: Option<CpuId>,
}

impl CpuGuard {
    #[must_use]
    pub fn enter(cpu: CpuId) -> Self {
        let previous = CPU_OVERRIDE.with(|c| c.replace(Some(cpu)));
        Self { previous }
    }
}

impl Drop for CpuGuard {
    fn drop(&mut self) {
        CPU_OVERRIDE.with(|c| c.set(self.previous));
    }
}

/// Pin the calling thread to `cpu` and record it as the thread's CPU.
///
/// Returns false when the host refuses the affinity change; the override is
/// installed either way so the thread keeps using its assigned shard.
pub fn pin_current_thread(cpu: CpuId) -> bool {
    set_current_cpu(cpu);

    let Some(core_ids) = core_affinity::get_core_ids() else {
        warn!("cannot enumerate cores, cpu {} left unpinned", cpu);
        return false;
    };
    let Some(core) = core_ids.into_iter().find(|core| core.id == cpu) else {
        warn!("cpu {} not present on this host, left unpinned", cpu);
        return false;
    };

    if core_affinity::set_for_current(core) {
        debug!("pinned thread to cpu {}", cpu);
        true
    } else {
        warn!("failed to pin thread to cpu {}", cpu);
        false
    }
}

#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn kernel_cpu() -> Option<CpuId> {
    // SAFETY: sched_getcpu takes no arguments and only reads per-thread state.
    let cpu = unsafe { libc::sched_getcpu() };
    usize::try_from(cpu).ok()
}

#[cfg(not(target_os = "linux"))]
const fn kernel_cpu() -> Option<CpuId> {
    None
}

fn fallback_cpu() -> CpuId {
    FALLBACK_CPU.with(|c| {
        if let Some(cpu) = c.get() {
            return cpu;
        }
        let cpu = NEXT_FALLBACK.fetch_add(1, Ordering::Relaxed) % host_cpu_count();
        c.set(Some(cpu));
        cpu
    })
}
