//! Priority downgrade registrants
//!
//! A registrant is typically the owner of high-priority threads (the
//! dispatcher's workers, an I/O poller) that could starve the group's
//! maintenance thread. It is told when its group is downgraded and when the
//! downgrade ends, and why.

use derive_more::{Display, From};
use iocore_common::CpuMask;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Weak};

/// Why a downgraded group went back to normal priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreReason {
    /// The maintenance thread dequeued work after the downgrade
    LowPriorityRan,
    /// The downgrade lasted its full duration without progress
    DowngradeExpired,
    /// The maintenance thread has been running one item for a long time
    RanLongTime,
}

impl fmt::Display for RestoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LowPriorityRan => "low priority ran",
            Self::DowngradeExpired => "downgrade expired",
            Self::RanLongTime => "ran long time",
        };
        f.write_str(name)
    }
}

/// Party that gives up priority while a CPU group's maintenance thread is
/// starved.
///
/// Callbacks run on the monitor thread and must not block.
pub trait PriorityRegistrant: Send + Sync {
    /// CPUs this registrant runs on; it is notified for every group the
    /// mask touches
    fn cpu_mask(&self) -> CpuMask;

    fn on_downgrade(&self, group: usize);

    fn on_restore(&self, group: usize, reason: RestoreReason);
}

/// Handle returned by `enable_priority_downgrade`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, From)]
#[display("registration-{_0}")]
pub struct RegistrationId(u64);

/// Registrants are held weakly: dropping the last strong reference
/// unregisters implicitly.
#[derive(Default)]
pub(crate) struct Registry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    entries: Vec<(RegistrationId, Weak<dyn PriorityRegistrant>)>,
}

impl Registry {
    pub(crate) fn register(&self, registrant: &Arc<dyn PriorityRegistrant>) -> RegistrationId {
        let mut inner = self.inner.lock();
        let id = RegistrationId(inner.next_id);
        inner.next_id += 1;
        inner.entries.push((id, Arc::downgrade(registrant)));
        id
    }

    pub(crate) fn unregister(&self, id: RegistrationId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|(entry, _)| *entry != id);
        inner.entries.len() != before
    }

    /// Live registrants whose mask intersects `cpus`
    pub(crate) fn interested(&self, cpus: &CpuMask) -> Vec<Arc<dyn PriorityRegistrant>> {
        let mut inner = self.inner.lock();
        inner.entries.retain(|(_, weak)| weak.strong_count() > 0);
        inner
            .entries
            .iter()
            .filter_map(|(_, weak)| weak.upgrade())
            .filter(|registrant| registrant.cpu_mask().intersects(cpus))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }
}
