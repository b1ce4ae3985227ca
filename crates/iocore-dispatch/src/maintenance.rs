//! Per-group maintenance thread
//!
//! Runs low-priority work for one CPU group at normal (non real-time)
//! priority and reports every dequeue to the group's [`GroupState`], which
//! is what the starvation monitor watches.

use crate::dispatcher::{Work, run_guarded};
use crate::monitor::GroupState;
use crossbeam_channel::{Sender, unbounded};
use iocore_common::{CpuId, Error, Result, cpu};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::debug;

pub(crate) struct MaintenanceWorker {
    state: Arc<GroupState>,
    tx: Mutex<Option<Sender<Work>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MaintenanceWorker {
    /// Start the thread; `pin_to` pins it to one of the group's CPUs
    pub(crate) fn spawn(state: Arc<GroupState>, pin_to: Option<CpuId>) -> Result<Self> {
        let (tx, rx) = unbounded::<Work>();
        let group = state.group();
        let thread_state = Arc::clone(&state);

        let handle = thread::Builder::new()
            .name(format!("iocore-maint-{group}"))
            .spawn(move || {
                if let Some(cpu) = pin_to {
                    cpu::pin_current_thread(cpu);
                }
                debug!("maintenance thread for group {} running", group);
                for work in rx {
                    thread_state.note_dequeued(Instant::now());
                    run_guarded(work);
                    thread_state.note_idle();
                }
                debug!("maintenance thread for group {} exiting", group);
            })
            .map_err(|e| Error::Spawn(e.to_string()))?;

        Ok(Self {
            state,
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub(crate) fn submit(&self, work: Work) -> Result<()> {
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            return Err(Error::ShutDown);
        };
        self.state.note_enqueued(Instant::now());
        tx.send(work).map_err(|_| Error::ShutDown)
    }

    /// Stop accepting work; queued items still run
    pub(crate) fn close(&self) {
        self.tx.lock().take();
    }

    pub(crate) fn take_handle(&self) -> Option<JoinHandle<()>> {
        self.handle.lock().take()
    }
}
