//! iocore Dispatch - CPU-affine work dispatch with starvation protection
//!
//! This crate provides:
//! - Per-CPU workers with class-ordered queues and bounded inline completion
//! - A maintenance thread per CPU group for low-priority work
//! - A monitor that downgrades registrants while a maintenance thread starves

pub mod dispatcher;
mod maintenance;
pub mod monitor;
pub mod registrant;

pub use dispatcher::{Completion, Dispatcher, DispatcherStats, Work};
pub use monitor::{GroupState, ProgressSample, StarvationTracker, Transition};
pub use registrant::{PriorityRegistrant, RegistrationId, RestoreReason};
