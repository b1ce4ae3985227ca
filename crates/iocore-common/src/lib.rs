//! iocore Common - Shared types and utilities
//!
//! This crate provides the error type, configuration tree, CPU topology
//! helpers and small shared types used by the pool and dispatcher crates.

pub mod config;
pub mod cpu;
pub mod error;
pub mod types;

pub use config::{DispatcherConfig, IocoreConfig, MonitorConfig, PoolConfig};
pub use error::{Error, RequestError, Result};
pub use types::*;
