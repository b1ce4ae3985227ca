//! Configuration types for iocore
//!
//! Every field has a serde default so a partial TOML file (or none at all)
//! yields a usable configuration.

use crate::cpu::host_cpu_count;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Root configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IocoreConfig {
    /// Resource pool and semaphore configuration
    #[serde(default)]
    pub pool: PoolConfig,
    /// Dispatcher configuration
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    /// Starvation monitor configuration
    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl IocoreConfig {
    /// Parse a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| Error::configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        self.dispatcher.validate()?;
        self.monitor.validate()
    }
}

/// Partitioning for pools and semaphores
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of partitions (default: one per host CPU)
    #[serde(default)]
    pub partitions: Option<usize>,
}

impl PoolConfig {
    /// Partition count after applying the host default
    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.partitions.unwrap_or_else(host_cpu_count)
    }

    fn validate(&self) -> Result<()> {
        if self.partitions == Some(0) {
            return Err(Error::configuration("pool.partitions must be > 0"));
        }
        Ok(())
    }
}

/// Per-CPU worker threads
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Number of per-CPU workers (default: one per host CPU)
    #[serde(default)]
    pub workers: Option<usize>,
    /// Promote workers to SCHED_FIFO
    #[serde(default)]
    pub realtime: bool,
    /// SCHED_FIFO priority used when `realtime` is set
    #[serde(default = "default_realtime_priority")]
    pub realtime_priority: i32,
    /// Pin each worker to its CPU
    #[serde(default = "default_true")]
    pub pin_threads: bool,
    /// Deepest nesting at which a completion still runs inline
    #[serde(default = "default_max_inline_depth")]
    pub max_inline_depth: usize,
    /// CPUs sharing one low-priority maintenance thread
    #[serde(default = "default_cpus_per_group")]
    pub cpus_per_group: usize,
    /// Workers on a downgraded group step aside between work items
    #[serde(default = "default_true")]
    pub yield_when_downgraded: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: None,
            realtime: false,
            realtime_priority: default_realtime_priority(),
            pin_threads: true,
            max_inline_depth: default_max_inline_depth(),
            cpus_per_group: default_cpus_per_group(),
            yield_when_downgraded: true,
        }
    }
}

impl DispatcherConfig {
    /// Worker count after applying the host default
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(host_cpu_count)
    }

    /// Number of CPU groups the workers fall into
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.worker_count().div_ceil(self.cpus_per_group)
    }

    fn validate(&self) -> Result<()> {
        if self.workers == Some(0) {
            return Err(Error::configuration("dispatcher.workers must be > 0"));
        }
        if self.cpus_per_group == 0 {
            return Err(Error::configuration("dispatcher.cpus_per_group must be > 0"));
        }
        if self.realtime && !(1..=99).contains(&self.realtime_priority) {
            return Err(Error::configuration(format!(
                "dispatcher.realtime_priority must be 1..=99, got {}",
                self.realtime_priority
            )));
        }
        Ok(())
    }
}

/// Starvation monitor thresholds, all in milliseconds
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// How often the monitor samples the maintenance threads
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Pending maintenance work older than this counts as starved
    #[serde(default = "default_starvation_threshold_ms")]
    pub starvation_threshold_ms: u64,
    /// Longest a group stays downgraded without progress
    #[serde(default = "default_downgrade_duration_ms")]
    pub downgrade_duration_ms: u64,
    /// Continuous maintenance run time that ends a downgrade
    #[serde(default = "default_ran_long_threshold_ms")]
    pub ran_long_threshold_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            starvation_threshold_ms: default_starvation_threshold_ms(),
            downgrade_duration_ms: default_downgrade_duration_ms(),
            ran_long_threshold_ms: default_ran_long_threshold_ms(),
        }
    }
}

impl MonitorConfig {
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub const fn starvation_threshold(&self) -> Duration {
        Duration::from_millis(self.starvation_threshold_ms)
    }

    #[must_use]
    pub const fn downgrade_duration(&self) -> Duration {
        Duration::from_millis(self.downgrade_duration_ms)
    }

    #[must_use]
    pub const fn ran_long_threshold(&self) -> Duration {
        Duration::from_millis(self.ran_long_threshold_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(Error::configuration("monitor.poll_interval_ms must be > 0"));
        }
        if self.starvation_threshold_ms < self.poll_interval_ms {
            return Err(Error::configuration(
                "monitor.starvation_threshold_ms must be >= poll_interval_ms",
            ));
        }
        if self.downgrade_duration_ms == 0 || self.ran_long_threshold_ms == 0 {
            return Err(Error::configuration(
                "monitor.downgrade_duration_ms and ran_long_threshold_ms must be > 0",
            ));
        }
        Ok(())
    }
}

const fn default_true() -> bool {
    true
}

const fn default_realtime_priority() -> i32 {
    10
}

const fn default_max_inline_depth() -> usize {
    8
}

const fn default_cpus_per_group() -> usize {
    4
}

const fn default_poll_interval_ms() -> u64 {
    10
}

const fn default_starvation_threshold_ms() -> u64 {
    100
}

const fn default_downgrade_duration_ms() -> u64 {
    50
}

const fn default_ran_long_threshold_ms() -> u64 {
    20
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = IocoreConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.pool.partition_count() >= 1);
        assert_eq!(config.dispatcher.max_inline_depth, 8);
        assert_eq!(config.monitor.poll_interval(), Duration::from_millis(10));
    }

    #[test]
    fn test_partial_toml() {
        let config = IocoreConfig::from_toml_str(
            r#"
            [pool]
            partitions = 4

            [dispatcher]
            workers = 6
            cpus_per_group = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.pool.partition_count(), 4);
        assert_eq!(config.dispatcher.worker_count(), 6);
        assert_eq!(config.dispatcher.group_count(), 2);
        assert!(config.dispatcher.pin_threads);
        assert_eq!(config.monitor.starvation_threshold_ms, 100);
    }

    #[test]
    fn test_invalid_values() {
        assert!(IocoreConfig::from_toml_str("[pool]\npartitions = 0\n").is_err());
        assert!(IocoreConfig::from_toml_str("[dispatcher]\ncpus_per_group = 0\n").is_err());
        assert!(
            IocoreConfig::from_toml_str(
                "[monitor]\npoll_interval_ms = 50\nstarvation_threshold_ms = 10\n"
            )
            .is_err()
        );
        assert!(
            IocoreConfig::from_toml_str("[dispatcher]\nrealtime = true\nrealtime_priority = 0\n")
                .is_err()
        );
        assert!(IocoreConfig::from_toml_str("not = [valid").is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[monitor]\nstarvation_threshold_ms = 250").unwrap();
        let config = IocoreConfig::from_file(file.path()).unwrap();
        assert_eq!(config.monitor.starvation_threshold(), Duration::from_millis(250));

        let missing = IocoreConfig::from_file("/nonexistent/iocore.toml");
        assert!(matches!(missing, Err(Error::Configuration(_))));
    }
}
