//! Queueing statistics for pools and semaphores
//!
//! Exhaustion never surfaces as an error; it shows up as time spent queued.
//! `WaitHistogram` records that time in fixed logarithmic buckets:
//! - Bucket 0: 0-10us
//! - Bucket 1: 10-20us
//! - Bucket 2: 20-50us
//! - ...
//! - Bucket 14: 200-500ms
//! - Bucket 15: 500ms+

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const BUCKETS: usize = 16;

/// Upper bucket bounds in microseconds (exclusive)
const BUCKET_BOUNDS_US: [u64; BUCKETS] = [
    10,
    20,
    50,
    100,
    200,
    500,
    1_000,
    2_000,
    5_000,
    10_000,
    20_000,
    50_000,
    100_000,
    200_000,
    500_000,
    u64::MAX,
];

/// Histogram of queueing delays
#[derive(Debug)]
pub struct WaitHistogram {
    buckets: [AtomicU64; BUCKETS],
    count: AtomicU64,
    sum_us: AtomicU64,
    min_us: AtomicU64,
    max_us: AtomicU64,
}

impl WaitHistogram {
    pub fn new() -> Self {
        Self {
            buckets: Default::default(),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
            min_us: AtomicU64::new(u64::MAX),
            max_us: AtomicU64::new(0),
        }
    }

    /// Record one delay
    pub fn record(&self, wait: Duration) {
        let us = u64::try_from(wait.as_micros()).unwrap_or(u64::MAX);
        let idx = BUCKET_BOUNDS_US
            .iter()
            .position(|&bound| us < bound)
            .unwrap_or(BUCKETS - 1);

        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(us, Ordering::Relaxed);
        self.min_us.fetch_min(us, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn avg_us(&self) -> u64 {
        let count = self.count();
        if count == 0 {
            return 0;
        }
        self.sum_us.load(Ordering::Relaxed) / count
    }

    pub fn min_us(&self) -> u64 {
        let min = self.min_us.load(Ordering::Relaxed);
        if min == u64::MAX { 0 } else { min }
    }

    pub fn max_us(&self) -> u64 {
        self.max_us.load(Ordering::Relaxed)
    }

    /// Upper bound of the bucket holding the given percentile (0.0 to 1.0)
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn percentile_us(&self, percentile: f64) -> u64 {
        let total = self.count();
        if total == 0 {
            return 0;
        }

        let target = ((total as f64) * percentile).ceil() as u64;
        let mut cumulative = 0u64;
        for (idx, bucket) in self.buckets.iter().enumerate() {
            cumulative += bucket.load(Ordering::Relaxed);
            if cumulative >= target {
                return BUCKET_BOUNDS_US[idx];
            }
        }
        BUCKET_BOUNDS_US[BUCKETS - 1]
    }

    /// (upper bound, count) pairs
    pub fn bucket_counts(&self) -> Vec<(u64, u64)> {
        BUCKET_BOUNDS_US
            .iter()
            .zip(self.buckets.iter())
            .map(|(&bound, count)| (bound, count.load(Ordering::Relaxed)))
            .collect()
    }

    pub fn snapshot(&self) -> WaitPercentiles {
        WaitPercentiles {
            samples: self.count(),
            avg_us: self.avg_us(),
            min_us: self.min_us(),
            max_us: self.max_us(),
            p50_us: self.percentile_us(0.50),
            p99_us: self.percentile_us(0.99),
            p999_us: self.percentile_us(0.999),
        }
    }
}

impl Default for WaitHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of a [`WaitHistogram`]
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct WaitPercentiles {
    pub samples: u64,
    pub avg_us: u64,
    pub min_us: u64,
    pub max_us: u64,
    pub p50_us: u64,
    pub p99_us: u64,
    pub p999_us: u64,
}

/// Request outcome counters plus queueing delay
#[derive(Debug, Default)]
pub struct WaitStats {
    immediate: AtomicU64,
    queued: AtomicU64,
    signaled: AtomicU64,
    canceled: AtomicU64,
    delay: WaitHistogram,
}

impl WaitStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request satisfied without queueing
    pub fn record_immediate(&self) {
        self.immediate.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queued(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    /// Queued request satisfied after waiting since `enqueued_at`
    pub fn record_signaled(&self, enqueued_at: Instant) {
        self.signaled.fetch_add(1, Ordering::Relaxed);
        self.delay.record(enqueued_at.elapsed());
    }

    pub fn record_canceled(&self) {
        self.canceled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delay(&self) -> &WaitHistogram {
        &self.delay
    }

    pub fn snapshot(&self) -> WaitStatsSnapshot {
        WaitStatsSnapshot {
            immediate: self.immediate.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            signaled: self.signaled.load(Ordering::Relaxed),
            canceled: self.canceled.load(Ordering::Relaxed),
            delay: self.delay.snapshot(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct WaitStatsSnapshot {
    pub immediate: u64,
    pub queued: u64,
    pub signaled: u64,
    pub canceled: u64,
    pub delay: WaitPercentiles,
}
