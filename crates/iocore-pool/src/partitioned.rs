//! Per-CPU free lists
//!
//! Adds always go to the caller's own partition, so releases stay
//! cache-local and never contend with other CPUs. Removes try the local
//! partition first and only on a miss scan the others, starting at the next
//! partition and wrapping around. Which CPU donates under contention is
//! therefore always "the nearest one after me".

use crate::lifo::Pooled;
use crate::locked::LockedFreeList;
use crossbeam_utils::CachePadded;
use iocore_common::{CpuId, cpu};

pub struct PartitionedFreeList<T> {
    partitions: Box<[CachePadded<LockedFreeList<T>>]>,
}

impl<T> PartitionedFreeList<T> {
    /// Create a list with `partitions` shards.
    ///
    /// # Panics
    ///
    /// Panics if `partitions` is zero.
    #[must_use]
    pub fn new(partitions: usize) -> Self {
        assert!(partitions > 0, "partition count must be > 0");
        let partitions = (0..partitions)
            .map(|_| CachePadded::new(LockedFreeList::new()))
            .collect();
        Self { partitions }
    }

    /// One partition per host CPU
    #[must_use]
    pub fn with_host_partitions() -> Self {
        Self::new(cpu::host_cpu_count())
    }

    /// Number of partitions
    pub fn partitions(&self) -> usize {
        self.partitions.len()
    }

    /// Partition index used for `cpu`
    pub fn partition_of(&self, cpu: CpuId) -> usize {
        cpu % self.partitions.len()
    }

    /// Direct access to one partition
    pub fn partition(&self, index: usize) -> &LockedFreeList<T> {
        &self.partitions[index]
    }

    /// Add to the calling CPU's partition
    pub fn add_head(&self, node: Pooled<T>) {
        self.add_head_on(cpu::current_cpu(), node);
    }

    /// Add to the partition for `cpu`
    pub fn add_head_on(&self, cpu: CpuId, node: Pooled<T>) {
        self.partitions[self.partition_of(cpu)].add_head(node);
    }

    /// Remove starting from the calling CPU's partition
    pub fn remove_head(&self) -> Option<Pooled<T>> {
        self.remove_head_from(cpu::current_cpu())
    }

    /// Remove starting from `cpu`'s partition, then every other partition
    /// once in round-robin order. `None` only if all were empty.
    pub fn remove_head_from(&self, cpu: CpuId) -> Option<Pooled<T>> {
        let count = self.partitions.len();
        let local = self.partition_of(cpu);
        (0..count).find_map(|offset| self.partitions[(local + offset) % count].remove_head())
    }

    /// Sum of all partitions; stale as soon as it is returned
    pub fn num_free(&self) -> usize {
        self.partitions.iter().map(|p| p.len()).sum()
    }

    /// Free count per partition
    pub fn free_per_partition(&self) -> Vec<usize> {
        self.partitions.iter().map(|p| p.len()).collect()
    }

    /// Lock acquisitions per partition
    pub fn lock_acquisitions(&self) -> Vec<u64> {
        self.partitions.iter().map(|p| p.lock_acquisitions()).collect()
    }
}
