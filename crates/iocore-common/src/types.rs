//! Core type definitions for iocore
//!
//! Identifiers and small value types shared by the pools, semaphores and the
//! dispatcher.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical CPU index as seen by a partitioned structure
pub type CpuId = usize;

/// Coarse priority bucket for queued work.
///
/// Classes bias the order in which a worker drains its per-CPU queues. They
/// never override FIFO fairness inside a pool or semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuingClass {
    Urgent = 0,
    High = 1,
    #[default]
    Normal = 2,
    Background = 3,
}

impl QueuingClass {
    /// Number of distinct classes
    pub const COUNT: usize = 4;

    /// All classes, most urgent first
    pub const ALL: [Self; Self::COUNT] = [Self::Urgent, Self::High, Self::Normal, Self::Background];

    /// Queue index for this class (0 is drained first)
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for QueuingClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Urgent => "urgent",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Background => "background",
        };
        f.write_str(name)
    }
}

/// Preferred CPU for a waiter or work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Affinity {
    /// No preference
    #[default]
    Any,
    /// Prefer the given logical CPU
    Cpu(CpuId),
}

impl Affinity {
    /// The preferred CPU, if any
    #[must_use]
    pub const fn cpu(self) -> Option<CpuId> {
        match self {
            Self::Any => None,
            Self::Cpu(cpu) => Some(cpu),
        }
    }
}

impl From<CpuId> for Affinity {
    fn from(cpu: CpuId) -> Self {
        Self::Cpu(cpu)
    }
}

/// Position of a queued request within one pool or semaphore.
///
/// Tickets are handed out in increasing order per structure and are used to
/// cancel a request that is still waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Into)]
#[display("ticket-{_0}")]
pub struct Ticket(u64);

impl Ticket {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Set of logical CPUs
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CpuMask {
    words: Vec<u64>,
}

impl CpuMask {
    /// Empty mask
    #[must_use]
    pub const fn empty() -> Self {
        Self { words: Vec::new() }
    }

    /// Mask containing CPUs `0..count`
    #[must_use]
    pub fn first(count: usize) -> Self {
        let mut mask = Self::empty();
        for cpu in 0..count {
            mask.insert(cpu);
        }
        mask
    }

    /// Mask containing a single CPU
    #[must_use]
    pub fn single(cpu: CpuId) -> Self {
        let mut mask = Self::empty();
        mask.insert(cpu);
        mask
    }

    /// Add a CPU to the mask
    pub fn insert(&mut self, cpu: CpuId) {
        let word = cpu / 64;
        if self.words.len() <= word {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << (cpu % 64);
    }

    /// Remove a CPU from the mask
    pub fn remove(&mut self, cpu: CpuId) {
        if let Some(word) = self.words.get_mut(cpu / 64) {
            *word &= !(1u64 << (cpu % 64));
        }
    }

    #[must_use]
    pub fn contains(&self, cpu: CpuId) -> bool {
        self.words
            .get(cpu / 64)
            .is_some_and(|word| word & (1u64 << (cpu % 64)) != 0)
    }

    /// True if the two masks share at least one CPU
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .any(|(a, b)| a & b != 0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|word| *word == 0)
    }

    /// Number of CPUs in the mask
    #[must_use]
    pub fn len(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }

    /// CPUs in ascending order
    pub fn iter(&self) -> impl Iterator<Item = CpuId> + '_ {
        self.words.iter().enumerate().flat_map(|(idx, word)| {
            (0..64usize).filter_map(move |bit| (word & (1u64 << bit) != 0).then_some(idx * 64 + bit))
        })
    }
}

impl FromIterator<CpuId> for CpuMask {
    fn from_iter<I: IntoIterator<Item = CpuId>>(iter: I) -> Self {
        let mut mask = Self::empty();
        for cpu in iter {
            mask.insert(cpu);
        }
        mask
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
