//! Free list guarded by a single lock
//!
//! One [`LifoList`] behind a `parking_lot` mutex, with a mirrored element
//! count for lock-free peeks and a counter of lock acquisitions so tests and
//! benches can see which partitions a workload actually touched.

use crate::lifo::{LifoList, Pooled};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Free list of pooled nodes behind one lock
pub struct LockedFreeList<T> {
    list: Mutex<LifoList<T>>,
    /// Copy of `list.len()`, written under the lock
    len: AtomicUsize,
    acquisitions: AtomicU64,
}

impl<T> LockedFreeList<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            list: Mutex::new(LifoList::new()),
            len: AtomicUsize::new(0),
            acquisitions: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LifoList<T>> {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.list.lock()
    }

    fn publish_len(&self, list: &LifoList<T>) {
        debug_assert_eq!(list.len() == 0, list.is_empty(), "count disagrees with emptiness");
        self.len.store(list.len(), Ordering::Release);
    }

    /// Add one node at the head
    pub fn add_head(&self, node: Pooled<T>) {
        let mut list = self.lock();
        list.push_head(node);
        self.publish_len(&list);
    }

    /// Add a batch of nodes at the head
    pub fn add_list(&self, nodes: LifoList<T>) {
        if nodes.is_empty() {
            return;
        }
        let mut list = self.lock();
        list.push_list(nodes);
        self.publish_len(&list);
    }

    /// Take the head node; `None` when empty, never blocks waiting for one
    pub fn remove_head(&self) -> Option<Pooled<T>> {
        // Skip the lock entirely when the list looks empty
        if self.len.load(Ordering::Acquire) == 0 {
            return None;
        }
        let mut list = self.lock();
        let node = list.pop_head();
        self.publish_len(&list);
        node
    }

    /// Move up to `n` nodes into `dest`; returns how many moved
    pub fn remove_head_n(&self, dest: &mut LifoList<T>, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        let mut list = self.lock();
        let moved = list.pop_into(dest, n);
        self.publish_len(&list);
        moved
    }

    /// Unlink the first node matching `pred`
    pub fn remove(&self, pred: impl FnMut(&T) -> bool) -> Option<Pooled<T>> {
        let mut list = self.lock();
        let node = list.remove_first(pred);
        self.publish_len(&list);
        node
    }

    /// Unlink the first node equal to `value`
    pub fn remove_value(&self, value: &T) -> Option<Pooled<T>>
    where
        T: PartialEq,
    {
        self.remove(|candidate| candidate == value)
    }

    /// Unlink every node matching `pred`
    pub fn remove_if(&self, pred: impl FnMut(&T) -> bool) -> LifoList<T> {
        let mut list = self.lock();
        let removed = list.remove_if(pred);
        self.publish_len(&list);
        removed
    }

    /// Current number of free nodes (may be stale)
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of times this list's lock has been taken
    pub fn lock_acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }
}

impl<T> Default for LockedFreeList<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifo::Node;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_add_remove_round_trip() {
        let list = LockedFreeList::new();
        list.add_head(Node::new(42u32));
        assert_eq!(list.len(), 1);
        assert_eq!(Node::into_inner(list.remove_head().unwrap()), 42);
        assert!(list.remove_head().is_none());
        assert!(list.is_empty());
    }

    #[test]
    fn test_empty_remove_skips_lock() {
        let list: LockedFreeList<u32> = LockedFreeList::new();
        assert!(list.remove_head().is_none());
        assert_eq!(list.lock_acquisitions(), 0);
    }

    #[test]
    fn test_bulk_operations() {
        let list = LockedFreeList::new();
        list.add_list((0..5u32).map(Node::new).collect());
        assert_eq!(list.len(), 5);

        let mut batch = LifoList::new();
        assert_eq!(list.remove_head_n(&mut batch, 3), 3);
        assert_eq!(list.len(), 2);
        assert_eq!(batch.len(), 3);
        assert_eq!(list.remove_head_n(&mut batch, 0), 0);

        list.add_list(batch);
        assert_eq!(list.len(), 5);
    }

    #[test]
    fn test_remove_by_identity() {
        let list = LockedFreeList::new();
        for v in [1u32, 2, 3, 4] {
            list.add_head(Node::new(v));
        }
        assert!(list.remove_value(&3).is_some());
        assert!(list.remove_value(&3).is_none());
        assert_eq!(list.len(), 3);

        let odd = list.remove_if(|v| v % 2 == 1);
        assert_eq!(odd.len(), 1);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_concurrent_conservation() {
        let list = Arc::new(LockedFreeList::new());
        for v in 0..64u32 {
            list.add_head(Node::new(v));
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let list = Arc::clone(&list);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        if let Some(node) = list.remove_head() {
                            list.add_head(node);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(list.len(), 64);
        let mut seen: Vec<u32> = std::iter::from_fn(|| list.remove_head())
            .map(Node::into_inner)
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..64).collect::<Vec<_>>());
    }
}
