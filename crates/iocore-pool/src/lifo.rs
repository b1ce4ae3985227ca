//! Single-linked LIFO list of owned nodes
//!
//! A node is a `Box<Node<T>>` whose forward link is itself an owned box. A
//! node therefore sits on at most one list at a time and can never link to
//! itself: pushing it moves the box into the list, popping moves it back out
//! with the link cleared. No locking happens here; [`crate::locked`] adds it.

use std::fmt;
use std::ops::{Deref, DerefMut};

/// A pooled object together with its free-list link
pub struct Node<T> {
    value: T,
    next: Option<Box<Node<T>>>,
}

/// A node owned by the caller (not on any list)
pub type Pooled<T> = Box<Node<T>>;

impl<T> Node<T> {
    /// Allocate a node; this is the only allocation a pooled object ever makes
    pub fn new(value: T) -> Pooled<T> {
        Box::new(Self { value, next: None })
    }

    /// Take the value out, consuming the node
    pub fn into_inner(node: Pooled<T>) -> T {
        debug_assert!(node.next.is_none(), "unlinked node still has a successor");
        node.value
    }

    /// True while the node is threaded into a list
    #[must_use]
    pub const fn is_linked(&self) -> bool {
        self.next.is_some()
    }
}

impl<T> Deref for Node<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for Node<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: fmt::Debug> fmt::Debug for Node<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("value", &self.value)
            .field("linked", &self.is_linked())
            .finish()
    }
}

/// Head-only LIFO list
pub struct LifoList<T> {
    head: Option<Box<Node<T>>>,
    len: usize,
}

impl<T> LifoList<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Push one node at the head
    pub fn push_head(&mut self, mut node: Pooled<T>) {
        assert!(node.next.is_none(), "node pushed while still linked");
        node.next = self.head.take();
        self.head = Some(node);
        self.len += 1;
    }

    /// Splice a whole list in front of this one, keeping its order
    pub fn push_list(&mut self, other: Self) {
        let mut reversed = other.reversed();
        while let Some(node) = reversed.pop_head() {
            self.push_head(node);
        }
    }

    /// Pop the head node, clearing its link
    pub fn pop_head(&mut self) -> Option<Pooled<T>> {
        let mut node = self.head.take()?;
        self.head = node.next.take();
        assert!(self.len > 0, "free list count underflow");
        self.len -= 1;
        debug_assert_eq!(self.len == 0, self.head.is_none());
        Some(node)
    }

    /// Move up to `n` nodes onto the head of `dest`; returns how many moved.
    ///
    /// Nodes arrive in `dest` in reverse order, which is irrelevant for free
    /// lists.
    pub fn pop_into(&mut self, dest: &mut Self, n: usize) -> usize {
        let mut moved = 0;
        while moved < n {
            let Some(node) = self.pop_head() else {
                break;
            };
            dest.push_head(node);
            moved += 1;
        }
        moved
    }

    /// Unlink and return the first node matching `pred`
    pub fn remove_first(&mut self, mut pred: impl FnMut(&T) -> bool) -> Option<Pooled<T>> {
        let mut skipped = Self::new();
        let mut found = None;
        while let Some(node) = self.pop_head() {
            if pred(&node.value) {
                found = Some(node);
                break;
            }
            skipped.push_head(node);
        }
        // skipped holds the prefix reversed; pushing back node by node
        // restores the original order
        while let Some(node) = skipped.pop_head() {
            self.push_head(node);
        }
        found
    }

    /// Unlink every node matching `pred`; both lists keep their relative order
    pub fn remove_if(&mut self, mut pred: impl FnMut(&T) -> bool) -> Self {
        let mut kept = Self::new();
        let mut removed = Self::new();
        while let Some(node) = self.pop_head() {
            if pred(&node.value) {
                removed.push_head(node);
            } else {
                kept.push_head(node);
            }
        }
        while let Some(node) = kept.pop_head() {
            self.push_head(node);
        }
        removed.reversed()
    }

    /// Same nodes, opposite order
    #[must_use]
    pub fn reversed(mut self) -> Self {
        let mut out = Self::new();
        while let Some(node) = self.pop_head() {
            out.push_head(node);
        }
        out
    }

    /// Iterate values from head to tail
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            next: self.head.as_deref(),
        }
    }
}

impl<T> Default for LifoList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for LifoList<T> {
    fn drop(&mut self) {
        // Unlink iteratively; the default recursive drop would blow the
        // stack on long lists.
        let mut cur = self.head.take();
        while let Some(mut node) = cur {
            cur = node.next.take();
        }
    }
}

impl<T> FromIterator<Pooled<T>> for LifoList<T> {
    fn from_iter<I: IntoIterator<Item = Pooled<T>>>(iter: I) -> Self {
        let mut list = Self::new();
        for node in iter {
            list.push_head(node);
        }
        list
    }
}

impl<T> Iterator for LifoList<T> {
    type Item = Pooled<T>;

    fn next(&mut self) -> Option<Pooled<T>> {
        self.pop_head()
    }
}

impl<T: fmt::Debug> fmt::Debug for LifoList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Borrowing iterator over a [`LifoList`]
pub struct Iter<'a, T> {
    next: Option<&'a Node<T>>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        let node = self.next?;
        self.next = node.next.as_deref();
        Some(&node.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_of(values: &[u32]) -> LifoList<u32> {
        // push in reverse so the list reads in slice order
        values.iter().rev().map(|v| Node::new(*v)).collect()
    }

    #[test]
    fn test_push_pop_round_trip() {
        let mut list = LifoList::new();
        list.push_head(Node::new(7u32));
        let node = list.pop_head().unwrap();
        assert_eq!(**node, 7);
        assert!(!node.is_linked());
        assert!(list.is_empty());
        assert!(list.pop_head().is_none());
    }

    #[test]
    fn test_lifo_order() {
        let mut list = LifoList::new();
        for v in 0..4u32 {
            list.push_head(Node::new(v));
        }
        assert_eq!(list.len(), 4);
        let order: Vec<u32> = list.by_ref().map(Node::into_inner).collect();
        assert_eq!(order, vec![3, 2, 1, 0]);
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn test_push_list_keeps_order() {
        let mut list = list_of(&[10, 11]);
        list.push_list(list_of(&[1, 2, 3]));
        assert_eq!(list.len(), 5);
        assert_eq!(list.iter().copied().collect::<Vec<_>>(), vec![1, 2, 3, 10, 11]);

        list.push_list(LifoList::new());
        assert_eq!(list.len(), 5);
    }

    #[test]
    fn test_pop_into() {
        let mut list = list_of(&[1, 2, 3, 4]);
        let mut dest = LifoList::new();
        assert_eq!(list.pop_into(&mut dest, 3), 3);
        assert_eq!(list.len(), 1);
        assert_eq!(dest.iter().copied().collect::<Vec<_>>(), vec![3, 2, 1]);
        assert_eq!(list.pop_into(&mut dest, 10), 1);
        assert_eq!(dest.len(), 4);
    }

    #[test]
    fn test_remove_first() {
        let mut list = list_of(&[1, 2, 3, 2]);
        let node = list.remove_first(|v| *v == 2).unwrap();
        assert_eq!(**node, 2);
        assert!(!node.is_linked());
        assert_eq!(list.iter().copied().collect::<Vec<_>>(), vec![1, 3, 2]);
        assert!(list.remove_first(|v| *v == 9).is_none());
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_remove_if() {
        let mut list = list_of(&[1, 2, 3, 4, 5, 6]);
        let evens = list.remove_if(|v| v % 2 == 0);
        assert_eq!(evens.iter().copied().collect::<Vec<_>>(), vec![2, 4, 6]);
        assert_eq!(list.iter().copied().collect::<Vec<_>>(), vec![1, 3, 5]);
        assert_eq!(evens.len() + list.len(), 6);
    }

    #[test]
    #[should_panic(expected = "still linked")]
    fn test_push_linked_node_panics() {
        let mut node = Node::new(1u32);
        node.next = Some(Node::new(2u32));
        let mut list = LifoList::new();
        list.push_head(node);
    }

    #[test]
    fn test_long_list_drop() {
        let list: LifoList<u64> = (0..200_000u64).map(Node::new).collect();
        assert_eq!(list.len(), 200_000);
        drop(list);
    }
}
