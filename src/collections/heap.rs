// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! A binary min-heap with O(log n) `push`/`peek`/`pop`/`delete`.
//!
//! `delete` needs to locate an arbitrary element in O(log n), which a plain
//! array-backed heap cannot do. We keep a secondary index from item identity
//! to its current array position, maintained on every swap, exactly as the
//! scheduler's timer queue needs for [`crate::scheduler::Scheduler::cancel_timer`].

use std::collections::HashMap;
use std::hash::Hash;

//==============================================================================
// Structures
//==============================================================================

/// A min-heap over `T`, ordered by `Ord`, indexed by `K` for O(log n) delete.
///
/// Pushing a key already present is a no-op (idempotent) so the identity
/// index stays well-defined; callers that need multiset semantics (e.g. the
/// scheduler, whose keys are unique timer records) are unaffected.
pub struct IndexedHeap<K, T> {
    items: Vec<(K, T)>,
    positions: HashMap<K, usize>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl<K, T> IndexedHeap<K, T>
where
    K: Eq + Hash + Clone,
    T: Ord,
{
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            positions: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.positions.contains_key(key)
    }

    /// Inserts `item` under `key`. A no-op if `key` is already present.
    pub fn push(&mut self, key: K, item: T) {
        if self.positions.contains_key(&key) {
            return;
        }
        let idx = self.items.len();
        self.positions.insert(key.clone(), idx);
        self.items.push((key, item));
        self.sift_up(idx);
    }

    /// Returns the minimum item without removing it.
    pub fn peek(&self) -> Option<&T> {
        self.items.first().map(|(_, v)| v)
    }

    pub fn peek_key(&self) -> Option<&K> {
        self.items.first().map(|(k, _)| k)
    }

    /// Removes and returns the minimum item.
    pub fn pop(&mut self) -> Option<(K, T)> {
        if self.items.is_empty() {
            return None;
        }
        let last = self.items.len() - 1;
        self.items.swap(0, last);
        let (key, item) = self.items.pop().unwrap();
        self.positions.remove(&key);
        if !self.items.is_empty() {
            self.fix_position(0);
            self.sift_down(0);
        }
        Some((key, item))
    }

    /// Removes an arbitrary item by key, wherever it sits in the heap.
    pub fn delete(&mut self, key: &K) -> Option<T> {
        let idx = *self.positions.get(key)?;
        let last = self.items.len() - 1;
        self.items.swap(idx, last);
        let (removed_key, removed_item) = self.items.pop().unwrap();
        debug_assert_eq!(&removed_key, key);
        self.positions.remove(key);
        if idx < self.items.len() {
            self.fix_position(idx);
            // the element swapped into `idx` may need to move either way
            let parent_ok = idx == 0 || self.items[parent(idx)].1 <= self.items[idx].1;
            if parent_ok {
                self.sift_down(idx);
            } else {
                self.sift_up(idx);
            }
        }
        Some(removed_item)
    }

    fn fix_position(&mut self, idx: usize) {
        let key = self.items[idx].0.clone();
        self.positions.insert(key, idx);
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let p = parent(idx);
            if self.items[p].1 <= self.items[idx].1 {
                break;
            }
            self.items.swap(p, idx);
            self.fix_position(p);
            self.fix_position(idx);
            idx = p;
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        let len = self.items.len();
        loop {
            let (l, r) = (left(idx), right(idx));
            let mut smallest = idx;
            if l < len && self.items[l].1 < self.items[smallest].1 {
                smallest = l;
            }
            if r < len && self.items[r].1 < self.items[smallest].1 {
                smallest = r;
            }
            if smallest == idx {
                break;
            }
            self.items.swap(idx, smallest);
            self.fix_position(idx);
            self.fix_position(smallest);
            idx = smallest;
        }
    }
}

impl<K, T> Default for IndexedHeap<K, T>
where
    K: Eq + Hash + Clone,
    T: Ord,
{
    fn default() -> Self {
        Self::new()
    }
}

fn parent(i: usize) -> usize {
    (i - 1) / 2
}
fn left(i: usize) -> usize {
    2 * i + 1
}
fn right(i: usize) -> usize {
    2 * i + 2
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_non_decreasing_order() {
        let mut h: IndexedHeap<u32, u32> = IndexedHeap::new();
        for (k, v) in [(1, 5), (2, 1), (3, 3), (4, 4), (5, 2)] {
            h.push(k, v);
        }
        let mut out = Vec::new();
        while let Some((_, v)) = h.pop() {
            out.push(v);
        }
        assert_eq!(out, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn delete_removes_arbitrary_item_and_preserves_order() {
        let mut h: IndexedHeap<u32, u32> = IndexedHeap::new();
        for (k, v) in [(1, 5), (2, 1), (3, 3), (4, 4), (5, 2)] {
            h.push(k, v);
        }
        assert_eq!(h.delete(&3), Some(3));
        assert!(!h.contains(&3));
        let mut out = Vec::new();
        while let Some((_, v)) = h.pop() {
            out.push(v);
        }
        assert_eq!(out, vec![1, 2, 4, 5]);
    }

    #[test]
    fn push_is_idempotent_on_duplicate_key() {
        let mut h: IndexedHeap<u32, u32> = IndexedHeap::new();
        h.push(1, 10);
        h.push(1, 999); // ignored, key 1 already present
        assert_eq!(h.len(), 1);
        assert_eq!(h.peek(), Some(&10));
    }

    #[test]
    fn delete_of_minimum_is_same_as_pop() {
        let mut h: IndexedHeap<u32, u32> = IndexedHeap::new();
        for (k, v) in [(1, 1), (2, 2), (3, 3)] {
            h.push(k, v);
        }
        assert_eq!(h.delete(&1), Some(1));
        assert_eq!(h.peek(), Some(&2));
    }
}
