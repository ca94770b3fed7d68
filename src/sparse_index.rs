// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The sparse index: an ordered map from the minimum key of each non-empty
//! segment to its segment id.
//!
//! Spec treats this as an external collaborator and only specifies the
//! interface the core consumes (`find`/`insert`/`remove`/`rebuild_from`).
//! The teacher crate does the same thing for its own out-of-core
//! collaborator, the value log: `Config`/`AbstractTree` only ever touch it
//! through a narrow surface (`src/vlog.rs`), never reaching into its
//! internals. We follow that shape here: [`SparseIndex`] is the trait the
//! rest of the crate is written against, and [`BTreeSparseIndex`] is one
//! concrete, in-crate implementation of it (a thin `BTreeMap` wrapper)
//! supplied so the crate builds and runs end-to-end.

use std::collections::BTreeMap;
use std::sync::RwLock;

/// Ordered mapping from a segment's minimum live key to its id.
///
/// Implementations must make point inserts/removes and predecessor
/// lookups individually atomic (spec §5); they need not provide any
/// stronger cross-call consistency.
pub trait SparseIndex: Send + Sync {
    /// Returns the id of the segment most likely to contain `key`: the
    /// segment owning the largest pivot `<= key`, or the very first
    /// segment if `key` precedes every pivot.
    fn find(&self, key: i64) -> Option<u32>;

    /// Registers `segment_id` as owning pivot `key`.
    fn insert(&self, key: i64, segment_id: u32);

    /// Removes the pivot entry for `key`, if present.
    fn remove(&self, key: i64);

    /// Atomically replaces every pivot in `[min_key, max_key]` with the
    /// given `(pivot, segment_id)` pairs. Used after a rebalance
    /// re-partitions a window: the old pivots for the window's segments
    /// are no longer valid and must be replaced together.
    fn rebuild_window(&self, min_key: i64, max_key: i64, pairs: &[(i64, u32)]);

    /// Number of registered pivots.
    fn len(&self) -> usize;

    /// Whether the index has no registered pivots.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Reference [`SparseIndex`] implementation backed by a `BTreeMap` behind
/// a single `RwLock`. Sized for correctness and simplicity, not for
/// lock-free scalability — exactly the scope the baseline RMA's actual
/// sparse-index crate is out of scope for here (spec §1).
#[derive(Default)]
pub struct BTreeSparseIndex {
    pivots: RwLock<BTreeMap<i64, u32>>,
}

impl BTreeSparseIndex {
    /// Creates an empty sparse index.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SparseIndex for BTreeSparseIndex {
    fn find(&self, key: i64) -> Option<u32> {
        let pivots = self.pivots.read().expect("sparse index lock poisoned");
        pivots
            .range(..=key)
            .next_back()
            .map(|(_, &segment_id)| segment_id)
            .or_else(|| pivots.iter().next().map(|(_, &segment_id)| segment_id))
    }

    fn insert(&self, key: i64, segment_id: u32) {
        self.pivots
            .write()
            .expect("sparse index lock poisoned")
            .insert(key, segment_id);
    }

    fn remove(&self, key: i64) {
        self.pivots
            .write()
            .expect("sparse index lock poisoned")
            .remove(&key);
    }

    fn rebuild_window(&self, min_key: i64, max_key: i64, pairs: &[(i64, u32)]) {
        let mut pivots = self.pivots.write().expect("sparse index lock poisoned");
        let stale: Vec<i64> = pivots.range(min_key..=max_key).map(|(&k, _)| k).collect();
        for key in stale {
            pivots.remove(&key);
        }
        for &(key, segment_id) in pairs {
            pivots.insert(key, segment_id);
        }
    }

    fn len(&self) -> usize {
        self.pivots.read().expect("sparse index lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn find_returns_predecessor_segment() {
        let index = BTreeSparseIndex::new();
        index.insert(10, 0);
        index.insert(20, 1);
        index.insert(30, 2);

        assert_eq!(index.find(5), Some(0), "below every pivot falls back to the first segment");
        assert_eq!(index.find(10), Some(0));
        assert_eq!(index.find(15), Some(0));
        assert_eq!(index.find(20), Some(1));
        assert_eq!(index.find(100), Some(2));
    }

    #[test]
    fn rebuild_window_replaces_stale_pivots_atomically() {
        let index = BTreeSparseIndex::new();
        index.insert(0, 0);
        index.insert(10, 1);
        index.insert(20, 2);

        index.rebuild_window(0, 20, &[(0, 0), (7, 1), (14, 2)]);

        assert_eq!(index.find(3), Some(0));
        assert_eq!(index.find(10), Some(1));
        assert_eq!(index.find(14), Some(2));
        assert_eq!(index.len(), 3);
    }
}
