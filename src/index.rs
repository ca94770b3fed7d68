// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The public, concurrent ordered index: wires [`Storage`], the
//! [`GateTable`], the [`Calibrator`], and a [`SparseIndex`] together
//! behind the top-level operations (spec §4.5).

use crate::binary_search::partition_point;
use crate::calibrator::Calibrator;
use crate::config::Config;
use crate::error::Result;
use crate::gate::GateTable;
use crate::rebalance::{self, Outcome};
use crate::sparse_index::{BTreeSparseIndex, SparseIndex};
use crate::storage::Storage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// A concurrent, self-balancing ordered index over `i64` keys.
///
/// Every method takes `&self`; wrap an `Index` in [`std::sync::Arc`] to
/// share it across threads. Internally, a coarse [`RwLock`] around
/// storage and the gate table provides the "quiescent barrier" a resize
/// needs (spec §5): ordinary operations take the read side, so a resize
/// only has to wait for in-flight point operations to finish, never the
/// other way around.
pub struct Index {
    storage: RwLock<Storage>,
    gates: RwLock<GateTable>,
    sparse_index: Box<dyn SparseIndex>,
    calibrator: Calibrator,
    total: AtomicU64,
    rebalance_workers: usize,
}

impl Index {
    /// Builds a new, empty index from a [`Config`], using the in-crate
    /// [`BTreeSparseIndex`] as its sparse index.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidConfig`] or [`crate::Error::OutOfMemory`]
    /// per [`Config::validated`] and [`Storage::new`].
    pub fn new(config: Config) -> Result<Self> {
        Self::with_sparse_index(config, Box::new(BTreeSparseIndex::new()))
    }

    /// Builds a new, empty index from a [`Config`] and a caller-supplied
    /// [`SparseIndex`] implementation.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidConfig`] or [`crate::Error::OutOfMemory`]
    /// per [`Config::validated`] and [`Storage::new`].
    pub fn with_sparse_index(config: Config, sparse_index: Box<dyn SparseIndex>) -> Result<Self> {
        let config = config.validated()?;
        let segments_per_lock = config.segments_per_lock;
        let rebalance_workers = config.rebalance_workers;
        let thresholds = config.thresholds.expect("validated() fills thresholds");

        let storage = Storage::new(config.segment_size, config.pages_per_extent, config.initial_segments)?;
        let segment_capacity = storage.segment_capacity();
        let gates = GateTable::new(segments_per_lock, storage.num_segments(), |start, len| {
            (start..start + len).map(|s| u64::from(storage.size(s))).sum()
        });

        Ok(Self {
            storage: RwLock::new(storage),
            gates: RwLock::new(gates),
            sparse_index,
            calibrator: Calibrator::new(segment_capacity, thresholds, segments_per_lock),
            total: AtomicU64::new(0),
            rebalance_workers,
        })
    }

    /// Looks up `key`, acquiring its segment's gate in `Read` mode.
    pub fn find(&self, key: i64) -> Option<i64> {
        loop {
            let segment_id = self.sparse_index.find(key)?;
            let storage = self.storage.read().expect("storage lock poisoned");
            if segment_id >= storage.num_segments() {
                continue;
            }
            let gates = self.gates.read().expect("gate table lock poisoned");
            let _read_guard = gates.gate_for_segment(segment_id).acquire_read();

            let (keys, values) = storage.segment_live(segment_id);
            let pos = partition_point(keys, |&k| k < key);
            return if pos < keys.len() && keys[pos] == key {
                Some(values[pos])
            } else {
                None
            };
        }
    }

    /// Inserts `(key, value)`, rebalancing as many times as necessary if
    /// the target segment is full (spec §4.5).
    pub fn insert(&self, key: i64, value: i64) {
        loop {
            let segment_id = self.sparse_index.find(key).unwrap_or(0);

            let needs_rebalance = {
                let storage = self.storage.read().expect("storage lock poisoned");
                if segment_id >= storage.num_segments() {
                    continue;
                }
                let gates = self.gates.read().expect("gate table lock poisoned");
                let write_guard = gates.gate_for_segment(segment_id).acquire_write();

                let capacity = storage.segment_capacity() as usize;
                let size = storage.size(segment_id) as usize;
                if size == capacity {
                    true
                } else {
                    let (keys, _) = storage.segment_live(segment_id);
                    let local_pos = partition_point(keys, |&k| k < key);
                    let old_min = (size > 0).then(|| storage.segment_min(segment_id));

                    // SAFETY: `write_guard` grants exclusive access to this
                    // segment, and `size < capacity` was just checked.
                    unsafe { shift_insert(&storage, segment_id, local_pos, key, value) };
                    write_guard.adjust_cardinality(1);
                    self.total.fetch_add(1, Ordering::AcqRel);

                    if local_pos == 0 {
                        if let Some(old_min) = old_min {
                            if old_min != key {
                                self.sparse_index.remove(old_min);
                            }
                        }
                        self.sparse_index.insert(key, segment_id);
                    }
                    false
                }
            };

            if needs_rebalance {
                self.drive_rebalance(segment_id, true);
                continue;
            }
            return;
        }
    }

    /// Removes `key`, returning its value if present. Underflow triggers
    /// a rebalance only when the segment's density drops below the leaf
    /// bound (spec §4.5).
    pub fn remove(&self, key: i64) -> Option<i64> {
        loop {
            let segment_id = self.sparse_index.find(key)?;

            let outcome = {
                let storage = self.storage.read().expect("storage lock poisoned");
                if segment_id >= storage.num_segments() {
                    continue;
                }
                let gates = self.gates.read().expect("gate table lock poisoned");
                let write_guard = gates.gate_for_segment(segment_id).acquire_write();

                let (keys, _) = storage.segment_live(segment_id);
                let local_pos = partition_point(keys, |&k| k < key);
                if local_pos >= keys.len() || keys[local_pos] != key {
                    return None;
                }
                let was_min = local_pos == 0;

                // SAFETY: `write_guard` grants exclusive access to this
                // segment, and `local_pos` was just verified in range.
                let removed_value = unsafe { shift_remove(&storage, segment_id, local_pos) };
                write_guard.adjust_cardinality(-1);
                self.total.fetch_sub(1, Ordering::AcqRel);

                let new_size = storage.size(segment_id);
                if was_min {
                    self.sparse_index.remove(key);
                    if new_size > 0 {
                        self.sparse_index.insert(storage.segment_min(segment_id), segment_id);
                    }
                }

                let underflow =
                    f64::from(new_size) < self.calibrator.leaf_lower_bound() * storage.segment_capacity() as f64;
                (removed_value, underflow)
            };

            let (value, needs_rebalance) = outcome;
            if needs_rebalance {
                self.drive_rebalance(segment_id, false);
            }
            return Some(value);
        }
    }

    /// Walks the sorted key range `[lo, hi]`, invoking `visitor(k, v)` for
    /// every live pair in order. `visitor` returns `false` to stop the scan
    /// early. Re-resolves the scan position via the sparse index if a gate
    /// is found to reference a segment id that no longer exists (a resize
    /// raced with the scan).
    pub fn range_scan(&self, lo: i64, hi: i64, mut visitor: impl FnMut(i64, i64) -> bool) {
        if lo > hi {
            return;
        }
        let Some(mut segment_id) = self.sparse_index.find(lo) else {
            return;
        };
        let mut cursor = lo;

        loop {
            let storage = self.storage.read().expect("storage lock poisoned");
            if segment_id >= storage.num_segments() {
                drop(storage);
                match self.sparse_index.find(cursor) {
                    Some(id) => {
                        segment_id = id;
                        continue;
                    }
                    None => return,
                }
            }

            let gates = self.gates.read().expect("gate table lock poisoned");
            let _read_guard = gates.gate_for_segment(segment_id).acquire_read();
            let (keys, values) = storage.segment_live(segment_id);
            let start = partition_point(keys, |&k| k < cursor);

            let mut reached_hi = false;
            for i in start..keys.len() {
                if keys[i] > hi {
                    reached_hi = true;
                    break;
                }
                if !visitor(keys[i], values[i]) {
                    return;
                }
                cursor = keys[i] + 1;
                if keys[i] == hi {
                    reached_hi = true;
                    break;
                }
            }
            if reached_hi {
                return;
            }

            segment_id += 1;
            if segment_id >= storage.num_segments() {
                return;
            }
        }
    }

    /// Total number of live key/value pairs.
    pub fn size(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    /// Total bytes currently backing the three segmented arrays.
    pub fn memory_footprint(&self) -> u64 {
        self.storage.read().expect("storage lock poisoned").memory_footprint()
    }

    /// Writes every live key/value pair, in order, as `key\tvalue` lines.
    /// Not a stable format; intended for debugging and tests (spec §9).
    pub fn dump(&self, mut sink: impl std::io::Write) -> std::io::Result<()> {
        let storage = self.storage.read().expect("storage lock poisoned");
        for id in 0..storage.num_segments() {
            let (keys, values) = storage.segment_live(id);
            for (k, v) in keys.iter().zip(values.iter()) {
                writeln!(sink, "{k}\t{v}")?;
            }
        }
        Ok(())
    }

    /// Drives one triggering segment through rebalance, resizing storage
    /// first if the calibrator walked off the root on overflow.
    fn drive_rebalance(&self, segment_id: u32, overflow: bool) {
        let outcome = {
            let storage = self.storage.read().expect("storage lock poisoned");
            let gates = self.gates.read().expect("gate table lock poisoned");
            if segment_id >= storage.num_segments() {
                return;
            }
            rebalance::rebalance_segment(
                &storage,
                &gates,
                self.sparse_index.as_ref(),
                &self.calibrator,
                segment_id,
                overflow,
                self.rebalance_workers,
            )
        };

        if let Outcome::NeedsResize = outcome {
            let mut storage = self.storage.write().expect("storage lock poisoned");
            let mut gates = self.gates.write().expect("gate table lock poisoned");
            rebalance::resize_and_redistribute(&mut storage, &mut gates, self.sparse_index.as_ref(), self.rebalance_workers)
                .expect("resize failure is fatal to the instance");
        }
    }
}

/// # Safety
///
/// Caller must hold exclusive (`Write`) access to `segment_id` and must
/// have verified `storage.size(segment_id) < storage.segment_capacity()`.
unsafe fn shift_insert(storage: &Storage, segment_id: u32, local_pos: usize, key: i64, value: i64) {
    let size = storage.size(segment_id) as usize;
    let (keys, values) = storage.segment_slot_mut(segment_id);
    let c = keys.len();
    if segment_id % 2 == 0 {
        let live_start = c - size;
        let new_live_start = live_start - 1;
        for j in 0..local_pos {
            keys[new_live_start + j] = keys[live_start + j];
            values[new_live_start + j] = values[live_start + j];
        }
        keys[new_live_start + local_pos] = key;
        values[new_live_start + local_pos] = value;
    } else {
        for j in (local_pos..size).rev() {
            keys[j + 1] = keys[j];
            values[j + 1] = values[j];
        }
        keys[local_pos] = key;
        values[local_pos] = value;
    }
    storage.set_size(segment_id, (size + 1) as u16);
}

/// # Safety
///
/// Caller must hold exclusive (`Write`) access to `segment_id` and must
/// have verified `local_pos < storage.size(segment_id)`.
unsafe fn shift_remove(storage: &Storage, segment_id: u32, local_pos: usize) -> i64 {
    let size = storage.size(segment_id) as usize;
    let (keys, values) = storage.segment_slot_mut(segment_id);
    let c = keys.len();
    let removed_value;
    if segment_id % 2 == 0 {
        let live_start = c - size;
        removed_value = values[live_start + local_pos];
        for j in (0..local_pos).rev() {
            keys[live_start + 1 + j] = keys[live_start + j];
            values[live_start + 1 + j] = values[live_start + j];
        }
    } else {
        removed_value = values[local_pos];
        for j in local_pos..size - 1 {
            keys[j] = keys[j + 1];
            values[j] = values[j + 1];
        }
    }
    storage.set_size(segment_id, (size - 1) as u16);
    removed_value
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::collections::BTreeMap;
    use test_log::test;

    #[test]
    fn insert_find_remove_round_trip() {
        let index = Index::new(Config::new().segment_size(4).initial_segments(2)).unwrap();
        for k in [1, 3, 2, 4, 5, 6, 10, 11, 9] {
            index.insert(k, k * 10);
        }
        assert_eq!(index.size(), 9);
        assert_eq!(index.find(7), None);
        assert_eq!(index.find(10), Some(100));

        let mut seen = Vec::new();
        index.range_scan(i64::MIN, i64::MAX, |k, v| {
            seen.push((k, v));
            true
        });
        assert_eq!(
            seen,
            vec![(1, 10), (2, 20), (3, 30), (4, 40), (5, 50), (6, 60), (9, 90), (10, 100), (11, 110)]
        );

        for k in [1, 3, 2, 4, 5, 6, 10, 11, 9] {
            assert_eq!(index.remove(k), Some(k * 10));
        }
        assert_eq!(index.size(), 0);
        assert_eq!(index.find(1), None);
    }

    #[test]
    fn bulk_insert_triggers_resizes_and_stays_sorted() {
        let index = Index::new(Config::new().segment_size(64).initial_segments(1)).unwrap();
        for k in 1..=1024i64 {
            index.insert(k, k);
        }
        assert_eq!(index.size(), 1024);
        let mut seen = Vec::new();
        index.range_scan(i64::MIN, i64::MAX, |k, _| {
            seen.push(k);
            true
        });
        assert_eq!(seen, (1..=1024).collect::<Vec<_>>());
    }

    #[test]
    fn range_scan_respects_bounds() {
        let index = Index::new(Config::new().segment_size(16).initial_segments(1)).unwrap();
        for k in 1..=100i64 {
            index.insert(k, k);
        }
        let mut seen = Vec::new();
        index.range_scan(40, 45, |k, _| {
            seen.push(k);
            true
        });
        assert_eq!(seen, vec![40, 41, 42, 43, 44, 45]);
    }

    #[test]
    fn range_scan_stops_as_soon_as_the_visitor_returns_false() {
        let index = Index::new(Config::new().segment_size(16).initial_segments(1)).unwrap();
        for k in 1..=100i64 {
            index.insert(k, k);
        }
        let mut seen = Vec::new();
        index.range_scan(1, 100, |k, _| {
            seen.push(k);
            k < 5
        });
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    /// Drives `insert`/`remove`/`find` through a few thousand random
    /// operations against a `BTreeMap` oracle. After every operation a
    /// full scan must be sorted and agree with the oracle key-for-key
    /// (size conservation, round-trips), and every non-empty segment's
    /// minimum key must be the one pivot the sparse index resolves it by
    /// (index consistency).
    #[test]
    fn random_operations_match_a_btreemap_oracle() {
        let index = Index::new(Config::new().segment_size(8).initial_segments(2)).unwrap();
        let mut oracle: BTreeMap<i64, i64> = BTreeMap::new();
        let mut rng = rand::rng();

        for step in 0..5_000 {
            let key = rng.random_range(-500..=500);
            if oracle.contains_key(&key) && rng.random_bool(0.3) {
                let expected = oracle.remove(&key);
                assert_eq!(index.remove(key), expected, "step {step}: remove({key})");
            } else {
                let value = rng.random_range(i64::MIN..i64::MAX);
                oracle.insert(key, value);
                index.insert(key, value);
            }
            assert_eq!(index.find(key), oracle.get(&key).copied(), "step {step}: find({key})");
        }

        assert_eq!(index.size(), oracle.len() as u64, "size conservation");

        let mut seen = Vec::new();
        index.range_scan(i64::MIN, i64::MAX, |k, v| {
            seen.push((k, v));
            true
        });
        assert_eq!(seen, oracle.into_iter().collect::<Vec<_>>(), "sortedness and round-trips");

        let storage = index.storage.read().unwrap();
        let sparse_index = index.sparse_index.as_ref();
        for id in 0..storage.num_segments() {
            if storage.size(id) == 0 {
                continue;
            }
            let min_key = storage.segment_min(id);
            assert_eq!(
                sparse_index.find(min_key),
                Some(id),
                "segment {id}'s minimum key {min_key} must resolve back to it"
            );
        }
    }
}
