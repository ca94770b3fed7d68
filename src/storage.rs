// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Segmented storage: the three parallel arrays (`keys`, `values`,
//! per-segment `sizes`) the rest of the engine packs and redistributes.
//!
//! Grounded on `original_source/data_structures/rma/baseline/storage.cpp`
//! for exact layout arithmetic (`segment_min`, `height`, `hyperheight`,
//! `extend`'s extent accounting), reworked into safe-by-default Rust: raw
//! pointer access is confined to this module and [`crate::rewired`], every
//! public accessor is a checked, `&self`/`&mut self` method, and the two
//! backing strategies (OS-rewired vs. plain heap) are unified behind one
//! type instead of the six raw out-parameters `alloc_workspace` threaded
//! through in the original.

use crate::error::{Error, Result};
use crate::rewired::RewiredMemory;
use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// Smallest permitted segment capacity.
pub const MIN_SEGMENT_CAPACITY: u32 = 4;
/// Largest permitted segment capacity (bounded by the 16-bit cardinality counter).
pub const MAX_SEGMENT_CAPACITY: u32 = u16::MAX as u32;

fn os_page_size() -> usize {
    // SAFETY: `sysconf` with `_SC_PAGESIZE` has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    size.max(4096) as usize
}

fn ceil_div(n: usize, d: usize) -> usize {
    (n + d - 1) / d
}

/// A growable array of `T`, either a plain heap allocation or a view over
/// a [`RewiredMemory`] capability, chosen once at construction based on
/// how large the instance starts out.
enum Backing<T> {
    Heap { ptr: NonNull<T>, len: usize },
    Rewired(RewiredMemory),
}

impl<T: Copy + Default> Backing<T> {
    fn new_heap(len: usize) -> Result<Self> {
        let layout = Layout::array::<T>(len.max(1)).map_err(|_| Error::OutOfMemory)?;
        // SAFETY: `layout` has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw.cast::<T>()).ok_or(Error::OutOfMemory)?;
        Ok(Self::Heap { ptr, len })
    }

    fn new_rewired(pages_per_extent: u32, initial_extents: usize) -> Result<Self> {
        Ok(Self::Rewired(RewiredMemory::new(
            pages_per_extent,
            initial_extents,
        )?))
    }

    fn ptr(&self) -> *mut T {
        match self {
            Self::Heap { ptr, .. } => ptr.as_ptr(),
            Self::Rewired(mem) => mem.start_address().cast::<T>(),
        }
    }

    /// Total addressable elements in the current backing.
    fn capacity_elems(&self) -> usize {
        match self {
            Self::Heap { len, .. } => *len,
            Self::Rewired(mem) => {
                mem.allocated_extents() * mem.extent_bytes() / std::mem::size_of::<T>()
            }
        }
    }

    fn allocated_bytes(&self) -> usize {
        match self {
            Self::Heap { len, .. } => *len * std::mem::size_of::<T>(),
            Self::Rewired(mem) => mem.allocated_extents() * mem.extent_bytes(),
        }
    }

    /// Grows the backing to hold at least `new_len` elements.
    fn grow_to(&mut self, new_len: usize, pages_per_extent: u32) -> Result<()> {
        match self {
            Self::Heap { ptr, len } => {
                if new_len <= *len {
                    return Ok(());
                }
                let old_layout = Layout::array::<T>((*len).max(1)).map_err(|_| Error::OutOfMemory)?;
                let new_layout = Layout::array::<T>(new_len).map_err(|_| Error::OutOfMemory)?;
                // SAFETY: `ptr` was allocated with `old_layout` by `alloc_zeroed` above.
                let raw = unsafe {
                    alloc::realloc(ptr.as_ptr().cast::<u8>(), old_layout, new_layout.size())
                };
                let new_ptr = NonNull::new(raw.cast::<T>()).ok_or(Error::OutOfMemory)?;
                // SAFETY: the tail beyond the old length is freshly (re)allocated and
                // must be zeroed, matching the zero-initialized semantics new segment
                // slots are documented to have.
                unsafe {
                    new_ptr
                        .as_ptr()
                        .add(*len)
                        .write_bytes(0u8, new_len - *len);
                }
                *ptr = new_ptr;
                *len = new_len;
                Ok(())
            }
            Self::Rewired(mem) => {
                let extent_bytes = mem.extent_bytes();
                let elem_size = std::mem::size_of::<T>();
                let bytes_needed = new_len * elem_size;
                let extents_total = ceil_div(bytes_needed, extent_bytes);
                let extents_current = mem.allocated_extents();
                if extents_total > extents_current {
                    mem.extend(extents_total - extents_current)?;
                }
                let _ = pages_per_extent;
                Ok(())
            }
        }
    }
}

impl<T> Drop for Backing<T> {
    fn drop(&mut self) {
        if let Self::Heap { ptr, len } = self {
            if let Ok(layout) = Layout::array::<T>((*len).max(1)) {
                // SAFETY: `ptr`/`layout` match the allocation made in `new_heap`/`grow_to`.
                unsafe { alloc::dealloc(ptr.as_ptr().cast::<u8>(), layout) };
            }
        }
    }
}

// SAFETY: ownership of the backing's memory is exclusive to the `Storage`
// that holds it; cross-thread mutation is only ever done by the unique
// client that currently holds the covering gate.
unsafe impl<T> Send for Backing<T> {}
unsafe impl<T> Sync for Backing<T> {}

/// Owns the three parallel arrays (`keys`, `values`, per-segment `sizes`)
/// backing the packed memory array, plus the segment-layout arithmetic
/// that depends only on `segment_capacity` and the current segment count.
///
/// Mutation is only ever valid from within an active rebalancing task or
/// from the unique writer holding the covering gate in `Write` mode — see
/// the crate's concurrency docs. `Storage` itself performs no locking.
pub struct Storage {
    segment_capacity: u32,
    pages_per_extent: u32,
    num_segments: u32,
    keys: Backing<i64>,
    values: Backing<i64>,
    sizes: Backing<u16>,
}

impl Storage {
    /// Creates a new storage with `num_segments` segments (a power of two),
    /// each of capacity `segment_size` rounded up to a power of two in
    /// `[32, 65535]`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `segment_size` rounds past
    /// [`MAX_SEGMENT_CAPACITY`], if `pages_per_extent` is not a power of
    /// two, or if the resulting segment byte size does not divide the OS
    /// page size (a prerequisite for memory rewiring). Returns
    /// [`Error::OutOfMemory`] if the initial allocation fails.
    pub fn new(segment_size: u32, pages_per_extent: u32, num_segments: u32) -> Result<Self> {
        let segment_capacity = segment_size.max(MIN_SEGMENT_CAPACITY).next_power_of_two();
        if segment_capacity > MAX_SEGMENT_CAPACITY {
            return Err(Error::InvalidConfig(format!(
                "segment size too big: {segment_capacity} exceeds {MAX_SEGMENT_CAPACITY}"
            )));
        }
        if !pages_per_extent.is_power_of_two() {
            return Err(Error::InvalidConfig(
                "pages_per_extent must be a power of two".into(),
            ));
        }
        let page_size = os_page_size();
        let segment_bytes = segment_capacity as usize * std::mem::size_of::<i64>();
        if page_size % segment_bytes != 0 {
            return Err(Error::InvalidConfig(format!(
                "segment capacity ({segment_capacity} keys = {segment_bytes} bytes) must divide the page size ({page_size} bytes)"
            )));
        }

        let extent_bytes = pages_per_extent as usize * page_size;
        let elts_bytes = num_segments as usize * segment_bytes;
        let use_rewired = elts_bytes >= extent_bytes;
        let sizes_len = (num_segments as usize).max(2);

        let (keys, values, sizes) = if use_rewired {
            let elts_extents = ceil_div(elts_bytes, extent_bytes);
            let keys = Backing::new_rewired(pages_per_extent, elts_extents)?;
            let values = Backing::new_rewired(pages_per_extent, elts_extents)?;
            let sizes_bytes = sizes_len * std::mem::size_of::<u16>();
            let sizes_extents = ceil_div(sizes_bytes, extent_bytes).max(1);
            let sizes = Backing::new_rewired(pages_per_extent, sizes_extents)?;
            (keys, values, sizes)
        } else {
            let keys = Backing::new_heap(num_segments as usize * segment_capacity as usize)?;
            let values = Backing::new_heap(num_segments as usize * segment_capacity as usize)?;
            let sizes = Backing::new_heap(sizes_len)?;
            (keys, values, sizes)
        };

        log::debug!(
            "storage initialized: {num_segments} segments x {segment_capacity} capacity, rewired={use_rewired}"
        );

        Ok(Self {
            segment_capacity,
            pages_per_extent,
            num_segments,
            keys,
            values,
            sizes,
        })
    }

    /// Per-segment capacity `C`.
    pub fn segment_capacity(&self) -> u32 {
        self.segment_capacity
    }

    /// Current number of segments `N`.
    pub fn num_segments(&self) -> u32 {
        self.num_segments
    }

    /// `⌊log2(N)⌋ + 1`.
    pub fn height(&self) -> u32 {
        (31 - self.num_segments.max(1).leading_zeros()) + 1
    }

    /// `⌈log2(N)⌉ + 1`.
    pub fn hyperheight(&self) -> u32 {
        let n = self.num_segments.max(1);
        if n.is_power_of_two() {
            self.height()
        } else {
            self.height() + 1
        }
    }

    /// Total element capacity `N * C`.
    pub fn capacity(&self) -> u64 {
        self.num_segments as u64 * self.segment_capacity as u64
    }

    /// Segments worth of space a single extent can hold.
    pub fn segments_per_extent(&self) -> u32 {
        let page_size = os_page_size();
        let extent_bytes = self.pages_per_extent as usize * page_size;
        let segment_bytes = self.segment_capacity as usize * std::mem::size_of::<i64>();
        (extent_bytes / segment_bytes).max(1) as u32
    }

    /// Cardinality of segment `id`.
    pub fn size(&self, id: u32) -> u16 {
        debug_assert!(id < self.num_segments, "segment id out of range");
        // SAFETY: `id` is in bounds and `sizes` has at least `num_segments` elements.
        unsafe { *self.sizes.ptr().add(id as usize) }
    }

    /// Sets the cardinality of segment `id`.
    ///
    /// # Safety
    ///
    /// Caller must hold exclusive access (a `Write` or `Rebalance` gate)
    /// over segment `id`.
    pub unsafe fn set_size(&self, id: u32, size: u16) {
        debug_assert!(size as u32 <= self.segment_capacity);
        *self.sizes.ptr().add(id as usize) = size;
    }

    /// Leftmost live key of segment `id`.
    ///
    /// # Panics (debug only)
    ///
    /// Panics if `size(id) == 0`; the caller must guarantee the segment is
    /// non-empty (spec §4.1).
    pub fn segment_min(&self, id: u32) -> i64 {
        debug_assert!(self.size(id) > 0, "segment_min of an empty segment");
        let c = self.segment_capacity as usize;
        // SAFETY: index is within the keys array: for even segments
        // `(id+1)*C - size <= (id+1)*C <= N*C`; for odd, `id*C < N*C`.
        unsafe {
            if id % 2 == 0 {
                *self
                    .keys
                    .ptr()
                    .add((id as usize + 1) * c - self.size(id) as usize)
            } else {
                *self.keys.ptr().add(id as usize * c)
            }
        }
    }

    /// Read-only view of the *entire* capacity slot for segment `id`
    /// (`[id*C, (id+1)*C)`), not just the live sub-range.
    pub fn segment_slot(&self, id: u32) -> (&[i64], &[i64]) {
        let c = self.segment_capacity as usize;
        let start = id as usize * c;
        // SAFETY: `[start, start+c)` is within the allocated capacity.
        unsafe {
            let keys = std::slice::from_raw_parts(self.keys.ptr().add(start), c);
            let values = std::slice::from_raw_parts(self.values.ptr().add(start), c);
            (keys, values)
        }
    }

    /// Read-only view of the live `(keys, values)` sub-slices of segment `id`,
    /// respecting the even-right/odd-left packing rule.
    pub fn segment_live(&self, id: u32) -> (&[i64], &[i64]) {
        let size = self.size(id) as usize;
        let (slot_keys, slot_values) = self.segment_slot(id);
        let c = self.segment_capacity as usize;
        if id % 2 == 0 {
            (&slot_keys[c - size..], &slot_values[c - size..])
        } else {
            (&slot_keys[..size], &slot_values[..size])
        }
    }

    /// Mutable access to the entire capacity slot for segment `id`.
    ///
    /// # Safety
    ///
    /// Caller must hold exclusive access over segment `id`.
    pub unsafe fn segment_slot_mut(&self, id: u32) -> (&mut [i64], &mut [i64]) {
        let c = self.segment_capacity as usize;
        let start = id as usize * c;
        let keys = std::slice::from_raw_parts_mut(self.keys.ptr().add(start), c);
        let values = std::slice::from_raw_parts_mut(self.values.ptr().add(start), c);
        (keys, values)
    }

    /// Grows storage to host `self.num_segments() + delta` segments,
    /// extending the backing(s) by the minimal number of extents required.
    ///
    /// New segment slots start with `size = 0` and undefined key content;
    /// callers must populate them via a rebalance before exposing them.
    pub fn extend(&mut self, delta: u32) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }
        let num_segments_after = self.num_segments + delta;
        let elts_len_after = num_segments_after as usize * self.segment_capacity as usize;
        self.keys.grow_to(elts_len_after, self.pages_per_extent)?;
        self.values.grow_to(elts_len_after, self.pages_per_extent)?;
        self.sizes
            .grow_to(num_segments_after.max(2) as usize, self.pages_per_extent)?;

        log::debug!(
            "storage extended from {} to {} segments",
            self.num_segments,
            num_segments_after
        );
        self.num_segments = num_segments_after;
        Ok(())
    }

    /// Total memory footprint in bytes across all three backings.
    pub fn memory_footprint(&self) -> u64 {
        (self.keys.allocated_bytes() + self.values.allocated_bytes() + self.sizes.allocated_bytes())
            as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use test_log::test;

    #[test]
    fn rounds_up_segment_capacity() {
        let storage = Storage::new(40, 1, 2).unwrap();
        assert_eq!(storage.segment_capacity(), 64);
    }

    #[test]
    fn rejects_oversized_segment() {
        assert!(Storage::new(1 << 20, 1, 1).is_err());
    }

    #[test]
    fn segment_min_respects_packing() {
        let storage = Storage::new(4, 1, 2).unwrap();
        // Segment 0 (even) packs right: last 2 slots.
        unsafe {
            let (keys, _) = storage.segment_slot_mut(0);
            keys[2] = 10;
            keys[3] = 20;
            storage.set_size(0, 2);
        }
        assert_eq!(storage.segment_min(0), 10);

        // Segment 1 (odd) packs left: first slot.
        unsafe {
            let (keys, _) = storage.segment_slot_mut(1);
            keys[0] = 30;
            storage.set_size(1, 1);
        }
        assert_eq!(storage.segment_min(1), 30);
    }

    #[test]
    fn extend_grows_capacity_and_zeroes_new_slots() {
        let mut storage = Storage::new(4, 1, 2).unwrap();
        unsafe {
            storage.set_size(0, 4);
        }
        storage.extend(2).unwrap();
        assert_eq!(storage.num_segments(), 4);
        assert_eq!(storage.size(2), 0);
        assert_eq!(storage.size(3), 0);
        assert_eq!(storage.size(0), 4, "existing segment sizes survive extend");
    }

    #[test]
    fn height_and_hyperheight() {
        let storage = Storage::new(4, 1, 1).unwrap();
        assert_eq!(storage.height(), 1);
        assert_eq!(storage.hyperheight(), 1);

        let storage = Storage::new(4, 1, 8).unwrap();
        assert_eq!(storage.height(), 4);
        assert_eq!(storage.hyperheight(), 4);
    }

    /// For random cardinalities at random parities, `segment_live` must
    /// return exactly the packed sub-range the even-right/odd-left rule
    /// predicts: `[(id+1)*C - size, (id+1)*C)` for even segments,
    /// `[id*C, id*C + size)` for odd ones.
    #[test]
    fn segment_live_matches_packing_formula_for_random_fills() {
        let storage = Storage::new(16, 1, 4).unwrap();
        let c = storage.segment_capacity() as usize;
        let mut rng = rand::rng();

        for id in 0..storage.num_segments() {
            let size = rng.random_range(0..=c as u16);
            unsafe {
                let (keys, values) = storage.segment_slot_mut(id);
                for (j, (k, v)) in keys.iter_mut().zip(values.iter_mut()).enumerate() {
                    *k = (id as usize * c + j) as i64;
                    *v = *k * 2;
                }
                storage.set_size(id, size);
            }

            let (live_keys, live_values) = storage.segment_live(id);
            assert_eq!(live_keys.len(), size as usize);
            assert_eq!(live_values.len(), size as usize);

            let (slot_keys, slot_values) = storage.segment_slot(id);
            let expected_start = if id % 2 == 0 { c - size as usize } else { 0 };
            assert_eq!(live_keys, &slot_keys[expected_start..expected_start + size as usize]);
            assert_eq!(live_values, &slot_values[expected_start..expected_start + size as usize]);

            if size > 0 {
                assert_eq!(storage.segment_min(id), live_keys[0]);
            }
        }
    }
}
