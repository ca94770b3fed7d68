// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Rewired memory: a contiguous virtual range that can be grown in place
//! by committing more of a large up-front reservation, never moving the
//! addresses of pages that are already backed.
//!
//! This is the one piece of the baseline RMA (see
//! `original_source/data_structures/rma/baseline/storage.cpp`) that has
//! no equivalent anywhere in the teacher crate, which never manages raw
//! pages itself. The approach below — reserve a generous address range
//! with `PROT_NONE`, then `mprotect` extents into `PROT_READ | PROT_WRITE`
//! as they're needed — is the standard way to get "virtual addresses
//! never move" out of `mmap`/`mprotect` without the real `mremap`
//! in-place guarantee, which Linux does not offer unconditionally.

use crate::error::{Error, Result};
use std::ffi::c_void;
use std::ptr::NonNull;

/// Upper bound on how much address space a single rewired allocation will
/// ever reserve. Reservation is virtual-only (no physical memory is
/// touched by pages outside the committed prefix), so this can be
/// generous; it merely bounds how many times a backing can be extended
/// before [`RewiredMemory::extend`] returns [`Error::OutOfMemory`].
const MAX_RESERVATION_BYTES: usize = 1 << 37; // 128 GiB of address space

fn os_page_size() -> usize {
    // SAFETY: `sysconf` with `_SC_PAGESIZE` has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    debug_assert!(size > 0, "sysconf(_SC_PAGESIZE) failed");
    size.max(4096) as usize
}

/// A growable, page-granular virtual memory region.
///
/// `extend` commits additional whole extents at the tail of the mapping;
/// `shrink` decommits them (returning the physical pages to the OS via
/// `madvise(MADV_DONTNEED)`) while keeping the virtual reservation alive
/// so a later `extend` can re-commit without remapping. `swap` exchanges
/// the contents of two same-sized, page-aligned byte ranges.
pub struct RewiredMemory {
    base: NonNull<u8>,
    page_size: usize,
    extent_bytes: usize,
    reserved_extents: usize,
    committed_extents: usize,
}

// SAFETY: the region is exclusively owned by the `Storage` that holds it;
// all mutation happens under that owner's synchronization.
unsafe impl Send for RewiredMemory {}
unsafe impl Sync for RewiredMemory {}

impl RewiredMemory {
    /// Reserves address space for up to [`MAX_RESERVATION_BYTES`] worth of
    /// extents and commits `initial_extents` of them.
    pub fn new(pages_per_extent: u32, initial_extents: usize) -> Result<Self> {
        let page_size = os_page_size();
        let extent_bytes = pages_per_extent as usize * page_size;
        let reserved_extents = (MAX_RESERVATION_BYTES / extent_bytes).max(initial_extents);
        let reserved_bytes = reserved_extents * extent_bytes;

        // SAFETY: valid arguments for an anonymous, unbacked reservation.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                reserved_bytes,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::OutOfMemory);
        }
        // SAFETY: `mmap` succeeded, so `ptr` is a valid non-null mapping base.
        let base = unsafe { NonNull::new_unchecked(ptr.cast::<u8>()) };

        let mut rewired = Self {
            base,
            page_size,
            extent_bytes,
            reserved_extents,
            committed_extents: 0,
        };
        if initial_extents > 0 {
            rewired.extend(initial_extents)?;
        }
        Ok(rewired)
    }

    /// The stable base address of the mapping. Never changes for the
    /// lifetime of `self`, regardless of `extend`/`shrink` calls.
    pub fn start_address(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Number of extents currently backed by read/write pages.
    pub fn allocated_extents(&self) -> usize {
        self.committed_extents
    }

    /// Bytes per rewiring extent.
    pub fn extent_bytes(&self) -> usize {
        self.extent_bytes
    }

    /// Commits `additional_extents` more extents at the tail of the
    /// mapping. Addresses of already-committed pages never change.
    pub fn extend(&mut self, additional_extents: usize) -> Result<()> {
        if additional_extents == 0 {
            return Ok(());
        }
        let new_committed = self.committed_extents + additional_extents;
        if new_committed > self.reserved_extents {
            return Err(Error::OutOfMemory);
        }

        // SAFETY: the range [committed, new_committed) extents lies within
        // the reservation made in `new`.
        let rc = unsafe {
            let offset = self.committed_extents * self.extent_bytes;
            libc::mprotect(
                self.base.as_ptr().add(offset).cast::<c_void>(),
                additional_extents * self.extent_bytes,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if rc != 0 {
            return Err(Error::OutOfMemory);
        }

        self.committed_extents = new_committed;
        log::trace!(
            "rewired memory extended to {} committed extents ({} bytes)",
            self.committed_extents,
            self.committed_extents * self.extent_bytes
        );
        Ok(())
    }

    /// Decommits the trailing `extents_to_remove` extents, returning their
    /// physical pages to the OS. The virtual reservation is kept, so a
    /// later `extend` can re-commit without moving anything.
    pub fn shrink(&mut self, extents_to_remove: usize) {
        let extents_to_remove = extents_to_remove.min(self.committed_extents);
        if extents_to_remove == 0 {
            return;
        }
        let new_committed = self.committed_extents - extents_to_remove;
        let offset = new_committed * self.extent_bytes;
        let len = extents_to_remove * self.extent_bytes;

        // SAFETY: the range lies within the committed prefix of the reservation.
        unsafe {
            let addr = self.base.as_ptr().add(offset).cast::<c_void>();
            libc::madvise(addr, len, libc::MADV_DONTNEED);
            libc::mprotect(addr, len, libc::PROT_NONE);
        }
        self.committed_extents = new_committed;
    }

    /// Swaps the contents of two page-aligned, equally sized byte ranges
    /// within the committed prefix.
    ///
    /// # Safety
    ///
    /// `a`, `b`, and `len` must all be multiples of the OS page size, and
    /// `[a, a+len)`/`[b, b+len)` must lie within `0..self.allocated_extents()
    /// * self.extent_bytes()` and must not overlap.
    pub unsafe fn swap(&mut self, a: usize, b: usize, len: usize) {
        debug_assert_eq!(a % self.page_size, 0);
        debug_assert_eq!(b % self.page_size, 0);
        debug_assert_eq!(len % self.page_size, 0);
        if a == b || len == 0 {
            return;
        }
        let ptr_a = self.base.as_ptr().add(a);
        let ptr_b = self.base.as_ptr().add(b);
        // A swap via a page-sized scratch buffer; true zero-copy swapping
        // would exchange the underlying physical pages between the two
        // virtual slots (e.g. via `remap_file_pages`), which is out of
        // scope here — see DESIGN.md.
        let mut scratch = vec![0u8; len];
        std::ptr::copy_nonoverlapping(ptr_a, scratch.as_mut_ptr(), len);
        std::ptr::copy_nonoverlapping(ptr_b, ptr_a, len);
        std::ptr::copy_nonoverlapping(scratch.as_ptr(), ptr_b, len);
    }
}

impl Drop for RewiredMemory {
    fn drop(&mut self) {
        // SAFETY: `base` was obtained from `mmap` with this exact reservation size.
        unsafe {
            libc::munmap(
                self.base.as_ptr().cast::<c_void>(),
                self.reserved_extents * self.extent_bytes,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn extend_preserves_base_address_and_data() {
        let mut mem = RewiredMemory::new(1, 1).unwrap();
        let base = mem.start_address();

        // SAFETY: test-local access to freshly committed, exclusively owned pages.
        unsafe {
            *base.cast::<u64>() = 0xDEAD_BEEF;
        }

        mem.extend(3).unwrap();
        assert_eq!(mem.start_address(), base, "base address must never move");
        assert_eq!(mem.allocated_extents(), 4);

        // SAFETY: see above.
        unsafe {
            assert_eq!(*base.cast::<u64>(), 0xDEAD_BEEF);
        }
    }

    #[test]
    fn shrink_then_extend_recommits_without_moving() {
        let mut mem = RewiredMemory::new(1, 4).unwrap();
        let base = mem.start_address();
        mem.shrink(2);
        assert_eq!(mem.allocated_extents(), 2);
        mem.extend(2).unwrap();
        assert_eq!(mem.allocated_extents(), 4);
        assert_eq!(mem.start_address(), base);
    }

    #[test]
    fn swap_exchanges_page_contents() {
        let mut mem = RewiredMemory::new(1, 2).unwrap();
        let page = mem.page_size;
        let base = mem.start_address();

        // SAFETY: writing within the two committed, exclusively owned pages.
        unsafe {
            *base.cast::<u64>() = 1;
            *base.add(page).cast::<u64>() = 2;
            mem.swap(0, page, page);
            assert_eq!(*base.cast::<u64>(), 2);
            assert_eq!(*base.add(page).cast::<u64>(), 1);
        }
    }
}
