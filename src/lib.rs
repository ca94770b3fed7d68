// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A concurrent, self-balancing ordered index over signed 64-bit keys,
//! built around a Rewired Packed Memory Array (RMA).
//!
//! ##### About
//!
//! The index keeps its keys in a single densely packed, sorted sequence
//! living in a contiguous virtual address range, split into fixed-capacity
//! *segments*. Point inserts and removes amortize the cost of keeping the
//! sequence sorted by rebalancing only a small enclosing window of
//! segments, not the whole array, and growth happens by doubling the
//! array in place via OS page remapping rather than by copying it
//! elsewhere.
//!
//! This crate does not provide durability, a wire protocol, or duplicate
//! keys with a defined tie-break order; see the module docs of
//! [`rebalance`] and [`gate`] for the concurrency model.
//!
//! # Example usage
//!
//! ```
//! use rma_index::{Config, Index};
//!
//! let index = Index::new(Config::new().segment_size(64).initial_segments(1))?;
//!
//! index.insert(1, 10);
//! index.insert(2, 20);
//! assert_eq!(index.find(1), Some(10));
//! assert_eq!(index.remove(2), Some(20));
//!
//! let mut seen = Vec::new();
//! index.range_scan(0, 10, |k, v| {
//!     seen.push((k, v));
//!     true
//! });
//! assert_eq!(seen, vec![(1, 10)]);
//! #
//! # Ok::<(), rma_index::Error>(())
//! ```

#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]
#![allow(clippy::option_if_let_else)]

// Unlike the rest of this crate, `rewired` and `storage` manage raw OS
// pages and a hand-packed array layout; `unsafe` is confined to those two
// modules and documented at every use site (see DESIGN.md).

mod binary_search;
mod calibrator;
mod config;
mod error;
mod gate;
mod index;
mod rebalance;
mod rewired;
mod sparse_index;
mod storage;

pub use config::{Config, DensityBound};
pub use error::{Error, Result};
pub use index::Index;
pub use sparse_index::{BTreeSparseIndex, SparseIndex};
