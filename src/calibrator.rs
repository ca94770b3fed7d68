// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The calibrator: a pure function from a triggering segment and the
//! current cardinalities to a [`RebalancePlan`], walking the implicit
//! binary tree of density thresholds described in spec §3/§4.2.

use crate::config::DensityBound;

/// What a rebalancing task must enact.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RebalancePlan {
    /// First segment of the window, a multiple of `2^level`.
    pub window_start: u32,
    /// Number of segments in the window, `2^level`.
    pub window_length: u32,
    /// Total cardinality the window must hold after redistribution.
    pub cardinality_after: u64,
    /// Whether the whole array must double in size first.
    pub resize: bool,
}

/// Stateless, deterministic density-threshold evaluator.
///
/// Its only inputs are instance constants (`segment_capacity`, the
/// threshold schedule) and cardinalities read by the caller under gates;
/// `Calibrator` itself holds no mutable state.
#[derive(Clone, Debug)]
pub(crate) struct Calibrator {
    segment_capacity: u32,
    /// `thresholds[level] = (ρ_lo(level), ρ_up(level))`, `level = 0` at
    /// the leaves (individual segments).
    thresholds: Vec<DensityBound>,
    /// `log2(segments_per_lock)`: the smallest level `plan` will ever walk
    /// to, so every window it returns is both sized and aligned to a whole
    /// number of gates (`rebalancing_task.cpp`'s `window_length %
    /// segments_per_lock == 0` invariant).
    min_level: u32,
}

impl Calibrator {
    /// Creates a calibrator for the given segment capacity, threshold
    /// schedule, and gate granularity. `thresholds` must have one entry per
    /// tree level, leaves first; levels beyond the schedule reuse the
    /// root's bounds. `segments_per_lock` must be a power of two (see
    /// [`crate::Config::segments_per_lock`]).
    pub fn new(segment_capacity: u32, thresholds: Vec<DensityBound>, segments_per_lock: u32) -> Self {
        debug_assert!(!thresholds.is_empty());
        debug_assert!(segments_per_lock.is_power_of_two());
        Self {
            segment_capacity,
            thresholds,
            min_level: segments_per_lock.trailing_zeros(),
        }
    }

    fn bounds_at(&self, level: u32) -> DensityBound {
        let level = level as usize;
        self.thresholds
            .get(level)
            .copied()
            .unwrap_or_else(|| *self.thresholds.last().expect("non-empty schedule"))
    }

    fn in_bounds(&self, level: u32, window_len: u32, cardinality: u64) -> bool {
        let (lo, up) = self.bounds_at(level);
        let capacity = window_len as f64 * self.segment_capacity as f64;
        let cardinality = cardinality as f64;
        lo * capacity <= cardinality && cardinality <= up * capacity
    }

    /// Whether a window of `window_len` segments (a power of two) holding
    /// `cardinality` elements currently satisfies its level's density
    /// bounds. Used to re-verify a plan after its gates are actually
    /// acquired, since cardinalities may have shifted under contention.
    pub fn window_in_bounds(&self, window_len: u32, cardinality: u64) -> bool {
        self.in_bounds(window_len.trailing_zeros(), window_len, cardinality)
    }

    /// Lower density bound of an individual segment (`ℓ = 0`); the
    /// threshold a segment's cardinality must stay above to avoid
    /// triggering an underflow rebalance.
    pub fn leaf_lower_bound(&self) -> f64 {
        self.bounds_at(0).0
    }

    /// Computes the rebalance plan for a segment that just went out of
    /// bounds, given a closure that sums the current cardinality of any
    /// aligned window and the instance's total cardinality and segment
    /// count.
    ///
    /// `overflow` selects the tie-break at the root: `true` grows the
    /// array, `false` rebalances the root window in place (§4.2).
    pub fn plan(
        &self,
        segment_id: u32,
        overflow: bool,
        num_segments: u32,
        total_cardinality: u64,
        window_cardinality: impl Fn(u32, u32) -> u64,
    ) -> RebalancePlan {
        debug_assert!(segment_id < num_segments);
        debug_assert!(1u32 << self.min_level <= num_segments, "num_segments must be at least segments_per_lock");

        let mut level = self.min_level;
        while (1u32 << level) < num_segments {
            let window_len = 1u32 << level;
            let window_start = (segment_id / window_len) * window_len;
            let cardinality = window_cardinality(window_start, window_len);
            if self.in_bounds(level, window_len, cardinality) {
                return RebalancePlan {
                    window_start,
                    window_length: window_len,
                    cardinality_after: cardinality,
                    resize: false,
                };
            }
            level += 1;
        }

        // `1 << level == num_segments`: check the root itself before
        // concluding the walk is out of bounds everywhere.
        if self.in_bounds(level, num_segments, total_cardinality) {
            return RebalancePlan {
                window_start: 0,
                window_length: num_segments,
                cardinality_after: total_cardinality,
                resize: false,
            };
        }

        // Reached the root while still out of bounds.
        if overflow {
            RebalancePlan {
                window_start: 0,
                window_length: num_segments,
                cardinality_after: total_cardinality,
                resize: true,
            }
        } else {
            RebalancePlan {
                window_start: 0,
                window_length: num_segments,
                cardinality_after: total_cardinality,
                resize: false,
            }
        }
    }
}
