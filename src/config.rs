// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::error::{Error, Result};

/// A `(lower, upper)` occupancy bound pair for one level of the calibrator
/// tree, `ℓ = 0` being individual segments and `ℓ = h - 1` the root.
pub type DensityBound = (f64, f64);

/// Default density threshold schedule.
///
/// Per-segment bounds are permissive (`[0.5, 1.0]`) and tighten linearly
/// toward the root's global bounds (`[0.3, 0.75]`) over `levels` steps,
/// matching the shape described for the baseline RMA.
fn default_thresholds(levels: usize) -> Vec<DensityBound> {
    const SEGMENT_LO: f64 = 0.5;
    const SEGMENT_UP: f64 = 1.0;
    const ROOT_LO: f64 = 0.3;
    const ROOT_UP: f64 = 0.75;

    if levels <= 1 {
        return vec![(ROOT_LO, ROOT_UP)];
    }

    (0..levels)
        .map(|level| {
            let t = level as f64 / (levels - 1) as f64;
            let lo = SEGMENT_LO + (ROOT_LO - SEGMENT_LO) * t;
            let up = SEGMENT_UP + (ROOT_UP - SEGMENT_UP) * t;
            (lo, up)
        })
        .collect()
}

/// Builder for an [`Index`](crate::Index).
///
/// Mirrors the construction arguments of the baseline RMA: a requested
/// segment capacity, the granularity of memory rewiring, the starting
/// segment count, the gate granularity, the density threshold schedule,
/// and the rebalance worker budget.
#[derive(Clone, Debug)]
pub struct Config {
    /// Requested segment capacity; rounded up to a power of two in `[32, 65535]`.
    pub(crate) segment_size: u32,

    /// Pages per rewiring extent; must be a power of two.
    pub(crate) pages_per_extent: u32,

    /// Starting number of segments; must be a power of two `>= 1`.
    pub(crate) initial_segments: u32,

    /// Gate granularity, in segments; must be a power of two.
    pub(crate) segments_per_lock: u32,

    /// `(ρ_lo(ℓ), ρ_up(ℓ))` for `ℓ = 0..levels`, `None` to derive a default
    /// schedule sized to `initial_segments` at construction time.
    pub(crate) thresholds: Option<Vec<DensityBound>>,

    /// Upper bound on subtasks run concurrently per rebalance.
    pub(crate) rebalance_workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            segment_size: 64,
            pages_per_extent: 16,
            initial_segments: 1,
            segments_per_lock: 1,
            thresholds: None,
            rebalance_workers: 4,
        }
    }
}

impl Config {
    /// Creates a config with the baseline defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the requested per-segment capacity.
    #[must_use]
    pub fn segment_size(mut self, segment_size: u32) -> Self {
        self.segment_size = segment_size;
        self
    }

    /// Sets the rewiring extent granularity, in OS pages.
    #[must_use]
    pub fn pages_per_extent(mut self, pages_per_extent: u32) -> Self {
        self.pages_per_extent = pages_per_extent;
        self
    }

    /// Sets the starting number of segments.
    #[must_use]
    pub fn initial_segments(mut self, initial_segments: u32) -> Self {
        self.initial_segments = initial_segments;
        self
    }

    /// Sets the gate granularity, in segments.
    #[must_use]
    pub fn segments_per_lock(mut self, segments_per_lock: u32) -> Self {
        self.segments_per_lock = segments_per_lock;
        self
    }

    /// Overrides the default density threshold schedule.
    #[must_use]
    pub fn thresholds(mut self, thresholds: Vec<DensityBound>) -> Self {
        self.thresholds = Some(thresholds);
        self
    }

    /// Sets the upper bound on concurrent rebalance subtasks.
    #[must_use]
    pub fn rebalance_workers(mut self, rebalance_workers: usize) -> Self {
        self.rebalance_workers = rebalance_workers;
        self
    }

    /// Validates the configuration and fills in a default threshold
    /// schedule if none was supplied.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if any value is out of range or the
    /// power-of-two / divisibility constraints required by the rewiring
    /// layer are not met.
    pub(crate) fn validated(mut self) -> Result<Self> {
        if !self.pages_per_extent.is_power_of_two() {
            return Err(Error::InvalidConfig(
                "pages_per_extent must be a power of two".into(),
            ));
        }
        if !self.initial_segments.is_power_of_two() || self.initial_segments == 0 {
            return Err(Error::InvalidConfig(
                "initial_segments must be a non-zero power of two".into(),
            ));
        }
        if !self.segments_per_lock.is_power_of_two() || self.segments_per_lock == 0 {
            return Err(Error::InvalidConfig(
                "segments_per_lock must be a non-zero power of two".into(),
            ));
        }
        if self.initial_segments % self.segments_per_lock != 0 {
            return Err(Error::InvalidConfig(
                "segments_per_lock must divide initial_segments".into(),
            ));
        }

        let levels = (self.initial_segments.ilog2() as usize) + 2;
        if self.thresholds.is_none() {
            self.thresholds = Some(default_thresholds(levels));
        }

        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn rejects_non_power_of_two_pages_per_extent() {
        let config = Config::new().pages_per_extent(3);
        assert!(config.validated().is_err());
    }

    #[test]
    fn rejects_misaligned_lock_granularity() {
        let config = Config::new().initial_segments(4).segments_per_lock(3);
        assert!(config.validated().is_err());
    }

    #[test]
    fn fills_default_thresholds() {
        let config = Config::new().initial_segments(8).validated().unwrap();
        let thresholds = config.thresholds.unwrap();
        assert_eq!(thresholds.len(), 5);
        // Monotone: lo increases, up decreases, toward the root.
        for w in thresholds.windows(2) {
            assert!(w[0].0 <= w[1].0);
            assert!(w[0].1 >= w[1].1);
        }
    }
}
