//! Multicore adjustment of a chosen tile.
//!
//! The outer tile of a core-mappable axis decides how many blocks the cores
//! share. A tile that leaves some cores idle is shrunk toward the largest
//! tile that still keeps every core busy, as long as each core keeps
//! writing back enough data and a large shrink saves more memory than the
//! number of blocks still pending.

use crate::analyze::TilingAnalyzer;
use crate::axis::{AxisId, TileLevel};
use crate::memory::MemoryEstimator;
use crate::MIN_MULTICORE_BYTES;
use tpo_session::{DumpLevel, LogStage, Session};
use tracing::debug;

/// Shrinking by at least this ratio is checked against pending blocks.
const SHRINK_LIMIT: i64 = 2;

/// Adjusts outer tiles for the configured number of cores.
pub struct MulticoreStrategy<'a> {
    analyzer: &'a TilingAnalyzer,
    estimator: &'a MemoryEstimator,
    session: &'a Session,
    core_num: i64,
}

impl<'a> MulticoreStrategy<'a> {
    /// Strategy for the band `estimator` describes.
    #[must_use]
    pub fn new(analyzer: &'a TilingAnalyzer, estimator: &'a MemoryEstimator, session: &'a Session, core_num: i64) -> Self {
        Self {
            analyzer,
            estimator,
            session,
            core_num: core_num.max(1),
        }
    }

    fn log(&self, line: String) {
        self.session.log(LogStage::DoTiling, DumpLevel::General, line);
    }

    /// Tile below which a core writes back too little data.
    #[must_use]
    pub fn min_factor_for_enough_data(&self, tiles: &[i64], pos: usize) -> i64 {
        let inner = self.estimator.written_bytes_inside(tiles, pos).unwrap_or(1).max(1);
        (MIN_MULTICORE_BYTES / inner).max(1)
    }

    /// `[min_for_enough_data, max_for_full_cores]` for the axis at band
    /// position `pos`. The upper bound is `-1` when it cannot be derived.
    #[must_use]
    pub fn proposal_range(&self, tiles: &[i64], pos: usize) -> (i64, i64) {
        let lower = self.min_factor_for_enough_data(tiles, pos);
        let axes = &self.estimator.axes;
        let Some(&target) = axes.get(pos) else {
            return (lower, -1);
        };
        let shape = self.analyzer.axes.axis(target).range_extent;
        let mut used = 1;
        let mut this_level = self.core_num;
        for (k, &other) in axes.iter().enumerate().take(pos) {
            let axis = self.analyzer.axes.axis(other);
            if axis.has_attr("REDUCE_AXIS") {
                continue;
            }
            let l1 = tiles.get(k).copied().unwrap_or(axis.l1.tile_min).max(1);
            let block_extent = (axis.range_extent / l1).max(1);
            self.log(format!(
                "range {shape} l1 tile {l1} -> block extent {block_extent} this level {this_level}"
            ));
            let last = if block_extent > this_level {
                let factor = (block_extent + this_level - 1) / this_level;
                this_level = (block_extent + factor - 1) / factor;
                true
            } else {
                let last = block_extent * 2 > this_level;
                this_level = block_extent;
                last
            };
            if last {
                break;
            }
            used *= this_level;
            this_level = (self.core_num / used).max(1);
            self.log(format!("use core {used} this level {this_level}"));
        }
        let upper = (shape / this_level).max(1);
        self.log(format!(" proposal range ({lower}, {upper})"));
        (lower, upper)
    }

    /// Blocks of the other non-reduce axes still to be pipelined.
    #[must_use]
    pub fn pending_blocks(&self, tiles: &[i64], excluded: usize) -> i64 {
        self.estimator
            .axes
            .iter()
            .enumerate()
            .filter(|&(k, &id)| k != excluded && !self.analyzer.axes.axis(id).has_attr("REDUCE_AXIS"))
            .map(|(k, &id)| {
                let extent = self.analyzer.axes.axis(id).range_extent;
                let tile = tiles.get(k).copied().unwrap_or(1).max(1);
                (extent + tile - 1) / tile
            })
            .product()
    }

    /// The adjusted outer tile of the axis at band position `pos`.
    #[must_use]
    pub fn adjust(&self, tiles: &[i64], pos: usize) -> i64 {
        let Some(&id) = self.estimator.axes.get(pos) else {
            return tiles.get(pos).copied().unwrap_or(1);
        };
        let origin = tiles.get(pos).copied().unwrap_or(1);
        let axis = self.analyzer.axes.axis(id);
        let (min_for_data, max_for_cores) = self.proposal_range(tiles, pos);
        if !axis.mc_sup
            || axis.has_attr("REDUCE_AXIS")
            || origin < min_for_data
            || origin == max_for_cores
            || max_for_cores <= 0
        {
            self.log("This axis is not suitable for multicore, return.".to_string());
            return origin;
        }

        let mut factor = origin;
        if factor < max_for_cores {
            let end = isqrt(max_for_cores);
            while max_for_cores % factor != 0 && factor > end {
                factor -= 1;
            }
        } else {
            factor = max_for_cores;
        }

        let shape = axis.range_extent;
        let mut efficient = shape % factor == 0 || shape % origin != 0;
        let reduced = (origin - factor).max(min_for_data - factor);
        let pending = self.pending_blocks(tiles, pos);
        if origin / factor >= SHRINK_LIMIT && reduced <= pending {
            self.log(format!(
                "If axis adjust to {factor}, only {reduced} memory is reduced; while maximal pending blocks is {pending}, adjust may not be efficient."
            ));
            efficient = false;
        }
        let valid = axis.tile_is_valid(TileLevel::L1, factor);
        self.log(format!(
            "--> Adjust tiling factor {origin} to {factor} if valid({valid}) and efficient({efficient}) according to proposal range ({min_for_data}, {max_for_cores})"
        ));
        if valid && efficient {
            debug!(origin, factor, "multicore adjusted tile");
            factor
        } else {
            origin
        }
    }

    /// Position of the first core-mappable axis of the band.
    #[must_use]
    pub fn multicore_axis(&self) -> Option<usize> {
        self.estimator
            .axes
            .iter()
            .position(|&id: &AxisId| self.analyzer.axes.axis(id).mc_sup)
    }
}

fn isqrt(n: i64) -> i64 {
    if n <= 0 {
        return 0;
    }
    let mut r = 0i64;
    while (r + 1) * (r + 1) <= n {
        r += 1;
    }
    r
}
