//! GPU constraint strategies.
//!
//! [`GpuMappingStrategy`] decides the launch configuration while the tile
//! constraints are being built: threads take the innermost axes first,
//! warp-aligned and within the per-block thread budget, and blocks take
//! what the threads leave of the remaining axes. Thread-mapped axes are
//! fixed to their thread count, block-mapped axes are capped so that the
//! tile loop fits the block grid. The chosen sizes are written back to the
//! session configuration.

use crate::template::{determine_template, is_elemwise_axis, Template};
use tpo_session::{DumpLevel, LogStage, MappingCfg};
use tpo_target::GpuInfo;
use tpo_tiling::strategy::{ConflictTreeRangeStrategy, CustomTilingStrategy, ModStrategy};
use tpo_tiling::{AxisId, AxisTree, StrategyContext, TileLevel, TilingError, TilingResult, TilingStrategy};
use tracing::debug;

/// Attribute keeping an axis off the thread grid.
pub const BLOCK_ONLY: &str = "BLOCK_ONLY";

/// Threads per block when transposing, `x` then `y`.
const TRANSPOSE_THREADS: [i64; 2] = [32, 8];

/// The strategies of the GPU pipeline, in the order they run.
#[must_use]
pub fn gpu_strategies() -> Vec<Box<dyn TilingStrategy>> {
    vec![
        Box::new(CustomTilingStrategy),
        Box::new(ConflictTreeRangeStrategy),
        Box::new(ModStrategy),
        Box::new(GpuReduceStrategy),
        Box::new(GpuMappingStrategy),
    ]
}

// ============================================================================
// Reduction
// ============================================================================

/// Keeps reduced axes off the thread grid.
///
/// A reduction over every axis, or one that also transposes, runs in a
/// single block with its reduced tile fixed to one element (or one warp).
pub struct GpuReduceStrategy;

impl TilingStrategy for GpuReduceStrategy {
    fn name(&self) -> &'static str {
        "gpu_reduce"
    }

    fn add_constraint(&self, axes: &mut AxisTree, ctx: &StrategyContext<'_>) -> TilingResult<()> {
        let ids = axes.top_down();
        let reduce: Vec<AxisId> = ids
            .iter()
            .copied()
            .filter(|&id| {
                let a = axes.axis(id);
                a.has_attr("REDUCE_AXIS") || !a.mc_sup
            })
            .collect();
        if reduce.is_empty() {
            return Ok(());
        }
        let all_reduce = reduce.len() == ids.len();
        let transposed = ids.iter().any(|&id| axes.axis(id).has_attr("TRANSPOSE"));
        let warp = ctx.session.target().gpu.warp_size;
        for &id in &reduce {
            let a = axes.axis_mut(id);
            a.thread.map_extent = 1;
            if all_reduce || transposed {
                a.block.map_extent = 1;
                let tile = if all_reduce { 1 } else { warp.min(a.range_extent) };
                a.restrain_to_single_value(TileLevel::L1, tile);
            }
        }
        debug!(axes = reduce.len(), all_reduce, transposed, "reduce axes kept off threads");
        Ok(())
    }
}

// ============================================================================
// Block and thread mapping
// ============================================================================

/// Maps the axes of the first band to threads and blocks.
pub struct GpuMappingStrategy;

/// An axis waiting for a grid, with the part of its range still unmapped.
#[derive(Clone, Copy, Debug)]
struct Pending {
    axis: AxisId,
    shape: i64,
}

impl TilingStrategy for GpuMappingStrategy {
    fn name(&self) -> &'static str {
        "gpu_mapping"
    }

    fn add_constraint(&self, axes: &mut AxisTree, ctx: &StrategyContext<'_>) -> TilingResult<()> {
        let gpu = ctx.session.target().gpu.clone();
        let template = determine_template(axes);
        let (user_threads, user_blocks) = {
            let config = ctx.session.config();
            (config.thread_cfg.clone(), config.block_cfg.clone())
        };
        let thread_limit = match user_threads.filter(|c| !c.is_empty()) {
            Some(cfg) => cfg.sizes().collect(),
            None => default_thread_limit(template, &gpu),
        };
        let block_limit = match user_blocks.filter(|c| !c.is_empty()) {
            Some(cfg) => cfg.sizes().collect(),
            None => default_block_limit(template, &gpu),
        };

        let mut pending = build_axes_queue(axes);
        let original = pending.len();
        let mut threaded = Vec::new();
        let threads = map_threads(axes, &mut pending, &thread_limit, &gpu, &mut threaded);
        let blocks = map_blocks(axes, &pending[original..], &block_limit, &gpu, &threaded);

        let threads = if threads.is_empty() { vec![1] } else { threads };
        let thread_cfg = MappingCfg::from_sizes(threads).map_err(|e| TilingError::Mapping(e.to_string()))?;
        let block_cfg = MappingCfg::from_sizes(blocks).map_err(|e| TilingError::Mapping(e.to_string()))?;

        {
            let mut logger = ctx.session.logger();
            logger.append(LogStage::GpuMapping, DumpLevel::General, format!("Template = {template}"));
            logger.append(LogStage::GpuMapping, DumpLevel::General, format!("Block config = {block_cfg}"));
            logger.append(LogStage::GpuMapping, DumpLevel::General, format!("Thread config = {thread_cfg}"));
        }
        debug!(%template, blocks = %block_cfg, threads = %thread_cfg, "launch configuration");
        let mut config = ctx.session.config_mut();
        config.block_cfg = Some(block_cfg);
        config.thread_cfg = Some(thread_cfg);
        Ok(())
    }
}

fn default_thread_limit(template: Template, gpu: &GpuInfo) -> Vec<i64> {
    match template {
        Template::AllReduce => vec![1],
        Template::Transpose => TRANSPOSE_THREADS.to_vec(),
        _ => vec![gpu.max_threads; 2],
    }
}

fn default_block_limit(template: Template, gpu: &GpuInfo) -> Vec<i64> {
    match template {
        Template::AllReduce => vec![1],
        Template::Transpose => vec![gpu.max_blocks; 2],
        _ => vec![gpu.max_blocks; 3],
    }
}

/// Axes of the first band, innermost first. Undetermined mapping extents
/// become the axis range.
fn build_axes_queue(axes: &mut AxisTree) -> Vec<Pending> {
    let mut pending = Vec::new();
    for id in axes.band_axes(0) {
        let a = axes.axis_mut(id);
        if a.has_attr(BLOCK_ONLY) {
            a.thread.map_extent = 1;
        }
        if a.thread.map_extent == 0 {
            a.thread.map_extent = a.range_extent;
        }
        if a.block.map_extent == 0 {
            a.block.map_extent = a.range_extent;
        }
        pending.insert(
            0,
            Pending {
                axis: id,
                shape: a.range_extent,
            },
        );
    }
    pending
}

fn ceil_to_warp(n: i64, warp: i64) -> i64 {
    (n + warp - 1) / warp * warp
}

/// Threads for an axis of `shape` elements when `rest` are still free.
fn thread_size(rest: i64, shape: i64, warp: i64) -> i64 {
    if shape > rest {
        rest
    } else {
        rest.min(ceil_to_warp(shape, warp))
    }
}

/// Largest divisor of `shape` not above `limit`.
fn divisible_factor(limit: i64, shape: i64) -> i64 {
    let limit = limit.min(shape).max(1);
    (1..=limit).rev().find(|d| shape % d == 0).unwrap_or(1)
}

/// Gives threads to the pending axes, innermost first. Axes with range
/// left over, and axes kept off threads but allowed on blocks, are queued
/// again behind the original entries. Returns the thread sizes, `x` first.
///
/// The range left over after `used` threads is `ceil(shape / used)`.
fn map_threads(
    axes: &mut AxisTree,
    pending: &mut Vec<Pending>,
    limit: &[i64],
    gpu: &GpuInfo,
    mapped: &mut Vec<AxisId>,
) -> Vec<i64> {
    let thread_dim = limit.len().min(gpu.max_thread_dims);
    let mut activated = 1;
    let mut cfg: Vec<i64> = Vec::new();
    let original = pending.len();
    for i in 0..original {
        let Pending { axis: id, shape } = pending[i];
        let rest = (gpu.max_threads / activated).min(limit.get(cfg.len()).copied().unwrap_or(1));
        let a = axes.axis_mut(id);
        if a.thread.map_extent <= 1 {
            if a.block.map_extent > 1 {
                pending.push(Pending { axis: id, shape });
            }
            continue;
        }
        if rest <= 1 || cfg.len() >= thread_dim {
            a.restrain_to_single_value(TileLevel::L1, 1);
            if a.block.map_extent > 1 {
                pending.push(Pending { axis: id, shape });
            }
            continue;
        }
        let used = thread_size(rest.min(a.thread.map_extent), shape, gpu.warp_size);
        activated *= ceil_to_warp(used, gpu.warp_size);
        cfg.push(used);
        a.restrain_to_single_value(TileLevel::L1, used.min(shape));
        mapped.push(id);
        let left = (shape + used - 1) / used;
        if left > 1 && a.block.map_extent > 1 {
            pending.push(Pending { axis: id, shape: left });
        }
    }
    cfg
}

/// Gives blocks to the axes [`map_threads`] queued. Outer axes come
/// first unless every queued axis is elementwise, in which case the axes
/// dividing into the most blocks come first. Returns the block sizes, `x`
/// first.
///
/// Block dimensions follow that sorted order, not the queue order.
fn map_blocks(axes: &mut AxisTree, queued: &[Pending], limit: &[i64], gpu: &GpuInfo, threaded: &[AxisId]) -> Vec<i64> {
    let block_dim = limit.len().min(gpu.max_block_dims);
    let mut cfg = vec![1; block_dim];
    let mut order: Vec<usize> = (0..queued.len()).rev().collect();
    if queued.iter().all(|p| is_elemwise_axis(axes.axis(p.axis))) {
        order.sort_by_key(|&j| std::cmp::Reverse(divisible_factor(gpu.max_blocks, queued[j].shape)));
    }
    let mut activated = 1;
    for (slot, j) in order.into_iter().enumerate().take(block_dim) {
        let Pending { axis: id, shape } = queued[j];
        let a = axes.axis_mut(id);
        let rest = (gpu.max_blocks / activated).min(limit[slot]).min(a.block.map_extent);
        if rest <= 1 {
            continue;
        }
        let used = divisible_factor(rest, shape);
        cfg[slot] = used;
        activated *= used;
        if !threaded.contains(&id) {
            a.restrain_upper(TileLevel::L1, (shape / used).max(1));
        }
    }
    while cfg.len() > 1 && cfg.last() == Some(&1) {
        cfg.pop();
    }
    cfg
}
