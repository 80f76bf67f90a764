//! The concrete passes and the two standard pipelines.
//!
//! Both pipelines share the graph prefix:
//!
//! ```text
//! normalize_axis ─► eliminate_transforms ─► fold_dimensions ─► build_scop
//! ```
//!
//! The AI-core pipeline then tiles and places unified-buffer copies below
//! the tile loops; the GPU pipeline maps the tiles to blocks and threads
//! and promotes tensors to shared memory.

use crate::pass::{PassContext, PassManager, PassOutcome, SchedulePass, TightenTiles};
use crate::scop::Scop;
use crate::OptimizeResult;
use indexmap::IndexSet;
use tpo_footprint::{CopyPlacer, HoistOptions, SharedMemoryManager};
use tpo_graph::desc::Process;
use tpo_graph::elim::eliminate_transforms;
use tpo_graph::fold::fold_dimensions;
use tpo_graph::normalize::normalize_axis_attrs;
use tpo_gpu::GpuMapper;
use tpo_poly::{NodeId, NodeKind, ScheduleTree};
use tpo_session::Session;
use tpo_target::MemScope;
use tpo_tiling::TilingSolver;
use tracing::{debug, info};

/// The pipeline for `process`, with tile tightening on memory failures.
#[must_use]
pub fn pipeline_for(process: Process) -> PassManager {
    let manager = graph_prefix(PassManager::new()).with_retry(TightenTiles);
    match process {
        Process::AiCore => manager.with_pass(TilePass).with_pass(PlaceCopiesPass),
        Process::Cuda => manager.with_pass(GpuMapPass).with_pass(SharedPromotionPass),
    }
}

fn graph_prefix(manager: PassManager) -> PassManager {
    manager
        .with_pass(NormalizeAxisPass)
        .with_pass(EliminateTransformsPass)
        .with_pass(FoldDimensionsPass)
        .with_pass(BuildScopPass)
}

// ============================================================================
// Graph passes
// ============================================================================

/// Brings negative `axis` attributes into range.
pub struct NormalizeAxisPass;

impl SchedulePass for NormalizeAxisPass {
    fn name(&self) -> &'static str {
        "normalize_axis"
    }

    fn run(&self, ctx: &mut PassContext, _session: &Session) -> OptimizeResult<PassOutcome> {
        let rewritten = normalize_axis_attrs(&mut ctx.graph);
        debug!(rewritten, "axis attributes normalized");
        Ok(PassOutcome::Continue)
    }
}

/// Removes redundant shape-only statements.
pub struct EliminateTransformsPass;

impl SchedulePass for EliminateTransformsPass {
    fn name(&self) -> &'static str {
        "eliminate_transforms"
    }

    fn run(&self, ctx: &mut PassContext, _session: &Session) -> OptimizeResult<PassOutcome> {
        let result = eliminate_transforms(&mut ctx.graph)?;
        info!(removed = result.removed.len(), reshapes = result.reshapes.len(), "transforms eliminated");
        ctx.elim = Some(result);
        Ok(PassOutcome::Continue)
    }
}

/// Merges dimensions that every statement treats alike.
pub struct FoldDimensionsPass;

impl SchedulePass for FoldDimensionsPass {
    fn name(&self) -> &'static str {
        "fold_dimensions"
    }

    fn run(&self, ctx: &mut PassContext, _session: &Session) -> OptimizeResult<PassOutcome> {
        let report = fold_dimensions(&mut ctx.graph)?;
        info!(
            applied = report.applied,
            folded = report.folded_dims,
            total = report.total_dims,
            "dimensions folded"
        );
        ctx.fold = Some(report);
        Ok(PassOutcome::Continue)
    }
}

/// Builds the schedule tree of the rewritten graph.
pub struct BuildScopPass;

impl SchedulePass for BuildScopPass {
    fn name(&self) -> &'static str {
        "build_scop"
    }

    fn run(&self, ctx: &mut PassContext, _session: &Session) -> OptimizeResult<PassOutcome> {
        ctx.scop = Some(Scop::from_graph(&ctx.graph)?);
        Ok(PassOutcome::Continue)
    }
}

// ============================================================================
// AI-core passes
// ============================================================================

/// Chooses tiles and tiles the outermost bands.
pub struct TilePass;

impl SchedulePass for TilePass {
    fn name(&self) -> &'static str {
        "tile"
    }

    fn run(&self, ctx: &mut PassContext, session: &Session) -> OptimizeResult<PassOutcome> {
        let scop = ctx.scop_mut(self.name())?;
        let plan = TilingSolver::new(session).solve(&scop.tree, &scop.tensors)?;
        let points = plan.apply(&mut scop.tree)?;
        info!(tiles = ?plan.l1_tiles(), tiled = points.len(), "tiles applied");
        ctx.plan = Some(plan);
        Ok(PassOutcome::Continue)
    }
}

/// Copies every tensor into the unified buffer below the tile loops of
/// each tiled band.
pub struct PlaceCopiesPass;

impl SchedulePass for PlaceCopiesPass {
    fn name(&self) -> &'static str {
        "place_copies"
    }

    fn run(&self, ctx: &mut PassContext, session: &Session) -> OptimizeResult<PassOutcome> {
        let bands: Vec<NodeId> = ctx
            .plan
            .as_ref()
            .map(|p| p.bands.iter().map(|b| b.node).collect())
            .unwrap_or_default();
        let scop = ctx.scop_mut(self.name())?;
        let Scop { tree, tensors, .. } = scop;
        let scopes: Vec<NodeId> = bands.into_iter().map(|b| copy_scope(tree, b)).collect();
        let mut placer = CopyPlacer::new(session, tensors);
        let opts = HoistOptions::new(MemScope::Unified);
        for node in scopes {
            for tensor in tensors_below(tree, node) {
                if let Some(hoisted) = placer.hoist(tree, node, &tensor, &opts)? {
                    debug!(%tensor, buffer = %hoisted.buffer, "copy placed");
                }
            }
        }
        let buffers = placer.into_buffers();
        info!(buffers = buffers.len(), bytes = buffers.bytes(MemScope::Unified), "copies placed");
        ctx.buffers = buffers;
        Ok(PassOutcome::Continue)
    }
}

/// The point band below each tiled band, or the band itself when it was
/// left whole.
fn copy_scope(tree: &ScheduleTree, band: NodeId) -> NodeId {
    match tree.child(band, 0) {
        Ok(point) if matches!(tree.kind(point), NodeKind::Band(_)) => point,
        _ => band,
    }
}

/// Tensors referenced below `node`, reads before writes, first use order.
fn tensors_below(tree: &ScheduleTree, node: NodeId) -> IndexSet<String> {
    let stmts = tree.stmts_below(node);
    let mut out = IndexSet::new();
    for &s in &stmts {
        out.extend(tree.stmt(s).reads().map(|a| a.tensor.clone()));
    }
    for &s in &stmts {
        out.extend(tree.stmt(s).writes().map(|a| a.tensor.clone()));
    }
    out
}

// ============================================================================
// GPU passes
// ============================================================================

/// Chooses the launch configuration and marks the tree.
pub struct GpuMapPass;

impl SchedulePass for GpuMapPass {
    fn name(&self) -> &'static str {
        "gpu_map"
    }

    fn run(&self, ctx: &mut PassContext, session: &Session) -> OptimizeResult<PassOutcome> {
        let scop = ctx.scop_mut(self.name())?;
        let mapping = GpuMapper::new(session).run(&mut scop.tree, &scop.tensors)?;
        ctx.plan = Some(mapping.plan.clone());
        ctx.gpu = Some(mapping);
        Ok(PassOutcome::Continue)
    }
}

/// Promotes tensors to shared memory below the block loops.
pub struct SharedPromotionPass;

impl SchedulePass for SharedPromotionPass {
    fn name(&self) -> &'static str {
        "shared_promotion"
    }

    fn run(&self, ctx: &mut PassContext, session: &Session) -> OptimizeResult<PassOutcome> {
        if !session.config().use_shared_memory {
            debug!("shared memory disabled");
            return Ok(PassOutcome::Continue);
        }
        let scop = ctx.scop_mut(self.name())?;
        let Scop { tree, tensors, .. } = scop;
        let mut placer = CopyPlacer::new(session, tensors);
        let promotions = SharedMemoryManager::new(session).run(tree, &mut placer)?;
        ctx.buffers = placer.into_buffers();
        ctx.promotions = promotions;
        Ok(PassOutcome::Continue)
    }
}
