//! Tiling and marking a schedule tree for a GPU launch.

use crate::strategy::gpu_strategies;
use crate::template::{determine_template, Template};
use tpo_footprint::TensorTable;
use tpo_poly::{NodeId, ScheduleTree};
use tpo_session::{MappingCfg, Session};
use tpo_tiling::{TilingPlan, TilingResult, TilingSolver};
use tracing::{info, instrument};

/// Mark above the loops distributed over blocks.
pub const BLOCK_MARKER: &str = "block_marker";

/// Mark above the loops distributed over threads.
pub const THREAD_MARKER: &str = "thread_marker";

/// Outcome of [`GpuMapper::run`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GpuMapping {
    /// Template the kernel was recognised as.
    pub template: Template,
    /// Blocks per grid dimension.
    pub block_cfg: MappingCfg,
    /// Threads per block dimension.
    pub thread_cfg: MappingCfg,
    /// Tiles applied to the tree.
    pub plan: TilingPlan,
    /// Block marks inserted, one per outermost band.
    pub block_marks: Vec<NodeId>,
    /// Thread marks inserted, one per outermost band.
    pub thread_marks: Vec<NodeId>,
}

/// Chooses tiles and launch sizes and marks the tree with them.
pub struct GpuMapper<'a> {
    session: &'a Session,
}

impl<'a> GpuMapper<'a> {
    /// Mapper for `session`; the session is switched to GPU tiling.
    #[must_use]
    pub fn new(session: &'a Session) -> Self {
        session.config_mut().is_gpu = true;
        Self { session }
    }

    /// Tiles every outermost band and marks it: the tile loops below a
    /// [`BLOCK_MARKER`], the point loops below a [`THREAD_MARKER`]. A band
    /// that needs no tiling carries both marks.
    ///
    /// # Errors
    ///
    /// Fails when no tiles fit the shared memory or a band cannot be tiled.
    #[instrument(skip_all, fields(stmts = tree.num_stmts()))]
    pub fn run(&self, tree: &mut ScheduleTree, tensors: &TensorTable) -> TilingResult<GpuMapping> {
        let solver = TilingSolver::with_strategies(self.session, gpu_strategies());
        let analyzer = solver.analyze(tree, tensors)?;
        let template = determine_template(&analyzer.axes);
        let plan = solver.search(&analyzer, tree, tensors)?;

        let mut block_marks = Vec::with_capacity(plan.bands.len());
        let mut thread_marks = Vec::with_capacity(plan.bands.len());
        for band in &plan.bands {
            let extents = tree.band_extents(band.node)?;
            let inner = if band.l1.iter().zip(&extents).all(|(t, e)| t >= e) {
                band.node
            } else {
                tree.band_tile(band.node, &band.l1)?
            };
            let thread_mark = tree.insert_mark(inner, THREAD_MARKER);
            thread_marks.push(thread_mark);
            let outer = if inner == band.node { thread_mark } else { band.node };
            block_marks.push(tree.insert_mark(outer, BLOCK_MARKER));
        }

        let (block_cfg, thread_cfg) = {
            let config = self.session.config();
            (
                config.block_cfg.clone().unwrap_or_default(),
                config.thread_cfg.clone().unwrap_or_default(),
            )
        };
        info!(%template, blocks = %block_cfg, threads = %thread_cfg, "GPU mapping done");
        Ok(GpuMapping {
            template,
            block_cfg,
            thread_cfg,
            plan,
            block_marks,
            thread_marks,
        })
    }
}
