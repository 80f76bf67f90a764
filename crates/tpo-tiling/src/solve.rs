//! Choosing the tiles and applying them.

use crate::analyze::TilingAnalyzer;
use crate::axis::{AxisId, TileLevel};
use crate::memory::MemoryEstimator;
use crate::multicore::MulticoreStrategy;
use crate::space::TileSpace;
use crate::strategy::{ai_core_strategies, TilingStrategy};
use crate::TilingResult;
use tpo_footprint::TensorTable;
use tpo_poly::{NodeId, ScheduleTree};
use tpo_session::{DumpLevel, LogStage, Session};
use tracing::{debug, info, instrument};

/// Chosen tiles of one outermost band.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BandTiles {
    /// The band node.
    pub node: NodeId,
    /// Axes, outermost first.
    pub axes: Vec<AxisId>,
    /// Outer tiles.
    pub l1: Vec<i64>,
    /// Inner tiles.
    pub l0: Vec<i64>,
}

/// Chosen tiles of a kernel.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TilingPlan {
    /// One entry per outermost band.
    pub bands: Vec<BandTiles>,
}

impl TilingPlan {
    /// Tiles every band whose outer tiles are smaller than its extents.
    /// Returns the point bands created, in band order.
    ///
    /// # Errors
    ///
    /// Fails when a band cannot be tiled.
    pub fn apply(&self, tree: &mut ScheduleTree) -> TilingResult<Vec<NodeId>> {
        let mut points = Vec::new();
        for band in &self.bands {
            let extents = tree.band_extents(band.node)?;
            if band.l1.iter().zip(&extents).all(|(t, e)| t >= e) {
                continue;
            }
            points.push(tree.band_tile(band.node, &band.l1)?);
        }
        Ok(points)
    }

    /// Outer tiles of every band, concatenated.
    #[must_use]
    pub fn l1_tiles(&self) -> Vec<i64> {
        self.bands.iter().flat_map(|b| b.l1.iter().copied()).collect()
    }
}

/// Runs analysis, constraint strategies, search and multicore adjustment.
pub struct TilingSolver<'a> {
    session: &'a Session,
    strategies: Vec<Box<dyn TilingStrategy>>,
}

impl<'a> TilingSolver<'a> {
    /// Solver with the AI-core strategies.
    #[must_use]
    pub fn new(session: &'a Session) -> Self {
        Self::with_strategies(session, ai_core_strategies())
    }

    /// Solver with custom strategies.
    #[must_use]
    pub fn with_strategies(session: &'a Session, strategies: Vec<Box<dyn TilingStrategy>>) -> Self {
        Self { session, strategies }
    }

    /// Builds the axes of `tree` and constrains them.
    ///
    /// # Errors
    ///
    /// Fails on malformed directives or missing convolution attributes.
    pub fn analyze(&self, tree: &ScheduleTree, tensors: &TensorTable) -> TilingResult<TilingAnalyzer> {
        let mut analyzer = TilingAnalyzer::build(tree, tensors, self.session)?;
        analyzer.add_constraints(&self.strategies, self.session)?;
        Ok(analyzer)
    }

    /// Chooses tiles for `tree`.
    ///
    /// # Errors
    ///
    /// [`crate::TilingError::MemoryAllocation`] when even the smallest
    /// tiles overflow a scope, or any analysis error.
    #[instrument(skip_all, fields(stmts = tree.num_stmts()))]
    pub fn solve(&self, tree: &ScheduleTree, tensors: &TensorTable) -> TilingResult<TilingPlan> {
        let analyzer = self.analyze(tree, tensors)?;
        self.search(&analyzer, tree, tensors)
    }

    /// Chooses tiles for already constrained axes.
    ///
    /// # Errors
    ///
    /// [`crate::TilingError::MemoryAllocation`] when even the smallest
    /// tiles overflow a scope.
    pub fn search(&self, analyzer: &TilingAnalyzer, tree: &ScheduleTree, tensors: &TensorTable) -> TilingResult<TilingPlan> {
        let estimators: Vec<MemoryEstimator> = (0..analyzer.bands.len())
            .map(|b| MemoryEstimator::new(analyzer, b, tree, tensors, self.session))
            .collect();
        for est in &estimators {
            let lines = est
                .buffers
                .iter()
                .map(|b| format!("{} [{}] live {}..={}", b.name, b.scope, b.live.0, b.live.1));
            self.session
                .logger()
                .append_all(LogStage::BufferLiveExtent, DumpLevel::General, lines);
        }

        let space = TileSpace::collect(analyzer, &estimators, self.session);
        let mut chosen: Vec<Vec<i64>> = match select(analyzer, &space) {
            Some(combo) => combo
                .iter()
                .enumerate()
                .map(|(b, &i)| space.bands[b][i].tiles.clone())
                .collect(),
            None => {
                info!("no admissible tiles, falling back to minimum tiles");
                estimators
                    .iter()
                    .map(|est| est.axes.iter().map(|&a| analyzer.axes.axis(a).l1.tile_min).collect())
                    .collect()
            }
        };

        let (core_num, is_gpu) = {
            let config = self.session.config();
            (config.core_num, config.is_gpu)
        };
        if core_num > 1 && !is_gpu {
            for (est, tiles) in estimators.iter().zip(chosen.iter_mut()) {
                let mc = MulticoreStrategy::new(analyzer, est, self.session, core_num);
                if let Some(pos) = mc.multicore_axis() {
                    let adjusted = mc.adjust(tiles, pos);
                    tiles[pos] = adjusted;
                }
            }
        }

        for (est, tiles) in estimators.iter().zip(&chosen) {
            est.usage(tiles).check(self.session.target())?;
        }

        let plan = TilingPlan {
            bands: analyzer
                .bands
                .iter()
                .zip(chosen)
                .map(|(band, l1)| {
                    let l0 = band
                        .axes
                        .iter()
                        .zip(&l1)
                        .map(|(&a, &t)| inner_tile(analyzer, a, t))
                        .collect();
                    BandTiles {
                        node: band.node,
                        axes: band.axes.clone(),
                        l1,
                        l0,
                    }
                })
                .collect(),
        };
        let mut logger = self.session.logger();
        for (b, band) in plan.bands.iter().enumerate() {
            logger.append(
                LogStage::DoTiling,
                DumpLevel::General,
                format!("band {b}: L1 {:?} L0 {:?}", band.l1, band.l0),
            );
        }
        debug!(tiles = ?plan.l1_tiles(), "tiles chosen");
        Ok(plan)
    }
}

/// Combination with the largest aligned memory; ties go to the one
/// with larger tiles on higher-priority axes.
fn select<'s>(analyzer: &TilingAnalyzer, space: &'s TileSpace) -> Option<&'s Vec<usize>> {
    let key = |combo: &Vec<usize>| {
        let aligned: u64 = combo
            .iter()
            .enumerate()
            .map(|(b, &i)| space.bands[b][i].usage.aligned_bytes)
            .sum();
        let mut ranked: Vec<(i32, i64)> = combo
            .iter()
            .enumerate()
            .flat_map(|(b, &i)| {
                analyzer.bands[b]
                    .axes
                    .iter()
                    .zip(&space.bands[b][i].tiles)
                    .map(|(&a, &t)| (analyzer.axes.axis(a).priority, t))
            })
            .collect();
        ranked.sort_by(|x, y| y.0.cmp(&x.0));
        let tiles: Vec<i64> = ranked.into_iter().map(|(_, t)| t).collect();
        (aligned, tiles)
    };
    space.combinations.iter().max_by(|a, b| key(a).cmp(&key(b)))
}

/// Inner tile for outer tile `outer`: the largest admissible inner tile
/// not above it.
fn inner_tile(analyzer: &TilingAnalyzer, axis: AxisId, outer: i64) -> i64 {
    let a = analyzer.axes.axis(axis);
    let c = &a.l0;
    let capped = outer.clamp(c.tile_min, c.tile_extent.max(c.tile_min));
    if a.tile_is_valid(TileLevel::L0, capped) {
        return capped;
    }
    c.scan_values(a.forbid_iso)
        .into_iter()
        .filter(|&t| t <= capped && a.tile_is_valid(TileLevel::L0, t))
        .max()
        .unwrap_or(c.tile_min)
}
