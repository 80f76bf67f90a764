//! Building the axis tree from a schedule tree.
//!
//! Each outermost band becomes a chain of axes. Statement shapes then mark
//! the axes: reduction axes and whether the source or destination keeps the
//! innermost dimension, transposition, broadcast, elementwise work, casts,
//! modular indexing, data-dependent (tensor-of-tensor) indexing, and the
//! roles of convolution and matmul loops taken from their iteration names.
//! Custom directives from the configuration are attached last.

use crate::axis::{AttrInfo, AxisId, AxisTree, TileLevel};
use crate::{TilingError, TilingResult};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tpo_footprint::TensorTable;
use tpo_poly::{IndexExpr, NodeId, NodeKind, ScheduleDim, ScheduleTree, StmtIdx, StmtKind};
use tpo_session::{DumpLevel, LogStage, Session};
use tracing::{debug, instrument};

/// Loop roles of a convolution, by iteration name.
pub const CONV_AXES: [&str; 9] = ["N", "C1_in_out", "H", "W", "C0_out", "C1_in", "kh", "kw", "C0_in"];

/// Loop roles of a fractal matmul, by iteration name.
pub const GEMM_AXES: [&str; 8] = ["bo", "bi", "no", "mo", "mi", "ni", "ko", "ki"];

/// Bytes assumed for tensors missing from the table.
const DEFAULT_ELEM_BYTES: i64 = 4;

/// What kind of kernel is being tiled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TileOpType {
    /// Vector work only.
    Vector,
    /// Contains a convolution.
    Conv,
    /// Contains a matrix multiplication.
    Gemm,
}

/// The axes of one outermost band.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BandAxes {
    /// The band node.
    pub node: NodeId,
    /// Its axes, outermost first.
    pub axes: Vec<AxisId>,
    /// Compute statements below it, in execution order.
    pub stmts: Vec<StmtIdx>,
}

/// The axis tree of a kernel with its band bookkeeping.
#[derive(Clone, Debug)]
pub struct TilingAnalyzer {
    /// The axes.
    pub axes: AxisTree,
    /// One entry per outermost band, in tree order.
    pub bands: Vec<BandAxes>,
    /// Kind of kernel.
    pub op_type: TileOpType,
    /// Tiling for the GPU pipeline.
    pub is_gpu: bool,
}

impl TilingAnalyzer {
    /// Builds and marks the axes of every outermost band of `tree`.
    ///
    /// # Errors
    ///
    /// Fails on malformed custom directives.
    #[instrument(skip_all, fields(stmts = tree.num_stmts()))]
    pub fn build(tree: &ScheduleTree, tensors: &TensorTable, session: &Session) -> TilingResult<Self> {
        let (is_gpu, directives) = {
            let config = session.config();
            (config.is_gpu, config.custom_tiling.clone())
        };
        let mut analyzer = Self {
            axes: AxisTree::new(),
            bands: Vec::new(),
            op_type: TileOpType::Vector,
            is_gpu,
        };
        let order = tree.stmt_order();
        for node in outermost_bands(tree) {
            analyzer.add_band(tree, node, &order)?;
        }
        for b in 0..analyzer.bands.len() {
            let stmts = analyzer.bands[b].stmts.clone();
            for s in stmts {
                analyzer.mark_stmt(tree, b, s, tensors);
            }
        }
        let ids = analyzer.axes.top_down();
        for id in ids {
            let a = analyzer.axes.axis_mut(id);
            a.mc_sup = !a.has_attr("REDUCE_AXIS");
        }
        for d in &directives {
            analyzer.apply_directive(d)?;
        }

        session
            .logger()
            .append_all(LogStage::ScheduleTreeAnalysis, DumpLevel::General, analyzer.axes.dump());
        debug!(bands = analyzer.bands.len(), axes = analyzer.axes.len() - 1, op = ?analyzer.op_type, "axis tree built");
        Ok(analyzer)
    }

    fn add_band(&mut self, tree: &ScheduleTree, node: NodeId, order: &[StmtIdx]) -> TilingResult<()> {
        let band = tree.band(node)?;
        let extents = tree.band_extents(node)?;
        let below = tree.stmts_below(node);
        let stmts: Vec<StmtIdx> = order
            .iter()
            .copied()
            .filter(|s| below.contains(s) && matches!(tree.stmt(*s).kind, StmtKind::Compute { .. }))
            .collect();
        let index = self.bands.len();
        let mut parent = self.axes.root();
        let mut axes = Vec::with_capacity(band.len());
        for (k, dim) in band.dims.iter().enumerate() {
            let ranges: Vec<(i64, i64)> = dim
                .iter()
                .filter(|(s, _)| below.contains(s))
                .map(|(s, sched)| {
                    let (lo, hi) = sched.range(&tree.stmt(*s).domain);
                    (lo, hi + 1)
                })
                .collect();
            let range_min = ranges.iter().map(|r| r.0).min().unwrap_or(0);
            let extent = extents.get(k).copied().unwrap_or(1);
            let id = self.axes.add_axis(parent, index, k, range_min, extent);
            self.axes.axis_mut(id).tree_ranges = ranges;
            axes.push(id);
            parent = id;
        }
        self.bands.push(BandAxes { node, axes, stmts });
        Ok(())
    }

    /// Band axis scanning each iteration variable of `stmt`.
    pub(crate) fn var_axes(&self, tree: &ScheduleTree, band: usize, stmt: StmtIdx) -> FxHashMap<usize, AxisId> {
        let info = &self.bands[band];
        let Ok(b) = tree.band(info.node) else {
            return FxHashMap::default();
        };
        b.dims
            .iter()
            .zip(&info.axes)
            .filter_map(|(dim, &axis)| dim.get(&stmt).and_then(ScheduleDim::single_var).map(|v| (v, axis)))
            .collect()
    }

    fn mark(&mut self, axis: Option<&AxisId>, key: &str, value: &str) {
        if let Some(&id) = axis {
            self.axes.axis_mut(id).mark_with_attr(AttrInfo::new(key, value));
        }
    }

    fn mark_stmt(&mut self, tree: &ScheduleTree, band: usize, stmt: StmtIdx, tensors: &TensorTable) {
        let info = tree.stmt(stmt);
        let StmtKind::Compute { op } = &info.kind else {
            return;
        };
        let name = info.name.as_str();
        let rank = info.domain.rank();
        let axes = self.var_axes(tree, band, stmt);
        let bytes = |t: &str| {
            tensors
                .get(t)
                .and_then(|i| i64::try_from(i.elem_bytes).ok())
                .unwrap_or(DEFAULT_ELEM_BYTES)
        };

        for access in &info.accesses {
            for v in 0..rank {
                if access.index.iter().any(|e| e.involves(v)) {
                    if let Some(&id) = axes.get(&v) {
                        self.axes
                            .axis_mut(id)
                            .data_size
                            .insert(access.tensor.clone(), bytes(&access.tensor));
                    }
                }
            }
            let mut mods = Vec::new();
            for e in &access.index {
                modular_factors(e, &mut mods);
            }
            for (v, m) in mods {
                self.mark(axes.get(&v), "MOD", &m.to_string());
            }
        }

        let write = info.writes().next();
        let vars_of = |e: Option<&IndexExpr>| -> SmallVec<[usize; 4]> {
            e.map(|e| (0..rank).filter(|&v| e.involves(v)).collect())
                .unwrap_or_default()
        };
        let write_vars: Vec<usize> = (0..rank)
            .filter(|&v| write.is_some_and(|w| w.index.iter().any(|e| e.involves(v))))
            .collect();
        let write_last = vars_of(write.and_then(|w| w.index.last()));

        let mut special = false;
        if op.starts_with("Reduce") {
            special = true;
            for v in (0..rank).filter(|v| !write_vars.contains(v)) {
                self.mark(axes.get(&v), "REDUCE_AXIS", name);
            }
            if let Some(src) = info.reads().next() {
                let src_last = vars_of(src.index.last());
                let reduced_last: Vec<usize> = src_last.iter().copied().filter(|v| !write_vars.contains(v)).collect();
                if reduced_last.is_empty() {
                    for v in &write_last {
                        self.mark(axes.get(v), "REDUCE_DST_LAST", name);
                    }
                } else {
                    for v in &reduced_last {
                        self.mark(axes.get(v), "REDUCE_SRC_LAST", name);
                    }
                }
            }
        }

        for read in info.reads() {
            let read_vars: Vec<usize> = (0..rank)
                .filter(|&v| read.index.iter().any(|e| e.involves(v)))
                .collect();
            let read_last = vars_of(read.index.last());
            let transposed = op == "Transpose"
                || (!read_last.is_empty()
                    && !write_last.is_empty()
                    && read_vars.len() == write_vars.len()
                    && read_last != write_last);
            if transposed {
                special = true;
                for v in read_last.iter().chain(&write_last) {
                    self.mark(axes.get(v), "TRANSPOSE", name);
                }
            }
            if !op.starts_with("Reduce") && (op == "BroadcastTo" || read_vars.len() < write_vars.len()) {
                special = true;
                for v in write_vars.iter().filter(|v| !read_vars.contains(v)) {
                    self.mark(axes.get(v), "BROADCAST", name);
                }
            }
            if read.index.iter().any(|e| matches!(e, IndexExpr::Any)) {
                for v in 0..rank {
                    self.mark(axes.get(&v), "TOT", name);
                }
                let inner = self.bands[band]
                    .axes
                    .iter()
                    .rev()
                    .find(|id| axes.values().any(|a| a == *id))
                    .copied();
                self.mark(inner.as_ref(), "ALIGN", "DMA");
            }
        }

        match op.as_str() {
            "Conv" => {
                self.op_type = TileOpType::Conv;
                for (v, n) in info.domain.names().iter().enumerate() {
                    if CONV_AXES.contains(&n.as_str()) {
                        self.mark(axes.get(&v), "CONV", n);
                    }
                }
            }
            "Matmul" | "BatchMatMul" => {
                if self.op_type != TileOpType::Conv {
                    self.op_type = TileOpType::Gemm;
                }
                for (v, n) in info.domain.names().iter().enumerate() {
                    if GEMM_AXES.contains(&n.as_str()) {
                        self.mark(axes.get(&v), "GEMM", n);
                    }
                }
            }
            "Cast" => {
                if let (Some(src), Some(dst)) = (info.reads().next(), write) {
                    let value = format!(
                        "{}:{}->{}:{}",
                        src.tensor,
                        bytes(&src.tensor),
                        dst.tensor,
                        bytes(&dst.tensor)
                    );
                    for v in &write_vars {
                        self.mark(axes.get(v), "CAST", &value);
                    }
                }
            }
            _ => {
                if !special {
                    for v in &write_vars {
                        self.mark(axes.get(v), "ELEMWISE", name);
                    }
                }
                if !self.is_gpu {
                    if let [v] = write_last.as_slice() {
                        self.mark(axes.get(v), "VECTORIZED", name);
                    }
                }
            }
        }
    }

    /// Attaches one custom directive, `[LEVEL:]ITEM:AXIS:VALUE` with
    /// `AXIS` either `dim` (band 0) or `band.dim`.
    ///
    /// `ATTR` directives mark the axis directly with `KEY[=VALUE]`; every
    /// other item becomes a `CUSTOM:<level>` attribute read by the custom
    /// tiling strategy.
    ///
    /// # Errors
    ///
    /// Fails with [`TilingError::InvalidDirective`] when the directive is
    /// malformed or names a missing axis.
    pub fn apply_directive(&mut self, directive: &str) -> TilingResult<()> {
        let invalid = |reason| TilingError::InvalidDirective {
            directive: directive.to_string(),
            reason,
        };
        let mut parts: Vec<&str> = directive.split(':').map(str::trim).collect();
        let level = match parts.first().and_then(|p| TileLevel::parse(p)) {
            Some(level) => {
                parts.remove(0);
                level
            }
            None => TileLevel::L1,
        };
        let [item, axis, value] = parts.as_slice() else {
            return Err(invalid("expected ITEM:AXIS:VALUE"));
        };
        if value.is_empty() {
            return Err(invalid("empty value"));
        }
        let (band, dim) = match axis.split_once('.') {
            Some((b, d)) => (b.parse::<usize>(), d.parse::<usize>()),
            None => (Ok(0), axis.parse::<usize>()),
        };
        let (Ok(band), Ok(dim)) = (band, dim) else {
            return Err(invalid("axis must be `dim` or `band.dim`"));
        };
        let id = self
            .bands
            .get(band)
            .and_then(|b| b.axes.get(dim))
            .copied()
            .ok_or_else(|| invalid("no such axis"))?;

        let int_ok = value.parse::<i64>().is_ok_and(|v| v > 0);
        let well_formed = match *item {
            "MIN" => int_ok || *value == "MIN",
            "MAX" => int_ok || *value == "FULL",
            "MOD" | "FACTOR" | "CANDIDATE" => int_ok,
            "PRIORITY" => value.parse::<i32>().is_ok(),
            "FORBIDISO" | "AXISINFO" | "ATTR" => true,
            _ => return Err(invalid("unknown item")),
        };
        if !well_formed {
            return Err(invalid("value must be a positive integer"));
        }

        let a = self.axes.axis_mut(id);
        if *item == "ATTR" {
            let (key, val) = value.split_once('=').unwrap_or((*value, ""));
            a.mark_with_attr(AttrInfo::new(key, val));
        } else {
            a.mark_with_attr(AttrInfo::new(format!("CUSTOM:{}", level.name()), format!("{item}:{value}")));
        }
        Ok(())
    }

    /// Axes of band `band`, outermost first.
    #[must_use]
    pub fn band_axes(&self, band: usize) -> &[AxisId] {
        self.bands.get(band).map_or(&[], |b| b.axes.as_slice())
    }
}

/// Outermost bands of `tree`, in preorder.
#[must_use]
pub fn outermost_bands(tree: &ScheduleTree) -> Vec<NodeId> {
    tree.bands()
        .into_iter()
        .filter(|&band| {
            let path = tree.path_to(band);
            !path[..path.len() - 1]
                .iter()
                .any(|&n| matches!(tree.kind(n), NodeKind::Band(_)))
        })
        .collect()
}

/// `(variable, factor)` for every variable under a `mod` or `floor` in `e`.
fn modular_factors(e: &IndexExpr, out: &mut Vec<(usize, i64)>) {
    match e {
        IndexExpr::Mod(inner, m) | IndexExpr::FloorDiv(inner, m) => {
            for v in 0..inner.dim() {
                if inner.involves(v) && !out.contains(&(v, *m)) {
                    out.push((v, *m));
                }
            }
            modular_factors(inner, out);
        }
        IndexExpr::Add(a, b) => {
            modular_factors(a, out);
            modular_factors(b, out);
        }
        IndexExpr::Scale(inner, _) => modular_factors(inner, out),
        IndexExpr::Aff(_) | IndexExpr::Any => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modular_factors() {
        let e = IndexExpr::var(2, 0).plus(IndexExpr::var(2, 1).modulo(16));
        let mut out = Vec::new();
        modular_factors(&e, &mut out);
        assert_eq!(out, vec![(1, 16)]);

        let e = IndexExpr::var(2, 0).floor_div(4).scale(2);
        let mut out = Vec::new();
        modular_factors(&e, &mut out);
        assert_eq!(out, vec![(0, 4)]);
    }
}
