//! Constraint strategies.
//!
//! Each strategy looks for axes carrying particular attributes and narrows
//! their tile constraints. Strategies run in registration order; later ones
//! see the constraints earlier ones left behind. After the last one every
//! axis is settled back to `1 ≤ min ≤ extent`.

use crate::analyze::{TileOpType, TilingAnalyzer};
use crate::axis::{gcd, AxisTree, TileLevel};
use crate::{TilingError, TilingResult, MIN_TILE, MMU_UNIT, VECTORIZE_BYTES};
use tpo_session::{DumpLevel, LogStage, Session};
use tracing::{debug, instrument, warn};

/// What a strategy may consult besides the axes.
pub struct StrategyContext<'a> {
    /// The invocation's session.
    pub session: &'a Session,
    /// Kind of kernel.
    pub op_type: TileOpType,
    /// Tiling for the GPU pipeline.
    pub is_gpu: bool,
}

/// A rule turning axis attributes into constraints.
pub trait TilingStrategy {
    /// Name for logs.
    fn name(&self) -> &'static str;

    /// Narrows the constraints of matching axes.
    ///
    /// # Errors
    ///
    /// Fails when a matching axis needs configuration that is missing.
    fn add_constraint(&self, axes: &mut AxisTree, ctx: &StrategyContext<'_>) -> TilingResult<()>;
}

/// The strategies of the AI-core pipeline, in the order they run.
#[must_use]
pub fn ai_core_strategies() -> Vec<Box<dyn TilingStrategy>> {
    vec![
        Box::new(CustomTilingStrategy),
        Box::new(ConflictTreeRangeStrategy),
        Box::new(ModStrategy),
        Box::new(CastStrategy),
        Box::new(ReduceStrategy),
        Box::new(VectorizedStrategy),
        Box::new(TensorOfTensorStrategy),
        Box::new(PassDownAttrStrategy),
        Box::new(DynamicBoundStrategy),
        Box::new(ShiftAxisStrategy),
        Box::new(ModShiftAxisStrategy),
        Box::new(ConvStrategy),
        Box::new(GemmStrategy),
    ]
}

impl TilingAnalyzer {
    /// Runs `strategies` over the axes, then settles every constraint.
    ///
    /// # Errors
    ///
    /// Propagates the first strategy failure.
    #[instrument(skip_all, fields(strategies = strategies.len()))]
    pub fn add_constraints(&mut self, strategies: &[Box<dyn TilingStrategy>], session: &Session) -> TilingResult<()> {
        let ctx = StrategyContext {
            session,
            op_type: self.op_type,
            is_gpu: self.is_gpu,
        };
        for s in strategies {
            s.add_constraint(&mut self.axes, &ctx)?;
            debug!(strategy = s.name(), "constraints added");
        }
        self.axes.for_each_top_down(crate::axis::TileAxis::settle);
        let mut logger = session.logger();
        logger.append(LogStage::TilingSpace, DumpLevel::General, "After adding constraints:");
        logger.append_all(LogStage::TilingSpace, DumpLevel::General, self.axes.dump());
        Ok(())
    }
}

fn parse_i64(s: &str) -> Option<i64> {
    s.trim().parse().ok()
}

// ============================================================================
// AI-core strategies
// ============================================================================

/// Applies `CUSTOM:<level>` attributes attached from directives.
pub struct CustomTilingStrategy;

impl TilingStrategy for CustomTilingStrategy {
    fn name(&self) -> &'static str {
        "custom"
    }

    fn add_constraint(&self, axes: &mut AxisTree, _ctx: &StrategyContext<'_>) -> TilingResult<()> {
        for (id, attrs) in axes.interested_info("CUSTOM", false) {
            let axis = axes.axis_mut(id);
            for attr in attrs {
                let level = attr
                    .key
                    .split_once(':')
                    .and_then(|(_, l)| TileLevel::parse(l))
                    .unwrap_or(TileLevel::L1);
                let Some((item, value)) = attr.value.split_once(':') else {
                    continue;
                };
                let num = parse_i64(value);
                match (item, num) {
                    ("MIN", _) if value == "MIN" => {
                        let c = axis.constraint_mut(level);
                        c.tile_extent = c.tile_min;
                    }
                    ("MIN", Some(v)) => axis.constraint_mut(level).tile_min = v,
                    ("MAX", _) if value == "FULL" => axis.restrain_entire(level),
                    ("MAX", Some(v)) => axis.constraint_mut(level).tile_extent = v,
                    ("FACTOR", Some(v)) => axis.restrain_to_single_value(level, v),
                    ("CANDIDATE", Some(v)) => axis.insert_cand_factor(level, v),
                    ("MOD", Some(v)) => axis.restrain_mod(level, v),
                    ("FORBIDISO", _) => axis.forbid_iso = true,
                    ("PRIORITY", Some(v)) => axis.priority = i32::try_from(v).unwrap_or(i32::MAX),
                    ("AXISINFO", _) => axis.axis_type = value.to_string(),
                    _ => warn!(item, value, "ignoring custom tiling item"),
                }
            }
        }
        Ok(())
    }
}

/// Axes whose statements disagree on the loop range get only the
/// candidates `1` and the full extent.
pub struct ConflictTreeRangeStrategy;

impl TilingStrategy for ConflictTreeRangeStrategy {
    fn name(&self) -> &'static str {
        "conflict tree range"
    }

    fn add_constraint(&self, axes: &mut AxisTree, _ctx: &StrategyContext<'_>) -> TilingResult<()> {
        for id in axes.top_down() {
            let axis = axes.axis_mut(id);
            let offsets: Vec<i64> = axis.tree_ranges.iter().map(|r| r.0).filter(|&o| o != 0).collect();
            let mut extents: Vec<i64> = axis
                .tree_ranges
                .iter()
                .filter(|r| r.1 != 0)
                .map(|r| r.1 - r.0)
                .collect();
            extents.sort_unstable();
            extents.dedup();
            let min_off = offsets.iter().copied().min();
            let misaligned = min_off.is_some_and(|m| offsets.iter().any(|o| o % m != 0));
            if !misaligned && extents.len() < 2 {
                continue;
            }
            let mut extent = axis.range_extent;
            if !axis.has_attr("MOD") {
                axis.insert_cand_factor(TileLevel::L1, MIN_TILE);
            }
            if axis.has_attr("MODSHIFT") {
                extent -= axis.range_min;
                axis.remove_attr("MODSHIFT");
            }
            axis.remove_attr("SHIFT");
            axis.range_min = MIN_TILE;
            axis.insert_cand_factor(TileLevel::L1, extent);
            for level in [TileLevel::L1, TileLevel::L0] {
                let c = axis.constraint_mut(level);
                c.tile_min = MIN_TILE;
                c.tile_extent = extent;
            }
            debug!(band = axis.band, dim = axis.dim, extent, "conflicting tree ranges");
        }
        Ok(())
    }
}

/// `MOD` attributes become the outer tile modulus.
pub struct ModStrategy;

impl TilingStrategy for ModStrategy {
    fn name(&self) -> &'static str {
        "mod"
    }

    fn add_constraint(&self, axes: &mut AxisTree, _ctx: &StrategyContext<'_>) -> TilingResult<()> {
        for (id, attrs) in axes.interested_info("MOD", true) {
            for attr in attrs {
                if let Some(m) = parse_i64(&attr.value) {
                    axes.axis_mut(id).restrain_mod(TileLevel::L1, m);
                }
            }
        }
        Ok(())
    }
}

/// `CAST` attributes (`src:bytes[,src:bytes]->dst:bytes`) record element
/// sizes on the axis.
pub struct CastStrategy;

impl TilingStrategy for CastStrategy {
    fn name(&self) -> &'static str {
        "cast"
    }

    fn add_constraint(&self, axes: &mut AxisTree, _ctx: &StrategyContext<'_>) -> TilingResult<()> {
        for (id, attrs) in axes.interested_info("CAST", true) {
            for attr in attrs {
                let Some((src, dst)) = attr.value.split_once("->") else {
                    warn!(value = %attr.value, "malformed cast attribute");
                    continue;
                };
                for entry in src.split(',').chain([dst]) {
                    let parsed = entry.split_once(':').and_then(|(t, b)| Some((t, parse_i64(b)?)));
                    match parsed {
                        Some((tensor, bytes)) => {
                            axes.axis_mut(id).data_size.insert(tensor.to_string(), bytes);
                        }
                        None => warn!(entry, "malformed cast entry"),
                    }
                }
            }
        }
        Ok(())
    }
}

/// Reductions keeping the destination's innermost dimension need aligned
/// outer tiles there; reductions over the innermost dimension are tiled
/// first.
pub struct ReduceStrategy;

impl TilingStrategy for ReduceStrategy {
    fn name(&self) -> &'static str {
        "reduce"
    }

    fn add_constraint(&self, axes: &mut AxisTree, _ctx: &StrategyContext<'_>) -> TilingResult<()> {
        for id in axes.axes_of_attr("REDUCE_DST_LAST") {
            let axis = axes.axis_mut(id);
            let block = axis.max_align_elems();
            let align = gcd(block, axis.range_extent);
            if align == block {
                axis.l1.tile_min = align;
            } else {
                axis.priority += 1;
                axis.forbid_iso = true;
            }
        }
        for id in axes.axes_of_attr("REDUCE_SRC_LAST") {
            axes.axis_mut(id).priority += 1;
        }
        Ok(())
    }
}

/// Vectorized axes take whole vector instructions.
pub struct VectorizedStrategy;

impl TilingStrategy for VectorizedStrategy {
    fn name(&self) -> &'static str {
        "vectorized"
    }

    fn add_constraint(&self, axes: &mut AxisTree, ctx: &StrategyContext<'_>) -> TilingResult<()> {
        if ctx.op_type != TileOpType::Vector || ctx.is_gpu {
            return Ok(());
        }
        for id in axes.axes_of_attr("VECTORIZED") {
            let axis = axes.axis_mut(id);
            if axis.has_attr("DYNAMIC_BOUND") {
                continue;
            }
            let min_byte = axis.min_elem_bytes().unwrap_or(1).max(1);
            axis.l1.tile_mod = (VECTORIZE_BYTES / min_byte).max(1);
        }
        Ok(())
    }
}

/// Data-dependent accesses aligned for DMA are copied one element at a
/// time.
pub struct TensorOfTensorStrategy;

impl TilingStrategy for TensorOfTensorStrategy {
    fn name(&self) -> &'static str {
        "tensor of tensor"
    }

    fn add_constraint(&self, axes: &mut AxisTree, _ctx: &StrategyContext<'_>) -> TilingResult<()> {
        for id in axes.axes_of_attr("TOT") {
            let axis = axes.axis_mut(id);
            if axis.has_attr_value("ALIGN", "DMA") {
                axis.restrain_to_single_value(TileLevel::L1, MIN_TILE);
            }
        }
        Ok(())
    }
}

/// Axes passed down whole from an enclosing kernel are not tiled.
pub struct PassDownAttrStrategy;

impl TilingStrategy for PassDownAttrStrategy {
    fn name(&self) -> &'static str {
        "pass down"
    }

    fn add_constraint(&self, axes: &mut AxisTree, _ctx: &StrategyContext<'_>) -> TilingResult<()> {
        for id in axes.axes_with_attr_value("ATTR", "pass_down") {
            axes.axis_mut(id).restrain_entire(TileLevel::L1);
        }
        Ok(())
    }
}

/// Axes with a runtime bound tile by that bound and allow no partial tile.
pub struct DynamicBoundStrategy;

impl TilingStrategy for DynamicBoundStrategy {
    fn name(&self) -> &'static str {
        "dynamic bound"
    }

    fn add_constraint(&self, axes: &mut AxisTree, _ctx: &StrategyContext<'_>) -> TilingResult<()> {
        for (id, attrs) in axes.interested_info("DYNAMIC_BOUND", true) {
            for attr in attrs {
                if let Some(bound) = parse_i64(&attr.value) {
                    let axis = axes.axis_mut(id);
                    axis.restrain_mod(TileLevel::L1, bound);
                    axis.forbid_iso = true;
                }
            }
        }
        Ok(())
    }
}

/// Shifted axes cover every shifted copy in one tile.
pub struct ShiftAxisStrategy;

impl TilingStrategy for ShiftAxisStrategy {
    fn name(&self) -> &'static str {
        "shift"
    }

    fn add_constraint(&self, axes: &mut AxisTree, _ctx: &StrategyContext<'_>) -> TilingResult<()> {
        for (id, attrs) in axes.interested_info("SHIFT", true) {
            if let Some(share) = attrs.first().and_then(|a| parse_i64(&a.value)) {
                let axis = axes.axis_mut(id);
                let value = axis.range_extent * (share + 1);
                axis.restrain_to_single_value(TileLevel::L1, value);
            }
        }
        Ok(())
    }
}

/// Modulo-shifted axes forbid partial tiles; when the smallest tile
/// already exceeds the loop they cover every shifted copy, otherwise no
/// axis may leave a partial tile.
pub struct ModShiftAxisStrategy;

impl TilingStrategy for ModShiftAxisStrategy {
    fn name(&self) -> &'static str {
        "mod shift"
    }

    fn add_constraint(&self, axes: &mut AxisTree, _ctx: &StrategyContext<'_>) -> TilingResult<()> {
        for (id, attrs) in axes.interested_info("MODSHIFT", true) {
            let Some(attr) = attrs.first() else {
                continue;
            };
            let axis = axes.axis_mut(id);
            axis.forbid_iso = true;
            if axis.l1.tile_min > axis.range_extent {
                if let Some(share) = parse_i64(&attr.value) {
                    let value = axis.range_extent * (share + 1);
                    axis.restrain_to_single_value(TileLevel::L1, value);
                }
            } else {
                axes.for_each_top_down(|a| a.forbid_iso = true);
            }
        }
        Ok(())
    }
}

/// Convolution loops by role: batch and channel-group loops take one
/// element, spatial loops a tile large enough to hold a valid output row,
/// inner channel and kernel loops stay whole.
pub struct ConvStrategy;

impl TilingStrategy for ConvStrategy {
    fn name(&self) -> &'static str {
        "conv"
    }

    fn add_constraint(&self, axes: &mut AxisTree, ctx: &StrategyContext<'_>) -> TilingResult<()> {
        let conv = ctx.session.config().conv.clone();
        for (id, attrs) in axes.interested_info("CONV", true) {
            for attr in attrs {
                let axis = axes.axis_mut(id);
                axis.axis_type.clone_from(&attr.value);
                match attr.value.as_str() {
                    "N" | "C1_in_out" => {
                        axis.restrain_to_single_value(TileLevel::L1, MIN_TILE);
                        axis.restrain_to_single_value(TileLevel::L0, MIN_TILE);
                    }
                    "H" => {
                        if conv.kernel_h <= 0 {
                            return Err(TilingError::MissingConvAttr("pragma_conv_kernel_h"));
                        }
                        let kernel = (conv.kernel_h - 1) * conv.dilation_h.max(1) + 1;
                        axis.l1.tile_min = spatial_tile_min(
                            axis.range_extent,
                            MIN_TILE + 1,
                            conv.stride_h,
                            kernel,
                            conv.feature_h + conv.pad_top,
                        );
                    }
                    "W" if conv.backprop_filter => axis.restrain_entire(TileLevel::L1),
                    "W" => {
                        if conv.kernel_w <= 0 {
                            return Err(TilingError::MissingConvAttr("pragma_conv_kernel_w"));
                        }
                        let kernel = (conv.kernel_w - 1) * conv.dilation_w.max(1) + 1;
                        axis.l1.tile_min = spatial_tile_min(
                            axis.range_extent,
                            MIN_TILE,
                            conv.stride_w,
                            kernel,
                            conv.feature_w + conv.pad_left,
                        );
                    }
                    v if v.contains("C0") || v == "kh" || v == "kw" => axis.restrain_entire(TileLevel::L1),
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

/// Smallest output tile from `start` such that the last full tile still
/// reads inside the padded input of size `bound`.
fn spatial_tile_min(extent: i64, start: i64, stride: i64, kernel: i64, bound: i64) -> i64 {
    let mut tile = start;
    while tile <= extent && ((((extent + tile - 1) / tile) - 1) * tile - 1) * stride + kernel > bound {
        tile += 1;
    }
    tile
}

/// Matmul loops by role: inner fractal loops are one matrix-unit block,
/// batch loops one element.
pub struct GemmStrategy;

impl TilingStrategy for GemmStrategy {
    fn name(&self) -> &'static str {
        "gemm"
    }

    fn add_constraint(&self, axes: &mut AxisTree, _ctx: &StrategyContext<'_>) -> TilingResult<()> {
        for (id, attrs) in axes.interested_info("GEMM", true) {
            for attr in attrs {
                let axis = axes.axis_mut(id);
                axis.axis_type.clone_from(&attr.value);
                match attr.value.as_str() {
                    "mi" | "ni" | "ki" => {
                        for level in [TileLevel::L1, TileLevel::L0] {
                            axis.restrain_mod(level, MMU_UNIT);
                            axis.restrain_to_single_value(level, MMU_UNIT);
                        }
                    }
                    "bo" | "bi" => {
                        axis.restrain_to_single_value(TileLevel::L1, MIN_TILE);
                        axis.restrain_to_single_value(TileLevel::L0, MIN_TILE);
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::{AttrInfo, AxisId};
    use tpo_session::{Session, UserConfig};
    use tpo_target::TargetInfo;

    fn chain(extents: &[i64]) -> (AxisTree, Vec<AxisId>) {
        let mut tree = AxisTree::new();
        let mut parent = tree.root();
        let mut ids = Vec::new();
        for (d, &e) in extents.iter().enumerate() {
            parent = tree.add_axis(parent, 0, d, 0, e);
            ids.push(parent);
        }
        (tree, ids)
    }

    fn run(strategy: &dyn TilingStrategy, axes: &mut AxisTree, session: &Session) {
        let ctx = StrategyContext {
            session,
            op_type: TileOpType::Vector,
            is_gpu: false,
        };
        strategy.add_constraint(axes, &ctx).unwrap();
    }

    #[test]
    fn test_custom_directives() {
        let session = Session::with_defaults();
        let (mut axes, ids) = chain(&[64, 32]);
        axes.axis_mut(ids[0])
            .mark_with_attr(AttrInfo::new("CUSTOM:C1", "MIN:4"));
        axes.axis_mut(ids[0])
            .mark_with_attr(AttrInfo::new("CUSTOM:C1", "MOD:8"));
        axes.axis_mut(ids[0])
            .mark_with_attr(AttrInfo::new("CUSTOM:C1", "PRIORITY:3"));
        axes.axis_mut(ids[1])
            .mark_with_attr(AttrInfo::new("CUSTOM:C0", "FACTOR:16"));
        axes.axis_mut(ids[1])
            .mark_with_attr(AttrInfo::new("CUSTOM:C1", "MAX:FULL"));
        run(&CustomTilingStrategy, &mut axes, &session);
        let a = axes.axis(ids[0]);
        assert_eq!((a.l1.tile_min, a.l1.tile_mod, a.priority), (4, 8, 3));
        let b = axes.axis(ids[1]);
        assert_eq!((b.l0.tile_min, b.l0.tile_extent), (16, 16));
        assert_eq!((b.l1.tile_min, b.l1.tile_extent), (32, 32));
    }

    #[test]
    fn test_conflicting_ranges_allow_one_or_full() {
        let session = Session::with_defaults();
        let (mut axes, ids) = chain(&[17]);
        axes.axis_mut(ids[0]).tree_ranges = vec![(0, 16), (0, 17)];
        run(&ConflictTreeRangeStrategy, &mut axes, &session);
        assert_eq!(axes.axis(ids[0]).l1.cand_factors, vec![1, 17]);

        let (mut axes, ids) = chain(&[16]);
        axes.axis_mut(ids[0]).tree_ranges = vec![(0, 16), (0, 16)];
        run(&ConflictTreeRangeStrategy, &mut axes, &session);
        assert!(axes.axis(ids[0]).l1.cand_factors.is_empty());
    }

    #[test]
    fn test_reduce_dst_last_alignment() {
        let session = Session::with_defaults();
        let (mut axes, ids) = chain(&[64, 12]);
        for &id in &ids {
            axes.axis_mut(id).data_size.insert("B".into(), 4);
            axes.axis_mut(id).mark_with_attr(AttrInfo::new("REDUCE_DST_LAST", "S_0"));
        }
        run(&ReduceStrategy, &mut axes, &session);
        // 8 floats per 32 bytes: 64 aligns, 12 does not
        assert_eq!(axes.axis(ids[0]).l1.tile_min, 8);
        assert!(axes.axis(ids[1]).forbid_iso);
        assert_eq!(axes.axis(ids[1]).priority, 0);
    }

    #[test]
    fn test_vectorized_mod_from_smallest_type() {
        let session = Session::with_defaults();
        let (mut axes, ids) = chain(&[1024]);
        let a = axes.axis_mut(ids[0]);
        a.data_size.insert("A".into(), 2);
        a.data_size.insert("B".into(), 4);
        a.mark_with_attr(AttrInfo::new("VECTORIZED", "S_0"));
        run(&VectorizedStrategy, &mut axes, &session);
        assert_eq!(axes.axis(ids[0]).l1.tile_mod, 128);
    }

    #[test]
    fn test_shift_covers_copies() {
        let session = Session::with_defaults();
        let (mut axes, ids) = chain(&[10]);
        axes.axis_mut(ids[0]).mark_with_attr(AttrInfo::new("SHIFT", "2"));
        run(&ShiftAxisStrategy, &mut axes, &session);
        assert_eq!(axes.axis(ids[0]).l1.tile_min, 30);
        assert!(axes.axis(ids[0]).l1.is_single_value());
    }

    #[test]
    fn test_gemm_roles() {
        let session = Session::with_defaults();
        let (mut axes, ids) = chain(&[4, 16, 2]);
        axes.axis_mut(ids[0]).mark_with_attr(AttrInfo::new("GEMM", "mo"));
        axes.axis_mut(ids[1]).mark_with_attr(AttrInfo::new("GEMM", "mi"));
        axes.axis_mut(ids[2]).mark_with_attr(AttrInfo::new("GEMM", "bo"));
        run(&GemmStrategy, &mut axes, &session);
        assert_eq!(axes.axis(ids[0]).l1.tile_extent, 4);
        assert_eq!((axes.axis(ids[1]).l0.tile_min, axes.axis(ids[1]).l0.tile_mod), (16, 16));
        assert_eq!(axes.axis(ids[2]).l1.tile_extent, 1);
        assert_eq!(axes.axis(ids[1]).axis_type, "mi");
    }

    #[test]
    fn test_conv_h_lower_bound() {
        let mut config = UserConfig::default();
        config.conv.feature_h = 14;
        config.conv.pad_top = 1;
        config.conv.kernel_h = 3;
        config.conv.kernel_w = 3;
        let session = Session::new(config, TargetInfo::default());
        let (mut axes, ids) = chain(&[14, 4]);
        axes.axis_mut(ids[0]).mark_with_attr(AttrInfo::new("CONV", "H"));
        axes.axis_mut(ids[1]).mark_with_attr(AttrInfo::new("CONV", "kh"));
        run(&ConvStrategy, &mut axes, &session);
        // tile 2: ((7 - 1) * 2 - 1) + 3 = 14 <= 15
        assert_eq!(axes.axis(ids[0]).l1.tile_min, 2);
        assert_eq!(axes.axis(ids[1]).l1.tile_min, 4);
    }

    #[test]
    fn test_conv_spatial_needs_kernel() {
        let session = Session::with_defaults();
        let (mut axes, ids) = chain(&[14]);
        axes.axis_mut(ids[0]).mark_with_attr(AttrInfo::new("CONV", "W"));
        let ctx = StrategyContext {
            session: &session,
            op_type: TileOpType::Conv,
            is_gpu: false,
        };
        let err = ConvStrategy.add_constraint(&mut axes, &ctx).unwrap_err();
        assert_eq!(err, TilingError::MissingConvAttr("pragma_conv_kernel_w"));
    }

    #[test]
    fn test_spatial_tile_min_grows_until_valid() {
        // extent 8, stride 2, kernel 3, padded input 14: tile 1 reads 15
        assert_eq!(spatial_tile_min(8, 1, 2, 3, 14), 2);
        assert_eq!(spatial_tile_min(8, 1, 1, 1, 100), 1);
    }
}
