//! Memory estimation for candidate tiles.
//!
//! Every tensor a band touches gets one on-chip buffer per scope it is
//! promoted into. A buffer's size for a tile vector is the product of its
//! per-dimension footprints, times the element size and an expansion
//! factor. Buffers are live from the first to the last statement of the
//! band that touches them, so the need of a scope is the largest sum over
//! buffers live at the same statement.

use crate::analyze::TilingAnalyzer;
use crate::axis::AxisId;
use crate::{align_elems, TilingError, TilingResult};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tpo_footprint::TensorTable;
use tpo_poly::{AccessMap, BoxSet, IndexExpr, ScheduleTree, StmtKind};
use tpo_session::Session;
use tpo_target::{MemScope, TargetInfo};
use tracing::trace;

/// How one buffer dimension grows with the tiles.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DimExtent {
    /// Independent of the tiles.
    Fixed(i64),
    /// `min(cap, (base + Σ coeff·(tile[pos] − 1)) / div + 1)`.
    Tiled {
        /// Span contributed by loops outside the band.
        base: i64,
        /// `(band position, |coefficient|)` per tiled loop.
        terms: SmallVec<[(usize, i64); 2]>,
        /// Floor divisor applied to the span.
        div: i64,
        /// Tensor extent.
        cap: i64,
    },
}

impl DimExtent {
    fn of(expr: &IndexExpr, cap: i64, var_pos: &FxHashMap<usize, usize>, domain: &BoxSet) -> Self {
        let (inner, div) = match expr {
            IndexExpr::FloorDiv(inner, d) if *d > 0 => (inner.as_ref(), *d),
            IndexExpr::Mod(_, m) if *m > 0 => return Self::Fixed(cap.min(*m)),
            e => (e, 1),
        };
        let Some(aff) = inner.as_aff() else {
            return Self::Fixed(cap);
        };
        let mut base = 0;
        let mut terms = SmallVec::new();
        for (v, c) in aff.terms() {
            match var_pos.get(&v) {
                Some(&pos) => terms.push((pos, c.abs())),
                None if v < domain.rank() => base += c.abs() * (domain.extent(v) - 1).max(0),
                None => {}
            }
        }
        if terms.is_empty() {
            return Self::Fixed(cap.min(base / div + 1));
        }
        Self::Tiled { base, terms, div, cap }
    }

    /// Footprint under `tiles`, indexed by band position.
    #[must_use]
    pub fn extent(&self, tiles: &[i64]) -> i64 {
        match self {
            Self::Fixed(e) => *e,
            Self::Tiled { base, terms, div, cap } => {
                let span: i64 = terms
                    .iter()
                    .map(|&(pos, c)| c * (tiles.get(pos).copied().unwrap_or(1) - 1))
                    .sum();
                ((base + span) / div + 1).min(*cap).max(1)
            }
        }
    }
}

/// An on-chip buffer of one tensor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferEntry {
    /// Buffer name, the tensor name with the scope suffix.
    pub name: String,
    /// Promoted tensor.
    pub tensor: String,
    /// Scope holding the buffer.
    pub scope: MemScope,
    /// Bytes per element.
    pub elem_bytes: i64,
    /// Extra multiplicity, e.g. partial results of a reduction.
    pub expand: i64,
    /// Footprint per tensor dimension.
    pub dims: Vec<DimExtent>,
    /// First and last statement position using the buffer.
    pub live: (usize, usize),
    /// Written by a statement of the band.
    pub written: bool,
}

impl BufferEntry {
    /// Element counts per dimension under `tiles`.
    #[must_use]
    pub fn extents(&self, tiles: &[i64]) -> Vec<i64> {
        self.dims.iter().map(|d| d.extent(tiles)).collect()
    }

    /// Bytes under `tiles`.
    #[must_use]
    pub fn bytes(&self, tiles: &[i64]) -> i64 {
        self.extents(tiles).iter().product::<i64>() * self.elem_bytes * self.expand
    }

    /// Bytes under `tiles` with the innermost dimension padded to the
    /// alignment unit.
    #[must_use]
    pub fn aligned_bytes(&self, tiles: &[i64]) -> i64 {
        let mut extents = self.extents(tiles);
        if let Some(last) = extents.last_mut() {
            let align = align_elems(self.elem_bytes);
            *last = (*last + align - 1) / align * align;
        }
        extents.iter().product::<i64>() * self.elem_bytes * self.expand
    }
}

/// Memory need of one tile vector.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    /// Aligned peak bytes per scope, sorted by scope.
    pub per_scope: Vec<(MemScope, u64)>,
    /// Sum of all buffer sizes.
    pub bytes: u64,
    /// Sum of all aligned buffer sizes.
    pub aligned_bytes: u64,
}

impl MemoryUsage {
    /// Peak bytes needed in `scope`.
    #[must_use]
    pub fn need(&self, scope: MemScope) -> u64 {
        self.per_scope
            .iter()
            .find(|(s, _)| *s == scope)
            .map_or(0, |(_, b)| *b)
    }

    /// Checks every bounded scope against `target`.
    ///
    /// # Errors
    ///
    /// [`TilingError::MemoryAllocation`] for the first over-subscribed scope.
    pub fn check(&self, target: &TargetInfo) -> TilingResult<()> {
        for &(scope, need) in &self.per_scope {
            if let Some(cap) = target.capacity_bytes(scope) {
                if need > cap {
                    return Err(TilingError::MemoryAllocation {
                        scope,
                        need_bits: need * 8,
                        alloc_bits: cap * 8,
                    });
                }
            }
        }
        Ok(())
    }

    /// Returns true if every bounded scope fits.
    #[must_use]
    pub fn fits(&self, target: &TargetInfo) -> bool {
        self.check(target).is_ok()
    }
}

/// Buffers of one band.
#[derive(Clone, Debug)]
pub struct MemoryEstimator {
    /// Band index in the analyzer.
    pub band: usize,
    /// Band axes, outermost first; tile vectors follow this order.
    pub axes: Vec<AxisId>,
    /// The buffers.
    pub buffers: Vec<BufferEntry>,
    num_stmts: usize,
}

impl MemoryEstimator {
    /// Collects the buffers of band `band`.
    #[must_use]
    pub fn new(
        analyzer: &TilingAnalyzer,
        band: usize,
        tree: &ScheduleTree,
        tensors: &TensorTable,
        session: &Session,
    ) -> Self {
        let use_shared = session.config().use_shared_memory;
        let info = &analyzer.bands[band];
        let mut buffers: Vec<BufferEntry> = Vec::new();

        for (pos, &stmt) in info.stmts.iter().enumerate() {
            let s = tree.stmt(stmt);
            let StmtKind::Compute { op } = &s.kind else {
                continue;
            };
            let var_pos: FxHashMap<usize, usize> = analyzer
                .var_axes(tree, band, stmt)
                .into_iter()
                .filter_map(|(v, id)| info.axes.iter().position(|&a| a == id).map(|p| (v, p)))
                .collect();
            let src_last_reduce = op.starts_with("Reduce")
                && info
                    .axes
                    .iter()
                    .any(|&a| analyzer.axes.axis(a).has_attr_value("REDUCE_SRC_LAST", &s.name));
            let cube = matches!(op.as_str(), "Matmul" | "BatchMatMul" | "Conv");

            for (k, access) in s.reads().enumerate() {
                let scopes: SmallVec<[MemScope; 2]> = if analyzer.is_gpu {
                    if use_shared {
                        SmallVec::from_slice(&[MemScope::Shared])
                    } else {
                        SmallVec::new()
                    }
                } else if cube && k == 0 {
                    SmallVec::from_slice(&[MemScope::L1, MemScope::L0A])
                } else if cube && k == 1 {
                    SmallVec::from_slice(&[MemScope::L1, MemScope::L0B])
                } else {
                    SmallVec::from_slice(&[MemScope::Unified])
                };
                for scope in scopes {
                    add_buffer(&mut buffers, access, scope, pos, 1, false, &var_pos, &s.domain, tensors);
                }
            }
            if analyzer.is_gpu {
                continue;
            }
            for access in s.writes() {
                let bytes = elem_bytes(tensors, &access.tensor);
                let expand = if src_last_reduce { align_elems(bytes) } else { 1 };
                let scopes: &[MemScope] = if cube {
                    &[MemScope::L0C, MemScope::Unified]
                } else {
                    &[MemScope::Unified]
                };
                for &scope in scopes {
                    add_buffer(&mut buffers, access, scope, pos, expand, true, &var_pos, &s.domain, tensors);
                }
            }
        }
        trace!(band, buffers = buffers.len(), "buffers collected");
        Self {
            band,
            axes: info.axes.clone(),
            buffers,
            num_stmts: info.stmts.len(),
        }
    }

    /// Memory need under `tiles`.
    #[must_use]
    pub fn usage(&self, tiles: &[i64]) -> MemoryUsage {
        let mut usage = MemoryUsage::default();
        let sizes: Vec<(i64, i64)> = self
            .buffers
            .iter()
            .map(|b| (b.bytes(tiles), b.aligned_bytes(tiles)))
            .collect();
        for &(bytes, aligned) in &sizes {
            usage.bytes += to_u64(bytes);
            usage.aligned_bytes += to_u64(aligned);
        }
        let mut peak: FxHashMap<MemScope, u64> = FxHashMap::default();
        for pos in 0..self.num_stmts.max(1) {
            let mut live: FxHashMap<MemScope, u64> = FxHashMap::default();
            for (b, &(_, aligned)) in self.buffers.iter().zip(&sizes) {
                if b.live.0 <= pos && pos <= b.live.1 {
                    *live.entry(b.scope).or_default() += to_u64(aligned);
                }
            }
            for (scope, bytes) in live {
                let p = peak.entry(scope).or_default();
                *p = (*p).max(bytes);
            }
        }
        usage.per_scope = peak.into_iter().collect();
        usage.per_scope.sort_unstable();
        usage
    }

    /// Smallest amount of data, in bytes, one written buffer sends back
    /// per outer iteration when the tiles of positions `..=pos` are one.
    #[must_use]
    pub fn written_bytes_inside(&self, tiles: &[i64], pos: usize) -> Option<i64> {
        let inner: Vec<i64> = tiles
            .iter()
            .enumerate()
            .map(|(k, &t)| if k <= pos { 1 } else { t })
            .collect();
        self.buffers
            .iter()
            .filter(|b| b.written)
            .map(|b| b.bytes(&inner) / b.expand.max(1))
            .min()
    }
}

fn to_u64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

fn elem_bytes(tensors: &TensorTable, tensor: &str) -> i64 {
    tensors
        .get(tensor)
        .and_then(|t| i64::try_from(t.elem_bytes).ok())
        .unwrap_or(4)
}

#[allow(clippy::too_many_arguments)]
fn add_buffer(
    buffers: &mut Vec<BufferEntry>,
    access: &AccessMap,
    scope: MemScope,
    pos: usize,
    expand: i64,
    written: bool,
    var_pos: &FxHashMap<usize, usize>,
    domain: &BoxSet,
    tensors: &TensorTable,
) {
    if let Some(b) = buffers
        .iter_mut()
        .find(|b| b.tensor == access.tensor && b.scope == scope)
    {
        b.live.1 = b.live.1.max(pos);
        b.expand = b.expand.max(expand);
        b.written |= written;
        return;
    }
    let shape = tensors.get(&access.tensor).map(|t| t.shape.clone());
    let hull = access.range_hull(domain);
    let dims = access
        .index
        .iter()
        .enumerate()
        .map(|(d, e)| {
            let cap = shape
                .as_ref()
                .and_then(|s| s.get(d).copied())
                .or_else(|| hull.get(d).copied().flatten().map(|(lo, hi)| hi - lo + 1))
                .unwrap_or(1);
            DimExtent::of(e, cap, var_pos, domain)
        })
        .collect();
    buffers.push(BufferEntry {
        name: format!("{}{}", access.tensor, scope.buffer_suffix()),
        tensor: access.tensor.clone(),
        scope,
        elem_bytes: elem_bytes(tensors, &access.tensor),
        expand,
        dims,
        live: (pos, pos),
        written,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use tpo_footprint::TensorInfo;
    use tpo_index::Idx;
    use tpo_poly::{AccessKind, Band, ScheduleDim, StmtIdx, StmtInfo};
    use tpo_target::TargetInfo;

    fn stmt(name: &str, op: &str, extents: &[i64], accesses: Vec<AccessMap>) -> StmtInfo {
        let names: Vec<String> = (0..extents.len()).map(|i| format!("i{i}")).collect();
        StmtInfo::compute(name, op, BoxSet::from_extents(names, extents.iter().copied()), accesses)
    }

    /// All statements share one band of `rank` identity dimensions.
    fn banded(stmts: Vec<StmtInfo>, rank: usize) -> ScheduleTree {
        let n = stmts.len();
        let mut tree = ScheduleTree::new(stmts);
        let leaf = tree.child(tree.root(), 0).unwrap();
        let dims = (0..rank)
            .map(|d| {
                (0..n)
                    .map(|s| (StmtIdx::new(s), ScheduleDim::var(rank, d)))
                    .collect::<IndexMap<_, _>>()
            })
            .collect();
        tree.insert_partial_schedule(leaf, Band::new(dims, true));
        tree
    }

    fn table(entries: &[(&str, &[i64])]) -> TensorTable {
        entries
            .iter()
            .map(|(n, s)| ((*n).to_string(), TensorInfo::new(s.to_vec(), 4)))
            .collect()
    }

    fn estimator(tree: &ScheduleTree, tensors: &TensorTable) -> MemoryEstimator {
        let session = Session::with_defaults();
        let analyzer = TilingAnalyzer::build(tree, tensors, &session).unwrap();
        MemoryEstimator::new(&analyzer, 0, tree, tensors, &session)
    }

    #[test]
    fn test_elementwise_sizes() {
        let tree = banded(
            vec![stmt(
                "S_0",
                "Add",
                &[64, 64],
                vec![
                    AccessMap::identity("A", AccessKind::Read, 2),
                    AccessMap::identity("B", AccessKind::Write, 2),
                ],
            )],
            2,
        );
        let tensors = table(&[("A", &[64, 64]), ("B", &[64, 64])]);
        let est = estimator(&tree, &tensors);
        assert_eq!(est.buffers.len(), 2);
        assert_eq!(est.buffers[0].name, "A_local_UB");

        let usage = est.usage(&[8, 16]);
        assert_eq!(usage.need(MemScope::Unified), 2 * 8 * 16 * 4);

        // innermost 3 pads to 8 floats
        let usage = est.usage(&[8, 3]);
        assert_eq!(usage.bytes, 2 * 8 * 3 * 4);
        assert_eq!(usage.aligned_bytes, 2 * 8 * 8 * 4);
    }

    #[test]
    fn test_live_ranges_overlap_per_statement() {
        let tree = banded(
            vec![
                stmt(
                    "S_0",
                    "Exp",
                    &[128],
                    vec![
                        AccessMap::identity("A", AccessKind::Read, 1),
                        AccessMap::identity("B", AccessKind::Write, 1),
                    ],
                ),
                stmt(
                    "S_1",
                    "Add",
                    &[128],
                    vec![
                        AccessMap::identity("B", AccessKind::Read, 1),
                        AccessMap::identity("C", AccessKind::Write, 1),
                    ],
                ),
            ],
            1,
        );
        let tensors = table(&[("A", &[128]), ("B", &[128]), ("C", &[128])]);
        let est = estimator(&tree, &tensors);
        let live: Vec<_> = est.buffers.iter().map(|b| (b.tensor.as_str(), b.live)).collect();
        assert_eq!(live, vec![("A", (0, 0)), ("B", (0, 1)), ("C", (1, 1))]);
        // two buffers live at a time, never three
        assert_eq!(est.usage(&[64]).need(MemScope::Unified), 2 * 64 * 4);
    }

    #[test]
    fn test_over_budget_reports_bits() {
        let tree = banded(
            vec![stmt(
                "S_0",
                "Abs",
                &[1024, 1024],
                vec![
                    AccessMap::identity("A", AccessKind::Read, 2),
                    AccessMap::identity("B", AccessKind::Write, 2),
                ],
            )],
            2,
        );
        let tensors = table(&[("A", &[1024, 1024]), ("B", &[1024, 1024])]);
        let est = estimator(&tree, &tensors);
        let usage = est.usage(&[1024, 1024]);
        let err = usage.check(&TargetInfo::default()).unwrap_err();
        assert_eq!(
            err,
            TilingError::MemoryAllocation {
                scope: MemScope::Unified,
                need_bits: 2 * 1024 * 1024 * 4 * 8,
                alloc_bits: 256 * 1024 * 8,
            }
        );
        assert!(est.usage(&[16, 64]).fits(&TargetInfo::default()));
    }

    #[test]
    fn test_modular_dimension_is_bounded() {
        let domain = BoxSet::from_extents(["i"], [100]);
        let e = IndexExpr::var(1, 0).modulo(16);
        let pos: FxHashMap<usize, usize> = [(0, 0)].into_iter().collect();
        assert_eq!(DimExtent::of(&e, 100, &pos, &domain), DimExtent::Fixed(16));
        let e = IndexExpr::var(1, 0).floor_div(4);
        assert_eq!(DimExtent::of(&e, 25, &pos, &domain).extent(&[16]), 4);
    }
}
