//! Scoped references and footprint boxes.
//!
//! A reference is analysed from a schedule-tree node: the bands above the
//! node fix some of the statement's iteration variables (or narrow them to
//! a tile), and the box records which part of the tensor one execution of
//! the subtree touches.
//!
//! The scoped space numbers the prefix schedule values first (`p₀ …`),
//! then the statement's iteration variables. Box offsets are affine in
//! that space.

use crate::{FootprintError, FootprintResult};
use std::fmt::Write as _;
use tpo_poly::aff::{gcd, Aff, IndexExpr, VarRange};
use tpo_poly::{AccessKind, AccessMap, BoxSet, NodeId, ScheduleDim, ScheduleTree, StmtIdx};

// ============================================================================
// Scoped references
// ============================================================================

/// One tensor reference seen from a schedule-tree node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScopedRef {
    /// Referencing statement.
    pub stmt: StmtIdx,
    /// Position of the reference among the statement's accesses.
    pub position: usize,
    /// The reference.
    pub access: AccessMap,
    /// Schedule dimensions of the bands above the node.
    pub prefix: Vec<ScheduleDim>,
    /// Iteration domain of the statement.
    pub domain: BoxSet,
}

/// `out[dim] = coeff · x[var] + constant`, used to recover an iteration
/// variable from an earlier tensor coordinate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Determinant {
    /// Scoped variable.
    pub var: usize,
    /// Tensor dimension that determines it.
    pub dim: usize,
    /// Coefficient, always `1` or `-1`.
    pub coeff: i64,
    /// Constant term.
    pub constant: i64,
}

/// A single-variable equality `out[range_dim] = domain_stride' · in[domain_dim] + c`
/// in the normalized form used to decide whether references can share a box.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Equality {
    /// Tensor dimension.
    pub range_dim: usize,
    /// Scoped variable.
    pub domain_dim: usize,
    /// Coefficient of the tensor dimension, never negative.
    pub range_stride: i64,
    /// Coefficient of the scoped variable.
    pub domain_stride: i64,
    /// Constant term.
    pub offset: i64,
}

/// Value range of one tensor dimension: `lo + stride · [0, span / stride]`.
#[derive(Clone, Debug, PartialEq, Eq)]
struct DimSpan {
    lo: Aff,
    stride: i64,
    span: i64,
}

impl ScopedRef {
    /// Number of prefix schedule values.
    #[must_use]
    pub fn n_params(&self) -> usize {
        self.prefix.len()
    }

    /// Size of the scoped space.
    #[must_use]
    pub fn space_dim(&self) -> usize {
        self.n_params() + self.domain.rank()
    }

    /// Read or write.
    #[must_use]
    pub fn kind(&self) -> AccessKind {
        self.access.kind
    }

    /// Names of the scoped variables.
    #[must_use]
    pub fn space_names(&self) -> Vec<String> {
        (0..self.n_params())
            .map(|k| format!("p{k}"))
            .chain(self.domain.names().iter().cloned())
            .collect()
    }

    /// Ranges of the iteration variables in the scoped space.
    ///
    /// Prefix dimensions at position `cutoff` and beyond are ignored, which
    /// leaves the variables they scan at their full domain range.
    #[must_use]
    pub fn iteration_ranges(&self, cutoff: usize) -> Vec<VarRange> {
        let n = self.space_dim();
        (0..self.domain.rank())
            .map(|v| {
                let extent = self.domain.extent(v).max(1);
                let mut range = VarRange::constant(n, self.domain.lower(v), extent);
                let mut grain = None;
                for (k, sched) in self.prefix.iter().enumerate().take(cutoff) {
                    if sched.single_var() != Some(v) {
                        continue;
                    }
                    match sched.modulo {
                        None => {
                            range = VarRange {
                                lower: Aff::var(n, k) * sched.div,
                                size: sched.div.min(extent),
                            };
                            grain = Some(sched.div);
                        }
                        Some(m) if grain == Some(sched.div * m) => {
                            range = VarRange {
                                lower: range.lower + Aff::var(n, k) * sched.div,
                                size: sched.div.min(range.size),
                            };
                            grain = Some(sched.div);
                        }
                        Some(_) => {}
                    }
                }
                range
            })
            .collect()
    }

    /// Per-dimension value ranges, and the variables fixed along the way.
    ///
    /// Once a dimension reads a single iteration variable with unit
    /// coefficient, later dimensions see that variable as a point.
    fn dim_spans(&self, cutoff: usize, determine: bool) -> (Vec<Option<DimSpan>>, Vec<Determinant>) {
        let p = self.n_params();
        let n = self.space_dim();
        let mut ranges = self.iteration_ranges(cutoff);
        let mut determinants = Vec::new();
        let mut spans = Vec::with_capacity(self.access.rank());
        for (d, expr) in self.access.index.iter().enumerate() {
            spans.push(dim_span(expr, &ranges));
            if !determine {
                continue;
            }
            let Some(aff) = expr.as_aff() else {
                continue;
            };
            if let Some((v, c)) = aff.single_var() {
                let free = ranges.get(v).is_some_and(|r| r.size > 1);
                if c.abs() == 1 && free && p + v < cutoff {
                    ranges[v] = VarRange::point(n, p + v);
                    determinants.push(Determinant {
                        var: p + v,
                        dim: d,
                        coeff: c,
                        constant: aff.constant_term(),
                    });
                }
            }
        }
        (spans, determinants)
    }

    /// Single-variable equalities of this reference.
    #[must_use]
    pub fn equalities(&self) -> Vec<Equality> {
        let p = self.n_params();
        let ranges = self.iteration_ranges(usize::MAX);
        let mut out = Vec::new();
        for (d, expr) in self.access.index.iter().enumerate() {
            let Some((v, c)) = expr.as_aff().and_then(Aff::single_var) else {
                continue;
            };
            let Some(range) = ranges.get(v) else {
                continue;
            };
            let domain_dim = match range.lower.single_var() {
                Some((k, 1)) if range.size == 1 && range.lower.constant_term() == 0 => k,
                _ => p + v,
            };
            let constant = expr.as_aff().map_or(0, Aff::constant_term);
            out.push(Equality {
                range_dim: d,
                domain_dim,
                range_stride: 1,
                domain_stride: -c,
                offset: -constant,
            });
        }
        out
    }
}

fn dim_span(expr: &IndexExpr, ranges: &[VarRange]) -> Option<DimSpan> {
    let s = expr.span(ranges)?;
    let stride = match expr {
        IndexExpr::Aff(a) => a
            .terms()
            .filter(|(v, _)| ranges.get(*v).is_some_and(|r| r.size > 1))
            .fold(0, |g, (_, c)| gcd(g, c)),
        _ => 1,
    };
    Some(DimSpan {
        lo: s.lo,
        stride: stride.max(1),
        span: s.span,
    })
}

/// References to `tensor` executed below `node`, in statement order.
///
/// Copy statements are skipped; they move data rather than use it.
#[must_use]
pub fn scoped_refs(tree: &ScheduleTree, node: NodeId, tensor: &str) -> Vec<ScopedRef> {
    let prefix = tree.prefix_schedule(node);
    let mut out = Vec::new();
    for stmt in tree.stmts_below(node) {
        let info = tree.stmt(stmt);
        if info.is_copy() {
            continue;
        }
        let sched = prefix.get(&stmt).cloned().unwrap_or_default();
        for (position, access) in info.accesses.iter().enumerate() {
            if access.tensor == tensor {
                out.push(ScopedRef {
                    stmt,
                    position,
                    access: access.clone(),
                    prefix: sched.clone(),
                    domain: info.domain.clone(),
                });
            }
        }
    }
    out
}

// ============================================================================
// Footprint boxes
// ============================================================================

/// The part of a tensor accessed by one execution of a subtree.
///
/// Dimension `d` covers `offsets[d] + strides[d] · k` for `k < sizes[d]`.
/// A size of `None` means the dimension has no fixed bound.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FootprintBox {
    /// Distance between accessed indices.
    pub strides: Vec<i64>,
    /// Smallest accessed index, affine in the scoped space.
    pub offsets: Vec<Aff>,
    /// Number of accessed indices.
    pub sizes: Vec<Option<i64>>,
    /// False once some dimensions fell back to identity buffering.
    pub valid: bool,
    /// Dimensions buffered with the identity map.
    pub invalid_dims: Vec<usize>,
    /// The references share a box only approximately.
    pub should_split: bool,
    /// Iteration variables recovered from earlier coordinates.
    pub determinants: Vec<Determinant>,
}

impl FootprintBox {
    /// The box covering every reference.
    ///
    /// # Errors
    ///
    /// Fails when `refs` is empty or the references disagree in rank.
    pub fn of_refs(refs: &[ScopedRef]) -> FootprintResult<Self> {
        Self::of_refs_with_cutoff(refs, usize::MAX)
    }

    /// Like [`FootprintBox::of_refs`], ignoring prefix dimensions from
    /// `cutoff` on.
    pub(crate) fn of_refs_with_cutoff(refs: &[ScopedRef], cutoff: usize) -> FootprintResult<Self> {
        let first = refs.first().ok_or_else(|| FootprintError::EmptyCluster {
            tensor: String::new(),
        })?;
        let rank = first.access.rank();
        if let Some(bad) = refs.iter().find(|r| r.access.rank() != rank) {
            return Err(FootprintError::DimMismatch {
                relation: bad.access.display(&bad.domain).to_string(),
                expected: rank,
                found: bad.access.rank(),
            });
        }

        let mut per_ref: Vec<_> = refs.iter().map(|r| r.dim_spans(cutoff, true)).collect();
        let agree = per_ref.windows(2).all(|w| w[0].1 == w[1].1);
        if !agree {
            per_ref = refs.iter().map(|r| r.dim_spans(cutoff, false)).collect();
        }
        let determinants = per_ref.first().map(|(_, d)| d.clone()).unwrap_or_default();

        let n = first.space_dim();
        let mut strides = Vec::with_capacity(rank);
        let mut offsets = Vec::with_capacity(rank);
        let mut sizes = Vec::with_capacity(rank);
        for d in 0..rank {
            let spans: Vec<Option<&DimSpan>> = per_ref.iter().map(|(s, _)| s[d].as_ref()).collect();
            match combine(&spans) {
                Some((lo, stride, size)) => {
                    strides.push(stride);
                    offsets.push(lo);
                    sizes.push(Some(size));
                }
                None => {
                    strides.push(1);
                    offsets.push(Aff::zero(n));
                    sizes.push(None);
                }
            }
        }
        let valid = sizes.iter().all(Option::is_some);
        Ok(Self {
            strides,
            offsets,
            sizes,
            valid,
            invalid_dims: Vec::new(),
            should_split: false,
            determinants,
        })
    }

    /// Number of dimensions.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.sizes.len()
    }

    /// Returns true if every dimension has a fixed size.
    #[must_use]
    pub fn is_bounded(&self) -> bool {
        self.sizes.iter().all(Option::is_some)
    }

    /// Sizes, if every dimension is bounded.
    #[must_use]
    pub fn fixed_sizes(&self) -> Option<Vec<i64>> {
        self.sizes.iter().copied().collect()
    }

    /// Number of buffered elements, if bounded.
    #[must_use]
    pub fn num_elements(&self) -> Option<i64> {
        self.sizes.iter().copied().product()
    }

    /// Buffer shape: the sizes with unit dimensions removed.
    #[must_use]
    pub fn buffer_sizes(&self) -> Option<Vec<i64>> {
        let sizes: Vec<i64> = self.fixed_sizes()?.into_iter().filter(|&s| s != 1).collect();
        Some(if sizes.is_empty() { vec![1] } else { sizes })
    }

    /// Renders strides, offsets and sizes against `names`.
    #[must_use]
    pub fn describe(&self, names: &[String]) -> String {
        let mut out = String::new();
        let strides: Vec<String> = self.strides.iter().map(ToString::to_string).collect();
        let offsets: Vec<String> = self.offsets.iter().map(|o| o.display(names).to_string()).collect();
        let sizes: Vec<String> = self
            .sizes
            .iter()
            .map(|s| s.map_or_else(|| "?".to_string(), |s| s.to_string()))
            .collect();
        let _ = write!(
            out,
            "strides [{}] offsets [{}] sizes [{}]",
            strides.join(", "),
            offsets.join(", "),
            sizes.join(", ")
        );
        if !self.invalid_dims.is_empty() {
            let _ = write!(out, " identity {:?}", self.invalid_dims);
        }
        out
    }
}

/// Combines per-reference ranges of one dimension. Offsets may differ only
/// by constants.
fn combine(spans: &[Option<&DimSpan>]) -> Option<(Aff, i64, i64)> {
    let first = (*spans.first()?)?;
    let mut parts = Vec::with_capacity(spans.len());
    for s in spans {
        let s = (*s)?;
        let diff = s.lo.clone() - first.lo.clone();
        if !diff.is_constant() {
            return None;
        }
        parts.push((diff.constant_term(), s.span, s.stride));
    }
    let min = parts.iter().map(|p| p.0).min()?;
    let max = parts.iter().map(|p| p.0 + p.1).max()?;
    let stride = parts
        .iter()
        .fold(0, |g, &(c, _, s)| gcd(gcd(g, s), c - min))
        .max(1);
    let mut lo = first.lo.clone();
    lo.set_constant(lo.constant_term() + min);
    Some((lo, stride, (max - min) / stride + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpo_index::Idx;

    fn read(index: Vec<IndexExpr>) -> AccessMap {
        AccessMap::new("A", AccessKind::Read, index)
    }

    fn scoped(access: AccessMap, prefix: Vec<ScheduleDim>) -> ScopedRef {
        ScopedRef {
            stmt: StmtIdx::new(0),
            position: 0,
            access,
            prefix,
            domain: BoxSet::from_extents(["i", "j"], [8, 8]),
        }
    }

    #[test]
    fn test_tiled_prefix_ranges() {
        // i tiled by 4 (outer p0, point p1), j tiled by 4 (outer only)
        let mut outer = ScheduleDim::var(2, 0);
        outer.div = 4;
        let mut point = ScheduleDim::var(2, 0);
        point.modulo = Some(4);
        let mut j_outer = ScheduleDim::var(2, 1);
        j_outer.div = 4;
        let r = scoped(AccessMap::identity("A", AccessKind::Read, 2), vec![outer, point, j_outer]);
        let ranges = r.iteration_ranges(usize::MAX);
        assert_eq!(ranges[0].size, 1);
        assert_eq!(ranges[0].lower, Aff::from_parts([4, 1, 0, 0, 0], 0));
        assert_eq!(ranges[1].size, 4);
        assert_eq!(ranges[1].lower, Aff::from_parts([0, 0, 4, 0, 0], 0));

        let cut = r.iteration_ranges(1);
        assert_eq!(cut[0].size, 4);
        assert_eq!(cut[1].size, 8);
    }

    #[test]
    fn test_strided_access() {
        let r = scoped(
            read(vec![IndexExpr::from(Aff::var(2, 0) * 2), IndexExpr::var(2, 1)]),
            Vec::new(),
        );
        let fp = FootprintBox::of_refs(&[r]).unwrap();
        assert_eq!(fp.strides, vec![2, 1]);
        assert_eq!(fp.fixed_sizes(), Some(vec![8, 8]));
        assert!(fp.valid);
    }

    #[test]
    fn test_any_index_is_unbounded() {
        let r = scoped(read(vec![IndexExpr::var(2, 0), IndexExpr::Any]), Vec::new());
        let fp = FootprintBox::of_refs(&[r]).unwrap();
        assert!(!fp.is_bounded());
        assert_eq!(fp.sizes, vec![Some(8), None]);
        assert!(fp.buffer_sizes().is_none());
    }

    #[test]
    fn test_equalities_use_point_params() {
        let r = scoped(
            read(vec![IndexExpr::var(2, 0).offset(1), IndexExpr::var(2, 1)]),
            vec![ScheduleDim::var(2, 0)],
        );
        let eqs = r.equalities();
        assert_eq!(eqs.len(), 2);
        assert_eq!(eqs[0].domain_dim, 0);
        assert_eq!(eqs[0].offset, -1);
        assert_eq!(eqs[0].domain_stride, -1);
        assert_eq!(eqs[1].domain_dim, 2);
    }

    #[test]
    fn test_buffer_sizes_drop_unit_dims() {
        let fp = FootprintBox {
            strides: vec![1, 1, 1],
            offsets: vec![Aff::zero(0); 3],
            sizes: vec![Some(1), Some(16), Some(1)],
            valid: true,
            invalid_dims: Vec::new(),
            should_split: false,
            determinants: Vec::new(),
        };
        assert_eq!(fp.buffer_sizes(), Some(vec![16]));
        assert_eq!(fp.num_elements(), Some(16));
    }
}
