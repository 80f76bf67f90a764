//! Buffer definitions and copy-in / copy-out placement.
//!
//! Hoisting a tensor below a schedule-tree node computes its footprint
//! cluster, defines a buffer of the footprint's shape in the target scope,
//! and grafts copy statements into the sequence below the node: reads
//! before the first filter that uses the tensor, writes after the last.
//! Compute statements keep naming the original tensor; the buffer table
//! records which buffers stand for it.

use crate::cluster::FootprintCluster;
use crate::footprint::{scoped_refs, FootprintBox};
use crate::remap::Remapper;
use crate::{FootprintResult, TensorTable};
use indexmap::IndexMap;
use rustc_hash::FxHashSet;
use tpo_poly::{
    AccessKind, AccessMap, Band, BandDim, BoxSet, IndexExpr, NodeId, NodeKind, PolyError,
    ScheduleDim, ScheduleTree, StmtIdx, StmtInfo, StmtKind,
};
use tpo_session::{DumpLevel, LogStage, Session};
use tpo_target::MemScope;
use tracing::{debug, info, instrument, warn};

/// Mark placed above a subtree realized in L1.
pub const REALIZE_L1: &str = "realize_L1";

/// Element size assumed for tensors missing from the table.
const DEFAULT_ELEM_BYTES: u64 = 4;

// ============================================================================
// Buffers
// ============================================================================

/// A buffer introduced by promotion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferDef {
    /// Buffer name.
    pub buffer: String,
    /// Tensor (or buffer) the data comes from.
    pub tensor: String,
    /// Memory scope.
    pub scope: MemScope,
    /// Shape, without unit dimensions.
    pub sizes: Vec<i64>,
    /// Bytes per element.
    pub elem_bytes: u64,
}

impl BufferDef {
    /// Size in bytes.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        let elems: i64 = self.sizes.iter().product();
        u64::try_from(elems).unwrap_or(0) * self.elem_bytes
    }
}

/// Every buffer defined so far, in definition order.
#[derive(Clone, Debug, Default)]
pub struct BufferTable {
    defs: IndexMap<String, BufferDef>,
}

impl BufferTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defines a buffer for `tensor` in `scope` and returns its name:
    /// the tensor name with the scope suffix, numbered when taken.
    pub fn define(&mut self, tensor: &str, scope: MemScope, sizes: Vec<i64>, elem_bytes: u64) -> String {
        let base = format!("{tensor}{}", scope.buffer_suffix());
        let mut name = base.clone();
        let mut k = 1;
        while self.defs.contains_key(&name) {
            name = format!("{base}_{k}");
            k += 1;
        }
        self.defs.insert(
            name.clone(),
            BufferDef {
                buffer: name.clone(),
                tensor: tensor.to_string(),
                scope,
                sizes,
                elem_bytes,
            },
        );
        name
    }

    /// A buffer by name.
    #[must_use]
    pub fn get(&self, buffer: &str) -> Option<&BufferDef> {
        self.defs.get(buffer)
    }

    /// The tensor a name ultimately stands for: buffers are followed back
    /// to the tensor they were promoted from.
    #[must_use]
    pub fn origin<'a>(&'a self, name: &'a str) -> &'a str {
        let mut cur = name;
        // definitions only refer to earlier names, so the chain ends
        while let Some(def) = self.defs.get(cur) {
            cur = &def.tensor;
        }
        cur
    }

    /// Buffers in definition order.
    pub fn iter(&self) -> impl Iterator<Item = &BufferDef> + '_ {
        self.defs.values()
    }

    /// Total bytes defined in `scope`.
    #[must_use]
    pub fn bytes(&self, scope: MemScope) -> u64 {
        self.iter().filter(|d| d.scope == scope).map(BufferDef::bytes).sum()
    }

    /// Number of buffers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.defs.len()
    }

    /// Returns true if no buffer is defined.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}

// ============================================================================
// Hoisting
// ============================================================================

/// How a tensor is promoted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HoistOptions {
    /// Target scope.
    pub scope: MemScope,
    /// Layout change applied to the buffer.
    pub remapper: Option<Remapper>,
    /// The L1 buffer feeds the matrix unit.
    pub pre_mmu: bool,
    /// Pad the innermost buffer dimension to an odd size.
    pub pad_odd: bool,
}

impl HoistOptions {
    /// Plain promotion to `scope`.
    #[must_use]
    pub fn new(scope: MemScope) -> Self {
        Self {
            scope,
            remapper: None,
            pre_mmu: false,
            pad_odd: false,
        }
    }
}

/// The result of promoting one tensor.
#[derive(Clone, Debug)]
pub struct Hoisted {
    /// Buffer name.
    pub buffer: String,
    /// The references and their footprint.
    pub cluster: FootprintCluster,
    /// Footprint of the buffer, after any remapping.
    pub buffer_box: FootprintBox,
    /// Copy-in statement, if reads are promoted.
    pub read_copy: Option<StmtIdx>,
    /// Copy-out statement, if writes are promoted.
    pub write_copy: Option<StmtIdx>,
    /// Filters grafted for the copy-in.
    pub read_filters: Vec<NodeId>,
    /// Filters grafted for the copy-out.
    pub write_filters: Vec<NodeId>,
}

/// An access that leaves the declared tensor shape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutOfBound {
    /// Accessing statement.
    pub stmt: StmtIdx,
    /// Read or write.
    pub kind: AccessKind,
    /// Every accessed index is outside the tensor.
    pub always: bool,
    /// The access relation, as logged.
    pub relation: String,
}

/// Places copy statements and keeps the buffer table.
pub struct CopyPlacer<'a> {
    session: &'a Session,
    tensors: &'a TensorTable,
    buffers: BufferTable,
}

impl<'a> CopyPlacer<'a> {
    /// Creates a placer over the declared tensors.
    #[must_use]
    pub fn new(session: &'a Session, tensors: &'a TensorTable) -> Self {
        Self {
            session,
            tensors,
            buffers: BufferTable::new(),
        }
    }

    /// Buffers defined so far.
    #[must_use]
    pub fn buffers(&self) -> &BufferTable {
        &self.buffers
    }

    /// Consumes the placer, returning its buffers.
    #[must_use]
    pub fn into_buffers(self) -> BufferTable {
        self.buffers
    }

    /// Element size of a tensor or buffer.
    #[must_use]
    pub fn elem_bytes(&self, tensor: &str) -> u64 {
        self.tensors
            .get(tensor)
            .map(|t| t.elem_bytes)
            .or_else(|| self.buffers.get(tensor).map(|b| b.elem_bytes))
            .unwrap_or(DEFAULT_ELEM_BYTES)
    }

    /// The cluster of `tensor` below `node` and the footprint of its
    /// buffer, or `None` when nothing below the node uses the tensor.
    ///
    /// # Errors
    ///
    /// Propagates rank mismatches and remapper failures.
    pub fn compute_cluster(
        &self,
        tree: &ScheduleTree,
        node: NodeId,
        tensor: &str,
        remapper: Option<&Remapper>,
    ) -> FootprintResult<Option<(FootprintCluster, FootprintBox)>> {
        let refs = scoped_refs(tree, node, tensor);
        if refs.is_empty() {
            return Ok(None);
        }
        let cluster = FootprintCluster::build(tensor, refs)?;
        let buffer_box = match remapper {
            Some(r) if !r.not_need_construct(tensor) => {
                let remapped = r.remap_box(&cluster.footprint)?;
                debug!(tensor, remapper = r.name(), "remapped footprint");
                remapped
            }
            _ => cluster.footprint.clone(),
        };
        Ok(Some((cluster, buffer_box)))
    }

    /// Compares every reference of `tensor` below `node` with the declared
    /// shape and warns about accesses that leave it. Accesses are not
    /// rewritten.
    pub fn check_out_of_bounds(&self, tree: &ScheduleTree, node: NodeId, tensor: &str) -> Vec<OutOfBound> {
        let Some(info) = self.tensors.get(self.buffers.origin(tensor)) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for r in scoped_refs(tree, node, tensor) {
            let hull = r.access.range_hull(&r.domain);
            let mut always = false;
            let mut possible = false;
            for (d, range) in hull.iter().enumerate() {
                let (Some((lo, hi)), Some(&extent)) = (range, info.shape.get(d)) else {
                    continue;
                };
                if *hi < 0 || *lo >= extent {
                    always = true;
                } else if *lo < 0 || *hi >= extent {
                    possible = true;
                }
            }
            if !(always || possible) {
                continue;
            }
            let relation = r.access.display(&r.domain).to_string();
            let kind = r.kind().name();
            if always {
                warn!(tensor, %relation, "detected always out of bound {kind} access");
            } else {
                warn!(tensor, %relation, "detected possible out of bound {kind} access");
            }
            out.push(OutOfBound {
                stmt: r.stmt,
                kind: r.kind(),
                always,
                relation,
            });
        }
        out
    }

    /// Promotes `tensor` below `node` into `opts.scope`.
    ///
    /// Returns `None` when nothing below the node uses the tensor or when
    /// its footprint has no fixed bound.
    ///
    /// # Errors
    ///
    /// Propagates footprint and tree-edit failures.
    #[instrument(skip_all, fields(tensor = %tensor, scope = %opts.scope))]
    pub fn hoist(
        &mut self,
        tree: &mut ScheduleTree,
        node: NodeId,
        tensor: &str,
        opts: &HoistOptions,
    ) -> FootprintResult<Option<Hoisted>> {
        self.check_out_of_bounds(tree, node, tensor);
        let Some((cluster, buffer_box)) = self.compute_cluster(tree, node, tensor, opts.remapper.as_ref())? else {
            return Ok(None);
        };
        let Some(mut sizes) = buffer_box.buffer_sizes() else {
            info!(
                footprint = %buffer_box.describe(&cluster.space_names()),
                "footprint has no fixed bound, not promoted"
            );
            return Ok(None);
        };

        let mut do_read = cluster.has_reads();
        let mut do_write = cluster.has_writes();
        let bound = self.session.config().is_bound(tensor);
        let pre_mmu_l1 = opts.scope == MemScope::L1 && opts.pre_mmu;
        if do_write && !bound && (opts.scope == MemScope::Unified || pre_mmu_l1) {
            debug!("write-back suppressed");
            do_write = false;
            if pre_mmu_l1 {
                do_read = false;
            }
        }

        if opts.pad_odd {
            if let Some(last) = sizes.last_mut() {
                if *last % 2 == 0 {
                    *last += 1;
                }
            }
        }
        let elem_bytes = self.elem_bytes(tensor);
        let buffer = self.buffers.define(tensor, opts.scope, sizes.clone(), elem_bytes);

        let source = match &opts.remapper {
            Some(r) if !r.not_need_construct(tensor) => Some(r.source_index(&cluster.footprint)?),
            _ => None,
        };
        let mut hoisted = Hoisted {
            buffer: buffer.clone(),
            read_copy: None,
            write_copy: None,
            read_filters: Vec::new(),
            write_filters: Vec::new(),
            cluster,
            buffer_box,
        };
        for (kind, wanted) in [(AccessKind::Read, do_read), (AccessKind::Write, do_write)] {
            if !wanted {
                continue;
            }
            let (stmt, band) = copy_stmt(tree, &hoisted, source.as_deref(), kind, tensor);
            let filters = self.place(tree, node, stmt, &band, tensor, kind, &buffer)?;
            match kind {
                AccessKind::Read => {
                    hoisted.read_copy = Some(stmt);
                    hoisted.read_filters = filters;
                }
                AccessKind::Write => {
                    hoisted.write_copy = Some(stmt);
                    hoisted.write_filters = filters;
                }
            }
        }

        self.session.log(
            LogStage::BufferLiveExtent,
            DumpLevel::General,
            format!(
                "{buffer}: {} {:?} from {tensor}, {}",
                opts.scope,
                sizes,
                hoisted.buffer_box.describe(&hoisted.cluster.space_names())
            ),
        );
        info!(%buffer, sizes = ?sizes, read = do_read, write = do_write, "promoted");
        Ok(Some(hoisted))
    }

    /// Grafts extension statement `ext` next to the filters below `node`
    /// that use `tensor`. Returns the grafted filters.
    #[allow(clippy::too_many_arguments)]
    fn place(
        &self,
        tree: &mut ScheduleTree,
        node: NodeId,
        ext: StmtIdx,
        band: &Band,
        tensor: &str,
        kind: AccessKind,
        buffer: &str,
    ) -> FootprintResult<Vec<NodeId>> {
        let graft = |tree: &mut ScheduleTree, filter| match kind {
            AccessKind::Read => tree.graft_before(filter, ext, Some(band.clone())),
            AccessKind::Write => tree.graft_after(filter, ext, Some(band.clone())),
        };

        let mut inserted = Vec::new();
        if let Some(seq) = sequence_below(tree, node) {
            let mut filters = tree.children(seq).to_vec();
            if kind == AccessKind::Write {
                filters.reverse();
            }
            let mut last: Option<Vec<(i64, i64)>> = None;
            for filter in filters {
                if !self.filter_uses(tree, filter, tensor, buffer, ext) {
                    continue;
                }
                let range = tree.short_schedule(filter);
                if last.as_ref().is_some_and(|prev| covers(prev, &range)) {
                    debug!(?filter, "data reused within the tile, no extra copy");
                    continue;
                }
                inserted.push(graft(tree, filter)?);
                last = Some(range);
            }
        }
        if inserted.is_empty() {
            let target = match tree.kind(node) {
                NodeKind::Domain | NodeKind::Mark { .. } => tree.child(node, 0)?,
                _ => node,
            };
            let in_sequence = tree.parent(target).filter(|&f| {
                matches!(tree.kind(f), NodeKind::Filter { .. })
                    && tree
                        .parent(f)
                        .is_some_and(|s| matches!(tree.kind(s), NodeKind::Sequence | NodeKind::Set))
            });
            let filter = match in_sequence {
                Some(f) => f,
                None => tree.wrap_in_sequence(target),
            };
            inserted.push(graft(tree, filter)?);
        }
        Ok(inserted)
    }

    /// Returns true if a statement below `filter`, other than `ext` and the
    /// copies of `buffer`, uses `tensor` or a buffer holding it.
    fn filter_uses(&self, tree: &ScheduleTree, filter: NodeId, tensor: &str, buffer: &str, ext: StmtIdx) -> bool {
        tree.stmts_below(filter).into_iter().filter(|&s| s != ext).any(|s| {
            let info = tree.stmt(s);
            if matches!(&info.kind, StmtKind::Copy { buffer: b, .. } if b == buffer) {
                return false;
            }
            info.accesses
                .iter()
                .any(|a| a.tensor == tensor || self.buffers.origin(&a.tensor) == tensor)
        })
    }

    // ------------------------------------------------------------------
    // Recomputation into L1
    // ------------------------------------------------------------------

    /// Inside the subtree at an L1 realization mark, makes every tensor read
    /// there but neither copied in nor produced there available by
    /// recomputing its producers, chasing their inputs upstream.
    ///
    /// Returns the recompute statements added.
    ///
    /// # Errors
    ///
    /// Fails when `mark` is not a [`REALIZE_L1`] mark.
    pub fn insert_recompute(
        &mut self,
        tree: &mut ScheduleTree,
        mark: NodeId,
        tensor: &str,
    ) -> FootprintResult<Vec<StmtIdx>> {
        match tree.kind(mark) {
            NodeKind::Mark { name } if name == REALIZE_L1 => {}
            other => {
                return Err(PolyError::NodeKind {
                    node: mark,
                    expected: "realize_L1 mark",
                    found: other.name(),
                }
                .into())
            }
        }
        let mut visited = FxHashSet::default();
        let mut added = Vec::new();
        self.recompute(tree, mark, tensor, &mut visited, &mut added)?;
        Ok(added)
    }

    fn recompute(
        &mut self,
        tree: &mut ScheduleTree,
        mark: NodeId,
        tensor: &str,
        visited: &mut FxHashSet<String>,
        added: &mut Vec<StmtIdx>,
    ) -> FootprintResult<()> {
        if !visited.insert(tensor.to_string()) {
            return Ok(());
        }
        let below = tree.stmts_below(mark);
        let copied = below.iter().any(|&s| {
            matches!(&tree.stmt(s).kind,
                StmtKind::Copy { kind: AccessKind::Read, tensor: t, .. } if t == tensor)
        });
        let read = below.iter().any(|&s| tree.stmt(s).reads().any(|a| a.tensor == tensor));
        let produced = below.iter().any(|&s| tree.stmt(s).writes().any(|a| a.tensor == tensor));
        if copied || !read || produced {
            return Ok(());
        }

        let producers: Vec<StmtIdx> = tree
            .stmts()
            .filter(|(_, info)| {
                matches!(info.kind, StmtKind::Compute { .. }) && info.writes().any(|a| a.tensor == tensor)
            })
            .map(|(id, _)| id)
            .collect();
        for source in producers {
            let info = tree.stmt(source).clone();
            let rank = info.domain.rank();
            let stmt = tree.add_stmt(StmtInfo {
                name: format!("{}_recompute", info.name),
                kind: StmtKind::Recompute { source },
                domain: info.domain.clone(),
                accesses: info.accesses.clone(),
            });
            let dims = (0..rank)
                .filter(|&i| info.domain.extent(i) > 1)
                .map(|i| single_dim(stmt, ScheduleDim::var(rank, i)))
                .collect();
            self.place(tree, mark, stmt, &Band::new(dims, true), tensor, AccessKind::Read, "")?;
            info!(tensor, producer = %info.name, "recomputing producer in L1");
            added.push(stmt);
            for input in info.reads() {
                self.recompute(tree, mark, &input.tensor, visited, added)?;
            }
        }
        Ok(())
    }
}

/// The first sequence or set below `node` reached through single children
/// without crossing a band.
fn sequence_below(tree: &ScheduleTree, node: NodeId) -> Option<NodeId> {
    let mut cur = node;
    loop {
        match tree.kind(cur) {
            NodeKind::Sequence | NodeKind::Set => return Some(cur),
            NodeKind::Band(_) | NodeKind::Leaf => return None,
            _ => match tree.children(cur) {
                [only] => cur = *only,
                _ => return None,
            },
        }
    }
}

/// Returns true if `range` lies inside `prev`, dimension by dimension.
fn covers(prev: &[(i64, i64)], range: &[(i64, i64)]) -> bool {
    prev.len() == range.len()
        && prev
            .iter()
            .zip(range)
            .all(|(p, r)| p.0 <= r.0 && r.1 <= p.1)
}

fn single_dim(stmt: StmtIdx, sched: ScheduleDim) -> BandDim {
    let mut dim = BandDim::default();
    dim.insert(stmt, sched);
    dim
}

/// Builds the copy statement for one direction and the band scanning its
/// non-unit buffer dimensions.
///
/// The statement iterates the prefix values `p₀ …` of the first reference
/// and one variable `cc_d` per footprint dimension. Tensor coordinate `d`
/// is the footprint offset plus `stride · cc_d`; iteration variables in the
/// offset are recovered from earlier coordinates.
fn copy_stmt(
    tree: &mut ScheduleTree,
    hoisted: &Hoisted,
    source: Option<&[IndexExpr]>,
    kind: AccessKind,
    tensor: &str,
) -> (StmtIdx, Band) {
    let fp = &hoisted.buffer_box;
    let (prefix, domain) = hoisted
        .cluster
        .refs
        .first()
        .map(|r| (r.prefix.clone(), r.domain.clone()))
        .unwrap_or_default();
    let p = prefix.len();
    let rank = fp.rank();
    let n = p + rank;

    let mut names: Vec<String> = (0..p).map(|k| format!("p{k}")).collect();
    names.extend((0..rank).map(|d| format!("cc{d}")));
    let mut bounds: Vec<(i64, i64)> = prefix
        .iter()
        .map(|s| {
            let (lo, hi) = s.range(&domain);
            (lo, hi + 1)
        })
        .collect();
    bounds.extend(fp.sizes.iter().map(|s| (0, s.unwrap_or(1))));
    let copy_domain = BoxSet::from_bounds(names, bounds);

    let mut coords: Vec<IndexExpr> = Vec::with_capacity(rank);
    for d in 0..rank {
        let offset = &fp.offsets[d];
        let mut expr = IndexExpr::constant(n, offset.constant_term());
        for (u, c) in offset.terms() {
            let term = if u < p {
                IndexExpr::var(n, u)
            } else {
                fp.determinants
                    .iter()
                    .find(|t| t.var == u && t.dim < d)
                    .map_or(IndexExpr::Any, |t| coords[t.dim].clone().offset(-t.constant).scale(t.coeff))
            };
            expr = expr.plus(term.scale(c));
        }
        coords.push(expr.plus(IndexExpr::var(n, p + d).scale(fp.strides[d])));
    }
    let tensor_index = match source {
        Some(src) => src.iter().map(|e| e.compose(&coords)).collect(),
        None => coords,
    };
    let mut buffer_index: Vec<IndexExpr> = (0..rank)
        .filter(|&d| fp.sizes[d] != Some(1))
        .map(|d| IndexExpr::var(n, p + d))
        .collect();
    if buffer_index.is_empty() {
        buffer_index.push(IndexExpr::constant(n, 0));
    }

    let buffer = hoisted.buffer.clone();
    let (accesses, suffix) = match kind {
        AccessKind::Read => (
            vec![
                AccessMap::new(tensor, AccessKind::Read, tensor_index),
                AccessMap::new(buffer.clone(), AccessKind::Write, buffer_index),
            ],
            "read",
        ),
        AccessKind::Write => (
            vec![
                AccessMap::new(buffer.clone(), AccessKind::Read, buffer_index),
                AccessMap::new(tensor, AccessKind::Write, tensor_index),
            ],
            "write",
        ),
    };
    let stmt = tree.add_stmt(StmtInfo {
        name: format!("{buffer}_{suffix}"),
        kind: StmtKind::Copy {
            kind,
            tensor: tensor.to_string(),
            buffer,
        },
        domain: copy_domain,
        accesses,
    });
    let dims = (0..rank)
        .filter(|&d| fp.sizes[d].is_some_and(|s| s > 1))
        .map(|d| single_dim(stmt, ScheduleDim::var(n, p + d)))
        .collect();
    (stmt, Band::new(dims, true))
}
