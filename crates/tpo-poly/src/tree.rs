//! Schedule trees.
//!
//! A [`ScheduleTree`] is an arena of [`Node`]s rooted at a domain node.
//! Statements live in a separate table; filters, extensions and bands refer
//! to them by [`StmtIdx`]. Every edit goes through the narrow surface below
//! (`insert_*`, `graft_*`, `band_split`, `band_tile`), and a tree is cheap
//! to clone, so callers keep a snapshot when they may need to start over.

use crate::access::{AccessKind, AccessMap};
use crate::aff::{div_floor, Aff};
use crate::set::BoxSet;
use crate::{NodeId, PolyError, PolyResult, StmtIdx};
use indexmap::IndexMap;
use std::fmt::{self, Write as _};
use tpo_index::{Idx, IndexVec};

// ============================================================================
// Schedules
// ============================================================================

/// One schedule dimension of one statement: `floor(expr / div) [mod m]`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ScheduleDim {
    /// Affine function of the statement's iteration variables.
    pub expr: Aff,
    /// Positive divisor applied by tiling.
    pub div: i64,
    /// Modulus of a point loop created by tiling.
    pub modulo: Option<i64>,
}

impl ScheduleDim {
    /// The schedule `expr`.
    #[must_use]
    pub fn new(expr: Aff) -> Self {
        Self {
            expr,
            div: 1,
            modulo: None,
        }
    }

    /// The schedule `xᵢ` over `n` iteration variables.
    #[must_use]
    pub fn var(n: usize, i: usize) -> Self {
        Self::new(Aff::var(n, i))
    }

    /// The iteration variable this dimension scans one to one, if any.
    #[must_use]
    pub fn single_var(&self) -> Option<usize> {
        match self.expr.single_var() {
            Some((v, 1)) if self.expr.constant_term() == 0 => Some(v),
            _ => None,
        }
    }

    /// Value at iteration `point`.
    #[must_use]
    pub fn eval(&self, point: &[i64]) -> i64 {
        let v = div_floor(self.expr.eval(point), self.div);
        match self.modulo {
            Some(m) => v.rem_euclid(m),
            None => v,
        }
    }

    /// Inclusive value range over `domain`.
    #[must_use]
    pub fn range(&self, domain: &BoxSet) -> (i64, i64) {
        let (lo, hi) = self.expr.bounds(domain.lowers(), &domain.last_points());
        let (lo, hi) = (div_floor(lo, self.div), div_floor(hi, self.div));
        match self.modulo {
            Some(m) if hi - lo + 1 >= m || lo.div_euclid(m) != hi.div_euclid(m) => (0, m - 1),
            Some(m) => (lo.rem_euclid(m), hi.rem_euclid(m)),
            None => (lo, hi),
        }
    }

    /// Number of values over `domain`.
    #[must_use]
    pub fn extent(&self, domain: &BoxSet) -> i64 {
        let (lo, hi) = self.range(domain);
        (hi - lo + 1).max(0)
    }

    fn write(&self, f: &mut impl fmt::Write, names: &[String]) -> fmt::Result {
        let expr = self.expr.display(names);
        match (self.div, self.modulo) {
            (1, None) => write!(f, "{expr}"),
            (1, Some(m)) => write!(f, "({expr}) mod {m}"),
            (d, None) => write!(f, "floor(({expr})/{d})"),
            (d, Some(m)) => write!(f, "floor(({expr})/{d}) mod {m}"),
        }
    }
}

/// One band member: the schedule of every statement it covers.
pub type BandDim = IndexMap<StmtIdx, ScheduleDim>;

/// A band of loop dimensions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Band {
    /// Members, outermost first.
    pub dims: Vec<BandDim>,
    /// The members may be freely interchanged and tiled.
    pub permutable: bool,
    /// Members carrying no dependence.
    pub coincident: Vec<bool>,
}

impl Band {
    /// Creates a band with no coincident members.
    #[must_use]
    pub fn new(dims: Vec<BandDim>, permutable: bool) -> Self {
        let coincident = vec![false; dims.len()];
        Self {
            dims,
            permutable,
            coincident,
        }
    }

    /// The identity band over every iteration variable of one statement.
    #[must_use]
    pub fn identity(stmt: StmtIdx, rank: usize) -> Self {
        let dims = (0..rank)
            .map(|i| {
                let mut dim = BandDim::default();
                dim.insert(stmt, ScheduleDim::var(rank, i));
                dim
            })
            .collect();
        Self::new(dims, true)
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.dims.len()
    }

    /// Returns true if the band has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dims.is_empty()
    }

    fn split_at(mut self, pos: usize) -> (Self, Self) {
        let inner_dims = self.dims.split_off(pos);
        let inner_coin = self.coincident.split_off(pos.min(self.coincident.len()));
        let inner = Self {
            dims: inner_dims,
            permutable: self.permutable,
            coincident: inner_coin,
        };
        (self, inner)
    }
}

// ============================================================================
// Statements
// ============================================================================

/// What a statement does.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StmtKind {
    /// A tensor computation from the graph.
    Compute {
        /// Op name.
        op: String,
    },
    /// A data-movement statement introduced by promotion.
    Copy {
        /// `Read` copies the tensor into the buffer, `Write` copies back.
        kind: AccessKind,
        /// Promoted tensor.
        tensor: String,
        /// Buffer in the target scope.
        buffer: String,
    },
    /// A copy of another statement, evaluated into a local buffer.
    Recompute {
        /// The statement being recomputed.
        source: StmtIdx,
    },
}

/// A statement with its iteration domain and references.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StmtInfo {
    /// Unique name, e.g. `S_0`.
    pub name: String,
    /// Role of the statement.
    pub kind: StmtKind,
    /// Iteration domain.
    pub domain: BoxSet,
    /// Tensor references, reads first by convention.
    pub accesses: Vec<AccessMap>,
}

impl StmtInfo {
    /// A compute statement.
    #[must_use]
    pub fn compute(
        name: impl Into<String>,
        op: impl Into<String>,
        domain: BoxSet,
        accesses: Vec<AccessMap>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: StmtKind::Compute { op: op.into() },
            domain,
            accesses,
        }
    }

    /// References that read.
    pub fn reads(&self) -> impl Iterator<Item = &AccessMap> + '_ {
        self.accesses.iter().filter(|a| a.is_read())
    }

    /// References that write.
    pub fn writes(&self) -> impl Iterator<Item = &AccessMap> + '_ {
        self.accesses.iter().filter(|a| a.is_write())
    }

    /// Returns true for copy statements.
    #[must_use]
    pub fn is_copy(&self) -> bool {
        matches!(self.kind, StmtKind::Copy { .. })
    }
}

// ============================================================================
// Nodes
// ============================================================================

/// The kind of a schedule-tree node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
    /// Root; its statements are the domain statements.
    Domain,
    /// Named parameters in scope below.
    Context {
        /// Parameter names.
        params: Vec<String>,
    },
    /// Restricts the subtree to the listed statements.
    Filter {
        /// Statements kept.
        stmts: Vec<StmtIdx>,
    },
    /// A band of loops.
    Band(Band),
    /// Children (filters) execute in order.
    Sequence,
    /// Children (filters) execute in any order.
    Set,
    /// An annotation.
    Mark {
        /// Mark name.
        name: String,
    },
    /// Introduces statements not in the domain.
    Extension {
        /// Statements introduced.
        stmts: Vec<StmtIdx>,
    },
    /// Bottom of the tree.
    Leaf,
}

impl NodeKind {
    /// Lowercase kind name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Domain => "domain",
            Self::Context { .. } => "context",
            Self::Filter { .. } => "filter",
            Self::Band(_) => "band",
            Self::Sequence => "sequence",
            Self::Set => "set",
            Self::Mark { .. } => "mark",
            Self::Extension { .. } => "extension",
            Self::Leaf => "leaf",
        }
    }
}

/// A schedule-tree node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    /// Node kind and payload.
    pub kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

// ============================================================================
// Schedule tree
// ============================================================================

/// A schedule tree with its statement table.
#[derive(Clone, Debug)]
pub struct ScheduleTree {
    stmts: IndexVec<StmtIdx, StmtInfo>,
    domain: Vec<StmtIdx>,
    nodes: IndexVec<NodeId, Node>,
    root: NodeId,
}

impl ScheduleTree {
    /// A tree `domain → leaf` over `stmts`.
    #[must_use]
    pub fn new(stmts: impl IntoIterator<Item = StmtInfo>) -> Self {
        let mut table = IndexVec::new();
        let domain = stmts.into_iter().map(|s| table.push(s)).collect();
        let mut nodes = IndexVec::new();
        let root = nodes.push(Node {
            kind: NodeKind::Domain,
            parent: None,
            children: Vec::new(),
        });
        let leaf = nodes.push(Node {
            kind: NodeKind::Leaf,
            parent: Some(root),
            children: Vec::new(),
        });
        nodes[root].children.push(leaf);
        Self {
            stmts: table,
            domain,
            nodes,
            root,
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    /// Registers a statement introduced by an extension.
    pub fn add_stmt(&mut self, info: StmtInfo) -> StmtIdx {
        self.stmts.push(info)
    }

    /// A statement.
    #[must_use]
    pub fn stmt(&self, id: StmtIdx) -> &StmtInfo {
        &self.stmts[id]
    }

    /// Mutable statement access.
    pub fn stmt_mut(&mut self, id: StmtIdx) -> &mut StmtInfo {
        &mut self.stmts[id]
    }

    /// Every statement, domain and extension alike.
    pub fn stmts(&self) -> impl Iterator<Item = (StmtIdx, &StmtInfo)> + '_ {
        self.stmts.iter_enumerated()
    }

    /// Number of statements.
    #[must_use]
    pub fn num_stmts(&self) -> usize {
        self.stmts.len()
    }

    // ------------------------------------------------------------------
    // Navigation
    // ------------------------------------------------------------------

    /// The domain node.
    #[must_use]
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// A node.
    #[must_use]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// The kind of a node.
    #[must_use]
    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id].kind
    }

    /// Parent of a node; `None` at the root.
    #[must_use]
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    /// Children of a node.
    #[must_use]
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].children
    }

    /// Number of children.
    #[must_use]
    pub fn n_children(&self, id: NodeId) -> usize {
        self.nodes[id].children.len()
    }

    /// Child at `pos`.
    ///
    /// # Errors
    ///
    /// Fails when `pos` is out of range.
    pub fn child(&self, id: NodeId, pos: usize) -> PolyResult<NodeId> {
        let children = self.children(id);
        children
            .get(pos)
            .copied()
            .ok_or(PolyError::ChildOutOfRange {
                node: id,
                pos,
                len: children.len(),
            })
    }

    /// Ancestor `generation` levels up; generation 0 is the node itself.
    ///
    /// # Errors
    ///
    /// Fails when the tree is not that deep.
    pub fn ancestor(&self, id: NodeId, generation: usize) -> PolyResult<NodeId> {
        let mut cur = id;
        for _ in 0..generation {
            cur = self
                .parent(cur)
                .ok_or(PolyError::NoAncestor { node: id, generation })?;
        }
        Ok(cur)
    }

    /// Position of a node among its parent's children.
    #[must_use]
    pub fn child_position(&self, id: NodeId) -> Option<usize> {
        let parent = self.parent(id)?;
        self.children(parent).iter().position(|&c| c == id)
    }

    /// Distance from the root.
    #[must_use]
    pub fn depth(&self, id: NodeId) -> usize {
        let mut depth = 0;
        let mut cur = id;
        while let Some(p) = self.parent(cur) {
            depth += 1;
            cur = p;
        }
        depth
    }

    /// Nodes from the root down to `id`, inclusive.
    #[must_use]
    pub fn path_to(&self, id: NodeId) -> Vec<NodeId> {
        let mut path = vec![id];
        let mut cur = id;
        while let Some(p) = self.parent(cur) {
            path.push(p);
            cur = p;
        }
        path.reverse();
        path
    }

    /// The subtree at `from` in pre-order.
    #[must_use]
    pub fn preorder(&self, from: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.children(id).iter().rev());
        }
        out
    }

    /// Every band node in pre-order.
    #[must_use]
    pub fn bands(&self) -> Vec<NodeId> {
        self.preorder(self.root)
            .into_iter()
            .filter(|&id| matches!(self.kind(id), NodeKind::Band(_)))
            .collect()
    }

    /// The first mark named `name` in pre-order.
    #[must_use]
    pub fn find_mark(&self, name: &str) -> Option<NodeId> {
        self.preorder(self.root)
            .into_iter()
            .find(|&id| matches!(self.kind(id), NodeKind::Mark { name: n } if n == name))
    }

    /// The band payload of a band node.
    ///
    /// # Errors
    ///
    /// Fails when `id` is not a band.
    pub fn band(&self, id: NodeId) -> PolyResult<&Band> {
        match self.kind(id) {
            NodeKind::Band(band) => Ok(band),
            other => Err(Self::kind_error(id, "band", other)),
        }
    }

    /// Mutable band payload.
    ///
    /// # Errors
    ///
    /// Fails when `id` is not a band.
    pub fn band_mut(&mut self, id: NodeId) -> PolyResult<&mut Band> {
        let name = self.kind(id).name();
        match &mut self.nodes[id].kind {
            NodeKind::Band(band) => Ok(band),
            _ => Err(PolyError::NodeKind {
                node: id,
                expected: "band",
                found: name,
            }),
        }
    }

    fn kind_error(id: NodeId, expected: &'static str, found: &NodeKind) -> PolyError {
        PolyError::NodeKind {
            node: id,
            expected,
            found: found.name(),
        }
    }

    // ------------------------------------------------------------------
    // Statement sets and schedules
    // ------------------------------------------------------------------

    /// Statements executed at `id`: domain statements restricted by the
    /// filters above, plus statements introduced by extensions above.
    #[must_use]
    pub fn active_stmts(&self, id: NodeId) -> Vec<StmtIdx> {
        let path = self.path_to(id);
        let mut active: Vec<StmtIdx> = self.domain.clone();
        for (k, &node) in path.iter().enumerate() {
            match self.kind(node) {
                NodeKind::Filter { stmts } => active.retain(|s| stmts.contains(s)),
                NodeKind::Extension { stmts } if k + 1 < path.len() => {
                    for &s in stmts {
                        if !active.contains(&s) {
                            active.push(s);
                        }
                    }
                }
                _ => {}
            }
        }
        active.sort_unstable();
        active
    }

    /// Statements executed anywhere in the subtree at `id`.
    #[must_use]
    pub fn stmts_below(&self, id: NodeId) -> Vec<StmtIdx> {
        let mut out = self.active_stmts(id);
        for node in self.preorder(id) {
            if let NodeKind::Extension { stmts } = self.kind(node) {
                for &s in stmts {
                    if !out.contains(&s) {
                        out.push(s);
                    }
                }
            }
        }
        out.sort_unstable();
        out
    }

    /// Schedule dimensions of the bands strictly above `id`, per active
    /// statement, outermost first.
    #[must_use]
    pub fn prefix_schedule(&self, id: NodeId) -> IndexMap<StmtIdx, Vec<ScheduleDim>> {
        let mut out: IndexMap<StmtIdx, Vec<ScheduleDim>> = self
            .active_stmts(id)
            .into_iter()
            .map(|s| (s, Vec::new()))
            .collect();
        let path = self.path_to(id);
        for &node in &path[..path.len() - 1] {
            if let NodeKind::Band(band) = self.kind(node) {
                for dim in &band.dims {
                    for (stmt, sched) in dim {
                        if let Some(list) = out.get_mut(stmt) {
                            list.push(sched.clone());
                        }
                    }
                }
            }
        }
        out
    }

    /// Value ranges of the first band at or below `id` along single-child
    /// links; empty if there is none.
    #[must_use]
    pub fn short_schedule(&self, id: NodeId) -> Vec<(i64, i64)> {
        let mut cur = id;
        loop {
            if let NodeKind::Band(_) = self.kind(cur) {
                return self.band_ranges(cur);
            }
            match self.children(cur) {
                [only] if !matches!(self.kind(cur), NodeKind::Sequence | NodeKind::Set) => {
                    cur = *only;
                }
                _ => return Vec::new(),
            }
        }
    }

    fn band_ranges(&self, id: NodeId) -> Vec<(i64, i64)> {
        let Ok(band) = self.band(id) else {
            return Vec::new();
        };
        let below = self.stmts_below(id);
        band.dims
            .iter()
            .map(|dim| {
                dim.iter()
                    .filter(|(s, _)| below.contains(s))
                    .map(|(s, sched)| sched.range(&self.stmts[*s].domain))
                    .reduce(|a, b| (a.0.min(b.0), a.1.max(b.1)))
                    .unwrap_or((0, 0))
            })
            .collect()
    }

    /// Number of values of each member of a band.
    ///
    /// # Errors
    ///
    /// Fails when `id` is not a band.
    pub fn band_extents(&self, id: NodeId) -> PolyResult<Vec<i64>> {
        self.band(id)?;
        Ok(self
            .band_ranges(id)
            .into_iter()
            .map(|(lo, hi)| hi - lo + 1)
            .collect())
    }

    /// Statements in execution order, one entry per statement.
    #[must_use]
    pub fn stmt_order(&self) -> Vec<StmtIdx> {
        let mut order = Vec::new();
        for id in self.preorder(self.root) {
            if matches!(self.kind(id), NodeKind::Leaf) {
                for s in self.active_stmts(id) {
                    if !order.contains(&s) {
                        order.push(s);
                    }
                }
            }
        }
        order
    }

    // ------------------------------------------------------------------
    // Edits
    // ------------------------------------------------------------------

    fn push_node(&mut self, kind: NodeKind, parent: Option<NodeId>) -> NodeId {
        self.nodes.push(Node {
            kind,
            parent,
            children: Vec::new(),
        })
    }

    fn insert_above(&mut self, id: NodeId, kind: NodeKind) -> NodeId {
        let parent = self.parent(id);
        let new = self.push_node(kind, parent);
        if let Some(p) = parent {
            if let Some(slot) = self.nodes[p].children.iter_mut().find(|c| **c == id) {
                *slot = new;
            }
        } else {
            self.root = new;
        }
        self.nodes[id].parent = Some(new);
        self.nodes[new].children.push(id);
        new
    }

    fn insert_below(&mut self, id: NodeId, kind: NodeKind) -> NodeId {
        let new = self.push_node(kind, Some(id));
        let children = std::mem::take(&mut self.nodes[id].children);
        for &c in &children {
            self.nodes[c].parent = Some(new);
        }
        self.nodes[new].children = children;
        self.nodes[id].children.push(new);
        new
    }

    /// Inserts a context node directly below the root.
    pub fn insert_context(&mut self, params: Vec<String>) -> NodeId {
        self.insert_below(self.root, NodeKind::Context { params })
    }

    /// Inserts a filter above `id`.
    pub fn insert_filter(&mut self, id: NodeId, stmts: Vec<StmtIdx>) -> NodeId {
        self.insert_above(id, NodeKind::Filter { stmts })
    }

    /// Inserts a mark above `id`.
    pub fn insert_mark(&mut self, id: NodeId, name: impl Into<String>) -> NodeId {
        self.insert_above(id, NodeKind::Mark { name: name.into() })
    }

    /// Inserts a band above `id`.
    pub fn insert_partial_schedule(&mut self, id: NodeId, band: Band) -> NodeId {
        self.insert_above(id, NodeKind::Band(band))
    }

    /// Inserts a sequence above `id` with one filter per entry of
    /// `filters`; every filter receives its own copy of the subtree.
    ///
    /// # Errors
    ///
    /// Fails when `filters` is empty.
    pub fn insert_sequence(&mut self, id: NodeId, filters: Vec<Vec<StmtIdx>>) -> PolyResult<NodeId> {
        if filters.is_empty() {
            return Err(PolyError::EmptySequence(id));
        }
        let seq = self.insert_above(id, NodeKind::Sequence);
        self.nodes[seq].children.clear();
        for (k, stmts) in filters.into_iter().enumerate() {
            let filter = self.push_node(NodeKind::Filter { stmts }, Some(seq));
            self.nodes[seq].children.push(filter);
            let body = if k == 0 {
                self.nodes[id].parent = Some(filter);
                id
            } else {
                self.copy_subtree(id, filter)
            };
            self.nodes[filter].children.push(body);
        }
        Ok(seq)
    }

    fn copy_subtree(&mut self, src: NodeId, parent: NodeId) -> NodeId {
        let kind = self.nodes[src].kind.clone();
        let new = self.push_node(kind, Some(parent));
        let children = self.nodes[src].children.clone();
        for c in children {
            let copy = self.copy_subtree(c, new);
            self.nodes[new].children.push(copy);
        }
        new
    }

    /// Wraps `id` in a sequence so statements can be grafted around it.
    /// Returns the filter now holding `id`.
    pub fn wrap_in_sequence(&mut self, id: NodeId) -> NodeId {
        let stmts = self.stmts_below(id);
        let filter = self.insert_filter(id, stmts);
        self.insert_above(filter, NodeKind::Sequence);
        filter
    }

    /// Grafts extension statement `ext` in a new filter before `filter`.
    ///
    /// # Errors
    ///
    /// Fails unless `filter` is a child of a sequence or set.
    pub fn graft_before(&mut self, filter: NodeId, ext: StmtIdx, band: Option<Band>) -> PolyResult<NodeId> {
        self.graft(filter, ext, band, false)
    }

    /// Grafts extension statement `ext` in a new filter after `filter`.
    ///
    /// # Errors
    ///
    /// Fails unless `filter` is a child of a sequence or set.
    pub fn graft_after(&mut self, filter: NodeId, ext: StmtIdx, band: Option<Band>) -> PolyResult<NodeId> {
        self.graft(filter, ext, band, true)
    }

    fn graft(&mut self, filter: NodeId, ext: StmtIdx, band: Option<Band>, after: bool) -> PolyResult<NodeId> {
        let parent = self.parent(filter).ok_or(PolyError::NoAncestor {
            node: filter,
            generation: 1,
        })?;
        if !matches!(self.kind(parent), NodeKind::Sequence | NodeKind::Set) {
            return Err(Self::kind_error(parent, "sequence", self.kind(parent)));
        }
        let pos = self.child_position(filter).unwrap_or(0) + usize::from(after);
        let new_filter = self.push_node(NodeKind::Filter { stmts: vec![ext] }, Some(parent));
        self.nodes[parent].children.insert(pos, new_filter);
        let extension = self.push_node(NodeKind::Extension { stmts: vec![ext] }, Some(new_filter));
        self.nodes[new_filter].children.push(extension);
        let mut bottom = extension;
        if let Some(band) = band.filter(|b| !b.is_empty()) {
            let node = self.push_node(NodeKind::Band(band), Some(extension));
            self.nodes[extension].children.push(node);
            bottom = node;
        }
        let leaf = self.push_node(NodeKind::Leaf, Some(bottom));
        self.nodes[bottom].children.push(leaf);
        Ok(new_filter)
    }

    /// Splits a band after `pos` members. Returns the inner band.
    ///
    /// # Errors
    ///
    /// Fails when `id` is not a band or `pos` is not strictly inside it.
    pub fn band_split(&mut self, id: NodeId, pos: usize) -> PolyResult<NodeId> {
        let band = self.band(id)?.clone();
        if pos == 0 || pos >= band.len() {
            return Err(PolyError::DimMismatch {
                what: "band split position",
                expected: band.len(),
                found: pos,
            });
        }
        let (outer, inner) = band.split_at(pos);
        *self.band_mut(id)? = outer;
        Ok(self.insert_below(id, NodeKind::Band(inner)))
    }

    /// Tiles a band by `sizes`: the band keeps the tile loops and a new
    /// point band is inserted below it. Returns the point band.
    ///
    /// # Errors
    ///
    /// Fails when `id` is not a band, `sizes` does not match its width, a
    /// size is not positive, or a member is already a point loop.
    pub fn band_tile(&mut self, id: NodeId, sizes: &[i64]) -> PolyResult<NodeId> {
        let band = self.band(id)?.clone();
        if sizes.len() != band.len() {
            return Err(PolyError::DimMismatch {
                what: "tile sizes",
                expected: band.len(),
                found: sizes.len(),
            });
        }
        let mut outer = band.clone();
        let mut inner = band;
        for (k, &size) in sizes.iter().enumerate() {
            if size <= 0 {
                return Err(PolyError::InvalidTile { node: id, size });
            }
            for (sched_out, sched_in) in outer.dims[k].values_mut().zip(inner.dims[k].values_mut()) {
                if sched_out.modulo.is_some() {
                    return Err(PolyError::Unsupported("tiling a point loop".to_string()));
                }
                sched_out.div *= size;
                sched_in.modulo = Some(size);
            }
        }
        *self.band_mut(id)? = outer;
        Ok(self.insert_below(id, NodeKind::Band(inner)))
    }

    // ------------------------------------------------------------------
    // Printing
    // ------------------------------------------------------------------

    /// Renders the tree, one node per line, indented by depth.
    #[must_use]
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let mut stack = vec![(self.root, 0usize)];
        while let Some((id, depth)) = stack.pop() {
            let _ = write!(out, "{:width$}", "", width = depth * 2);
            let _ = self.write_node(&mut out, id);
            out.push('\n');
            for &c in self.children(id).iter().rev() {
                stack.push((c, depth + 1));
            }
        }
        out
    }

    fn stmt_list(&self, stmts: &[StmtIdx]) -> String {
        stmts
            .iter()
            .map(|&s| self.stmts[s].name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn write_node(&self, out: &mut String, id: NodeId) -> fmt::Result {
        match self.kind(id) {
            NodeKind::Domain => write!(out, "domain: {}", self.stmt_list(&self.domain)),
            NodeKind::Context { params } => write!(out, "context: [{}]", params.join(", ")),
            NodeKind::Filter { stmts } => write!(out, "filter: {}", self.stmt_list(stmts)),
            NodeKind::Extension { stmts } => write!(out, "extension: {}", self.stmt_list(stmts)),
            NodeKind::Mark { name } => write!(out, "mark: \"{name}\""),
            NodeKind::Sequence => write!(out, "sequence"),
            NodeKind::Set => write!(out, "set"),
            NodeKind::Leaf => write!(out, "leaf"),
            NodeKind::Band(band) => {
                write!(out, "band")?;
                if band.permutable {
                    write!(out, "(permutable)")?;
                }
                write!(out, ":")?;
                let mut stmts: Vec<StmtIdx> = band.dims.iter().flat_map(|d| d.keys().copied()).collect();
                stmts.sort_unstable();
                stmts.dedup();
                for s in stmts {
                    let info = &self.stmts[s];
                    write!(out, " {}[", info.name)?;
                    let mut first = true;
                    for dim in &band.dims {
                        if let Some(sched) = dim.get(&s) {
                            if !first {
                                write!(out, ", ")?;
                            }
                            sched.write(&mut *out, info.domain.names())?;
                            first = false;
                        }
                    }
                    write!(out, "]")?;
                }
                Ok(())
            }
        }
    }

    /// Number of nodes ever allocated, including detached ones.
    #[must_use]
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }
}

impl fmt::Display for ScheduleTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dump())
    }
}
