//! The axis tree.
//!
//! Axes live in an arena addressed by [`AxisId`]. The root axis stands for
//! the whole kernel; each outermost band hangs below it as a chain, outer
//! loop first. Parents and children are indices, so strategies can walk and
//! mutate the tree without shared ownership.

use crate::{align_elems, MIN_TILE};
use indexmap::IndexMap;
use std::fmt;
use tpo_index::{define_index, IndexVec};

define_index! {
    /// Index of an axis in an [`AxisTree`].
    pub struct AxisId;
}

// ============================================================================
// Constraints
// ============================================================================

/// The tiling level a constraint applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TileLevel {
    /// Outer tiles, sized for `L1` and the unified buffer.
    L1,
    /// Inner tiles, sized for the matrix-unit buffers.
    L0,
}

impl TileLevel {
    /// Name used in directives.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::L1 => "C1",
            Self::L0 => "C0",
        }
    }

    /// Parses a directive level name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "C1" | "L1" => Some(Self::L1),
            "C0" | "L0" => Some(Self::L0),
            _ => None,
        }
    }
}

/// Bounds on the tile of one axis at one level.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Constraint {
    /// Tiles are multiples of this value when it does not exceed the
    /// extent, and divisors of it otherwise.
    pub tile_mod: i64,
    /// Smallest tile.
    pub tile_min: i64,
    /// Largest tile.
    pub tile_extent: i64,
    /// When non-empty, the only tiles the search tries.
    pub cand_factors: Vec<i64>,
}

impl Constraint {
    /// The unconstrained range `[1, extent]`.
    #[must_use]
    pub fn full(extent: i64) -> Self {
        Self {
            tile_mod: 1,
            tile_min: MIN_TILE,
            tile_extent: extent.max(MIN_TILE),
            cand_factors: Vec::new(),
        }
    }

    /// Returns true if only one tile is admissible.
    #[must_use]
    pub fn is_single_value(&self) -> bool {
        self.tile_min == self.tile_extent
    }

    /// Returns true if `tile` respects the modulus.
    #[must_use]
    pub fn admits_mod(&self, tile: i64) -> bool {
        if tile <= 0 {
            return false;
        }
        if self.tile_mod <= self.tile_extent {
            tile % self.tile_mod == 0
        } else {
            self.tile_mod % tile == 0
        }
    }

    /// Tiles the search tries, ascending: the candidate factors if any,
    /// else `min`, `extent` and every divisor of `extent` in between that
    /// respects the modulus. With `forbid_iso`, a value leaving a partial
    /// last tile is dropped unless it is the extent itself.
    #[must_use]
    pub fn scan_values(&self, forbid_iso: bool) -> Vec<i64> {
        let (lo, hi) = (self.tile_min, self.tile_extent);
        let mut out: Vec<i64> = if self.cand_factors.is_empty() {
            let mut v = vec![lo, hi];
            v.extend(divisors(hi).into_iter().filter(|&t| t > lo && t < hi && self.admits_mod(t)));
            v
        } else {
            self.cand_factors.iter().copied().filter(|&t| t >= lo && t <= hi).collect()
        };
        if forbid_iso {
            out.retain(|&t| t == hi || hi % t == 0);
        }
        out.sort_unstable();
        out.dedup();
        if out.is_empty() {
            out.push(lo);
        }
        out
    }
}

/// Ascending divisors of `n`.
#[must_use]
pub fn divisors(n: i64) -> Vec<i64> {
    if n <= 0 {
        return Vec::new();
    }
    let mut small = Vec::new();
    let mut large = Vec::new();
    let mut d = 1;
    while d * d <= n {
        if n % d == 0 {
            small.push(d);
            if d * d != n {
                large.push(n / d);
            }
        }
        d += 1;
    }
    large.reverse();
    small.extend(large);
    small
}

/// Bounds on the block or thread size an axis maps to on a GPU.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MappingConstraint {
    /// Sizes are multiples of this value.
    pub map_mod: i64,
    /// Smallest size.
    pub map_min: i64,
    /// Largest size; `0` while undetermined.
    pub map_extent: i64,
    /// Elements each thread processes.
    pub item_process: i64,
}

impl Default for MappingConstraint {
    fn default() -> Self {
        Self {
            map_mod: MIN_TILE,
            map_min: MIN_TILE,
            map_extent: 0,
            item_process: MIN_TILE,
        }
    }
}

// ============================================================================
// Attributes
// ============================================================================

/// A `(key, value)` mark on an axis.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AttrInfo {
    /// Attribute key, e.g. `REDUCE_AXIS`.
    pub key: String,
    /// Attribute value; may be empty.
    pub value: String,
}

impl AttrInfo {
    /// Creates an attribute.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for AttrInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.value.is_empty() {
            f.write_str(&self.key)
        } else {
            write!(f, "{}:{}", self.key, self.value)
        }
    }
}

// ============================================================================
// Axes
// ============================================================================

/// One loop dimension of a band, with everything tiling knows about it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TileAxis {
    /// Enclosing axis; `None` for the root.
    pub parent: Option<AxisId>,
    /// Band index.
    pub band: usize,
    /// Position within the band.
    pub dim: usize,
    /// The axis may be distributed over cores.
    pub mc_sup: bool,
    /// Bytes per element of each tensor the axis indexes.
    pub data_size: IndexMap<String, i64>,
    /// Smallest loop value.
    pub range_min: i64,
    /// Number of loop values.
    pub range_extent: i64,
    /// Outer-level constraint.
    pub l1: Constraint,
    /// Inner-level constraint.
    pub l0: Constraint,
    /// GPU block mapping constraint.
    pub block: MappingConstraint,
    /// GPU thread mapping constraint.
    pub thread: MappingConstraint,
    /// Tiles must divide the extent.
    pub forbid_iso: bool,
    /// Child axes.
    pub children: Vec<AxisId>,
    /// Per-statement `(offset, end)` ranges of the loop.
    pub tree_ranges: Vec<(i64, i64)>,
    /// Larger values are tiled first; `-1` means unset.
    pub priority: i32,
    /// Role name set by convolution, matmul or custom directives.
    pub axis_type: String,
    /// Marks.
    pub attrs: Vec<AttrInfo>,
}

impl TileAxis {
    fn new(parent: Option<AxisId>, band: usize, dim: usize, range_min: i64, range_extent: i64) -> Self {
        Self {
            parent,
            band,
            dim,
            mc_sup: false,
            data_size: IndexMap::new(),
            range_min,
            range_extent,
            l1: Constraint::full(range_extent),
            l0: Constraint::full(range_extent),
            block: MappingConstraint::default(),
            thread: MappingConstraint::default(),
            forbid_iso: false,
            children: Vec::new(),
            tree_ranges: Vec::new(),
            priority: -1,
            axis_type: String::new(),
            attrs: Vec::new(),
        }
    }

    /// The constraint at `level`.
    #[must_use]
    pub fn constraint(&self, level: TileLevel) -> &Constraint {
        match level {
            TileLevel::L1 => &self.l1,
            TileLevel::L0 => &self.l0,
        }
    }

    /// The constraint at `level`, mutably.
    pub fn constraint_mut(&mut self, level: TileLevel) -> &mut Constraint {
        match level {
            TileLevel::L1 => &mut self.l1,
            TileLevel::L0 => &mut self.l0,
        }
    }

    /// Tiles at `level` become multiples (or divisors) of `m` as well.
    pub fn restrain_mod(&mut self, level: TileLevel, m: i64) {
        if m <= 0 {
            return;
        }
        let c = self.constraint_mut(level);
        c.tile_mod = lcm(c.tile_mod.max(1), m);
    }

    /// Caps the tile at `level`.
    pub fn restrain_upper(&mut self, level: TileLevel, value: i64) {
        let c = self.constraint_mut(level);
        c.tile_extent = c.tile_extent.min(value);
    }

    /// Raises the smallest tile at `level`.
    pub fn restrain_lower(&mut self, level: TileLevel, value: i64) {
        let c = self.constraint_mut(level);
        c.tile_min = c.tile_min.max(value);
    }

    /// Fixes the tile at `level`.
    pub fn restrain_to_single_value(&mut self, level: TileLevel, value: i64) {
        let c = self.constraint_mut(level);
        c.tile_min = value;
        c.tile_extent = value;
        c.cand_factors.clear();
    }

    /// Fixes the tile at `level` to the whole loop.
    pub fn restrain_entire(&mut self, level: TileLevel) {
        let extent = self.range_extent;
        self.restrain_to_single_value(level, extent);
    }

    /// Adds a candidate tile at `level`.
    pub fn insert_cand_factor(&mut self, level: TileLevel, factor: i64) {
        let c = self.constraint_mut(level);
        if !c.cand_factors.contains(&factor) {
            c.cand_factors.push(factor);
        }
    }

    /// Brings both constraints back to `1 ≤ min ≤ extent`.
    pub fn settle(&mut self) {
        for c in [&mut self.l1, &mut self.l0] {
            c.tile_mod = c.tile_mod.max(1);
            c.tile_extent = c.tile_extent.max(MIN_TILE);
            c.tile_min = c.tile_min.clamp(MIN_TILE, c.tile_extent);
        }
    }

    /// Returns true if `tile` is an acceptable tile at `level`. Axes marked
    /// `VECTORIZED` also accept divisors of the modulus.
    #[must_use]
    pub fn tile_is_valid(&self, level: TileLevel, tile: i64) -> bool {
        let c = self.constraint(level);
        if tile < c.tile_min || tile > c.tile_extent {
            return false;
        }
        tile == c.tile_min
            || tile == c.tile_extent
            || c.admits_mod(tile)
            || (self.has_attr("VECTORIZED") && c.tile_mod % tile == 0)
    }

    /// Adds an attribute unless already present.
    pub fn mark_with_attr(&mut self, attr: AttrInfo) {
        if !self.attrs.contains(&attr) {
            self.attrs.push(attr);
        }
    }

    /// Returns true if an attribute has exactly this key.
    #[must_use]
    pub fn has_attr(&self, key: &str) -> bool {
        self.attrs.iter().any(|a| a.key == key)
    }

    /// Returns true if an attribute key contains `key`.
    #[must_use]
    pub fn has_attr_partial(&self, key: &str) -> bool {
        self.attrs.iter().any(|a| a.key.contains(key))
    }

    /// Returns true if the exact attribute is present.
    #[must_use]
    pub fn has_attr_value(&self, key: &str, value: &str) -> bool {
        self.attrs.iter().any(|a| a.key == key && a.value == value)
    }

    /// Removes every attribute with this key.
    pub fn remove_attr(&mut self, key: &str) {
        self.attrs.retain(|a| a.key != key);
    }

    /// Smallest element size among the indexed tensors, if any is known.
    #[must_use]
    pub fn min_elem_bytes(&self) -> Option<i64> {
        self.data_size.values().copied().min()
    }

    /// Elements per alignment unit for the smallest indexed element type.
    #[must_use]
    pub fn max_align_elems(&self) -> i64 {
        align_elems(self.min_elem_bytes().unwrap_or(0))
    }
}

/// Greatest common divisor of `|a|` and `|b|`.
#[must_use]
pub fn gcd(a: i64, b: i64) -> i64 {
    let (mut a, mut b) = (a.abs(), b.abs());
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

fn lcm(a: i64, b: i64) -> i64 {
    if a == 0 || b == 0 {
        return 0;
    }
    a / gcd(a, b) * b
}

// ============================================================================
// Axis tree
// ============================================================================

/// The arena of axes for one kernel.
#[derive(Clone, Debug)]
pub struct AxisTree {
    axes: IndexVec<AxisId, TileAxis>,
    root: AxisId,
}

impl Default for AxisTree {
    fn default() -> Self {
        Self::new()
    }
}

impl AxisTree {
    /// A tree holding only the root axis.
    #[must_use]
    pub fn new() -> Self {
        let mut axes = IndexVec::new();
        let root = axes.push(TileAxis::new(None, 0, 0, 0, 1));
        Self { axes, root }
    }

    /// The root axis.
    #[must_use]
    pub fn root(&self) -> AxisId {
        self.root
    }

    /// Adds an axis below `parent`.
    pub fn add_axis(&mut self, parent: AxisId, band: usize, dim: usize, range_min: i64, range_extent: i64) -> AxisId {
        let id = self
            .axes
            .push(TileAxis::new(Some(parent), band, dim, range_min, range_extent));
        self.axes[parent].children.push(id);
        id
    }

    /// The axis `id`.
    #[must_use]
    pub fn axis(&self, id: AxisId) -> &TileAxis {
        &self.axes[id]
    }

    /// The axis `id`, mutably.
    pub fn axis_mut(&mut self, id: AxisId) -> &mut TileAxis {
        &mut self.axes[id]
    }

    /// Number of axes, root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.axes.len()
    }

    /// Returns true if only the root exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.axes.len() <= 1
    }

    /// Every axis but the root, parents before children, bands in order.
    #[must_use]
    pub fn top_down(&self) -> Vec<AxisId> {
        let mut out = Vec::new();
        let mut stack: Vec<AxisId> = self.axes[self.root].children.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.axes[id].children.iter().rev().copied());
        }
        out
    }

    /// Every axis but the root, children before parents.
    #[must_use]
    pub fn bottom_up(&self) -> Vec<AxisId> {
        let mut out = self.top_down();
        out.reverse();
        out
    }

    /// Applies `f` to every axis but the root, top-down.
    pub fn for_each_top_down(&mut self, mut f: impl FnMut(&mut TileAxis)) {
        for id in self.top_down() {
            f(&mut self.axes[id]);
        }
    }

    /// Axes of band `band`, outermost first.
    #[must_use]
    pub fn band_axes(&self, band: usize) -> Vec<AxisId> {
        self.top_down()
            .into_iter()
            .filter(|&id| self.axes[id].band == band)
            .collect()
    }

    /// Number of bands.
    #[must_use]
    pub fn num_bands(&self) -> usize {
        self.top_down()
            .into_iter()
            .map(|id| self.axes[id].band + 1)
            .max()
            .unwrap_or(0)
    }

    /// Axes with an attribute of exactly this key.
    #[must_use]
    pub fn axes_of_attr(&self, key: &str) -> Vec<AxisId> {
        self.top_down()
            .into_iter()
            .filter(|&id| self.axes[id].has_attr(key))
            .collect()
    }

    /// Axes with an attribute whose key contains `key`.
    #[must_use]
    pub fn axes_containing_attr(&self, key: &str) -> Vec<AxisId> {
        self.top_down()
            .into_iter()
            .filter(|&id| self.axes[id].has_attr_partial(key))
            .collect()
    }

    /// Axes carrying the exact attribute.
    #[must_use]
    pub fn axes_with_attr_value(&self, key: &str, value: &str) -> Vec<AxisId> {
        self.top_down()
            .into_iter()
            .filter(|&id| self.axes[id].has_attr_value(key, value))
            .collect()
    }

    /// Matching attributes per axis, by exact or partial key.
    #[must_use]
    pub fn interested_info(&self, key: &str, whole_word: bool) -> Vec<(AxisId, Vec<AttrInfo>)> {
        let axes = if whole_word {
            self.axes_of_attr(key)
        } else {
            self.axes_containing_attr(key)
        };
        axes.into_iter()
            .map(|id| {
                let attrs = self.axes[id]
                    .attrs
                    .iter()
                    .filter(|a| if whole_word { a.key == key } else { a.key.contains(key) })
                    .cloned()
                    .collect();
                (id, attrs)
            })
            .collect()
    }

    /// One line per axis for the stage log.
    #[must_use]
    pub fn dump(&self) -> Vec<String> {
        self.top_down()
            .into_iter()
            .map(|id| {
                let a = &self.axes[id];
                let attrs: Vec<String> = a.attrs.iter().map(ToString::to_string).collect();
                format!(
                    "| axis {}_{}: range [{}, +{}), C1 [{}, {}] mod {}, C0 [{}, {}] mod {}, mc {}, iso {}, priority {}, attrs [{}]",
                    a.band,
                    a.dim,
                    a.range_min,
                    a.range_extent,
                    a.l1.tile_min,
                    a.l1.tile_extent,
                    a.l1.tile_mod,
                    a.l0.tile_min,
                    a.l0.tile_extent,
                    a.l0.tile_mod,
                    a.mc_sup,
                    !a.forbid_iso,
                    a.priority,
                    attrs.join(", "),
                )
            })
            .collect()
    }
}
