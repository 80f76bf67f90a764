//! # Tensor statement graph
//!
//! This crate holds the pre-polyhedral view of a fused kernel: a directed
//! acyclic graph of primitive tensor statements, together with the two
//! whole-graph rewrites that run before any schedule is built.
//!
//! ## Overview
//!
//! | Type | Role |
//! |------|------|
//! | [`Tensor`] | Named n-dimensional array with a dtype and a [`Shape`] |
//! | [`Stmt`] | `output = op(inputs...)` with an ordered attribute map |
//! | [`Graph`] | Tensors, statements, kernel inputs and kernel outputs |
//!
//! Statements are classified by op name into four disjoint classes
//! ([`OpClass`]): elementwise (the default), reduce, transform and opaque.
//!
//! ## Rewrites
//!
//! ```text
//!  kernel description
//!         │
//!         ▼
//!  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
//!  │  normalize   │ ─▶ │    elim      │ ─▶ │    fold      │
//!  │ axis attrs   │    │  transforms  │    │  dimensions  │
//!  └──────────────┘    └──────────────┘    └──────────────┘
//! ```
//!
//! - [`normalize`]: negative reduce axes become non-negative.
//! - [`elim`]: shape-only statements are removed where every consumer can
//!   absorb the shape change; reshapes are synthesized where it cannot.
//! - [`fold`]: adjacent dimensions that every producer and consumer treats
//!   as one slab are folded into a single dimension.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod desc;
pub mod elim;
pub mod fold;
pub mod normalize;

use indexmap::IndexMap;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use thiserror::Error;
use tpo_index::{define_index, IndexVec};

define_index! {
    /// Index of a tensor in a [`Graph`].
    pub struct TensorId;

    /// Index of a statement in a [`Graph`].
    pub struct StmtId;
}

/// Attribute marking a statement that no rewrite may remove.
pub const PINNED_ATTR: &str = "pinned";

/// Errors raised while building or validating a graph.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Two tensors were declared with the same name.
    #[error("duplicate tensor `{0}`")]
    DuplicateTensor(String),

    /// A tensor name was referenced but never declared.
    #[error("unknown tensor `{0}`")]
    UnknownTensor(String),

    /// A tensor has more than one defining statement.
    #[error("tensor `{0}` is defined more than once")]
    MultipleDefinitions(String),

    /// A kernel input was used as a statement output.
    #[error("kernel input `{0}` cannot be written")]
    InputWritten(String),

    /// A non-input tensor is read but never written.
    #[error("tensor `{0}` is read but has no defining statement")]
    Undefined(String),

    /// The statement graph contains a cycle.
    #[error("statement graph has a cycle through `{0}`")]
    Cycle(String),

    /// A statement is missing a mandatory attribute.
    #[error("op `{op}` is missing mandatory attribute `{attr}`")]
    MissingAttr {
        /// The op name.
        op: String,
        /// The attribute key.
        attr: String,
    },

    /// A statement has the wrong number of operands.
    #[error("op `{op}` expects {expected} operands, found {found}")]
    Arity {
        /// The op name.
        op: String,
        /// Expected operand count.
        expected: usize,
        /// Actual operand count.
        found: usize,
    },

    /// An unrecognized element type name.
    #[error("unknown data type `{0}`")]
    UnknownDType(String),

    /// The kernel description could not be parsed.
    #[error("invalid kernel description")]
    Json(#[from] serde_json::Error),
}

/// Result alias for graph operations.
pub type GraphResult<T> = Result<T, GraphError>;

// ============================================================================
// Element types and shapes
// ============================================================================

/// Element data type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// Boolean (1 byte).
    Bool,
    /// 8-bit signed integer.
    Int8,
    /// 16-bit signed integer.
    Int16,
    /// 32-bit signed integer.
    Int32,
    /// 64-bit signed integer.
    Int64,
    /// 8-bit unsigned integer.
    UInt8,
    /// 16-bit unsigned integer.
    UInt16,
    /// 32-bit unsigned integer.
    UInt32,
    /// 64-bit unsigned integer.
    UInt64,
    /// Half precision float.
    Float16,
    /// Brain float.
    BFloat16,
    /// Single precision float.
    Float32,
    /// Double precision float.
    Float64,
}

impl DType {
    /// Size of one element in bytes.
    #[must_use]
    pub const fn size_bytes(self) -> usize {
        match self {
            Self::Bool | Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 | Self::Float16 | Self::BFloat16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Int64 | Self::UInt64 | Self::Float64 => 8,
        }
    }

    /// The canonical lower-case name used in kernel descriptions.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int8 => "int8",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::UInt8 => "uint8",
            Self::UInt16 => "uint16",
            Self::UInt32 => "uint32",
            Self::UInt64 => "uint64",
            Self::Float16 => "float16",
            Self::BFloat16 => "bfloat16",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
        }
    }

    /// Parses a dtype name.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::UnknownDType`] for unrecognized names.
    pub fn parse(name: &str) -> GraphResult<Self> {
        Ok(match name {
            "bool" => Self::Bool,
            "int8" => Self::Int8,
            "int16" => Self::Int16,
            "int32" => Self::Int32,
            "int64" => Self::Int64,
            "uint8" => Self::UInt8,
            "uint16" => Self::UInt16,
            "uint32" => Self::UInt32,
            "uint64" => Self::UInt64,
            "float16" => Self::Float16,
            "bfloat16" => Self::BFloat16,
            "float32" => Self::Float32,
            "float64" => Self::Float64,
            other => return Err(GraphError::UnknownDType(other.to_string())),
        })
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single tensor extent.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dim {
    /// A constant extent.
    Static(i64),
    /// A symbolic extent.
    Symbolic(String),
}

impl Dim {
    /// Returns the constant value if known.
    #[must_use]
    pub const fn static_value(&self) -> Option<i64> {
        match self {
            Self::Static(n) => Some(*n),
            Self::Symbolic(_) => None,
        }
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(n) => write!(f, "{n}"),
            Self::Symbolic(s) => f.write_str(s),
        }
    }
}

/// Tensor shape.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape(SmallVec<[Dim; 4]>);

impl Shape {
    /// Creates a shape from dimensions.
    #[must_use]
    pub fn new(dims: impl IntoIterator<Item = Dim>) -> Self {
        Self(dims.into_iter().collect())
    }

    /// Creates a shape from constant extents.
    #[must_use]
    pub fn from_static(dims: impl IntoIterator<Item = i64>) -> Self {
        Self(dims.into_iter().map(Dim::Static).collect())
    }

    /// Number of dimensions.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// The dimensions.
    #[must_use]
    pub fn dims(&self) -> &[Dim] {
        &self.0
    }

    /// All extents, if every one is constant.
    #[must_use]
    pub fn static_dims(&self) -> Option<Vec<i64>> {
        self.0.iter().map(Dim::static_value).collect()
    }

    /// Number of elements, if statically known.
    #[must_use]
    pub fn num_elements(&self) -> Option<i64> {
        self.0
            .iter()
            .try_fold(1i64, |acc, d| d.static_value().map(|n| acc * n))
    }

    /// Returns true for the singleton shape `[1]`.
    #[must_use]
    pub fn is_one(&self) -> bool {
        self.0.len() == 1 && self.0[0] == Dim::Static(1)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{d}")?;
        }
        f.write_str("]")
    }
}

// ============================================================================
// Ops and attributes
// ============================================================================

/// Classification of a primitive op by its name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpClass {
    /// Pointwise op; the default class.
    Elementwise,
    /// Reduction over a set of axes.
    Reduce,
    /// Shape-only op.
    Transform,
    /// Any op whose shape behaviour the optimizer does not model.
    Opaque,
}

impl OpClass {
    /// Classifies an op name.
    #[must_use]
    pub fn of(op: &str) -> Self {
        match op {
            "ReduceSum" | "ReduceMax" | "ReduceMin" => Self::Reduce,
            "Reshape" | "ExpandDims" | "Squeeze" | "Flatten" => Self::Transform,
            "Matmul" | "BatchMatMul" | "Conv" | "Transpose" | "Tile" | "Assign"
            | "InplaceAssign" | "EquivFormat" | "TransData" | "AddMinValue" | "BroadcastTo" => {
                Self::Opaque
            }
            _ => Self::Elementwise,
        }
    }

    /// Short name for logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Elementwise => "elemwise",
            Self::Reduce => "reduce",
            Self::Transform => "transform",
            Self::Opaque => "opaque",
        }
    }
}

/// A statement attribute value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    /// Boolean flag.
    Bool(bool),
    /// Integer scalar.
    Int(i64),
    /// Float scalar.
    Float(f64),
    /// String value.
    Str(String),
    /// Integer list.
    Ints(Vec<i64>),
    /// String list.
    Strs(Vec<String>),
}

impl AttrValue {
    /// Integer list view; a scalar becomes a one-element list.
    #[must_use]
    pub fn as_ints(&self) -> Option<Vec<i64>> {
        match self {
            Self::Int(v) => Some(vec![*v]),
            Self::Ints(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Ints(v) => write!(f, "{v:?}"),
            Self::Strs(v) => write!(f, "{v:?}"),
        }
    }
}

/// Ordered statement attributes.
pub type Attrs = IndexMap<String, AttrValue>;

// ============================================================================
// Tensors and statements
// ============================================================================

/// A named tensor.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    /// Unique name.
    pub name: String,
    /// Element type.
    pub dtype: DType,
    /// Current shape.
    pub shape: Shape,
}

/// One primitive statement: `output = op(inputs...)`.
#[derive(Clone, Debug, PartialEq)]
pub struct Stmt {
    /// Op name.
    pub op: String,
    /// Operands, in call order. The same tensor may appear more than once.
    pub inputs: SmallVec<[TensorId; 4]>,
    /// The written tensor.
    pub output: TensorId,
    /// Attributes such as `axis` or `shape`.
    pub attrs: Attrs,
}

impl Stmt {
    /// The op class.
    #[must_use]
    pub fn class(&self) -> OpClass {
        OpClass::of(&self.op)
    }

    /// Returns true if no rewrite may remove this statement.
    #[must_use]
    pub fn is_pinned(&self) -> bool {
        matches!(self.attrs.get(PINNED_ATTR), Some(AttrValue::Bool(true)))
    }

    /// Integer-list attribute.
    #[must_use]
    pub fn attr_ints(&self, key: &str) -> Option<Vec<i64>> {
        self.attrs.get(key).and_then(AttrValue::as_ints)
    }

    /// Operands with duplicates removed, first occurrence order.
    #[must_use]
    pub fn unique_inputs(&self) -> SmallVec<[TensorId; 4]> {
        let mut out: SmallVec<[TensorId; 4]> = SmallVec::new();
        for &t in &self.inputs {
            if !out.contains(&t) {
                out.push(t);
            }
        }
        out
    }
}

// ============================================================================
// Graph
// ============================================================================

/// A kernel: tensors, statements and the kernel boundary.
#[derive(Clone, Debug, Default)]
pub struct Graph {
    tensors: IndexVec<TensorId, Tensor>,
    stmts: IndexVec<StmtId, Option<Stmt>>,
    names: FxHashMap<String, TensorId>,
    defs: FxHashMap<TensorId, StmtId>,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
}

impl Graph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a tensor.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::DuplicateTensor`] if the name is taken.
    pub fn add_tensor(
        &mut self,
        name: impl Into<String>,
        dtype: DType,
        shape: Shape,
    ) -> GraphResult<TensorId> {
        let name = name.into();
        if self.names.contains_key(&name) {
            return Err(GraphError::DuplicateTensor(name));
        }
        let id = self.tensors.push(Tensor {
            name: name.clone(),
            dtype,
            shape,
        });
        self.names.insert(name, id);
        Ok(id)
    }

    /// Declares a tensor with a fresh name derived from `base`.
    pub fn fresh_tensor(&mut self, base: &str, dtype: DType, shape: Shape) -> TensorId {
        let mut n = self.tensors.len();
        loop {
            let name = format!("{base}_{n}");
            if !self.names.contains_key(&name) {
                let id = self.tensors.push(Tensor {
                    name: name.clone(),
                    dtype,
                    shape,
                });
                self.names.insert(name, id);
                return id;
            }
            n += 1;
        }
    }

    /// Looks a tensor up by name.
    #[must_use]
    pub fn tensor_by_name(&self, name: &str) -> Option<TensorId> {
        self.names.get(name).copied()
    }

    /// The tensor at `id`.
    #[must_use]
    pub fn tensor(&self, id: TensorId) -> &Tensor {
        &self.tensors[id]
    }

    /// Mutable access to the tensor at `id`.
    pub fn tensor_mut(&mut self, id: TensorId) -> &mut Tensor {
        &mut self.tensors[id]
    }

    /// Name of the tensor at `id`.
    #[must_use]
    pub fn name(&self, id: TensorId) -> &str {
        &self.tensors[id].name
    }

    /// Shape of the tensor at `id`.
    #[must_use]
    pub fn shape(&self, id: TensorId) -> &Shape {
        &self.tensors[id].shape
    }

    /// All tensors.
    pub fn tensors(&self) -> impl Iterator<Item = (TensorId, &Tensor)> + '_ {
        self.tensors.iter_enumerated()
    }

    /// Number of declared tensors.
    #[must_use]
    pub fn num_tensors(&self) -> usize {
        self.tensors.len()
    }

    /// Marks a tensor as a kernel input.
    pub fn mark_input(&mut self, id: TensorId) {
        if !self.inputs.contains(&id) {
            self.inputs.push(id);
        }
    }

    /// Marks a tensor as a kernel output.
    pub fn mark_output(&mut self, id: TensorId) {
        if !self.outputs.contains(&id) {
            self.outputs.push(id);
        }
    }

    /// Kernel inputs in declaration order.
    #[must_use]
    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    /// Kernel outputs in declaration order.
    #[must_use]
    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    /// Returns true if `id` is a kernel input.
    #[must_use]
    pub fn is_input(&self, id: TensorId) -> bool {
        self.inputs.contains(&id)
    }

    /// Returns true if `id` is a kernel output.
    #[must_use]
    pub fn is_output(&self, id: TensorId) -> bool {
        self.outputs.contains(&id)
    }

    /// Appends a statement.
    ///
    /// # Errors
    ///
    /// Fails if `output` already has a definition or is a kernel input.
    pub fn add_stmt(
        &mut self,
        op: impl Into<String>,
        inputs: impl IntoIterator<Item = TensorId>,
        output: TensorId,
        attrs: Attrs,
    ) -> GraphResult<StmtId> {
        if self.defs.contains_key(&output) {
            return Err(GraphError::MultipleDefinitions(self.name(output).to_string()));
        }
        if self.is_input(output) {
            return Err(GraphError::InputWritten(self.name(output).to_string()));
        }
        let id = self.stmts.push(Some(Stmt {
            op: op.into(),
            inputs: inputs.into_iter().collect(),
            output,
            attrs,
        }));
        self.defs.insert(output, id);
        Ok(id)
    }

    /// Replaces a kernel output by another tensor, keeping its position.
    pub fn replace_output(&mut self, old: TensorId, new: TensorId) {
        if self.outputs.contains(&new) {
            self.outputs.retain(|t| *t != old);
        } else {
            for t in &mut self.outputs {
                if *t == old {
                    *t = new;
                }
            }
        }
    }

    /// The live statement at `id`.
    #[must_use]
    pub fn stmt(&self, id: StmtId) -> Option<&Stmt> {
        self.stmts.get(id).and_then(Option::as_ref)
    }

    /// Mutable access to the live statement at `id`.
    pub fn stmt_mut(&mut self, id: StmtId) -> Option<&mut Stmt> {
        self.stmts.get_mut(id).and_then(Option::as_mut)
    }

    /// Live statements in insertion order.
    pub fn stmts(&self) -> impl Iterator<Item = (StmtId, &Stmt)> + '_ {
        self.stmts
            .iter_enumerated()
            .filter_map(|(id, s)| s.as_ref().map(|s| (id, s)))
    }

    /// Number of live statements.
    #[must_use]
    pub fn num_stmts(&self) -> usize {
        self.stmts.iter().filter(|s| s.is_some()).count()
    }

    /// The statement defining `tensor`.
    #[must_use]
    pub fn producer(&self, tensor: TensorId) -> Option<StmtId> {
        self.defs.get(&tensor).copied()
    }

    /// Statements reading `tensor`, in insertion order.
    #[must_use]
    pub fn consumers(&self, tensor: TensorId) -> Vec<StmtId> {
        self.stmts()
            .filter(|(_, s)| s.inputs.contains(&tensor))
            .map(|(id, _)| id)
            .collect()
    }

    /// Removes a statement, returning it.
    pub fn remove_stmt(&mut self, id: StmtId) -> Option<Stmt> {
        let stmt = self.stmts.get_mut(id)?.take()?;
        self.defs.remove(&stmt.output);
        Some(stmt)
    }

    /// Redirects a statement's output to another tensor.
    ///
    /// # Errors
    ///
    /// Fails if `new` already has a definition.
    pub fn retarget_output(&mut self, id: StmtId, new: TensorId) -> GraphResult<()> {
        if self.defs.contains_key(&new) {
            return Err(GraphError::MultipleDefinitions(self.name(new).to_string()));
        }
        if let Some(stmt) = self.stmts.get_mut(id).and_then(Option::as_mut) {
            self.defs.remove(&stmt.output);
            stmt.output = new;
            self.defs.insert(new, id);
        }
        Ok(())
    }

    /// Replaces every occurrence of `old` among the operands of `id`.
    pub fn replace_operand(&mut self, id: StmtId, old: TensorId, new: TensorId) {
        if let Some(stmt) = self.stmt_mut(id) {
            for t in &mut stmt.inputs {
                if *t == old {
                    *t = new;
                }
            }
        }
    }

    /// Live statements in dependency order.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Cycle`] if the statements are cyclic.
    pub fn topo_order(&self) -> GraphResult<Vec<StmtId>> {
        let mut dag: DiGraph<StmtId, ()> = DiGraph::new();
        let mut nodes: FxHashMap<StmtId, NodeIndex> = FxHashMap::default();
        for (id, _) in self.stmts() {
            nodes.insert(id, dag.add_node(id));
        }
        for (id, stmt) in self.stmts() {
            for input in stmt.unique_inputs() {
                if let Some(def) = self.producer(input) {
                    dag.add_edge(nodes[&def], nodes[&id], ());
                }
            }
        }
        // Ties resolve by insertion order so the result is reproducible.
        match toposort(&dag, None) {
            Ok(order) => {
                let mut ranked: Vec<(usize, StmtId)> = Vec::with_capacity(order.len());
                let mut depth: FxHashMap<StmtId, usize> = FxHashMap::default();
                for node in order {
                    let id = dag[node];
                    let level = self.stmt(id).map_or(0, |s| {
                        s.inputs
                            .iter()
                            .filter_map(|t| self.producer(*t))
                            .map(|p| depth.get(&p).copied().unwrap_or(0) + 1)
                            .max()
                            .unwrap_or(0)
                    });
                    depth.insert(id, level);
                    ranked.push((level, id));
                }
                ranked.sort_unstable();
                Ok(ranked.into_iter().map(|(_, id)| id).collect())
            }
            Err(cycle) => {
                let stmt = dag[cycle.node_id()];
                let name = self
                    .stmt(stmt)
                    .map_or_else(String::new, |s| self.name(s.output).to_string());
                Err(GraphError::Cycle(name))
            }
        }
    }

    /// Checks the structural invariants: single definition, every read
    /// tensor defined or a kernel input, acyclic.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn validate(&self) -> GraphResult<()> {
        for (_, stmt) in self.stmts() {
            for &input in &stmt.inputs {
                if self.producer(input).is_none() && !self.is_input(input) {
                    return Err(GraphError::Undefined(self.name(input).to_string()));
                }
            }
            if self.is_input(stmt.output) {
                return Err(GraphError::InputWritten(self.name(stmt.output).to_string()));
            }
        }
        self.topo_order().map(|_| ())
    }

    /// Formats one statement as `out = Op(a, b)`.
    #[must_use]
    pub fn stmt_to_string(&self, id: StmtId) -> String {
        let Some(stmt) = self.stmt(id) else {
            return String::from("<removed>");
        };
        let args: Vec<&str> = stmt.inputs.iter().map(|t| self.name(*t)).collect();
        format!("{} = {}({})", self.name(stmt.output), stmt.op, args.join(", "))
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (id, stmt) in self.stmts() {
            write!(f, "{}", self.stmt_to_string(id))?;
            if !stmt.attrs.is_empty() {
                let attrs: Vec<String> = stmt
                    .attrs
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect();
                write!(f, " {{{}}}", attrs.join(", "))?;
            }
            writeln!(f, " : {}", self.shape(stmt.output))?;
        }
        Ok(())
    }
}
