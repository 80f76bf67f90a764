//! Polyhedral building blocks for the optimizer.
//!
//! The optimizer needs a small, predictable slice of polyhedral machinery:
//!
//! - [`Aff`] and [`IndexExpr`]: affine and quasi-affine index functions,
//! - [`BoxSet`]: rectangular iteration domains,
//! - [`AccessMap`]: statement-to-tensor references,
//! - [`ScheduleTree`]: domain, filter, band, sequence, set, mark, extension
//!   and context nodes with the edits the passes perform.
//!
//! Everything is concrete and integer-valued. Symbolic extents are out of
//! scope; callers substitute constants before building a tree.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod access;
pub mod aff;
pub mod set;
pub mod tree;

pub use access::{AccessKind, AccessMap};
pub use aff::{Aff, IndexExpr, Span, VarRange};
pub use set::{BoxConstraints, BoxSet};
pub use tree::{Band, BandDim, Node, NodeKind, ScheduleDim, ScheduleTree, StmtInfo, StmtKind};

use thiserror::Error;
use tpo_index::define_index;

define_index! {
    /// Index of a statement in a schedule tree's statement table.
    pub struct StmtIdx;

    /// Index of a schedule-tree node.
    pub struct NodeId;
}

/// Errors raised by schedule-tree edits and remapping.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PolyError {
    /// A node of the wrong kind was passed to an edit.
    #[error("node {node} is a {found}, expected a {expected}")]
    NodeKind {
        /// Offending node.
        node: NodeId,
        /// Kind the edit needs.
        expected: &'static str,
        /// Kind found.
        found: &'static str,
    },

    /// A child position past the end.
    #[error("node {node} has {len} children, no child {pos}")]
    ChildOutOfRange {
        /// Parent node.
        node: NodeId,
        /// Requested position.
        pos: usize,
        /// Number of children.
        len: usize,
    },

    /// The tree is not deep enough.
    #[error("node {node} has no ancestor at generation {generation}")]
    NoAncestor {
        /// Starting node.
        node: NodeId,
        /// Requested generation.
        generation: usize,
    },

    /// Two spaces disagree in size.
    #[error("{what}: expected {expected}, found {found}")]
    DimMismatch {
        /// What was being matched.
        what: &'static str,
        /// Expected size.
        expected: usize,
        /// Actual size.
        found: usize,
    },

    /// A tile size that is not positive.
    #[error("invalid tile size {size} for band {node}")]
    InvalidTile {
        /// Band node.
        node: NodeId,
        /// Offending size.
        size: i64,
    },

    /// A sequence needs at least one filter.
    #[error("cannot insert an empty sequence at node {0}")]
    EmptySequence(NodeId),

    /// A remapping with no inverse was asked to map forward.
    #[error("{0} has no forward map")]
    NotInvertible(String),

    /// An edit the tree cannot express.
    #[error("unsupported schedule edit: {0}")]
    Unsupported(String),
}

/// Result type for polyhedral operations.
pub type PolyResult<T> = Result<T, PolyError>;
