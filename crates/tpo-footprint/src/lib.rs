//! # Footprint analysis and copy placement
//!
//! For every tensor touched below a schedule-tree node this crate computes
//! the part of the tensor a single tile accesses, and promotes that part
//! into a smaller memory scope by grafting copy statements into the tree.
//!
//! ## Overview
//!
//! | Module | Role |
//! |--------|------|
//! | [`footprint`] | Scoped references and per-dimension footprint boxes |
//! | [`cluster`] | Grouping interleaved reads and writes of one tensor |
//! | [`remap`] | Canonical layout changes for matrix and convolution operands |
//! | [`place`] | Buffer definitions and copy-in / copy-out placement |
//! | [`shared`] | GPU shared-memory and register promotion |
//!
//! A footprint box that cannot be bounded is not an error: the tensor is
//! simply left in its current scope.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cluster;
pub mod footprint;
pub mod place;
pub mod remap;
pub mod shared;

pub use cluster::FootprintCluster;
pub use footprint::{FootprintBox, ScopedRef};
pub use place::{BufferDef, BufferTable, CopyPlacer, HoistOptions, Hoisted, OutOfBound, REALIZE_L1};
pub use remap::Remapper;
pub use shared::{SharedMemoryManager, SharedPromotion};

use rustc_hash::FxHashMap;
use thiserror::Error;
use tpo_poly::PolyError;

/// Errors raised while computing footprints or placing copies.
#[derive(Debug, Error)]
pub enum FootprintError {
    /// A cluster was requested for a tensor with no references.
    #[error("no references to `{tensor}` in the cluster")]
    EmptyCluster {
        /// Tensor name.
        tensor: String,
    },

    /// An access space and a footprint disagree in rank.
    #[error("unexpected dimensionality mismatch in {relation}: expected {expected}, found {found}")]
    DimMismatch {
        /// The relation being processed.
        relation: String,
        /// Expected rank.
        expected: usize,
        /// Actual rank.
        found: usize,
    },

    /// A schedule-tree edit failed.
    #[error(transparent)]
    Poly(#[from] PolyError),
}

/// Result type for footprint operations.
pub type FootprintResult<T> = Result<T, FootprintError>;

/// Declared shape and element size of a tensor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorInfo {
    /// Constant extents.
    pub shape: Vec<i64>,
    /// Bytes per element.
    pub elem_bytes: u64,
}

impl TensorInfo {
    /// Creates a tensor description.
    #[must_use]
    pub fn new(shape: Vec<i64>, elem_bytes: u64) -> Self {
        Self { shape, elem_bytes }
    }
}

/// Tensor descriptions by name.
pub type TensorTable = FxHashMap<String, TensorInfo>;
