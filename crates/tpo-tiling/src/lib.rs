//! Tile-size selection.
//!
//! Every outermost band of a schedule tree becomes a chain of [`TileAxis`]
//! nodes in an [`AxisTree`]. The analyzer marks axes with attributes
//! derived from the statements (reduction, transposition, broadcast, casts,
//! modular indexing) and from custom directives. Strategies then turn the
//! attributes into constraints on the outer (`L1`) and inner (`L0`) tile of
//! each axis. Finally the [`TileSpace`] enumerates admissible tile vectors
//! under the per-scope memory budgets reported by the [`MemoryEstimator`],
//! and the [`TilingSolver`] picks one, adjusts it for multicore and tiles
//! the bands.
//!
//! # Pipeline
//!
//! ```text
//! ScheduleTree ──► TilingAnalyzer ──► strategies ──► TileSpace ──► TilingPlan
//!                     (axes)          (constraints)    (search)     (band_tile)
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod analyze;
pub mod axis;
pub mod memory;
pub mod multicore;
pub mod solve;
pub mod space;
pub mod strategy;

pub use analyze::{BandAxes, TileOpType, TilingAnalyzer};
pub use axis::{AttrInfo, AxisId, AxisTree, Constraint, MappingConstraint, TileAxis, TileLevel};
pub use memory::{BufferEntry, MemoryEstimator, MemoryUsage};
pub use multicore::MulticoreStrategy;
pub use solve::{BandTiles, TilingPlan, TilingSolver};
pub use space::{SpaceCandidate, TileSpace};
pub use strategy::{ai_core_strategies, StrategyContext, TilingStrategy};

use thiserror::Error;
use tpo_poly::PolyError;
use tpo_target::MemScope;

/// Smallest tile.
pub const MIN_TILE: i64 = 1;

/// Alignment unit of on-chip buffers, in bytes.
pub const ALIGN_BYTES: i64 = 32;

/// Block size of the matrix unit.
pub const MMU_UNIT: i64 = 16;

/// Bytes processed by one vector instruction.
pub const VECTORIZE_BYTES: i64 = 256;

/// Smallest useful amount of data, in bytes, written back per core.
pub const MIN_MULTICORE_BYTES: i64 = 256;

/// Elements per alignment unit for an element of `elem_bytes` bytes.
#[must_use]
pub fn align_elems(elem_bytes: i64) -> i64 {
    if elem_bytes <= 0 {
        return ALIGN_BYTES;
    }
    (ALIGN_BYTES + elem_bytes - 1) / elem_bytes
}

/// Errors raised while choosing tiles.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TilingError {
    /// The chosen tiles need more memory than a scope holds.
    #[error("Allocation exceed bound of memory tag {scope}: need {need_bits} bits, total alloc {alloc_bits} bits.")]
    MemoryAllocation {
        /// Over-subscribed scope.
        scope: MemScope,
        /// Bits required at the worst statement.
        need_bits: u64,
        /// Capacity of the scope in bits.
        alloc_bits: u64,
    },

    /// A custom tiling directive could not be understood.
    #[error("invalid custom tiling directive `{directive}`: {reason}")]
    InvalidDirective {
        /// The directive as written.
        directive: String,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// A convolution axis needs an attribute that is not configured.
    #[error("convolution attribute `{0}` is not set")]
    MissingConvAttr(&'static str),

    /// A block or thread configuration could not be recorded.
    #[error("invalid GPU mapping: {0}")]
    Mapping(String),

    /// A schedule-tree edit failed.
    #[error(transparent)]
    Poly(#[from] PolyError),
}

/// Result type for tiling operations.
pub type TilingResult<T> = Result<T, TilingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_elems() {
        assert_eq!(align_elems(4), 8);
        assert_eq!(align_elems(2), 16);
        assert_eq!(align_elems(3), 11);
        assert_eq!(align_elems(0), ALIGN_BYTES);
    }

    #[test]
    fn test_allocation_message() {
        let err = TilingError::MemoryAllocation {
            scope: MemScope::Unified,
            need_bits: 4096,
            alloc_bits: 2048,
        };
        assert_eq!(
            err.to_string(),
            "Allocation exceed bound of memory tag local.UB: need 4096 bits, total alloc 2048 bits."
        );
    }
}
