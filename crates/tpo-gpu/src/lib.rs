//! # GPU Mapping
//!
//! Distributes the outermost band of a kernel over a CUDA-style grid.
//!
//! ## Overview
//!
//! The kernel is first classified into a [`Template`] from the attributes
//! the tiling analysis put on its axes. The template bounds the thread and
//! block grids; an explicit `bind_thread` / `bind_block` configuration
//! replaces those bounds. The GPU strategies then fix the tiles of
//! thread-mapped axes and cap those of block-mapped ones, and the regular
//! tile search fills in the rest under the shared-memory budget.
//!
//! ```text
//! axes ──► Template ──► thread grid (inner first) ──► block grid ──► tiles
//!                                                                     │
//!                                  block_marker / thread_marker ◄─────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod mapping;
pub mod strategy;
pub mod template;

pub use mapping::{GpuMapper, GpuMapping, BLOCK_MARKER, THREAD_MARKER};
pub use strategy::{gpu_strategies, GpuMappingStrategy, GpuReduceStrategy, BLOCK_ONLY};
pub use template::{determine_template, is_elemwise_axis, Template};
