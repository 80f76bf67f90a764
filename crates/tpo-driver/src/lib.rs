//! Optimization driver.
//!
//! This crate turns a kernel description into a tiled, mapped schedule. It
//! builds the polyhedral view of the rewritten graph and runs the passes of
//! the target pipeline through a [`PassManager`].
//!
//! # Pipeline
//!
//! ```text
//! kernel JSON
//!      │
//!      ▼
//! ┌──────────┐     ┌───────────┐     ┌──────────┐     ┌──────────┐
//! │  Graph   │ ──▶ │ Transform │ ──▶ │   Dim    │ ──▶ │   Scop   │
//! │  loader  │     │   elim    │     │ folding  │     │          │
//! └──────────┘     └───────────┘     └──────────┘     └──────────┘
//!                                                           │
//!                      ┌────────────────────────────────────┤
//!                      ▼ (aicore)                           ▼ (cuda)
//!                 ┌──────────┐  ┌──────────┐         ┌──────────┐  ┌──────────┐
//!                 │  Tiling  │─▶│  Copies  │         │ GPU map  │─▶│  Shared  │
//!                 └──────────┘  └──────────┘         └──────────┘  └──────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod pass;
pub mod pipeline;
pub mod scop;

pub use pass::{
    PassContext, PassManager, PassOutcome, PassTiming, PipelineReport, RetryStrategy, SchedulePass, TightenTiles,
};
pub use pipeline::pipeline_for;
pub use scop::Scop;

use thiserror::Error;
use tpo_footprint::FootprintError;
use tpo_graph::desc::{KernelDesc, Process};
use tpo_graph::{Graph, GraphError};
use tpo_poly::PolyError;
use tpo_session::{SessionError, SessionRef};
use tpo_tiling::TilingError;
use tracing::{info, instrument};

/// Errors that can occur while optimizing a kernel.
#[derive(Debug, Error)]
pub enum OptimizeError {
    /// The kernel description or graph is malformed.
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    /// The session could not be configured or flushed.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// A schedule-tree edit failed.
    #[error("schedule tree error: {0}")]
    Poly(#[from] PolyError),

    /// Footprint computation or copy placement failed.
    #[error("copy placement failed: {0}")]
    Footprint(#[from] FootprintError),

    /// Tile selection failed.
    #[error("tiling failed: {0}")]
    Tiling(#[from] TilingError),

    /// A tensor has a symbolic extent.
    #[error("tensor `{0}` has a dynamic shape")]
    DynamicShape(String),

    /// A pass ran before the schedule tree was built.
    #[error("pass `{0}` needs the schedule tree")]
    MissingScop(&'static str),

    /// Tile tightening did not bring memory use under the limit.
    #[error("memory still over budget after {attempts} attempts")]
    RetriesExhausted {
        /// Attempts made, the first included.
        attempts: usize,
        /// The last failure.
        #[source]
        source: TilingError,
    },
}

/// Result type for optimization.
pub type OptimizeResult<T> = Result<T, OptimizeError>;

/// Result of a full optimization.
#[derive(Debug)]
pub struct Optimized {
    /// Pipeline that ran.
    pub process: Process,
    /// Final pass context.
    pub context: PassContext,
    /// Timings and retries.
    pub report: PipelineReport,
}

impl Optimized {
    /// Outer tiles of every band, concatenated.
    #[must_use]
    pub fn tiles(&self) -> Vec<i64> {
        self.context.plan.as_ref().map(tpo_tiling::TilingPlan::l1_tiles).unwrap_or_default()
    }

    /// The final schedule tree, rendered.
    #[must_use]
    pub fn tree_dump(&self) -> Option<String> {
        self.context.scop.as_ref().map(|s| s.tree.dump())
    }
}

/// Optimizes kernels within one session.
pub struct Optimizer {
    session: SessionRef,
}

impl Optimizer {
    /// Creates an optimizer over `session`.
    #[must_use]
    pub fn new(session: SessionRef) -> Self {
        Self { session }
    }

    /// The session.
    #[must_use]
    pub fn session(&self) -> &SessionRef {
        &self.session
    }

    /// Loads a kernel description and runs the pipeline it asks for.
    ///
    /// # Errors
    ///
    /// Fails on malformed descriptions and on any pass failure.
    #[instrument(skip_all)]
    pub fn optimize_json(&self, json: &str) -> OptimizeResult<Optimized> {
        let desc = KernelDesc::parse(json)?;
        let process = desc.process();
        let graph = desc.to_graph()?;
        self.optimize_graph(graph, process)
    }

    /// Runs the pipeline of `process` over `graph`.
    ///
    /// A pass asking for a restart makes the optimizer resume with the
    /// passes after it.
    ///
    /// # Errors
    ///
    /// Returns the first pass failure.
    #[instrument(skip_all, fields(process = process.name(), stmts = graph.num_stmts()))]
    pub fn optimize_graph(&self, graph: Graph, process: Process) -> OptimizeResult<Optimized> {
        if process == Process::Cuda {
            self.session.config_mut().is_gpu = true;
        }
        let manager = pipeline_for(process);
        let mut context = PassContext::new(graph);
        let mut report = manager.run(&mut context, &self.session)?;
        let mut timings = std::mem::take(&mut report.timings);
        let mut retries = report.retries;
        while let Some(at) = report.restart_at {
            report = manager.run_from(at + 1, &mut context, &self.session)?;
            timings.append(&mut report.timings);
            retries += report.retries;
        }
        report.timings = timings;
        report.retries = retries;
        info!(process = process.name(), passes = report.timings.len(), retries = report.retries, "optimization done");
        Ok(Optimized {
            process,
            context,
            report,
        })
    }
}
