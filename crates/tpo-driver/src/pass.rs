//! Schedule passes and the pass manager.
//!
//! A pipeline is an ordered list of [`SchedulePass`]es sharing one
//! [`PassContext`]. The [`PassManager`] runs them to completion one after
//! the other, timing each, and stops early when a pass asks for a restart.
//!
//! When a pass runs out of on-chip memory and a [`RetryStrategy`] is
//! registered, the manager asks the strategy for a tighter configuration,
//! restores the context captured before the first pass and runs the whole
//! pipeline again.

use crate::scop::Scop;
use crate::{OptimizeError, OptimizeResult};
use std::fmt;
use std::time::{Duration, Instant};
use tpo_footprint::{BufferTable, SharedPromotion};
use tpo_graph::elim::ElimResult;
use tpo_graph::fold::FoldReport;
use tpo_graph::Graph;
use tpo_gpu::{gpu_strategies, GpuMapping};
use tpo_session::{DumpLevel, LogStage, Session, UserConfig};
use tpo_tiling::{TileLevel, TilingError, TilingPlan, TilingSolver};
use tracing::{debug, info, instrument, warn};

/// Default bound on pipeline reruns after a memory failure.
pub const DEFAULT_MAX_RETRIES: usize = 8;

// ============================================================================
// Pass context
// ============================================================================

/// Everything the passes of one pipeline read and produce.
#[derive(Clone, Debug, Default)]
pub struct PassContext {
    /// The kernel graph.
    pub graph: Graph,
    /// Transform elimination outcome.
    pub elim: Option<ElimResult>,
    /// Dimension folding outcome.
    pub fold: Option<FoldReport>,
    /// The polyhedral view, once built.
    pub scop: Option<Scop>,
    /// Chosen tiles.
    pub plan: Option<TilingPlan>,
    /// GPU launch configuration.
    pub gpu: Option<GpuMapping>,
    /// On-chip buffers created by copy placement.
    pub buffers: BufferTable,
    /// Tensors promoted to GPU shared or local memory.
    pub promotions: Vec<SharedPromotion>,
}

impl PassContext {
    /// A context over `graph`.
    #[must_use]
    pub fn new(graph: Graph) -> Self {
        Self {
            graph,
            ..Self::default()
        }
    }

    /// The scop, which `pass` needs.
    ///
    /// # Errors
    ///
    /// Fails when no earlier pass built it.
    pub fn scop(&self, pass: &'static str) -> OptimizeResult<&Scop> {
        self.scop.as_ref().ok_or(OptimizeError::MissingScop(pass))
    }

    /// Mutable access to the scop, which `pass` needs.
    ///
    /// # Errors
    ///
    /// Fails when no earlier pass built it.
    pub fn scop_mut(&mut self, pass: &'static str) -> OptimizeResult<&mut Scop> {
        self.scop.as_mut().ok_or(OptimizeError::MissingScop(pass))
    }
}

// ============================================================================
// Passes
// ============================================================================

/// What the manager does after a pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassOutcome {
    /// Run the next pass.
    Continue,
    /// Stop here; the caller re-runs the remaining passes.
    Restart,
}

/// One step of a pipeline.
pub trait SchedulePass {
    /// Name used in timing lines.
    fn name(&self) -> &'static str;

    /// Runs the pass.
    ///
    /// # Errors
    ///
    /// Any failure aborts the pipeline, except memory-allocation failures
    /// when a retry strategy is registered.
    fn run(&self, ctx: &mut PassContext, session: &Session) -> OptimizeResult<PassOutcome>;
}

/// Wall-clock time of one pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PassTiming {
    /// The pass.
    pub pass: &'static str,
    /// Time spent.
    pub elapsed: Duration,
    /// Whether the kernel was a specialised matrix multiplication.
    pub spec_gemm: bool,
}

impl fmt::Display for PassTiming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[ Polyhedral exec time{} ], {} spent {:.3} ms",
            if self.spec_gemm { "_specgemm" } else { "" },
            self.pass,
            self.elapsed.as_secs_f64() * 1000.0
        )
    }
}

/// What happened during [`PassManager::run`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineReport {
    /// Timing of every pass of the final attempt, in run order.
    pub timings: Vec<PassTiming>,
    /// Index of the pass that asked for a restart.
    pub restart_at: Option<usize>,
    /// Number of reruns after memory failures.
    pub retries: usize,
}

impl PipelineReport {
    /// Returns true if a pass asked for a restart.
    #[must_use]
    pub fn needs_restart(&self) -> bool {
        self.restart_at.is_some()
    }
}

// ============================================================================
// Retry strategies
// ============================================================================

/// Produces a tighter configuration after a memory-allocation failure.
pub trait RetryStrategy {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// The configuration for the next attempt, or `None` to give up.
    ///
    /// `ctx` is the context as it was before the failing pass ran and the
    /// session holds the configuration of the failed attempt.
    ///
    /// # Errors
    ///
    /// Propagates analysis failures.
    fn tighten(&self, ctx: &PassContext, session: &Session, error: &TilingError) -> OptimizeResult<Option<UserConfig>>;
}

/// Halves the largest smallest-admissible outer tile with a `MAX`
/// directive.
pub struct TightenTiles;

impl RetryStrategy for TightenTiles {
    fn name(&self) -> &'static str {
        "tighten_tiles"
    }

    fn tighten(&self, ctx: &PassContext, session: &Session, error: &TilingError) -> OptimizeResult<Option<UserConfig>> {
        let Some(scop) = ctx.scop.as_ref() else {
            return Ok(None);
        };
        let mut config = session.config().clone();
        let solver = if config.is_gpu {
            TilingSolver::with_strategies(session, gpu_strategies())
        } else {
            TilingSolver::new(session)
        };
        let analyzer = solver.analyze(&scop.tree, &scop.tensors)?;

        let mut largest: Option<(usize, usize, i64)> = None;
        for id in analyzer.axes.top_down() {
            let a = analyzer.axes.axis(id);
            let min = a.constraint(TileLevel::L1).tile_min;
            if largest.map_or(true, |(_, _, m)| min > m) {
                largest = Some((a.band, a.dim, min));
            }
        }
        let Some((band, dim, min)) = largest.filter(|&(_, _, m)| m > 1) else {
            return Ok(None);
        };
        let directive = format!("MAX:{band}.{dim}:{}", min / 2);
        session.log(
            LogStage::MicroTuning,
            DumpLevel::General,
            format!("{error} Retrying with {directive}"),
        );
        config.custom_tiling.push(directive);
        Ok(Some(config))
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Runs a pipeline of passes.
pub struct PassManager {
    passes: Vec<Box<dyn SchedulePass>>,
    retry: Option<Box<dyn RetryStrategy>>,
    max_retries: usize,
}

impl Default for PassManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PassManager {
    /// An empty manager without retry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            passes: Vec::new(),
            retry: None,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Appends a pass.
    pub fn register(&mut self, pass: Box<dyn SchedulePass>) {
        self.passes.push(pass);
    }

    /// Appends a pass, builder style.
    #[must_use]
    pub fn with_pass(mut self, pass: impl SchedulePass + 'static) -> Self {
        self.register(Box::new(pass));
        self
    }

    /// Registers the strategy used after memory failures.
    #[must_use]
    pub fn with_retry(mut self, retry: impl RetryStrategy + 'static) -> Self {
        self.retry = Some(Box::new(retry));
        self
    }

    /// Bounds the number of reruns.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Registered pass names, in order.
    #[must_use]
    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Runs every pass from the first.
    ///
    /// # Errors
    ///
    /// Returns the first pass failure, or the memory failure once the retry
    /// strategy gives up or the retry bound is reached.
    pub fn run(&self, ctx: &mut PassContext, session: &Session) -> OptimizeResult<PipelineReport> {
        self.run_from(0, ctx, session)
    }

    /// Runs the passes from index `start`, typically the one after a
    /// restart.
    ///
    /// # Errors
    ///
    /// As [`PassManager::run`].
    #[instrument(skip_all, fields(passes = self.passes.len(), start))]
    pub fn run_from(&self, start: usize, ctx: &mut PassContext, session: &Session) -> OptimizeResult<PipelineReport> {
        let snapshot = self.retry.as_ref().map(|_| ctx.clone());
        let mut config = session.config().clone();
        let mut retries = 0;
        loop {
            match self.attempt(start, ctx, session) {
                Ok(mut report) => {
                    report.retries = retries;
                    return Ok(report);
                }
                Err(Failure { error, before }) => {
                    let (Some(retry), Some(snapshot), Some(before)) = (&self.retry, &snapshot, before) else {
                        return Err(error);
                    };
                    let OptimizeError::Tiling(tiling @ TilingError::MemoryAllocation { .. }) = &error else {
                        return Err(error);
                    };
                    if retries >= self.max_retries {
                        warn!(retries, "retry bound reached");
                        return Err(OptimizeError::RetriesExhausted {
                            attempts: retries + 1,
                            source: tiling.clone(),
                        });
                    }
                    session.replace_config(config.clone());
                    let Some(next) = retry.tighten(&before, session, tiling)? else {
                        info!(strategy = retry.name(), "retry strategy gave up");
                        return Err(error);
                    };
                    retries += 1;
                    info!(strategy = retry.name(), retries, %tiling, "rerunning pipeline");
                    config = next;
                    session.replace_config(config.clone());
                    *ctx = snapshot.clone();
                }
            }
        }
    }

    fn attempt(&self, start: usize, ctx: &mut PassContext, session: &Session) -> Result<PipelineReport, Failure> {
        let mut report = PipelineReport::default();
        for (i, pass) in self.passes.iter().enumerate().skip(start) {
            let before = self.retry.as_ref().map(|_| ctx.clone());
            let timer = Instant::now();
            let outcome = pass.run(ctx, session).map_err(|error| Failure { error, before })?;
            let timing = PassTiming {
                pass: pass.name(),
                elapsed: timer.elapsed(),
                spec_gemm: session.config().spec_gemm,
            };
            info!("{timing}");
            if let Some(scop) = &ctx.scop {
                debug!(pass = pass.name(), tree = %scop.tree.dump(), "schedule after pass");
            }
            report.timings.push(timing);
            if outcome == PassOutcome::Restart {
                info!(pass = pass.name(), "restart requested");
                report.restart_at = Some(i);
                break;
            }
        }
        Ok(report)
    }
}

struct Failure {
    error: OptimizeError,
    before: Option<PassContext>,
}
