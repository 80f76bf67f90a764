//! Integration tests for scop construction, the pass manager and the
//! pipelines.

use camino::Utf8PathBuf;
use std::sync::Arc;
use tpo_driver::pipeline::{BuildScopPass, TilePass};
use tpo_driver::{
    OptimizeError, Optimizer, PassContext, PassManager, PassOutcome, PassTiming, SchedulePass, Scop, TightenTiles,
};
use tpo_graph::desc::Process;
use tpo_graph::{AttrValue, Attrs, DType, Dim, Graph, Shape, TensorId};
use tpo_index::Idx;
use tpo_poly::{IndexExpr, StmtIdx};
use tpo_session::{create_session, DumpLevel, LogStage, Session, UserConfig};
use tpo_target::{MemScope, TargetInfo};
use tpo_tiling::TilingError;

// ============================================================================
// Helpers
// ============================================================================

fn tensor(g: &mut Graph, name: &str, dims: &[i64]) -> TensorId {
    g.add_tensor(name, DType::Float32, Shape::from_static(dims.iter().copied()))
        .expect("fresh tensor")
}

fn attrs(entries: &[(&str, AttrValue)]) -> Attrs {
    entries
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

/// `b = Exp(a)` over `dims`.
fn unary(dims: &[i64]) -> Graph {
    let mut g = Graph::new();
    let a = tensor(&mut g, "a", dims);
    let b = tensor(&mut g, "b", dims);
    g.mark_input(a);
    g.mark_output(b);
    g.add_stmt("Exp", [a], b, Attrs::new()).unwrap();
    g
}

fn kernel_json(process: &str, dims: &[i64]) -> String {
    let shape = format!("{dims:?}");
    format!(
        r#"{{
        "op": "Fused_Exp",
        "process": "{process}",
        "input_desc": [[{{"tensor_name": "a", "data_type": "float32", "shape": {shape}}}]],
        "op_desc": [
            {{"name": "Exp", "attr": null,
             "input_desc": [[{{"tensor_name": "a", "data_type": "float32", "shape": {shape}}}]],
             "output_desc": [{{"tensor_name": "b", "data_type": "float32", "shape": {shape}}}]}}
        ],
        "output_desc": [{{"tensor_name": "b", "data_type": "float32", "shape": {shape}}}]
    }}"#
    )
}

/// A pass that only reports its outcome.
struct Probe {
    name: &'static str,
    outcome: PassOutcome,
}

impl SchedulePass for Probe {
    fn name(&self) -> &'static str {
        self.name
    }

    fn run(&self, _ctx: &mut PassContext, _session: &Session) -> tpo_driver::OptimizeResult<PassOutcome> {
        Ok(self.outcome)
    }
}

fn probe(name: &'static str) -> Probe {
    Probe {
        name,
        outcome: PassOutcome::Continue,
    }
}

fn names(timings: &[PassTiming]) -> Vec<&'static str> {
    timings.iter().map(|t| t.pass).collect()
}

// ============================================================================
// Scop construction
// ============================================================================

#[test]
fn test_scop_broadcast_read() {
    let mut g = Graph::new();
    let a = tensor(&mut g, "a", &[4, 8]);
    let b = tensor(&mut g, "b", &[1, 8]);
    let c = tensor(&mut g, "c", &[4, 8]);
    g.mark_input(a);
    g.mark_input(b);
    g.mark_output(c);
    g.add_stmt("Add", [a, b], c, Attrs::new()).unwrap();

    let scop = Scop::from_graph(&g).unwrap();
    let stmt = scop.tree.stmt(StmtIdx::new(0));
    assert_eq!(stmt.name, "S_0");
    assert_eq!(stmt.domain.extents(), vec![4, 8]);
    let read_b = stmt.reads().find(|r| r.tensor == "b").unwrap();
    assert_eq!(read_b.index, vec![IndexExpr::constant(2, 0), IndexExpr::var(2, 1)]);
    assert_eq!(scop.tree.bands().len(), 1);
    assert_eq!(scop.tensors["c"].shape, vec![4, 8]);
    assert_eq!(scop.tensors["c"].elem_bytes, 4);
}

#[test]
fn test_scop_reduce_iterates_input() {
    let mut g = Graph::new();
    let a = tensor(&mut g, "a", &[4, 8]);
    let c = tensor(&mut g, "c", &[4]);
    g.mark_input(a);
    g.mark_output(c);
    g.add_stmt("ReduceSum", [a], c, attrs(&[("axis", AttrValue::Ints(vec![1]))]))
        .unwrap();

    let scop = Scop::from_graph(&g).unwrap();
    let stmt = scop.tree.stmt(StmtIdx::new(0));
    assert_eq!(stmt.domain.extents(), vec![4, 8]);
    let write = stmt.writes().next().unwrap();
    assert_eq!(write.index, vec![IndexExpr::var(2, 0)]);
}

#[test]
fn test_scop_matmul_adds_contraction() {
    let mut g = Graph::new();
    let a = tensor(&mut g, "a", &[16, 32]);
    let b = tensor(&mut g, "b", &[32, 8]);
    let c = tensor(&mut g, "c", &[16, 8]);
    g.mark_input(a);
    g.mark_input(b);
    g.mark_output(c);
    g.add_stmt("Matmul", [a, b], c, Attrs::new()).unwrap();

    let scop = Scop::from_graph(&g).unwrap();
    let stmt = scop.tree.stmt(StmtIdx::new(0));
    assert_eq!(stmt.domain.extents(), vec![16, 8, 32]);
    assert_eq!(stmt.domain.names(), ["mi", "ni", "ki"]);
    let read_b = stmt.reads().find(|r| r.tensor == "b").unwrap();
    assert_eq!(read_b.index, vec![IndexExpr::var(3, 2), IndexExpr::var(3, 1)]);
}

#[test]
fn test_scop_transpose_permutes_read() {
    let mut g = Graph::new();
    let a = tensor(&mut g, "a", &[4, 8]);
    let c = tensor(&mut g, "c", &[8, 4]);
    g.mark_input(a);
    g.mark_output(c);
    g.add_stmt("Transpose", [a], c, attrs(&[("perm", AttrValue::Ints(vec![1, 0]))]))
        .unwrap();

    let scop = Scop::from_graph(&g).unwrap();
    let stmt = scop.tree.stmt(StmtIdx::new(0));
    let read = stmt.reads().next().unwrap();
    assert_eq!(read.index, vec![IndexExpr::var(2, 1), IndexExpr::var(2, 0)]);
}

#[test]
fn test_scop_sequence_follows_dependencies() {
    let mut g = Graph::new();
    let a = tensor(&mut g, "a", &[16]);
    let b = tensor(&mut g, "b", &[16]);
    let c = tensor(&mut g, "c", &[16]);
    g.mark_input(a);
    g.mark_output(c);
    g.add_stmt("Abs", [b], c, Attrs::new()).unwrap();
    g.add_stmt("Exp", [a], b, Attrs::new()).unwrap();

    let scop = Scop::from_graph(&g).unwrap();
    assert_eq!(scop.tree.num_stmts(), 2);
    assert_eq!(scop.tree.bands().len(), 2);
    let order: Vec<String> = scop
        .tree
        .stmt_order()
        .into_iter()
        .map(|s| scop.tree.stmt(s).writes().next().unwrap().tensor.clone())
        .collect();
    assert_eq!(order, ["b", "c"]);
}

#[test]
fn test_scop_rejects_dynamic_shapes() {
    let mut g = Graph::new();
    let a = g
        .add_tensor("a", DType::Float32, Shape::new([Dim::Symbolic("n".into())]))
        .unwrap();
    let b = tensor(&mut g, "b", &[16]);
    g.mark_input(a);
    g.mark_output(b);
    g.add_stmt("Exp", [a], b, Attrs::new()).unwrap();
    let err = Scop::from_graph(&g).unwrap_err();
    assert!(matches!(err, OptimizeError::DynamicShape(ref t) if t == "a"));
}

// ============================================================================
// Pass manager
// ============================================================================

#[test]
fn test_passes_run_in_order_and_are_timed() {
    let manager = PassManager::new().with_pass(probe("first")).with_pass(probe("second"));
    assert_eq!(manager.pass_names(), ["first", "second"]);
    let session = Session::with_defaults();
    let mut ctx = PassContext::new(unary(&[8]));
    let report = manager.run(&mut ctx, &session).unwrap();
    assert_eq!(names(&report.timings), ["first", "second"]);
    assert!(!report.needs_restart());
    let line = report.timings[0].to_string();
    assert!(line.starts_with("[ Polyhedral exec time ], first spent "), "{line}");
    assert!(line.ends_with(" ms"));
}

#[test]
fn test_timing_line_flags_spec_gemm() {
    let manager = PassManager::new().with_pass(probe("gemm"));
    let session = Session::new(
        UserConfig {
            spec_gemm: true,
            ..UserConfig::default()
        },
        TargetInfo::default(),
    );
    let report = manager.run(&mut PassContext::default(), &session).unwrap();
    assert!(report.timings[0].spec_gemm);
    assert!(report.timings[0].to_string().starts_with("[ Polyhedral exec time_specgemm ], gemm"));
}

#[test]
fn test_restart_stops_pipeline() {
    let manager = PassManager::new()
        .with_pass(probe("before"))
        .with_pass(Probe {
            name: "restart",
            outcome: PassOutcome::Restart,
        })
        .with_pass(probe("after"));
    let session = Session::with_defaults();
    let mut ctx = PassContext::default();

    let report = manager.run(&mut ctx, &session).unwrap();
    assert_eq!(names(&report.timings), ["before", "restart"]);
    assert_eq!(report.restart_at, Some(1));

    let rest = manager.run_from(2, &mut ctx, &session).unwrap();
    assert_eq!(names(&rest.timings), ["after"]);
    assert!(!rest.needs_restart());
}

#[test]
fn test_pass_without_scop_fails() {
    let manager = PassManager::new().with_pass(TilePass);
    let session = Session::with_defaults();
    let err = manager.run(&mut PassContext::new(unary(&[8])), &session).unwrap_err();
    assert!(matches!(err, OptimizeError::MissingScop("tile")));
}

// ============================================================================
// Memory retries
// ============================================================================

fn oversized_session() -> Session {
    Session::new(
        UserConfig {
            custom_tiling: vec!["FACTOR:0:1024".to_string(), "FACTOR:1:1024".to_string()],
            dump_level: DumpLevel::General,
            ..UserConfig::default()
        },
        TargetInfo::default(),
    )
}

#[test]
fn test_memory_failure_without_retry_is_returned() {
    let manager = PassManager::new().with_pass(BuildScopPass).with_pass(TilePass);
    let session = oversized_session();
    let err = manager
        .run(&mut PassContext::new(unary(&[1024, 1024])), &session)
        .unwrap_err();
    assert!(matches!(
        err,
        OptimizeError::Tiling(TilingError::MemoryAllocation {
            scope: MemScope::Unified,
            ..
        })
    ));
}

#[test]
fn test_tighten_tiles_converges() {
    let manager = PassManager::new()
        .with_pass(BuildScopPass)
        .with_pass(TilePass)
        .with_retry(TightenTiles);
    let session = oversized_session();
    let mut ctx = PassContext::new(unary(&[1024, 1024]));
    let report = manager.run(&mut ctx, &session).unwrap();

    assert_eq!(report.retries, 5);
    assert_eq!(names(&report.timings), ["build_scop", "tile"]);
    assert_eq!(ctx.plan.unwrap().bands[0].l1, vec![128, 256]);
    assert_eq!(session.config().custom_tiling.len(), 7);

    let logger = session.logger();
    let log = logger.lines(LogStage::MicroTuning);
    assert_eq!(log.len(), 5);
    assert!(log[0].starts_with("Allocation exceed bound of memory tag local.UB"));
    assert!(log[0].ends_with("Retrying with MAX:0.0:512"));
}

#[test]
fn test_retry_bound_is_enforced() {
    let manager = PassManager::new()
        .with_pass(BuildScopPass)
        .with_pass(TilePass)
        .with_retry(TightenTiles)
        .with_max_retries(2);
    let session = oversized_session();
    let err = manager
        .run(&mut PassContext::new(unary(&[1024, 1024])), &session)
        .unwrap_err();
    assert!(matches!(err, OptimizeError::RetriesExhausted { attempts: 3, .. }));
}

// ============================================================================
// Pipelines
// ============================================================================

#[test]
fn test_aicore_pipeline_end_to_end() {
    let optimizer = Optimizer::new(create_session(UserConfig::default(), TargetInfo::default()));
    let out = optimizer.optimize_json(&kernel_json("aicore", &[64, 128])).unwrap();

    assert_eq!(out.process, Process::AiCore);
    assert_eq!(
        names(&out.report.timings),
        ["normalize_axis", "eliminate_transforms", "fold_dimensions", "build_scop", "tile", "place_copies"]
    );
    assert_eq!(out.tiles().iter().product::<i64>(), 64 * 128);
    assert!(out
        .context
        .buffers
        .iter()
        .any(|b| b.tensor == "a" && b.scope == MemScope::Unified));
    assert!(out.tree_dump().is_some());
    assert!(!optimizer.session().config().is_gpu);
}

#[test]
fn test_cuda_pipeline_end_to_end() {
    let session = create_session(UserConfig::default(), TargetInfo::default());
    let optimizer = Optimizer::new(Arc::clone(&session));
    let out = optimizer.optimize_json(&kernel_json("cuda", &[1024, 512])).unwrap();

    assert_eq!(out.process, Process::Cuda);
    assert_eq!(
        names(&out.report.timings),
        ["normalize_axis", "eliminate_transforms", "fold_dimensions", "build_scop", "gpu_map", "shared_promotion"]
    );
    let mapping = out.context.gpu.as_ref().unwrap();
    let gpu = &session.target().gpu;
    assert!(mapping.thread_cfg.product() <= gpu.max_threads);
    assert_eq!(mapping.thread_cfg.product() * mapping.block_cfg.product(), 1024 * 512);

    let config = session.config();
    assert!(config.is_gpu);
    assert_eq!(config.thread_cfg.as_ref(), Some(&mapping.thread_cfg));
    assert_eq!(config.block_cfg.as_ref(), Some(&mapping.block_cfg));
}

#[test]
fn test_cuda_mapping_is_logged() {
    let dir = tempfile::tempdir().unwrap();
    let dump_dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    let config = UserConfig {
        dump_dir: Some(dump_dir.clone()),
        dump_level: DumpLevel::General,
        ..UserConfig::default()
    };
    let session = create_session(config, TargetInfo::default());
    Optimizer::new(Arc::clone(&session))
        .optimize_json(&kernel_json("cuda", &[256, 64]))
        .unwrap();

    let path = session.flush_log().unwrap().unwrap();
    assert_eq!(path, dump_dir.join("tiling.log"));
    let log = std::fs::read_to_string(&path).unwrap();
    assert!(log.contains("[GPU_MAPPING]"));
    assert!(log.contains("Template = "));
    assert!(session.logger().lines(LogStage::GpuMapping).is_empty());
}

#[test]
fn test_malformed_json_is_a_graph_error() {
    let optimizer = Optimizer::new(Arc::new(Session::with_defaults()));
    let err = optimizer.optimize_json("{ not json").unwrap_err();
    assert!(matches!(err, OptimizeError::Graph(_)));
}
