//! Integration tests for tile selection.

use indexmap::IndexMap;
use tpo_footprint::{TensorInfo, TensorTable};
use tpo_index::Idx;
use tpo_poly::{
    AccessKind, AccessMap, Aff, Band, BoxSet, IndexExpr, NodeKind, ScheduleDim, ScheduleTree,
    StmtIdx, StmtInfo,
};
use tpo_session::{DumpLevel, LogStage, Session, UserConfig};
use tpo_target::{MemScope, TargetInfo};
use tpo_tiling::{TileLevel, TilingAnalyzer, TilingError, TilingPlan, TilingSolver};

// ============================================================================
// Helpers
// ============================================================================

fn stmt(name: &str, op: &str, extents: &[i64], accesses: Vec<AccessMap>) -> StmtInfo {
    let names: Vec<String> = (0..extents.len()).map(|i| format!("i{i}")).collect();
    StmtInfo::compute(name, op, BoxSet::from_extents(names, extents.iter().copied()), accesses)
}

fn ident(tensor: &str, kind: AccessKind, rank: usize) -> AccessMap {
    AccessMap::identity(tensor, kind, rank)
}

/// All statements under one band of `rank` identity dimensions.
fn banded(stmts: Vec<StmtInfo>, rank: usize) -> ScheduleTree {
    let n = stmts.len();
    let mut tree = ScheduleTree::new(stmts);
    let leaf = tree.child(tree.root(), 0).unwrap();
    let dims = (0..rank)
        .map(|d| {
            (0..n)
                .map(|s| (StmtIdx::new(s), ScheduleDim::var(rank, d)))
                .collect::<IndexMap<_, _>>()
        })
        .collect();
    tree.insert_partial_schedule(leaf, Band::new(dims, true));
    tree
}

/// One band per statement below a sequence.
fn sequenced(stmts: Vec<StmtInfo>, rank: usize) -> ScheduleTree {
    let n = stmts.len();
    let mut tree = ScheduleTree::new(stmts);
    let leaf = tree.child(tree.root(), 0).unwrap();
    let seq = tree
        .insert_sequence(leaf, (0..n).map(|s| vec![StmtIdx::new(s)]).collect())
        .unwrap();
    for (k, filter) in tree.children(seq).to_vec().into_iter().enumerate() {
        let body = tree.child(filter, 0).unwrap();
        tree.insert_partial_schedule(body, Band::identity(StmtIdx::new(k), rank));
    }
    tree
}

fn table(entries: &[(&str, &[i64])]) -> TensorTable {
    entries
        .iter()
        .map(|(n, s)| ((*n).to_string(), TensorInfo::new(s.to_vec(), 4)))
        .collect()
}

fn session_with(config: UserConfig) -> Session {
    Session::new(config, TargetInfo::default())
}

fn elementwise(n: i64, m: i64) -> (ScheduleTree, TensorTable) {
    let tree = banded(
        vec![stmt(
            "S_0",
            "Add",
            &[n, m],
            vec![ident("A", AccessKind::Read, 2), ident("B", AccessKind::Write, 2)],
        )],
        2,
    );
    (tree, table(&[("A", &[n, m]), ("B", &[n, m])]))
}

fn solve(tree: &ScheduleTree, tensors: &TensorTable, session: &Session) -> (TilingAnalyzer, TilingPlan) {
    let solver = TilingSolver::new(session);
    let analyzer = solver.analyze(tree, tensors).unwrap();
    let plan = solver.search(&analyzer, tree, tensors).unwrap();
    (analyzer, plan)
}

fn assert_admissible(analyzer: &TilingAnalyzer, plan: &TilingPlan) {
    for band in &plan.bands {
        for (&id, &tile) in band.axes.iter().zip(&band.l1) {
            let axis = analyzer.axes.axis(id);
            assert!(axis.l1.tile_min <= tile && tile <= axis.l1.tile_extent, "tile {tile} out of range");
            assert!(axis.tile_is_valid(TileLevel::L1, tile), "tile {tile} violates mod {}", axis.l1.tile_mod);
        }
    }
}

// ============================================================================
// Search
// ============================================================================

#[test]
fn test_elementwise_fills_unified_buffer() {
    let (mut tree, tensors) = elementwise(512, 512);
    let session = session_with(UserConfig {
        dump_level: DumpLevel::General,
        ..UserConfig::default()
    });
    let (analyzer, plan) = solve(&tree, &tensors, &session);
    assert_admissible(&analyzer, &plan);

    let l1 = &plan.bands[0].l1;
    // two float buffers in 256 KiB
    assert_eq!(l1[0] * l1[1], 32 * 1024);
    assert_eq!(analyzer.axes.axis(plan.bands[0].axes[1]).l1.tile_mod, 64);

    let points = plan.apply(&mut tree).unwrap();
    assert_eq!(points.len(), 1);
    assert!(matches!(tree.kind(points[0]), NodeKind::Band(_)));
    assert_eq!(tree.bands().len(), 2);
    assert!(!session.logger().lines(LogStage::DoTiling).is_empty());
}

#[test]
fn test_factor_directive_fixes_tile() {
    let (tree, tensors) = elementwise(512, 512);
    let session = session_with(UserConfig {
        custom_tiling: vec!["FACTOR:1:32".to_string()],
        ..UserConfig::default()
    });
    let (analyzer, plan) = solve(&tree, &tensors, &session);
    assert_admissible(&analyzer, &plan);
    assert_eq!(plan.bands[0].l1, vec![512, 32]);
}

#[test]
fn test_inner_level_directive() {
    let (tree, tensors) = elementwise(64, 64);
    let session = session_with(UserConfig {
        custom_tiling: vec!["C0:FACTOR:0:4".to_string()],
        ..UserConfig::default()
    });
    let (_, plan) = solve(&tree, &tensors, &session);
    assert_eq!(plan.bands[0].l1, vec![64, 64]);
    assert_eq!(plan.bands[0].l0[0], 4);
}

#[test]
fn test_small_kernel_is_not_tiled() {
    let (mut tree, tensors) = elementwise(16, 16);
    let session = Session::with_defaults();
    let (_, plan) = solve(&tree, &tensors, &session);
    assert_eq!(plan.bands[0].l1, vec![16, 16]);
    assert!(plan.apply(&mut tree).unwrap().is_empty());
}

#[test]
fn test_reduction_tiles_are_admissible() {
    let read = ident("A", AccessKind::Read, 2);
    let write = AccessMap::new("B", AccessKind::Write, vec![IndexExpr::var(2, 0)]);
    let tree = banded(vec![stmt("S_0", "ReduceSum", &[64, 1024], vec![read, write])], 2);
    let tensors = table(&[("A", &[64, 1024]), ("B", &[64])]);
    let session = Session::with_defaults();
    let (analyzer, plan) = solve(&tree, &tensors, &session);
    assert_admissible(&analyzer, &plan);

    let reduce = analyzer.axes.axis(plan.bands[0].axes[1]);
    assert!(reduce.has_attr("REDUCE_AXIS"));
    assert!(reduce.has_attr("REDUCE_SRC_LAST"));
    assert!(!reduce.mc_sup);
}

#[test]
fn test_shared_prefix_bands_agree() {
    let s0 = stmt(
        "S_0",
        "Exp",
        &[256, 256],
        vec![ident("A", AccessKind::Read, 2), ident("B", AccessKind::Write, 2)],
    );
    let s1 = stmt(
        "S_1",
        "Abs",
        &[256, 256],
        vec![ident("B", AccessKind::Read, 2), ident("C", AccessKind::Write, 2)],
    );
    let tree = sequenced(vec![s0, s1], 2);
    let tensors = table(&[("A", &[256, 256]), ("B", &[256, 256]), ("C", &[256, 256])]);
    let session = Session::with_defaults();
    let (analyzer, plan) = solve(&tree, &tensors, &session);
    assert_eq!(plan.bands.len(), 2);
    assert_admissible(&analyzer, &plan);
    assert_eq!(plan.bands[0].l1, plan.bands[1].l1);
}

// ============================================================================
// Multicore
// ============================================================================

#[test]
fn test_multicore_shrinks_outer_tile() {
    let tree = banded(
        vec![stmt(
            "S_0",
            "Exp",
            &[4096],
            vec![ident("A", AccessKind::Read, 1), ident("B", AccessKind::Write, 1)],
        )],
        1,
    );
    let tensors = table(&[("A", &[4096]), ("B", &[4096])]);

    let single = Session::with_defaults();
    let (_, plan) = solve(&tree, &tensors, &single);
    assert_eq!(plan.bands[0].l1, vec![4096]);

    let multi = session_with(UserConfig {
        core_num: 32,
        ..UserConfig::default()
    });
    let (analyzer, plan) = solve(&tree, &tensors, &multi);
    assert_admissible(&analyzer, &plan);
    // 4096 / 32 cores
    assert_eq!(plan.bands[0].l1, vec![128]);
}

#[test]
fn test_multicore_accepts_minimum_tile_off_modulus() {
    let tree = banded(
        vec![stmt(
            "S_0",
            "Exp",
            &[4096, 16],
            vec![ident("A", AccessKind::Read, 2), ident("B", AccessKind::Write, 2)],
        )],
        2,
    );
    let tensors = table(&[("A", &[4096, 16]), ("B", &[4096, 16])]);
    let session = session_with(UserConfig {
        core_num: 32,
        custom_tiling: vec!["MIN:0:128".to_string(), "MOD:0:256".to_string()],
        ..UserConfig::default()
    });
    let (analyzer, plan) = solve(&tree, &tensors, &session);
    let outer = analyzer.axes.axis(plan.bands[0].axes[0]);
    assert_eq!((outer.l1.tile_min, outer.l1.tile_mod), (128, 256));
    assert_admissible(&analyzer, &plan);
    // the smallest tile is admissible even though 256 does not divide it
    assert_eq!(plan.bands[0].l1[0], 128);
}

// ============================================================================
// Failures
// ============================================================================

#[test]
fn test_oversized_minimum_reports_allocation() {
    let (tree, tensors) = elementwise(1024, 1024);
    let session = session_with(UserConfig {
        custom_tiling: vec!["FACTOR:0:1024".to_string(), "FACTOR:1:1024".to_string()],
        ..UserConfig::default()
    });
    let err = TilingSolver::new(&session).solve(&tree, &tensors).unwrap_err();
    assert_eq!(
        err,
        TilingError::MemoryAllocation {
            scope: MemScope::Unified,
            need_bits: 2 * 1024 * 1024 * 4 * 8,
            alloc_bits: 256 * 1024 * 8,
        }
    );
    assert!(err.to_string().starts_with("Allocation exceed bound of memory tag local.UB"));
}

#[test]
fn test_malformed_directives() {
    let (tree, tensors) = elementwise(64, 64);
    for directive in ["BOGUS:0:4", "FACTOR:0", "FACTOR:7:4", "MOD:0:-2", "FACTOR:x:4"] {
        let session = session_with(UserConfig {
            custom_tiling: vec![directive.to_string()],
            ..UserConfig::default()
        });
        let err = TilingSolver::new(&session).solve(&tree, &tensors).unwrap_err();
        assert!(
            matches!(err, TilingError::InvalidDirective { .. }),
            "{directive} gave {err}"
        );
    }
}

#[test]
fn test_conv_without_kernel_is_rejected() {
    let names = ["N", "C1_in_out", "H", "W", "C0_out"];
    let domain = BoxSet::from_extents(names, [1, 4, 14, 14, 16]);
    let write = ident("out", AccessKind::Write, 5);
    let read = AccessMap::new(
        "in",
        AccessKind::Read,
        (0..5).map(|d| IndexExpr::Aff(Aff::var(5, d))).collect(),
    );
    let conv = StmtInfo::compute("S_0", "Conv", domain, vec![read, write]);
    let tree = banded(vec![conv], 5);
    let tensors = table(&[("in", &[1, 4, 14, 14, 16]), ("out", &[1, 4, 14, 14, 16])]);
    let err = TilingSolver::new(&Session::with_defaults()).solve(&tree, &tensors).unwrap_err();
    assert_eq!(err, TilingError::MissingConvAttr("pragma_conv_kernel_h"));
}
