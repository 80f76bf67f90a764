//! Integration tests for footprints, clustering and copy placement.

use tpo_footprint::footprint::scoped_refs;
use tpo_footprint::{
    CopyPlacer, FootprintCluster, HoistOptions, Remapper, SharedMemoryManager, TensorInfo,
    TensorTable, REALIZE_L1,
};
use tpo_index::Idx;
use tpo_poly::{
    AccessKind, AccessMap, Aff, Band, BoxSet, IndexExpr, NodeId, NodeKind, ScheduleTree,
    StmtIdx, StmtInfo, StmtKind,
};
use tpo_session::{Session, UserConfig};
use tpo_target::{MemScope, TargetInfo};

// ============================================================================
// Helpers
// ============================================================================

fn ident(tensor: &str, kind: AccessKind, rank: usize) -> AccessMap {
    AccessMap::identity(tensor, kind, rank)
}

fn stmt(name: &str, op: &str, extents: &[i64], accesses: Vec<AccessMap>) -> StmtInfo {
    let names: Vec<String> = (0..extents.len()).map(|i| format!("i{i}")).collect();
    StmtInfo::compute(name, op, BoxSet::from_extents(names, extents.iter().copied()), accesses)
}

fn leaf_of(tree: &ScheduleTree) -> NodeId {
    tree.child(tree.root(), 0).expect("root has a child")
}

/// `S_0: B[i] = exp(A[i])` followed by `S_1: C[i] = B[i] + B[i]`, each in
/// its own filter with a one-member band.
fn two_stage_tree(n: i64) -> (ScheduleTree, NodeId) {
    let s0 = stmt(
        "S_0",
        "Exp",
        &[n],
        vec![ident("A", AccessKind::Read, 1), ident("B", AccessKind::Write, 1)],
    );
    let s1 = stmt(
        "S_1",
        "Add",
        &[n],
        vec![ident("B", AccessKind::Read, 1), ident("C", AccessKind::Write, 1)],
    );
    let mut tree = ScheduleTree::new([s0, s1]);
    let leaf = leaf_of(&tree);
    let seq = tree
        .insert_sequence(leaf, vec![vec![StmtIdx::new(0)], vec![StmtIdx::new(1)]])
        .expect("sequence");
    for (k, filter) in tree.children(seq).to_vec().into_iter().enumerate() {
        let leaf = tree.child(filter, 0).expect("filter body");
        tree.insert_partial_schedule(leaf, Band::identity(StmtIdx::new(k), 1));
    }
    (tree, seq)
}

fn tensors(entries: &[(&str, &[i64])]) -> TensorTable {
    entries
        .iter()
        .map(|(name, shape)| ((*name).to_string(), TensorInfo::new(shape.to_vec(), 4)))
        .collect()
}

fn extension_stmt(tree: &ScheduleTree, filter: NodeId) -> StmtIdx {
    let ext = tree.child(filter, 0).expect("extension");
    match tree.kind(ext) {
        NodeKind::Extension { stmts } => stmts[0],
        other => panic!("expected an extension, found {}", other.name()),
    }
}

// ============================================================================
// Footprint boxes
// ============================================================================

#[test]
fn test_skewed_access_box() {
    // { S[i, j] -> A[i, j + i] : 0 <= i < 8 and 0 <= j < 8 }
    let access = AccessMap::new(
        "A",
        AccessKind::Read,
        vec![IndexExpr::var(2, 0), IndexExpr::from(Aff::var(2, 0) + Aff::var(2, 1))],
    );
    let tree = ScheduleTree::new([stmt("S", "Exp", &[8, 8], vec![access])]);
    let refs = scoped_refs(&tree, leaf_of(&tree), "A");
    let cluster = FootprintCluster::build("A", refs).unwrap();
    let fp = &cluster.footprint;
    assert_eq!(fp.strides, vec![1, 1]);
    assert!(fp.offsets[0].is_constant());
    assert_eq!(fp.offsets[0].constant_term(), 0);
    assert_eq!(fp.offsets[1], Aff::var(2, 0));
    assert_eq!(fp.fixed_sizes(), Some(vec![8, 8]));
    assert!(fp.valid);
    assert!(fp.strides.iter().all(|&s| s > 0));
}

#[test]
fn test_tiled_skewed_copy_recovers_row() {
    let access = AccessMap::new(
        "A",
        AccessKind::Read,
        vec![IndexExpr::var(2, 0), IndexExpr::from(Aff::var(2, 0) + Aff::var(2, 1))],
    );
    let mut tree = ScheduleTree::new([stmt("S", "Exp", &[8, 8], vec![access])]);
    let leaf = leaf_of(&tree);
    let band = tree.insert_partial_schedule(leaf, Band::identity(StmtIdx::new(0), 2));
    let point = tree.band_tile(band, &[4, 4]).unwrap();

    let session = Session::with_defaults();
    let table = tensors(&[("A", &[8, 16])]);
    let mut placer = CopyPlacer::new(&session, &table);
    let hoisted = placer
        .hoist(&mut tree, point, "A", &HoistOptions::new(MemScope::Unified))
        .unwrap()
        .expect("bounded footprint");
    assert_eq!(hoisted.buffer_box.fixed_sizes(), Some(vec![4, 4]));

    let copy = tree.stmt(hoisted.read_copy.expect("read copy"));
    assert!(matches!(&copy.kind, StmtKind::Copy { kind: AccessKind::Read, .. }));
    // tile (p0, p1) = (1, 0), buffer element (2, 3): row 6, column 6 + 3
    assert_eq!(copy.accesses[0].eval(&[1, 0, 2, 3]), Some(vec![6, 9]));
    assert_eq!(copy.accesses[1].tensor, "A_local_UB");
    assert_eq!(copy.domain.extents(), vec![2, 2, 4, 4]);
}

#[test]
fn test_unbounded_access_is_not_promoted() {
    let access = AccessMap::new("A", AccessKind::Read, vec![IndexExpr::Any]);
    let mut tree = ScheduleTree::new([stmt("S", "Gather", &[8], vec![access])]);
    let session = Session::with_defaults();
    let table = tensors(&[("A", &[64])]);
    let mut placer = CopyPlacer::new(&session, &table);
    let leaf = leaf_of(&tree);
    let before = tree.num_nodes();
    let hoisted = placer
        .hoist(&mut tree, leaf, "A", &HoistOptions::new(MemScope::Unified))
        .unwrap();
    assert!(hoisted.is_none());
    assert_eq!(tree.num_nodes(), before);
    assert!(placer.buffers().is_empty());
}

// ============================================================================
// Copy placement
// ============================================================================

#[test]
fn test_read_copy_precedes_first_use() {
    let (mut tree, seq) = two_stage_tree(16);
    let session = Session::with_defaults();
    let table = tensors(&[("A", &[16]), ("B", &[16]), ("C", &[16])]);
    let mut placer = CopyPlacer::new(&session, &table);

    let hoisted = placer
        .hoist(&mut tree, seq, "A", &HoistOptions::new(MemScope::Unified))
        .unwrap()
        .unwrap();
    assert_eq!(hoisted.buffer, "A_local_UB");
    assert!(hoisted.write_copy.is_none());
    assert_eq!(hoisted.read_filters.len(), 1);
    assert_eq!(tree.children(seq)[0], hoisted.read_filters[0]);
    assert_eq!(tree.n_children(seq), 3);
    assert_eq!(placer.buffers().get("A_local_UB").unwrap().sizes, vec![16]);
}

#[test]
fn test_reused_tensor_gets_one_copy_each_way() {
    let (mut tree, seq) = two_stage_tree(16);
    let mut config = UserConfig::default();
    config.binds.insert("B".to_string());
    let session = Session::new(config, TargetInfo::default());
    let table = tensors(&[("A", &[16]), ("B", &[16]), ("C", &[16])]);
    let mut placer = CopyPlacer::new(&session, &table);

    let hoisted = placer
        .hoist(&mut tree, seq, "B", &HoistOptions::new(MemScope::Unified))
        .unwrap()
        .unwrap();
    assert!(hoisted.cluster.footprint.valid);
    assert_eq!(hoisted.read_filters.len(), 1);
    assert_eq!(hoisted.write_filters.len(), 1);

    let children = tree.children(seq).to_vec();
    assert_eq!(children.len(), 4);
    assert_eq!(children[0], hoisted.read_filters[0]);
    assert_eq!(children[3], hoisted.write_filters[0]);
    assert_eq!(Some(extension_stmt(&tree, children[0])), hoisted.read_copy);
    assert_eq!(Some(extension_stmt(&tree, children[3])), hoisted.write_copy);
}

#[test]
fn test_unbound_write_to_unified_is_suppressed() {
    let (mut tree, seq) = two_stage_tree(16);
    let session = Session::with_defaults();
    let table = tensors(&[("B", &[16])]);
    let mut placer = CopyPlacer::new(&session, &table);
    let hoisted = placer
        .hoist(&mut tree, seq, "B", &HoistOptions::new(MemScope::Unified))
        .unwrap()
        .unwrap();
    assert!(hoisted.read_copy.is_some());
    assert!(hoisted.write_copy.is_none());
    assert_eq!(tree.n_children(seq), 3);
}

#[test]
fn test_copy_without_sequence_wraps_node() {
    let mut tree = ScheduleTree::new([stmt(
        "S",
        "Exp",
        &[32],
        vec![ident("A", AccessKind::Read, 1), ident("B", AccessKind::Write, 1)],
    )]);
    let leaf = leaf_of(&tree);
    let band = tree.insert_partial_schedule(leaf, Band::identity(StmtIdx::new(0), 1));
    let session = Session::with_defaults();
    let table = tensors(&[("A", &[32])]);
    let mut placer = CopyPlacer::new(&session, &table);

    let hoisted = placer
        .hoist(&mut tree, band, "A", &HoistOptions::new(MemScope::L1))
        .unwrap()
        .unwrap();
    let filter = hoisted.read_filters[0];
    let seq = tree.parent(filter).unwrap();
    assert!(matches!(tree.kind(seq), NodeKind::Sequence));
    assert_eq!(tree.child_position(filter), Some(0));
    // the wrapped band follows the copy
    let body = tree.child(seq, 1).unwrap();
    assert_eq!(tree.child(body, 0).unwrap(), band);
}

#[test]
fn test_gemm_operand_is_transposed_in_l0() {
    let mut tree = ScheduleTree::new([stmt(
        "S",
        "MatMul",
        &[2, 3, 16, 8],
        vec![ident("B", AccessKind::Read, 4), ident("C", AccessKind::Write, 4)],
    )]);
    let leaf = leaf_of(&tree);
    let session = Session::with_defaults();
    let table = tensors(&[("B", &[2, 3, 16, 8])]);
    let mut placer = CopyPlacer::new(&session, &table);
    let opts = HoistOptions {
        remapper: Some(Remapper::GemmInnerTranspose { matrix: "B".to_string() }),
        ..HoistOptions::new(MemScope::L0B)
    };
    let hoisted = placer.hoist(&mut tree, leaf, "B", &opts).unwrap().unwrap();
    assert_eq!(hoisted.buffer, "B_local_L0B");
    assert_eq!(placer.buffers().get("B_local_L0B").unwrap().sizes, vec![2, 3, 8, 16]);

    let copy = tree.stmt(hoisted.read_copy.unwrap());
    assert_eq!(copy.accesses[0].eval(&[1, 2, 5, 7]), Some(vec![1, 2, 7, 5]));
}

#[test]
fn test_out_of_bound_reads_are_reported() {
    let shifted = AccessMap::new("A", AccessKind::Read, vec![IndexExpr::var(1, 0).offset(1)]);
    let far = AccessMap::new("A", AccessKind::Read, vec![IndexExpr::var(1, 0).offset(20)]);
    let tree = ScheduleTree::new([
        stmt("S_0", "Exp", &[16], vec![shifted]),
        stmt("S_1", "Exp", &[16], vec![far]),
    ]);
    let session = Session::with_defaults();
    let table = tensors(&[("A", &[16])]);
    let placer = CopyPlacer::new(&session, &table);
    let reports = placer.check_out_of_bounds(&tree, leaf_of(&tree), "A");
    assert_eq!(reports.len(), 2);
    assert!(!reports[0].always);
    assert!(reports[1].always);
    assert_eq!(reports[1].kind, AccessKind::Read);
}

// ============================================================================
// Recomputation into L1
// ============================================================================

#[test]
fn test_recompute_chases_producers() {
    let (mut tree, seq) = two_stage_tree(16);
    let second = tree.child(seq, 1).unwrap();
    let body = tree.child(second, 0).unwrap();
    let mark = tree.insert_mark(body, REALIZE_L1);

    let session = Session::with_defaults();
    let table = tensors(&[("A", &[16]), ("B", &[16]), ("C", &[16])]);
    let mut placer = CopyPlacer::new(&session, &table);
    let added = placer.insert_recompute(&mut tree, mark, "B").unwrap();
    assert_eq!(added.len(), 1);
    let info = tree.stmt(added[0]);
    assert_eq!(info.name, "S_0_recompute");
    assert!(matches!(info.kind, StmtKind::Recompute { source } if source == StmtIdx::new(0)));
    assert!(tree.stmts_below(mark).contains(&added[0]));

    // the producer now runs inside the mark
    let again = placer.insert_recompute(&mut tree, mark, "B").unwrap();
    assert!(again.is_empty());
}

#[test]
fn test_recompute_requires_l1_mark() {
    let (mut tree, seq) = two_stage_tree(16);
    let session = Session::with_defaults();
    let table = TensorTable::default();
    let mut placer = CopyPlacer::new(&session, &table);
    assert!(placer.insert_recompute(&mut tree, seq, "B").is_err());
}

// ============================================================================
// Shared memory
// ============================================================================

/// `C[i, j] = A[i, j] + B[j]` over 64x64, tiled by 32x32.
fn gpu_tree() -> ScheduleTree {
    let b = AccessMap::new("B", AccessKind::Read, vec![IndexExpr::var(2, 1)]);
    let mut tree = ScheduleTree::new([stmt(
        "S",
        "Add",
        &[64, 64],
        vec![ident("A", AccessKind::Read, 2), b, ident("C", AccessKind::Write, 2)],
    )]);
    let leaf = leaf_of(&tree);
    let band = tree.insert_partial_schedule(leaf, Band::identity(StmtIdx::new(0), 2));
    tree.band_tile(band, &[32, 32]).unwrap();
    tree
}

#[test]
fn test_shared_promotion_pads_innermost_dim() {
    let mut tree = gpu_tree();
    let session = Session::with_defaults();
    let table = tensors(&[("A", &[64, 64]), ("B", &[64]), ("C", &[64, 64])]);
    let mut placer = CopyPlacer::new(&session, &table);
    let promoted = SharedMemoryManager::new(&session).run(&mut tree, &mut placer).unwrap();

    let names: Vec<&str> = promoted.iter().map(|p| p.tensor.as_str()).collect();
    assert_eq!(names, vec!["A", "B"]);
    assert_eq!(promoted[0].bytes, 32 * 33 * 4);
    assert_eq!(placer.buffers().get("A_shared").unwrap().sizes, vec![32, 33]);
    assert_eq!(placer.buffers().get("B_shared").unwrap().sizes, vec![33]);
}

#[test]
fn test_shared_promotion_respects_budget() {
    let mut tree = gpu_tree();
    let mut target = TargetInfo::default();
    target.gpu.shared_bytes = 4300;
    let session = Session::new(UserConfig::default(), target);
    let table = tensors(&[("A", &[64, 64]), ("B", &[64]), ("C", &[64, 64])]);
    let mut placer = CopyPlacer::new(&session, &table);
    let promoted = SharedMemoryManager::new(&session).run(&mut tree, &mut placer).unwrap();
    assert_eq!(promoted.len(), 1);
    assert_eq!(promoted[0].tensor, "A");
    assert!(placer.buffers().bytes(MemScope::Shared) <= 4300);
}

#[test]
fn test_local_tensors_go_to_registers() {
    let mut tree = gpu_tree();
    let config = UserConfig {
        use_shared_memory: false,
        local_tensors: vec!["B".to_string()],
        ..UserConfig::default()
    };
    let session = Session::new(config, TargetInfo::default());
    let table = tensors(&[("B", &[64])]);
    let mut placer = CopyPlacer::new(&session, &table);
    let promoted = SharedMemoryManager::new(&session).run(&mut tree, &mut placer).unwrap();
    assert_eq!(promoted.len(), 1);
    assert_eq!(promoted[0].scope, MemScope::Local);
    assert_eq!(promoted[0].buffer, "B_local");
}
