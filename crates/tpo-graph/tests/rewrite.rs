//! Integration tests for the whole-graph rewrites.

use tpo_graph::elim::{analyze, eliminate_transforms, ReshapeEdge};
use tpo_graph::fold::{fold_dimensions, FoldPlan};
use tpo_graph::normalize::normalize_axis_attrs;
use tpo_graph::{AttrValue, Attrs, DType, Graph, OpClass, Shape, TensorId};

// ============================================================================
// Helpers
// ============================================================================

fn tensor(g: &mut Graph, name: &str, dims: &[i64]) -> TensorId {
    g.add_tensor(name, DType::Float16, Shape::from_static(dims.iter().copied()))
        .expect("fresh tensor")
}

fn attrs(entries: &[(&str, AttrValue)]) -> Attrs {
    entries
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

fn shape_of(g: &Graph, t: TensorId) -> Vec<i64> {
    g.shape(t).static_dims().expect("static shape")
}

/// Checks `fold_dims[0] == 0`, `fold_dims[i] in {fold_dims[i-1], i}` and
/// that the number of leaders equals the plan's count.
fn assert_fold_invariants(plan: &FoldPlan) {
    let mut leaders = 0;
    for t in plan.tensors() {
        for (i, &leader) in t.fold_dims.iter().enumerate() {
            if i == 0 {
                assert_eq!(leader, 0);
            } else {
                assert!(leader == i || leader == t.fold_dims[i - 1]);
            }
            if leader == i {
                leaders += 1;
            }
        }
    }
    assert_eq!(leaders, plan.folded_dims());
}

// ============================================================================
// Transform elimination
// ============================================================================

#[test]
fn reshape_between_kernel_input_and_output_is_kept() {
    let mut g = Graph::new();
    let a = tensor(&mut g, "a", &[3, 4]);
    let b = tensor(&mut g, "b", &[12]);
    g.mark_input(a);
    g.mark_output(b);
    g.add_stmt("Reshape", [a], b, attrs(&[("shape", AttrValue::Ints(vec![12]))]))
        .unwrap();

    let plan = analyze(&g);
    assert!(plan.removed.is_empty());
    assert!(!plan.sames.contains_key(&b));
    assert!(plan.is_noop());
}

#[test]
fn internal_reshape_is_absorbed_by_elementwise_consumer() {
    let mut g = Graph::new();
    let a = tensor(&mut g, "a", &[3, 4]);
    let t = tensor(&mut g, "t", &[12]);
    let b = tensor(&mut g, "b", &[12]);
    g.mark_input(a);
    g.mark_output(b);
    let reshape = g
        .add_stmt("Reshape", [a], t, attrs(&[("shape", AttrValue::Ints(vec![12]))]))
        .unwrap();
    let add = g.add_stmt("Add", [t, t], b, Attrs::new()).unwrap();

    let plan = eliminate_transforms(&mut g).unwrap();
    assert!(plan.removed.contains(&reshape));
    assert_eq!(plan.replace[&t], a);
    assert!(plan.reshapes.is_empty());

    assert!(g.stmt(reshape).is_none());
    assert_eq!(g.stmt(add).unwrap().inputs.as_slice(), &[a, a]);
    assert_eq!(shape_of(&g, a), vec![12]);
    assert_eq!(g.producer(t), None);
    assert!(g.consumers(t).is_empty());
}

#[test]
fn non_elementwise_consumer_gets_input_reshape() {
    // t = Reshape(a); c = ReduceSum(a); d = Add(t, t)
    let mut g = Graph::new();
    let a = tensor(&mut g, "a", &[3, 4]);
    let t = tensor(&mut g, "t", &[12]);
    let c = tensor(&mut g, "c", &[3]);
    let d = tensor(&mut g, "d", &[12]);
    g.mark_input(a);
    g.mark_output(c);
    g.mark_output(d);
    g.add_stmt("Reshape", [a], t, Attrs::new()).unwrap();
    let reduce = g
        .add_stmt("ReduceSum", [a], c, attrs(&[("axis", AttrValue::Ints(vec![1]))]))
        .unwrap();
    g.add_stmt("Add", [t, t], d, Attrs::new()).unwrap();

    let plan = eliminate_transforms(&mut g).unwrap();
    assert_eq!(plan.reshapes.len(), 1);
    let op = &plan.reshapes[0];
    assert_eq!(op.stmt, reduce);
    assert_eq!(op.edge, ReshapeEdge::Input);
    assert_eq!(op.stmt_shape, Shape::from_static([3, 4]));
    assert_eq!(op.graph_shape, Shape::from_static([12]));

    // ReduceSum now reads a fresh [3, 4] view produced by a pinned Reshape.
    let fed = g.stmt(reduce).unwrap().inputs[0];
    assert_ne!(fed, a);
    assert_eq!(shape_of(&g, fed), vec![3, 4]);
    let producer = g.stmt(g.producer(fed).unwrap()).unwrap();
    assert_eq!(producer.class(), OpClass::Transform);
    assert!(producer.is_pinned());
    assert_eq!(producer.inputs.as_slice(), &[a]);
    g.validate().unwrap();
}

#[test]
fn removed_kernel_output_is_aliased() {
    // r = Transpose(x); t = Reshape(r) with t a kernel output
    let mut g = Graph::new();
    let x = tensor(&mut g, "x", &[4, 3]);
    let r = tensor(&mut g, "r", &[3, 4]);
    let t = tensor(&mut g, "t", &[12]);
    g.mark_input(x);
    g.mark_output(t);
    let transpose = g
        .add_stmt("Transpose", [x], r, attrs(&[("perm", AttrValue::Ints(vec![1, 0]))]))
        .unwrap();
    g.add_stmt("Reshape", [r], t, Attrs::new()).unwrap();

    let plan = eliminate_transforms(&mut g).unwrap();
    assert_eq!(plan.sames.get(&t), Some(&r));
    assert_eq!(plan.reshapes.len(), 1);
    assert_eq!(plan.reshapes[0].edge, ReshapeEdge::Output);

    assert_eq!(g.outputs(), &[r]);
    assert_eq!(shape_of(&g, r), vec![12]);
    let fresh = g.stmt(transpose).unwrap().output;
    assert_eq!(shape_of(&g, fresh), vec![3, 4]);
    let tail = g.stmt(g.producer(r).unwrap()).unwrap();
    assert_eq!(tail.op, "Reshape");
    assert_eq!(tail.inputs.as_slice(), &[fresh]);
    g.validate().unwrap();
}

#[test]
fn second_elimination_run_is_noop() {
    let mut g = Graph::new();
    let a = tensor(&mut g, "a", &[3, 4]);
    let t = tensor(&mut g, "t", &[12]);
    let c = tensor(&mut g, "c", &[3]);
    let d = tensor(&mut g, "d", &[12]);
    g.mark_input(a);
    g.mark_output(c);
    g.mark_output(d);
    g.add_stmt("Reshape", [a], t, Attrs::new()).unwrap();
    g.add_stmt("ReduceSum", [a], c, attrs(&[("axis", AttrValue::Ints(vec![1]))]))
        .unwrap();
    g.add_stmt("Add", [t, t], d, Attrs::new()).unwrap();

    let first = eliminate_transforms(&mut g).unwrap();
    assert!(!first.is_noop());
    let snapshot = g.to_string();
    let second = eliminate_transforms(&mut g).unwrap();
    assert!(second.is_noop());
    assert_eq!(g.to_string(), snapshot);
}

#[test]
fn all_reduce_input_stays_flexible() {
    // t = Reshape(a); s = ReduceSum(a) -> [1]; d = Exp(t)
    let mut g = Graph::new();
    let a = tensor(&mut g, "a", &[3, 4]);
    let t = tensor(&mut g, "t", &[12]);
    let s = tensor(&mut g, "s", &[1]);
    let d = tensor(&mut g, "d", &[12]);
    g.mark_input(a);
    g.mark_output(s);
    g.mark_output(d);
    g.add_stmt("Reshape", [a], t, Attrs::new()).unwrap();
    g.add_stmt("ReduceSum", [a], s, attrs(&[("axis", AttrValue::Ints(vec![0, 1]))]))
        .unwrap();
    g.add_stmt("Exp", [t], d, Attrs::new()).unwrap();

    let plan = analyze(&g);
    assert_eq!(plan.replace.get(&t), Some(&a));
    assert!(plan.reshapes.is_empty());
}

// ============================================================================
// Dimension folding
// ============================================================================

#[test]
fn elementwise_chain_folds_to_one_dim() {
    let mut g = Graph::new();
    let a = tensor(&mut g, "a", &[4, 8, 16]);
    let b = tensor(&mut g, "b", &[4, 8, 16]);
    let c = tensor(&mut g, "c", &[4, 8, 16]);
    g.mark_input(a);
    g.mark_output(c);
    g.add_stmt("Exp", [a], b, Attrs::new()).unwrap();
    g.add_stmt("Add", [b, b], c, Attrs::new()).unwrap();

    let plan = FoldPlan::build(&g).unwrap();
    for t in [a, b, c] {
        assert_eq!(plan.fold_dims(t).unwrap(), &[0, 0, 0]);
    }
    assert_fold_invariants(&plan);

    let report = fold_dimensions(&mut g).unwrap();
    assert!(report.applied);
    for t in [a, b, c] {
        assert_eq!(shape_of(&g, t), vec![512]);
    }
}

#[test]
fn broadcast_forces_split() {
    let mut g = Graph::new();
    let a = tensor(&mut g, "a", &[8, 16]);
    let bb = tensor(&mut g, "a_bcast", &[4, 8, 16]);
    let b = tensor(&mut g, "b", &[4, 8, 16]);
    let c = tensor(&mut g, "c", &[4, 8, 16]);
    g.mark_input(a);
    g.mark_input(b);
    g.mark_output(c);
    let bcast = g
        .add_stmt(
            "BroadcastTo",
            [a],
            bb,
            attrs(&[("shape", AttrValue::Ints(vec![4, 8, 16]))]),
        )
        .unwrap();
    g.add_stmt("Add", [bb, b], c, Attrs::new()).unwrap();

    let plan = FoldPlan::build(&g).unwrap();
    assert_eq!(plan.fold_dims(c).unwrap(), &[0, 1, 1]);
    assert_eq!(plan.fold_dims(b).unwrap(), &[0, 1, 1]);
    assert_eq!(plan.fold_dims(a).unwrap(), &[0, 0]);
    assert_fold_invariants(&plan);

    fold_dimensions(&mut g).unwrap();
    assert_eq!(shape_of(&g, c), vec![4, 128]);
    assert_eq!(shape_of(&g, a), vec![128]);
    assert_eq!(
        g.stmt(bcast).unwrap().attr_ints("shape"),
        Some(vec![4, 128])
    );
}

#[test]
fn reduce_splits_at_region_edges() {
    let mut g = Graph::new();
    let a = tensor(&mut g, "a", &[2, 3, 4, 5]);
    let b = tensor(&mut g, "b", &[2, 5]);
    g.mark_input(a);
    g.mark_output(b);
    let reduce = g
        .add_stmt("ReduceSum", [a], b, attrs(&[("axis", AttrValue::Ints(vec![1, 2]))]))
        .unwrap();

    let plan = FoldPlan::build(&g).unwrap();
    assert_eq!(plan.fold_dims(a).unwrap(), &[0, 1, 1, 3]);
    assert_eq!(plan.fold_dims(b).unwrap(), &[0, 1]);
    assert_eq!(plan.folded_dims(), 5);
    assert_eq!(plan.total_dims(), 6);
    assert_fold_invariants(&plan);

    fold_dimensions(&mut g).unwrap();
    assert_eq!(shape_of(&g, a), vec![2, 12, 5]);
    assert_eq!(g.stmt(reduce).unwrap().attr_ints("axis"), Some(vec![1]));
}

#[test]
fn opaque_op_gives_up() {
    let mut g = Graph::new();
    let a = tensor(&mut g, "a", &[4, 8]);
    let b = tensor(&mut g, "b", &[8, 4]);
    g.mark_input(a);
    g.mark_output(b);
    g.add_stmt("Transpose", [a], b, Attrs::new()).unwrap();

    let report = fold_dimensions(&mut g).unwrap();
    assert!(!report.applied);
    assert_eq!(shape_of(&g, a), vec![4, 8]);
}

#[test]
fn fully_split_graph_gives_up() {
    // Every dimension is its own run, so folding would change nothing.
    let mut g = Graph::new();
    let a = tensor(&mut g, "a", &[2, 3]);
    let b = tensor(&mut g, "b", &[2]);
    g.mark_input(a);
    g.mark_output(b);
    g.add_stmt("ReduceSum", [a], b, attrs(&[("axis", AttrValue::Ints(vec![1]))]))
        .unwrap();

    let plan = FoldPlan::build(&g).unwrap();
    assert_eq!(plan.folded_dims(), plan.total_dims());
    assert!(plan.gave_up());
}

#[test]
fn reduce_without_axis_is_rejected() {
    let mut g = Graph::new();
    let a = tensor(&mut g, "a", &[2, 3]);
    let b = tensor(&mut g, "b", &[2]);
    g.mark_input(a);
    g.add_stmt("ReduceMax", [a], b, Attrs::new()).unwrap();
    assert!(FoldPlan::build(&g).is_err());
}

#[test]
fn normalize_then_fold_uses_folded_axis() {
    let mut g = Graph::new();
    let a = tensor(&mut g, "a", &[2, 3, 4, 5]);
    let b = tensor(&mut g, "b", &[2, 3]);
    g.mark_input(a);
    g.mark_output(b);
    let reduce = g
        .add_stmt("ReduceMax", [a], b, attrs(&[("axis", AttrValue::Ints(vec![-2, -1]))]))
        .unwrap();

    normalize_axis_attrs(&mut g);
    assert_eq!(g.stmt(reduce).unwrap().attr_ints("axis"), Some(vec![2, 3]));
    fold_dimensions(&mut g).unwrap();
    assert_eq!(shape_of(&g, a), vec![6, 20]);
    assert_eq!(shape_of(&g, b), vec![6]);
    assert_eq!(g.stmt(reduce).unwrap().attr_ints("axis"), Some(vec![1]));
}
