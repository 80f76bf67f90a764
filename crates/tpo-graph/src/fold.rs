//! Dimension folding.
//!
//! Every tensor starts with all of its dimensions in one foldable run.
//! Each statement contributes a relation between an operand and its result
//! which forces run boundaries where the statement treats neighbouring
//! dimensions differently (a broadcast prefix, the edge of a reduce region).
//! Boundaries are then propagated forward and backward along relations
//! until nothing changes. Each remaining run is folded into one dimension.
//!
//! `fold_dims[i]` holds the leader of the run containing dimension `i`:
//! `fold_dims[i] == i` starts a run, `fold_dims[i] == fold_dims[i - 1]`
//! continues one.

use crate::{AttrValue, Graph, GraphError, GraphResult, OpClass, Shape, TensorId};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

struct Relation {
    to: usize,
    forward_commit: i64,
    backward_commit: i64,
    /// Producer dim to consumer dim.
    forward: Vec<Option<usize>>,
    /// Consumer dim to producer dim.
    backward: Vec<Option<usize>>,
}

impl Relation {
    fn new(to: usize) -> Self {
        Self {
            to,
            forward_commit: -1,
            backward_commit: -1,
            forward: Vec::new(),
            backward: Vec::new(),
        }
    }
}

/// Fold state of one tensor.
pub struct FoldTensor {
    /// The graph tensor.
    pub tensor: TensorId,
    /// Constant extents.
    pub shape: Vec<i64>,
    /// Run leader per dimension.
    pub fold_dims: Vec<usize>,
    update: i64,
    succ: Vec<Relation>,
}

/// The folding plan for a whole graph.
pub struct FoldPlan {
    tensors: Vec<FoldTensor>,
    index: FxHashMap<TensorId, usize>,
    inputs: Vec<usize>,
    total_dims: usize,
    folded_dims: usize,
    give_up: bool,
    forward_visited: FxHashSet<usize>,
    backward_visited: FxHashSet<usize>,
}

impl FoldPlan {
    /// Builds relations for every statement of `graph` and propagates run
    /// boundaries to a fixed point.
    ///
    /// # Errors
    ///
    /// Fails if a reduce statement has no `axis` attribute or not exactly
    /// one operand, or an `InplaceAssign` does not have exactly three.
    pub fn build(graph: &Graph) -> GraphResult<Self> {
        let mut plan = Self {
            tensors: Vec::new(),
            index: FxHashMap::default(),
            inputs: Vec::new(),
            total_dims: 0,
            folded_dims: 0,
            give_up: false,
            forward_visited: FxHashSet::default(),
            backward_visited: FxHashSet::default(),
        };
        for id in graph.topo_order()? {
            let Some(stmt) = graph.stmt(id) else {
                continue;
            };
            let Some(output) = plan.tensor_slot(graph, stmt.output, false) else {
                plan.give_up = true;
                break;
            };
            let mut inputs = Vec::with_capacity(stmt.inputs.len());
            for &t in &stmt.inputs {
                match plan.tensor_slot(graph, t, true) {
                    Some(slot) => inputs.push(slot),
                    None => plan.give_up = true,
                }
            }
            if plan.give_up {
                break;
            }
            match stmt.class() {
                OpClass::Elementwise => {
                    for &input in &inputs {
                        plan.add_elem_broad_relation(input, output);
                    }
                }
                OpClass::Opaque if stmt.op == "BroadcastTo" => {
                    for &input in &inputs {
                        plan.add_elem_broad_relation(input, output);
                    }
                }
                OpClass::Reduce => {
                    if inputs.len() != 1 {
                        return Err(GraphError::Arity {
                            op: stmt.op.clone(),
                            expected: 1,
                            found: inputs.len(),
                        });
                    }
                    let axis = stmt.attr_ints("axis").ok_or_else(|| GraphError::MissingAttr {
                        op: stmt.op.clone(),
                        attr: "axis".to_string(),
                    })?;
                    let axis = reduce_axis(axis);
                    plan.add_reduce_relation(inputs[0], output, &axis);
                }
                OpClass::Opaque if stmt.op == "InplaceAssign" => {
                    if inputs.len() != 3 {
                        return Err(GraphError::Arity {
                            op: stmt.op.clone(),
                            expected: 3,
                            found: inputs.len(),
                        });
                    }
                    plan.add_elem_broad_relation(inputs[1], inputs[0]);
                    plan.add_elem_broad_relation(inputs[2], output);
                }
                _ => {
                    for &input in &inputs {
                        plan.tensors[input].succ.push(Relation::new(output));
                    }
                    debug!(op = %stmt.op, "dimension folding gives up");
                    plan.give_up = true;
                }
            }
        }
        if plan.give_up {
            return Ok(plan);
        }

        loop {
            let old = plan.folded_dims;
            let inputs = plan.inputs.clone();
            for t in inputs {
                plan.backward_visited.clear();
                plan.propagate(t);
            }
            if plan.folded_dims == old || plan.folded_dims >= plan.total_dims {
                break;
            }
        }
        if plan.folded_dims == plan.total_dims {
            plan.give_up = true;
        }
        Ok(plan)
    }

    /// True when no folding will be applied.
    #[must_use]
    pub fn gave_up(&self) -> bool {
        self.give_up
    }

    /// Total number of run leaders across all tensors.
    #[must_use]
    pub fn folded_dims(&self) -> usize {
        self.folded_dims
    }

    /// Total number of dimensions across all tensors.
    #[must_use]
    pub fn total_dims(&self) -> usize {
        self.total_dims
    }

    /// The run leaders of `tensor`.
    #[must_use]
    pub fn fold_dims(&self, tensor: TensorId) -> Option<&[usize]> {
        self.index
            .get(&tensor)
            .map(|&i| self.tensors[i].fold_dims.as_slice())
    }

    /// All tensors taking part in the plan.
    pub fn tensors(&self) -> impl Iterator<Item = &FoldTensor> + '_ {
        self.tensors.iter()
    }

    fn tensor_slot(&mut self, graph: &Graph, t: TensorId, is_input: bool) -> Option<usize> {
        if let Some(&slot) = self.index.get(&t) {
            return Some(slot);
        }
        let shape = graph.shape(t).static_dims()?;
        let slot = self.tensors.len();
        self.total_dims += shape.len();
        self.folded_dims += 1;
        self.tensors.push(FoldTensor {
            tensor: t,
            fold_dims: vec![0; shape.len()],
            shape,
            update: 0,
            succ: Vec::new(),
        });
        self.index.insert(t, slot);
        if is_input {
            self.inputs.push(slot);
        }
        Some(slot)
    }

    fn add_elem_broad_relation(&mut self, input: usize, output: usize) {
        let in_shape = self.tensors[input].shape.clone();
        let out_shape = self.tensors[output].shape.clone();
        let Some(offset) = out_shape.len().checked_sub(in_shape.len()) else {
            self.give_up = true;
            return;
        };
        let mut rel = Relation::new(output);
        let mut domain = Vec::new();
        rel.backward.resize(offset, None);
        let mut in_elemwise = true;
        let mut broadcasting = true;
        for i in offset..out_shape.len() {
            let is_elemwise = in_shape[i - offset] == out_shape[i];
            if broadcasting && is_elemwise {
                broadcasting = false;
            }
            if broadcasting {
                rel.forward.push(None);
                rel.backward.push(None);
            } else {
                rel.forward.push(Some(i));
                rel.backward.push(Some(i - offset));
            }
            if i == offset || is_elemwise != in_elemwise {
                domain.push(i - offset);
                in_elemwise = is_elemwise;
            }
        }
        domain.push(in_shape.len());
        self.fold_relation(input, &rel, &domain);
        self.tensors[input].succ.push(rel);
    }

    fn add_reduce_relation(&mut self, input: usize, output: usize, axis: &FxHashSet<usize>) {
        let rank = self.tensors[input].shape.len();
        let keep_dim = rank == self.tensors[output].shape.len();
        let mut rel = Relation::new(output);
        let mut domain = Vec::new();
        let mut in_reduce = false;
        let mut out_idx = 0;
        for i in 0..rank {
            let reduced = axis.contains(&i);
            if i == 0 || reduced != in_reduce {
                domain.push(i);
                in_reduce = reduced;
            }
            if !reduced || keep_dim {
                rel.backward.push(Some(i));
                rel.forward.push(Some(out_idx));
                out_idx += 1;
            } else {
                rel.forward.push(None);
            }
        }
        if rel.backward.is_empty() {
            rel.backward.push(None);
        }
        domain.push(rank);
        self.fold_relation(input, &rel, &domain);
        self.tensors[input].succ.push(rel);
    }

    fn fold_relation(&mut self, t: usize, rel: &Relation, domain: &[usize]) {
        if domain.len() < 2 {
            return;
        }
        let mut start = domain[0];
        for &next in &domain[1..] {
            let end = next - 1;
            self.update_fold_dim(t, start, end);
            if let (Some(out_start), Some(out_end)) = (rel.forward[start], rel.forward[end]) {
                self.update_fold_dim(rel.to, out_start, out_end);
            }
            start = next;
        }
    }

    /// Makes `[start, end]` a union of whole runs: `start` and `end + 1`
    /// become run leaders.
    fn update_fold_dim(&mut self, t: usize, start: usize, end: usize) {
        let fold = &mut self.tensors[t].fold_dims;
        let size = fold.len();
        let start_fold = fold[start];
        let mut i_start = start;
        let mut splits = 0;
        if fold[i_start] != start {
            while i_start <= end && fold[i_start] == start_fold {
                fold[i_start] = start;
                i_start += 1;
            }
            splits += 1;
        }
        if i_start <= end {
            let end_fold = fold[end];
            let mut i_end = end;
            while i_end > i_start && fold[i_end - 1] == end_fold {
                i_end -= 1;
            }
            if fold[i_end] != i_end {
                for d in &mut fold[i_end..=end] {
                    *d = i_end;
                }
                splits += 1;
            }
        }
        let next = end + 1;
        if next < size && fold[next] != next {
            let next_fold = fold[next];
            let mut i = next;
            while i < size && fold[i] == next_fold {
                fold[i] = next;
                i += 1;
            }
            splits += 1;
        }
        if splits > 0 {
            self.folded_dims += splits;
            self.tensors[t].update += 1;
        }
    }

    fn propagate(&mut self, t: usize) {
        if self.backward_visited.contains(&t) {
            return;
        }
        self.forward_visited.insert(t);
        for r in 0..self.tensors[t].succ.len() {
            self.propagate_forward(t, r);

            let to = self.tensors[t].succ[r].to;
            let to_update = self.tensors[to].update;
            if to_update > self.tensors[t].succ[r].backward_commit {
                let forward = self.tensors[t].succ[r].forward.clone();
                let mut cur_dim: Option<usize> = None;
                let mut cur_out: Option<usize> = None;
                for i in 0..self.tensors[t].fold_dims.len() {
                    let out = forward
                        .get(i)
                        .copied()
                        .flatten()
                        .map(|d| self.tensors[to].fold_dims[d]);
                    let fold = &self.tensors[t].fold_dims;
                    match cur_dim {
                        Some(c) if fold[i] == fold[c] => {
                            if out != cur_out {
                                self.update_fold_dim(t, c, i - 1);
                                cur_dim = Some(i);
                                cur_out = out;
                            }
                        }
                        _ => {
                            cur_dim = Some(i);
                            cur_out = out;
                        }
                    }
                }
                self.tensors[t].succ[r].backward_commit = self.tensors[to].update;
            }
        }
        self.forward_visited.remove(&t);
    }

    fn propagate_forward(&mut self, top: usize, r: usize) {
        let to = self.tensors[top].succ[r].to;
        if self.forward_visited.contains(&to) {
            return;
        }
        let top_update = self.tensors[top].update;
        if top_update > self.tensors[top].succ[r].forward_commit {
            let backward = self.tensors[top].succ[r].backward.clone();
            let mut cur_dim: Option<usize> = None;
            let mut cur_in: Option<usize> = None;
            for i in 0..self.tensors[to].fold_dims.len() {
                let input = backward
                    .get(i)
                    .copied()
                    .flatten()
                    .map(|d| self.tensors[top].fold_dims[d]);
                let fold = &self.tensors[to].fold_dims;
                match cur_dim {
                    Some(c) if fold[i] == fold[c] => {
                        if input != cur_in {
                            self.update_fold_dim(to, c, i - 1);
                            cur_dim = Some(i);
                            cur_in = input;
                        }
                    }
                    _ => {
                        cur_dim = Some(i);
                        cur_in = input;
                    }
                }
            }
            self.tensors[top].succ[r].forward_commit = top_update;
        }
        self.propagate(to);
        self.backward_visited.insert(to);
    }
}

/// An empty axis list reduces dimension zero.
fn reduce_axis(axis: Vec<i64>) -> FxHashSet<usize> {
    if axis.is_empty() {
        return std::iter::once(0).collect();
    }
    axis.into_iter()
        .filter_map(|a| usize::try_from(a).ok())
        .collect()
}

/// Multiplies the extents of each run together.
#[must_use]
pub fn fold_shape(shape: &[i64], fold_dims: &[usize]) -> Vec<i64> {
    let mut out = Vec::new();
    let Some((&first, rest)) = shape.split_first() else {
        return out;
    };
    let mut acc = first;
    for (i, &extent) in rest.iter().enumerate() {
        if fold_dims.get(i + 1).map_or(true, |&leader| leader == i + 1) {
            out.push(acc);
            acc = extent;
        } else {
            acc *= extent;
        }
    }
    out.push(acc);
    out
}

/// Maps axis indices through the run table, dropping duplicates.
#[must_use]
pub fn fold_shape_index(fold_dims: &[usize], axis: &[i64]) -> Vec<i64> {
    let mut axis_map = Vec::with_capacity(fold_dims.len());
    let mut idx: i64 = -1;
    for (i, &leader) in fold_dims.iter().enumerate() {
        if leader == i {
            idx += 1;
        }
        axis_map.push(idx);
    }
    let mut out: Vec<i64> = Vec::new();
    for &a in axis {
        let Some(&dim) = usize::try_from(a).ok().and_then(|a| axis_map.get(a)) else {
            warn!(axis = a, "axis out of range while folding");
            continue;
        };
        if !out.contains(&dim) {
            out.push(dim);
        }
    }
    out
}

/// Summary of a folding run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FoldReport {
    /// Whether any shape was rewritten.
    pub applied: bool,
    /// Run leaders found.
    pub folded_dims: usize,
    /// Dimensions before folding.
    pub total_dims: usize,
}

/// Plans and applies dimension folding on `graph`.
///
/// # Errors
///
/// Propagates malformed-statement errors from planning.
pub fn fold_dimensions(graph: &mut Graph) -> GraphResult<FoldReport> {
    let plan = FoldPlan::build(graph)?;
    let report = FoldReport {
        applied: !plan.gave_up(),
        folded_dims: plan.folded_dims(),
        total_dims: plan.total_dims(),
    };
    if plan.gave_up() {
        debug!(
            folded = plan.folded_dims(),
            total = plan.total_dims(),
            "dimension folding skipped"
        );
        return Ok(report);
    }

    let stmts: Vec<_> = graph.stmts().map(|(id, _)| id).collect();
    for id in stmts {
        let Some(stmt) = graph.stmt(id) else {
            continue;
        };
        let class = stmt.class();
        let op = stmt.op.clone();
        let first_input = stmt.inputs.first().copied();
        let output = stmt.output;
        if class == OpClass::Reduce {
            let axis = stmt.attr_ints("axis");
            if let (Some(axis), Some(folds)) = (axis, first_input.and_then(|t| plan.fold_dims(t))) {
                let new_axis = fold_shape_index(folds, &axis);
                if let Some(stmt) = graph.stmt_mut(id) {
                    stmt.attrs
                        .insert("axis".to_string(), AttrValue::Ints(new_axis));
                }
            }
        } else if op == "BroadcastTo" {
            let shape = stmt.attr_ints("shape");
            if let (Some(shape), Some(folds)) = (shape, plan.fold_dims(output)) {
                if shape.len() == folds.len() {
                    let new_shape = fold_shape(&shape, folds);
                    if let Some(stmt) = graph.stmt_mut(id) {
                        stmt.attrs
                            .insert("shape".to_string(), AttrValue::Ints(new_shape));
                    }
                }
            }
        }
    }

    for t in plan.tensors() {
        let folded = fold_shape(&t.shape, &t.fold_dims);
        debug!(tensor = graph.name(t.tensor), shape = ?folded, "folded");
        graph.tensor_mut(t.tensor).shape = Shape::from_static(folded);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_shape_runs() {
        assert_eq!(fold_shape(&[4, 8, 16], &[0, 0, 0]), vec![512]);
        assert_eq!(fold_shape(&[4, 8, 16], &[0, 1, 1]), vec![4, 128]);
        assert_eq!(fold_shape(&[2, 3, 4, 5], &[0, 1, 1, 3]), vec![2, 12, 5]);
        assert!(fold_shape(&[], &[]).is_empty());
    }

    #[test]
    fn test_fold_shape_identity_map_is_fixed_point() {
        let once = fold_shape(&[2, 3, 4, 5], &[0, 1, 1, 3]);
        let identity: Vec<usize> = (0..once.len()).collect();
        assert_eq!(fold_shape(&once, &identity), once);
    }

    #[test]
    fn test_fold_shape_index_dedups() {
        assert_eq!(fold_shape_index(&[0, 1, 1, 3], &[1, 2]), vec![1]);
        assert_eq!(fold_shape_index(&[0, 1, 1, 3], &[0, 3]), vec![0, 2]);
        assert_eq!(fold_shape_index(&[0, 0], &[5]), Vec::<i64>::new());
    }

    #[test]
    fn test_reduce_axis_default() {
        assert!(reduce_axis(Vec::new()).contains(&0));
        assert_eq!(reduce_axis(vec![1, 2]).len(), 2);
    }
}
