//! Elimination of shape-only statements.
//!
//! Walks the graph from the kernel outputs toward the inputs and removes
//! `out = T(in)` transforms whose shape change can be absorbed by the
//! surrounding statements. Elementwise consumers absorb a change by simply
//! running on the new shape; every other op keeps its original view and
//! gets an explicit reshape on the affected edge instead.
//!
//! The analysis ([`analyze`]) is separate from the rewrite
//! ([`ElimResult::apply`]) so callers can inspect the plan.

use crate::{AttrValue, Attrs, Graph, GraphResult, OpClass, Shape, StmtId, TensorId, PINNED_ATTR};
use indexmap::{IndexMap, IndexSet};
use rustc_hash::FxHashSet;
use tracing::{debug, info};

/// Which side of a statement a synthesized reshape sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReshapeEdge {
    /// `t' = Reshape(t); stmt(..t'..)`
    Input,
    /// `t' = stmt(..); t = Reshape(t')`
    Output,
}

/// A reshape to materialize on one statement edge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReshapeOp {
    /// The statement whose edge needs the reshape.
    pub stmt: StmtId,
    /// The tensor on that edge, before replacement.
    pub tensor: TensorId,
    /// Input or output edge.
    pub edge: ReshapeEdge,
    /// Shape the statement itself works on.
    pub stmt_shape: Shape,
    /// Shape the rest of the graph sees.
    pub graph_shape: Shape,
}

/// The outcome of the transform analysis.
#[derive(Clone, Debug, Default)]
pub struct ElimResult {
    /// Removed transform statements, in discovery order.
    pub removed: IndexSet<StmtId>,
    /// Removed tensor to the tensor that replaces it.
    pub replace: IndexMap<TensorId, TensorId>,
    /// Tensors whose shape changes.
    pub changed_shapes: IndexMap<TensorId, Shape>,
    /// Removed kernel outputs and the tensor they alias.
    pub sames: IndexMap<TensorId, TensorId>,
    /// Reshapes to insert, one per statement edge.
    pub reshapes: Vec<ReshapeOp>,
}

impl ElimResult {
    /// Returns true if nothing would change.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.removed.is_empty() && self.changed_shapes.is_empty() && self.reshapes.is_empty()
    }

    /// Follows the replacement chain starting at `t`.
    #[must_use]
    pub fn resolve(&self, t: TensorId) -> TensorId {
        let mut cur = t;
        for _ in 0..=self.replace.len() {
            match self.replace.get(&cur) {
                Some(&next) if next != cur => cur = next,
                _ => break,
            }
        }
        cur
    }

    /// Rewrites `graph` according to this plan.
    ///
    /// Removed statements disappear, their outputs are substituted by their
    /// replacements, shapes are updated and every recorded reshape becomes a
    /// pinned `Reshape` statement. Transforms that survive are pinned too, so
    /// running the analysis again finds nothing to do.
    ///
    /// # Errors
    ///
    /// Propagates graph construction errors from the inserted reshapes.
    pub fn apply(&self, graph: &mut Graph) -> GraphResult<()> {
        for &stmt in &self.removed {
            if let Some(removed) = graph.remove_stmt(stmt) {
                debug!(
                    tensor = graph.name(removed.output),
                    "removed {} statement", removed.op
                );
            }
        }

        let live: Vec<StmtId> = graph.stmts().map(|(id, _)| id).collect();
        for &id in &live {
            for &from in self.replace.keys() {
                graph.replace_operand(id, from, self.resolve(from));
            }
        }
        for (&out, &same) in &self.sames {
            graph.replace_output(out, same);
        }

        for (&t, shape) in &self.changed_shapes {
            graph.tensor_mut(t).shape = shape.clone();
        }

        for op in &self.reshapes {
            let tensor = self.resolve(op.tensor);
            let dtype = graph.tensor(tensor).dtype;
            let base = graph.name(tensor).to_string();
            let fresh = graph.fresh_tensor(&base, dtype, op.stmt_shape.clone());
            match op.edge {
                ReshapeEdge::Input => {
                    graph.replace_operand(op.stmt, tensor, fresh);
                    graph.add_stmt("Reshape", [tensor], fresh, reshape_attrs(&op.stmt_shape))?;
                }
                ReshapeEdge::Output => {
                    graph.retarget_output(op.stmt, fresh)?;
                    graph.tensor_mut(tensor).shape = op.graph_shape.clone();
                    graph.add_stmt("Reshape", [fresh], tensor, reshape_attrs(&op.graph_shape))?;
                }
            }
        }

        let survivors: Vec<StmtId> = graph
            .stmts()
            .filter(|(_, s)| s.class() == OpClass::Transform && !s.is_pinned())
            .map(|(id, _)| id)
            .collect();
        for id in survivors {
            if let Some(stmt) = graph.stmt_mut(id) {
                stmt.attrs.insert(PINNED_ATTR.to_string(), AttrValue::Bool(true));
            }
        }
        Ok(())
    }
}

fn reshape_attrs(shape: &Shape) -> Attrs {
    let mut attrs = Attrs::new();
    if let Some(dims) = shape.static_dims() {
        attrs.insert("shape".to_string(), AttrValue::Ints(dims));
    }
    attrs.insert(PINNED_ATTR.to_string(), AttrValue::Bool(true));
    attrs
}

struct Analysis<'g> {
    graph: &'g Graph,
    visited: FxHashSet<TensorId>,
    result: ElimResult,
}

impl Analysis<'_> {
    fn shape_of(&self, t: TensorId) -> Shape {
        self.result
            .changed_shapes
            .get(&t)
            .cloned()
            .unwrap_or_else(|| self.graph.shape(t).clone())
    }

    fn changed(&self, t: TensorId) -> bool {
        self.result.changed_shapes.contains_key(&t)
    }

    fn collect_reshape(&mut self, op: ReshapeOp) {
        if let Some(existing) = self
            .result
            .reshapes
            .iter_mut()
            .find(|r| r.stmt == op.stmt && r.tensor == op.tensor && r.edge == op.edge)
        {
            *existing = op;
        } else {
            self.result.reshapes.push(op);
        }
    }

    /// An elementwise statement may run on a new shape only when every
    /// operand already matches its output or is the scalar `[1]`.
    fn can_change_elem(&self, stmt: StmtId) -> bool {
        let Some(s) = self.graph.stmt(stmt) else {
            return false;
        };
        let out = self.graph.shape(s.output);
        s.inputs.iter().all(|&t| {
            let shape = self.graph.shape(t);
            shape == out || shape.is_one()
        })
    }

    fn run(&mut self) {
        loop {
            let settled = self.visited.len();
            for &output in self.graph.outputs() {
                self.visit(output);
            }
            if settled == self.visited.len() {
                break;
            }
        }
        for &stmt in &self.result.removed {
            if let Some(s) = self.graph.stmt(stmt) {
                if self.graph.is_output(s.output) {
                    let same = self.result.resolve(s.output);
                    self.result.sames.insert(s.output, same);
                }
            }
        }
    }

    fn visit(&mut self, output: TensorId) {
        let graph = self.graph;
        let Some(stmt_id) = graph.producer(output) else {
            return;
        };
        let Some(stmt) = graph.stmt(stmt_id) else {
            return;
        };
        match stmt.class() {
            OpClass::Transform if !stmt.is_pinned() => self.visit_transform(stmt_id, output),
            OpClass::Elementwise if self.can_change_elem(stmt_id) => {
                self.visit_elemwise(stmt_id, output);
            }
            _ => self.visit_other(stmt_id, output),
        }
        for input in stmt.unique_inputs() {
            self.visit(input);
        }
    }

    fn visit_transform(&mut self, stmt: StmtId, output: TensorId) {
        let Some(&input) = self.graph.stmt(stmt).and_then(|s| s.inputs.first()) else {
            return;
        };
        if self.graph.is_output(output) && self.graph.is_input(input) {
            return;
        }
        let input_shape = self.shape_of(input);
        let output_shape = self.shape_of(output);
        if self.visited.contains(&input) && input_shape != output_shape {
            return;
        }
        self.result.replace.insert(output, input);
        for target in self.result.replace.values_mut() {
            if *target == output {
                *target = input;
            }
        }
        self.result.changed_shapes.insert(input, output_shape);
        self.result.removed.insert(stmt);
        self.visited.insert(output);
        self.visited.insert(input);
    }

    fn visit_elemwise(&mut self, stmt: StmtId, output: TensorId) {
        let output_changed = self.changed(output);
        let output_shape = self.shape_of(output);
        let inputs = self
            .graph
            .stmt(stmt)
            .map(crate::Stmt::unique_inputs)
            .unwrap_or_default();
        for input in inputs {
            if !self.visited.contains(&input) {
                if output_changed {
                    self.result
                        .changed_shapes
                        .insert(input, output_shape.clone());
                    self.visited.insert(input);
                }
            } else {
                let input_shape = self.shape_of(input);
                if input_shape != output_shape && !input_shape.is_one() {
                    info!(tensor = self.graph.name(input), "elementwise edge needs reshape");
                    self.collect_reshape(ReshapeOp {
                        stmt,
                        tensor: input,
                        edge: ReshapeEdge::Input,
                        stmt_shape: output_shape.clone(),
                        graph_shape: input_shape,
                    });
                }
            }
        }
    }

    fn visit_other(&mut self, stmt: StmtId, output: TensorId) {
        let graph = self.graph;
        let Some(s) = graph.stmt(stmt) else {
            return;
        };
        let output_shape = self.shape_of(output);
        self.visited.insert(output);
        if self.changed(output) {
            info!(tensor = self.graph.name(output), "output edge needs reshape");
            self.collect_reshape(ReshapeOp {
                stmt,
                tensor: output,
                edge: ReshapeEdge::Output,
                stmt_shape: self.graph.shape(output).clone(),
                graph_shape: output_shape.clone(),
            });
        }
        // An all-reduce accepts its input in any shape.
        if s.class() == OpClass::Reduce && output_shape.is_one() {
            return;
        }
        for input in s.unique_inputs() {
            if let Some(changed) = self.result.changed_shapes.get(&input).cloned() {
                info!(tensor = self.graph.name(input), "input edge needs reshape");
                self.collect_reshape(ReshapeOp {
                    stmt,
                    tensor: input,
                    edge: ReshapeEdge::Input,
                    stmt_shape: self.graph.shape(input).clone(),
                    graph_shape: changed,
                });
            }
        }
    }
}

/// Plans the removal of transform statements.
#[must_use]
pub fn analyze(graph: &Graph) -> ElimResult {
    let mut analysis = Analysis {
        graph,
        visited: FxHashSet::default(),
        result: ElimResult::default(),
    };
    analysis.run();
    debug!(
        removed = analysis.result.removed.len(),
        reshapes = analysis.result.reshapes.len(),
        "transform elimination planned"
    );
    analysis.result
}

/// Plans and applies transform elimination, returning the plan.
///
/// # Errors
///
/// Propagates graph errors from reshape materialization.
pub fn eliminate_transforms(graph: &mut Graph) -> GraphResult<ElimResult> {
    let result = analyze(graph);
    result.apply(graph)?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DType;

    fn tensor(g: &mut Graph, name: &str, dims: &[i64]) -> TensorId {
        g.add_tensor(name, DType::Float32, Shape::from_static(dims.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_replace_chain_retargets() {
        // b = Reshape(a); c = Reshape(b); d = Exp(c)
        let mut g = Graph::new();
        let a = tensor(&mut g, "a", &[2, 6]);
        let b = tensor(&mut g, "b", &[3, 4]);
        let c = tensor(&mut g, "c", &[12]);
        let d = tensor(&mut g, "d", &[12]);
        g.mark_input(a);
        g.mark_output(d);
        g.add_stmt("Reshape", [a], b, Attrs::new()).unwrap();
        g.add_stmt("Reshape", [b], c, Attrs::new()).unwrap();
        g.add_stmt("Exp", [c], d, Attrs::new()).unwrap();

        let plan = analyze(&g);
        assert_eq!(plan.removed.len(), 2);
        assert_eq!(plan.replace[&c], a);
        assert_eq!(plan.replace[&b], a);
        assert!(plan.reshapes.is_empty());
    }

    #[test]
    fn test_pinned_transform_is_kept() {
        let mut g = Graph::new();
        let a = tensor(&mut g, "a", &[3, 4]);
        let t = tensor(&mut g, "t", &[12]);
        let b = tensor(&mut g, "b", &[12]);
        g.mark_input(a);
        g.mark_output(b);
        let mut attrs = Attrs::new();
        attrs.insert(PINNED_ATTR.to_string(), AttrValue::Bool(true));
        g.add_stmt("Reshape", [a], t, attrs).unwrap();
        g.add_stmt("Exp", [t], b, Attrs::new()).unwrap();
        assert!(analyze(&g).is_noop());
    }

    #[test]
    fn test_broadcast_elemwise_keeps_view() {
        // Add(t, x) broadcasts and cannot change shape, but `a` simply takes
        // over t's shape so no reshape is needed.
        let mut g = Graph::new();
        let a = tensor(&mut g, "a", &[3, 4]);
        let x = tensor(&mut g, "x", &[3, 12]);
        let t = tensor(&mut g, "t", &[12]);
        let c = tensor(&mut g, "c", &[3, 12]);
        g.mark_input(a);
        g.mark_input(x);
        g.mark_output(c);
        g.add_stmt("Reshape", [a], t, Attrs::new()).unwrap();
        g.add_stmt("Add", [t, x], c, Attrs::new()).unwrap();

        let plan = analyze(&g);
        assert_eq!(plan.replace.get(&t), Some(&a));
        assert_eq!(plan.changed_shapes[&a], Shape::from_static([12]));
        assert!(plan.sames.is_empty());
        assert!(plan.reshapes.is_empty());
    }
}
