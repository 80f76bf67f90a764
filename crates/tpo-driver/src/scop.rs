//! Building the initial schedule tree of a graph.
//!
//! Every live statement becomes one compute statement `S_k`, in dependency
//! order. Its iteration domain is the box of its output shape; reductions
//! iterate over the input shape instead and matrix multiplications add the
//! contracted dimension. The tree is `Domain → Sequence → Filter(S_k) →
//! Band`, one permutable identity band per statement.

use crate::{OptimizeError, OptimizeResult};
use tpo_footprint::{TensorInfo, TensorTable};
use tpo_graph::{AttrValue, Graph, OpClass, Stmt, StmtId};
use tpo_index::Idx;
use tpo_poly::{AccessKind, AccessMap, Band, BoxSet, IndexExpr, ScheduleTree, StmtIdx, StmtInfo};
use tpo_tiling::analyze::{CONV_AXES, GEMM_AXES};
use tracing::{debug, instrument};

/// The polyhedral view of a kernel.
#[derive(Clone, Debug)]
pub struct Scop {
    /// The schedule tree.
    pub tree: ScheduleTree,
    /// Declared shape and element size of every tensor.
    pub tensors: TensorTable,
    /// Graph statement behind each schedule statement.
    pub origins: Vec<StmtId>,
}

impl Scop {
    /// Builds the scop of `graph`.
    ///
    /// # Errors
    ///
    /// Fails on cyclic graphs and on tensors with symbolic extents.
    #[instrument(skip_all, fields(stmts = graph.num_stmts()))]
    pub fn from_graph(graph: &Graph) -> OptimizeResult<Self> {
        let mut tensors = TensorTable::default();
        for (_, t) in graph.tensors() {
            let dims = t
                .shape
                .static_dims()
                .ok_or_else(|| OptimizeError::DynamicShape(t.name.clone()))?;
            let elem = u64::try_from(t.dtype.size_bytes()).unwrap_or(4);
            tensors.insert(t.name.clone(), TensorInfo::new(dims, elem));
        }

        let order = graph.topo_order()?;
        let mut stmts = Vec::with_capacity(order.len());
        for (k, &id) in order.iter().enumerate() {
            let Some(stmt) = graph.stmt(id) else {
                continue;
            };
            stmts.push(build_stmt(graph, &tensors, format!("S_{k}"), stmt));
        }
        let ranks: Vec<usize> = stmts.iter().map(|s| s.domain.rank()).collect();

        let mut tree = ScheduleTree::new(stmts);
        let leaf = tree.child(tree.root(), 0)?;
        if !ranks.is_empty() {
            let seq = tree.insert_sequence(leaf, (0..ranks.len()).map(|k| vec![StmtIdx::new(k)]).collect())?;
            let filters = tree.children(seq).to_vec();
            for (k, filter) in filters.into_iter().enumerate() {
                let body = tree.child(filter, 0)?;
                tree.insert_partial_schedule(body, Band::identity(StmtIdx::new(k), ranks[k]));
            }
        }
        debug!(stmts = ranks.len(), tensors = tensors.len(), "scop built");
        Ok(Self {
            tree,
            tensors,
            origins: order,
        })
    }
}

fn shape_of(tensors: &TensorTable, name: &str) -> Vec<i64> {
    let shape = tensors.get(name).map(|t| t.shape.clone()).unwrap_or_default();
    if shape.is_empty() {
        vec![1]
    } else {
        shape
    }
}

fn var_names(prefix: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{prefix}{i}")).collect()
}

fn build_stmt(graph: &Graph, tensors: &TensorTable, name: String, stmt: &Stmt) -> StmtInfo {
    let out_name = graph.name(stmt.output);
    let out = shape_of(tensors, out_name);
    let inputs: Vec<(&str, Vec<i64>)> = stmt
        .inputs
        .iter()
        .map(|&t| {
            let n = graph.name(t);
            (n, shape_of(tensors, n))
        })
        .collect();

    match (stmt.class(), stmt.op.as_str()) {
        (OpClass::Reduce, _) => reduce_stmt(name, stmt, out_name, &out, &inputs),
        (_, "Matmul" | "BatchMatMul") => matmul_stmt(name, stmt, out_name, &out, &inputs),
        (_, "Transpose") => transpose_stmt(name, stmt, out_name, &out, &inputs),
        (_, "Reshape" | "ExpandDims" | "Squeeze" | "Flatten") => reshape_stmt(name, stmt, out_name, &out, &inputs),
        _ => {
            let n = out.len();
            let names = if stmt.op == "Conv" && n == 5 {
                CONV_AXES[..5].iter().map(|s| (*s).to_string()).collect()
            } else {
                var_names("i", n)
            };
            let mut accesses: Vec<AccessMap> = inputs
                .iter()
                .map(|(t, shape)| AccessMap::new(*t, AccessKind::Read, broadcast_index(shape, &out)))
                .collect();
            accesses.push(AccessMap::identity(out_name, AccessKind::Write, n));
            StmtInfo::compute(name, stmt.op.clone(), BoxSet::from_extents(names, out.iter().copied()), accesses)
        }
    }
}

/// Index of an operand of `shape` read by an iteration over `out`, aligned
/// on the innermost dimension; unit dimensions broadcast.
fn broadcast_index(shape: &[i64], out: &[i64]) -> Vec<IndexExpr> {
    let n = out.len();
    let skip = shape.len().saturating_sub(n);
    shape
        .iter()
        .enumerate()
        .map(|(j, &extent)| {
            if j < skip {
                return IndexExpr::constant(n, 0);
            }
            let d = n - (shape.len() - j);
            if extent == 1 && out[d] != 1 {
                IndexExpr::constant(n, 0)
            } else {
                IndexExpr::var(n, d)
            }
        })
        .collect()
}

fn reduce_stmt(name: String, stmt: &Stmt, out_name: &str, out: &[i64], inputs: &[(&str, Vec<i64>)]) -> StmtInfo {
    let Some((src, shape)) = inputs.first() else {
        return StmtInfo::compute(name, stmt.op.clone(), BoxSet::from_extents(var_names("i", out.len()), out.iter().copied()), Vec::new());
    };
    let n = shape.len();
    let axes: Vec<usize> = stmt.attr_ints("axis").map_or_else(
        || (0..n).collect(),
        |a| a.into_iter().filter_map(|v| usize::try_from(v).ok()).collect(),
    );
    let keep_dims = out.len() == n;
    let mut write = Vec::new();
    for d in 0..n {
        if !axes.contains(&d) {
            write.push(IndexExpr::var(n, d));
        } else if keep_dims {
            write.push(IndexExpr::constant(n, 0));
        }
    }
    if write.is_empty() {
        write.push(IndexExpr::constant(n, 0));
    }
    let accesses = vec![
        AccessMap::identity(*src, AccessKind::Read, n),
        AccessMap::new(out_name, AccessKind::Write, write),
    ];
    StmtInfo::compute(name, stmt.op.clone(), BoxSet::from_extents(var_names("i", n), shape.iter().copied()), accesses)
}

fn flag(stmt: &Stmt, key: &str) -> bool {
    matches!(stmt.attrs.get(key), Some(AttrValue::Bool(true)))
}

/// `C[.., m, n] = A[.., m, k] · B[.., k, n]` over `(.., m, n, k)`.
fn matmul_stmt(name: String, stmt: &Stmt, out_name: &str, out: &[i64], inputs: &[(&str, Vec<i64>)]) -> StmtInfo {
    let r = out.len().max(2);
    let n = r + 1;
    let (m_var, n_var, k_var) = (r - 2, r - 1, r);
    let a_shape = inputs.first().map(|(_, s)| s.clone()).unwrap_or_default();
    let k_extent = if flag(stmt, "transpose_a") {
        a_shape.iter().rev().nth(1).copied()
    } else {
        a_shape.last().copied()
    }
    .unwrap_or(1);

    let operand = |shape: &[i64], inner: [usize; 2], transposed: bool| -> Vec<IndexExpr> {
        let batch = shape.len().saturating_sub(2);
        let mut index: Vec<IndexExpr> = broadcast_index(&shape[..batch], &out[..r - 2]);
        for e in &mut index {
            if let IndexExpr::Aff(a) = e {
                *e = IndexExpr::Aff(a.embed(0, n));
            }
        }
        let [x, y] = if transposed { [inner[1], inner[0]] } else { inner };
        index.push(IndexExpr::var(n, x));
        index.push(IndexExpr::var(n, y));
        index
    };

    let mut accesses = Vec::new();
    if let Some((a, shape)) = inputs.first() {
        accesses.push(AccessMap::new(*a, AccessKind::Read, operand(shape, [m_var, k_var], flag(stmt, "transpose_a"))));
    }
    if let Some((b, shape)) = inputs.get(1) {
        accesses.push(AccessMap::new(*b, AccessKind::Read, operand(shape, [k_var, n_var], flag(stmt, "transpose_b"))));
    }
    accesses.push(AccessMap::new(
        out_name,
        AccessKind::Write,
        (0..r).map(|d| IndexExpr::var(n, d)).collect(),
    ));

    let mut names = var_names("b", r - 2);
    names.extend([GEMM_AXES[4], GEMM_AXES[5], GEMM_AXES[7]].map(str::to_string));
    let extents = out[..r].iter().copied().chain([k_extent]);
    StmtInfo::compute(name, stmt.op.clone(), BoxSet::from_extents(names, extents), accesses)
}

/// `out[i] = in[perm⁻¹(i)]`, reading `in[j]` at the output variable `i`
/// with `perm[i] = j`.
fn transpose_stmt(name: String, stmt: &Stmt, out_name: &str, out: &[i64], inputs: &[(&str, Vec<i64>)]) -> StmtInfo {
    let n = out.len();
    let perm: Vec<usize> = stmt
        .attr_ints("perm")
        .map(|p| p.into_iter().filter_map(|v| usize::try_from(v).ok()).collect())
        .filter(|p: &Vec<usize>| p.len() == n)
        .unwrap_or_else(|| (0..n).rev().collect());
    let mut accesses = Vec::new();
    if let Some((src, _)) = inputs.first() {
        let index = (0..n)
            .map(|j| {
                let i = perm.iter().position(|&p| p == j).unwrap_or(j);
                IndexExpr::var(n, i)
            })
            .collect();
        accesses.push(AccessMap::new(*src, AccessKind::Read, index));
    }
    accesses.push(AccessMap::identity(out_name, AccessKind::Write, n));
    StmtInfo::compute(name, stmt.op.clone(), BoxSet::from_extents(var_names("i", n), out.iter().copied()), accesses)
}

/// Row-major relinearization of the output index into the input shape.
fn reshape_stmt(name: String, stmt: &Stmt, out_name: &str, out: &[i64], inputs: &[(&str, Vec<i64>)]) -> StmtInfo {
    let n = out.len();
    let mut linear = IndexExpr::constant(n, 0);
    let mut stride = 1;
    for d in (0..n).rev() {
        linear = linear.plus(IndexExpr::var(n, d).scale(stride));
        stride *= out[d];
    }
    let mut accesses = Vec::new();
    if let Some((src, shape)) = inputs.first() {
        let mut index = Vec::with_capacity(shape.len());
        let mut inner = 1;
        for (j, &extent) in shape.iter().enumerate().rev() {
            let e = linear.clone().floor_div(inner);
            index.push(if j == 0 { e } else { e.modulo(extent.max(1)) });
            inner *= extent.max(1);
        }
        index.reverse();
        accesses.push(AccessMap::new(*src, AccessKind::Read, index));
    }
    accesses.push(AccessMap::identity(out_name, AccessKind::Write, n));
    StmtInfo::compute(name, stmt.op.clone(), BoxSet::from_extents(var_names("i", n), out.iter().copied()), accesses)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_index() {
        let index = broadcast_index(&[1, 8], &[4, 8]);
        assert_eq!(index, vec![IndexExpr::constant(2, 0), IndexExpr::var(2, 1)]);
        let index = broadcast_index(&[8], &[4, 8]);
        assert_eq!(index, vec![IndexExpr::var(2, 1)]);
    }
}
