//! Axis-attribute normalization.
//!
//! Rewrites every `axis` attribute to a list of non-negative indices,
//! resolving negative entries against the rank of the statement's first
//! operand. Running it twice changes nothing.

use crate::{AttrValue, Graph, StmtId};
use tracing::debug;

/// Normalizes one axis value against `rank`.
#[must_use]
pub fn normalize_axis(value: &AttrValue, rank: i64) -> Option<AttrValue> {
    match value {
        AttrValue::Int(v) => {
            let idx = if rank > 0 { (v + rank).rem_euclid(rank) } else { 0 };
            Some(AttrValue::Ints(vec![idx]))
        }
        AttrValue::Ints(list) => Some(AttrValue::Ints(
            list.iter()
                .map(|&v| if v >= 0 { v } else { v + rank })
                .collect(),
        )),
        _ => None,
    }
}

/// Normalizes the `axis` attribute of every statement in `graph`.
///
/// Returns the number of statements whose attribute changed.
pub fn normalize_axis_attrs(graph: &mut Graph) -> usize {
    let targets: Vec<(StmtId, i64)> = graph
        .stmts()
        .filter(|(_, s)| s.attrs.contains_key("axis"))
        .map(|(id, s)| {
            let rank = s
                .inputs
                .first()
                .map_or(0, |&t| graph.shape(t).rank());
            (id, i64::try_from(rank).unwrap_or(i64::MAX))
        })
        .collect();

    let mut changed = 0;
    for (id, rank) in targets {
        let Some(stmt) = graph.stmt_mut(id) else {
            continue;
        };
        let Some(old) = stmt.attrs.get("axis") else {
            continue;
        };
        if let Some(new) = normalize_axis(old, rank) {
            if &new != old {
                debug!(op = %stmt.op, old = %old, new = %new, "normalized axis");
                stmt.attrs.insert("axis".to_string(), new);
                changed += 1;
            }
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Attrs, DType, Shape};

    #[test]
    fn test_scalar_axis() {
        assert_eq!(
            normalize_axis(&AttrValue::Int(-1), 4),
            Some(AttrValue::Ints(vec![3]))
        );
        assert_eq!(
            normalize_axis(&AttrValue::Int(2), 4),
            Some(AttrValue::Ints(vec![2]))
        );
        assert_eq!(
            normalize_axis(&AttrValue::Int(-1), 0),
            Some(AttrValue::Ints(vec![0]))
        );
    }

    #[test]
    fn test_list_axis() {
        assert_eq!(
            normalize_axis(&AttrValue::Ints(vec![-1, 0, -3]), 3),
            Some(AttrValue::Ints(vec![2, 0, 0]))
        );
        assert_eq!(normalize_axis(&AttrValue::Str("x".into()), 3), None);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let mut g = Graph::new();
        let a = g
            .add_tensor("a", DType::Float32, Shape::from_static([2, 3, 4]))
            .unwrap();
        let b = g
            .add_tensor("b", DType::Float32, Shape::from_static([2, 3]))
            .unwrap();
        g.mark_input(a);
        let mut attrs = Attrs::new();
        attrs.insert("axis".into(), AttrValue::Int(-1));
        let s = g.add_stmt("ReduceSum", [a], b, attrs).unwrap();

        assert_eq!(normalize_axis_attrs(&mut g), 1);
        assert_eq!(g.stmt(s).unwrap().attr_ints("axis"), Some(vec![2]));
        assert_eq!(normalize_axis_attrs(&mut g), 0);
        assert_eq!(g.stmt(s).unwrap().attr_ints("axis"), Some(vec![2]));
    }
}
