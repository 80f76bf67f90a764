//! Tensor access relations.

use crate::aff::IndexExpr;
use crate::set::BoxSet;
use std::fmt;

/// Whether a reference reads or writes its tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AccessKind {
    /// The statement reads the tensor.
    Read,
    /// The statement writes the tensor.
    Write,
}

impl AccessKind {
    /// Lowercase name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

/// One reference: a map from statement iterations to tensor indices.
///
/// `index[d]` gives tensor dimension `d` as an expression over the
/// statement's iteration variables.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AccessMap {
    /// Accessed tensor.
    pub tensor: String,
    /// Read or write.
    pub kind: AccessKind,
    /// One expression per tensor dimension.
    pub index: Vec<IndexExpr>,
}

impl AccessMap {
    /// Creates a reference.
    #[must_use]
    pub fn new(tensor: impl Into<String>, kind: AccessKind, index: Vec<IndexExpr>) -> Self {
        Self {
            tensor: tensor.into(),
            kind,
            index,
        }
    }

    /// The identity reference `tensor[x₀, …, xₙ₋₁]` over `n` variables.
    #[must_use]
    pub fn identity(tensor: impl Into<String>, kind: AccessKind, n: usize) -> Self {
        Self::new(tensor, kind, (0..n).map(|i| IndexExpr::var(n, i)).collect())
    }

    /// Tensor rank.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.index.len()
    }

    /// Returns true for reads.
    #[must_use]
    pub fn is_read(&self) -> bool {
        self.kind == AccessKind::Read
    }

    /// Returns true for writes.
    #[must_use]
    pub fn is_write(&self) -> bool {
        self.kind == AccessKind::Write
    }

    /// Post-composes with `remap`, where `remap[k]` is new dimension `k`
    /// expressed over the old tensor dimensions.
    #[must_use]
    pub fn then(&self, remap: &[IndexExpr]) -> Self {
        Self {
            tensor: self.tensor.clone(),
            kind: self.kind,
            index: remap.iter().map(|e| e.compose(&self.index)).collect(),
        }
    }

    /// Index of the accessed element at iteration `point`.
    #[must_use]
    pub fn eval(&self, point: &[i64]) -> Option<Vec<i64>> {
        self.index.iter().map(|e| e.eval(point)).collect()
    }

    /// Per-dimension inclusive `(min, max)` of the accessed indices over
    /// `domain`, or `None` for unbounded dimensions.
    #[must_use]
    pub fn range_hull(&self, domain: &BoxSet) -> Vec<Option<(i64, i64)>> {
        let ranges: Vec<_> = (0..domain.rank())
            .map(|i| crate::aff::VarRange::constant(0, domain.lower(i), domain.extent(i)))
            .collect();
        self.index
            .iter()
            .map(|e| {
                e.span(&ranges)
                    .map(|s| (s.lo.constant_term(), s.lo.constant_term() + s.span))
            })
            .collect()
    }

    /// Formats against `domain`'s variable names.
    #[must_use]
    pub fn display<'a>(&'a self, domain: &'a BoxSet) -> AccessDisplay<'a> {
        AccessDisplay {
            access: self,
            domain,
        }
    }
}

/// Display adapter returned by [`AccessMap::display`].
pub struct AccessDisplay<'a> {
    access: &'a AccessMap,
    domain: &'a BoxSet,
}

impl fmt::Display for AccessDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self.domain.names();
        write!(f, "{{ [{}] -> {}[", names.join(", "), self.access.tensor)?;
        for (d, e) in self.access.index.iter().enumerate() {
            if d > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", e.display(names))?;
        }
        write!(f, "] : {} }}", self.domain.constraints())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aff::Aff;

    #[test]
    fn test_range_hull() {
        let domain = BoxSet::from_extents(["i", "j"], [8, 8]);
        let access = AccessMap::new(
            "A",
            AccessKind::Read,
            vec![
                IndexExpr::var(2, 0),
                IndexExpr::from(Aff::var(2, 0) + Aff::var(2, 1)),
            ],
        );
        assert_eq!(access.range_hull(&domain), vec![Some((0, 7)), Some((0, 14))]);
        assert_eq!(
            access.display(&domain).to_string(),
            "{ [i, j] -> A[i, i + j] : 0 <= i < 8 and 0 <= j < 8 }"
        );
    }

    #[test]
    fn test_then_swaps_dims() {
        let access = AccessMap::identity("B", AccessKind::Write, 2);
        let swapped = access.then(&[IndexExpr::var(2, 1), IndexExpr::var(2, 0)]);
        assert_eq!(swapped.eval(&[3, 5]), Some(vec![5, 3]));
        assert!(swapped.is_write());
    }
}
