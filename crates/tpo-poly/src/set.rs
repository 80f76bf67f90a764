//! Rectangular iteration domains.

use std::fmt;

/// A named box `{ [x₀, …] : lowerᵢ ≤ xᵢ < upperᵢ }`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct BoxSet {
    names: Vec<String>,
    lower: Vec<i64>,
    upper: Vec<i64>,
}

impl BoxSet {
    /// A box `0 ≤ xᵢ < extents[i]` with the given dimension names.
    #[must_use]
    pub fn from_extents<S: Into<String>>(
        names: impl IntoIterator<Item = S>,
        extents: impl IntoIterator<Item = i64>,
    ) -> Self {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let upper: Vec<i64> = extents.into_iter().collect();
        debug_assert_eq!(names.len(), upper.len());
        Self {
            lower: vec![0; upper.len()],
            names,
            upper,
        }
    }

    /// A box with explicit half-open bounds.
    #[must_use]
    pub fn from_bounds<S: Into<String>>(
        names: impl IntoIterator<Item = S>,
        bounds: impl IntoIterator<Item = (i64, i64)>,
    ) -> Self {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let (lower, upper) = bounds.into_iter().unzip();
        Self {
            names,
            lower,
            upper,
        }
    }

    /// Number of dimensions.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.names.len()
    }

    /// Dimension names.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Inclusive lower bound of dimension `i`.
    #[must_use]
    pub fn lower(&self, i: usize) -> i64 {
        self.lower.get(i).copied().unwrap_or(0)
    }

    /// Exclusive upper bound of dimension `i`.
    #[must_use]
    pub fn upper(&self, i: usize) -> i64 {
        self.upper.get(i).copied().unwrap_or(0)
    }

    /// Number of values of dimension `i`.
    #[must_use]
    pub fn extent(&self, i: usize) -> i64 {
        (self.upper(i) - self.lower(i)).max(0)
    }

    /// All extents.
    #[must_use]
    pub fn extents(&self) -> Vec<i64> {
        (0..self.rank()).map(|i| self.extent(i)).collect()
    }

    /// Inclusive lower bounds.
    #[must_use]
    pub fn lowers(&self) -> &[i64] {
        &self.lower
    }

    /// Inclusive upper bounds.
    #[must_use]
    pub fn last_points(&self) -> Vec<i64> {
        self.upper.iter().map(|u| u - 1).collect()
    }

    /// Returns true if some dimension has no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        (0..self.rank()).any(|i| self.extent(i) == 0)
    }

    /// Number of points.
    #[must_use]
    pub fn cardinality(&self) -> i64 {
        self.extents().iter().product()
    }

    /// Returns true if `point` lies inside.
    #[must_use]
    pub fn contains(&self, point: &[i64]) -> bool {
        point.len() == self.rank()
            && point
                .iter()
                .enumerate()
                .all(|(i, &x)| self.lower(i) <= x && x < self.upper(i))
    }

    /// Returns true if every point of `self` lies in `other`.
    #[must_use]
    pub fn is_subset(&self, other: &Self) -> bool {
        self.is_empty()
            || (self.rank() == other.rank()
                && (0..self.rank())
                    .all(|i| other.lower(i) <= self.lower(i) && self.upper(i) <= other.upper(i)))
    }

    /// Restricts dimension `i` to `[lo, hi)`.
    pub fn restrict(&mut self, i: usize, lo: i64, hi: i64) {
        if i < self.rank() {
            self.lower[i] = self.lower[i].max(lo);
            self.upper[i] = self.upper[i].min(hi);
        }
    }

    /// The bounds alone, without the tuple.
    #[must_use]
    pub fn constraints(&self) -> BoxConstraints<'_> {
        BoxConstraints(self)
    }
}

/// Display adapter returned by [`BoxSet::constraints`].
pub struct BoxConstraints<'a>(&'a BoxSet);

impl fmt::Display for BoxConstraints<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set = self.0;
        for i in 0..set.rank() {
            if i > 0 {
                write!(f, " and ")?;
            }
            write!(f, "{} <= {} < {}", set.lower(i), set.names[i], set.upper(i))?;
        }
        Ok(())
    }
}

impl fmt::Display for BoxSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] : {}", self.names.join(", "), self.constraints())
    }
}
