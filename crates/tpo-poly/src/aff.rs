//! Affine and quasi-affine index expressions.
//!
//! An [`Aff`] is `c0 + Σ cᵢ·xᵢ` over a fixed-size variable space. An
//! [`IndexExpr`] extends it with floor division and modulo by constants,
//! which is all the remappers need. [`IndexExpr::span`] bounds an
//! expression when every variable ranges over `lower + [0, size)`.

use smallvec::SmallVec;
use std::fmt;
use std::ops::{Add, Mul, Neg, Sub};

/// Floor division rounding toward negative infinity.
#[must_use]
pub const fn div_floor(a: i64, b: i64) -> i64 {
    let q = a / b;
    if (a % b != 0) && ((a < 0) != (b < 0)) {
        q - 1
    } else {
        q
    }
}

/// Greatest common divisor of absolute values; `gcd(0, 0) = 0`.
#[must_use]
pub const fn gcd(a: i64, b: i64) -> i64 {
    let (mut a, mut b) = (a.abs(), b.abs());
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

// ============================================================================
// Affine expressions
// ============================================================================

/// An affine function of a fixed number of integer variables.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Aff {
    coeffs: SmallVec<[i64; 8]>,
    constant: i64,
}

impl Aff {
    /// The zero function over `n` variables.
    #[must_use]
    pub fn zero(n: usize) -> Self {
        Self::constant(n, 0)
    }

    /// The constant `c` over `n` variables.
    #[must_use]
    pub fn constant(n: usize, c: i64) -> Self {
        Self {
            coeffs: SmallVec::from_elem(0, n),
            constant: c,
        }
    }

    /// The variable `xᵢ` over `n` variables.
    #[must_use]
    pub fn var(n: usize, i: usize) -> Self {
        let mut aff = Self::zero(n.max(i + 1));
        aff.coeffs[i] = 1;
        aff
    }

    /// Builds `constant + Σ coeffs[i]·xᵢ`.
    #[must_use]
    pub fn from_parts(coeffs: impl IntoIterator<Item = i64>, constant: i64) -> Self {
        Self {
            coeffs: coeffs.into_iter().collect(),
            constant,
        }
    }

    /// Number of variables.
    #[must_use]
    pub fn dim(&self) -> usize {
        self.coeffs.len()
    }

    /// Coefficient of `xᵢ`; zero beyond the space.
    #[must_use]
    pub fn coeff(&self, i: usize) -> i64 {
        self.coeffs.get(i).copied().unwrap_or(0)
    }

    /// All coefficients.
    #[must_use]
    pub fn coeffs(&self) -> &[i64] {
        &self.coeffs
    }

    /// The constant term.
    #[must_use]
    pub fn constant_term(&self) -> i64 {
        self.constant
    }

    /// Sets the coefficient of `xᵢ`, growing the space if needed.
    pub fn set_coeff(&mut self, i: usize, c: i64) {
        if i >= self.coeffs.len() {
            self.coeffs.resize(i + 1, 0);
        }
        self.coeffs[i] = c;
    }

    /// Sets the constant term.
    pub fn set_constant(&mut self, c: i64) {
        self.constant = c;
    }

    /// Returns true if no variable has a non-zero coefficient.
    #[must_use]
    pub fn is_constant(&self) -> bool {
        self.coeffs.iter().all(|&c| c == 0)
    }

    /// Returns true if `xᵢ` has a non-zero coefficient.
    #[must_use]
    pub fn involves(&self, i: usize) -> bool {
        self.coeff(i) != 0
    }

    /// Non-zero `(variable, coefficient)` pairs in variable order.
    pub fn terms(&self) -> impl Iterator<Item = (usize, i64)> + '_ {
        self.coeffs
            .iter()
            .enumerate()
            .filter(|(_, &c)| c != 0)
            .map(|(i, &c)| (i, c))
    }

    /// The only variable with a non-zero coefficient, if there is exactly one.
    #[must_use]
    pub fn single_var(&self) -> Option<(usize, i64)> {
        let mut terms = self.terms();
        let first = terms.next()?;
        terms.next().is_none().then_some(first)
    }

    /// Re-embeds into a space of `n` variables, placing `x₀` at `offset`.
    #[must_use]
    pub fn embed(&self, offset: usize, n: usize) -> Self {
        let mut out = Self::constant(n, self.constant);
        for (i, c) in self.terms() {
            out.set_coeff(offset + i, c);
        }
        out
    }

    /// Evaluates at `point`; missing coordinates count as zero.
    #[must_use]
    pub fn eval(&self, point: &[i64]) -> i64 {
        self.terms()
            .map(|(i, c)| c * point.get(i).copied().unwrap_or(0))
            .sum::<i64>()
            + self.constant
    }

    /// Minimum and maximum over the box `lower[i] ≤ xᵢ ≤ upper[i]`.
    #[must_use]
    pub fn bounds(&self, lower: &[i64], upper: &[i64]) -> (i64, i64) {
        let mut lo = self.constant;
        let mut hi = self.constant;
        for (i, c) in self.terms() {
            let (l, u) = (
                lower.get(i).copied().unwrap_or(0),
                upper.get(i).copied().unwrap_or(0),
            );
            if c > 0 {
                lo += c * l;
                hi += c * u;
            } else {
                lo += c * u;
                hi += c * l;
            }
        }
        (lo, hi)
    }

    /// Returns true if every coefficient is a multiple of `d`.
    #[must_use]
    pub fn coeffs_divisible_by(&self, d: i64) -> bool {
        d != 0 && self.coeffs.iter().all(|&c| c % d == 0)
    }

    /// Formats with the given variable names.
    #[must_use]
    pub fn display<'a>(&'a self, names: &'a [String]) -> AffDisplay<'a> {
        AffDisplay { aff: self, names }
    }

    fn zip_with(self, rhs: Self, f: impl Fn(i64, i64) -> i64) -> Self {
        let n = self.dim().max(rhs.dim());
        let coeffs = (0..n).map(|i| f(self.coeff(i), rhs.coeff(i))).collect();
        Self {
            coeffs,
            constant: f(self.constant, rhs.constant),
        }
    }
}

impl Add for Aff {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        self.zip_with(rhs, |a, b| a + b)
    }
}

impl Sub for Aff {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        self.zip_with(rhs, |a, b| a - b)
    }
}

impl Neg for Aff {
    type Output = Self;

    fn neg(self) -> Self {
        self * -1
    }
}

impl Mul<i64> for Aff {
    type Output = Self;

    fn mul(mut self, k: i64) -> Self {
        for c in &mut self.coeffs {
            *c *= k;
        }
        self.constant *= k;
        self
    }
}

/// Display adapter returned by [`Aff::display`].
pub struct AffDisplay<'a> {
    aff: &'a Aff,
    names: &'a [String],
}

impl fmt::Display for AffDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (i, c) in self.aff.terms() {
            let fallback;
            let name = match self.names.get(i) {
                Some(n) => n.as_str(),
                None => {
                    fallback = format!("x{i}");
                    fallback.as_str()
                }
            };
            let (sign, mag) = if c < 0 { ("-", -c) } else { ("+", c) };
            if first {
                if c < 0 {
                    write!(f, "-")?;
                }
            } else {
                write!(f, " {sign} ")?;
            }
            if mag == 1 {
                write!(f, "{name}")?;
            } else {
                write!(f, "{mag}*{name}")?;
            }
            first = false;
        }
        let k = self.aff.constant;
        if first {
            write!(f, "{k}")
        } else if k > 0 {
            write!(f, " + {k}")
        } else if k < 0 {
            write!(f, " - {}", -k)
        } else {
            Ok(())
        }
    }
}

// ============================================================================
// Quasi-affine expressions
// ============================================================================

/// A quasi-affine index expression.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum IndexExpr {
    /// An affine function.
    Aff(Aff),
    /// Sum of two expressions.
    Add(Box<IndexExpr>, Box<IndexExpr>),
    /// Expression times a constant.
    Scale(Box<IndexExpr>, i64),
    /// `floor(e / d)` with `d > 0`.
    FloorDiv(Box<IndexExpr>, i64),
    /// `e mod d` with `d > 0`, always non-negative.
    Mod(Box<IndexExpr>, i64),
    /// An index with no usable bound, e.g. data-dependent.
    Any,
}

impl From<Aff> for IndexExpr {
    fn from(aff: Aff) -> Self {
        Self::Aff(aff)
    }
}

/// Value range `lo + [0, span]`, with `lo` affine in an outer space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Span {
    /// Smallest value.
    pub lo: Aff,
    /// Distance from smallest to largest value.
    pub span: i64,
}

/// Range of one variable: `lower + [0, size)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VarRange {
    /// Smallest value, affine in an outer space.
    pub lower: Aff,
    /// Number of values; at least 1.
    pub size: i64,
}

impl VarRange {
    /// The constant range `[lo, lo + size)` in an outer space of `n` variables.
    #[must_use]
    pub fn constant(n: usize, lo: i64, size: i64) -> Self {
        Self {
            lower: Aff::constant(n, lo),
            size,
        }
    }

    /// The single point `x_var` of the outer space.
    #[must_use]
    pub fn point(n: usize, var: usize) -> Self {
        Self {
            lower: Aff::var(n, var),
            size: 1,
        }
    }
}

impl IndexExpr {
    /// The variable `xᵢ` over `n` variables.
    #[must_use]
    pub fn var(n: usize, i: usize) -> Self {
        Self::Aff(Aff::var(n, i))
    }

    /// The constant `c`.
    #[must_use]
    pub fn constant(n: usize, c: i64) -> Self {
        Self::Aff(Aff::constant(n, c))
    }

    /// `self + rhs`, folding affine operands.
    #[must_use]
    pub fn plus(self, rhs: Self) -> Self {
        match (self, rhs) {
            (Self::Aff(a), Self::Aff(b)) => Self::Aff(a + b),
            (Self::Any, _) | (_, Self::Any) => Self::Any,
            (a, b) => Self::Add(Box::new(a), Box::new(b)),
        }
    }

    /// `self + c`.
    #[must_use]
    pub fn offset(self, c: i64) -> Self {
        if c == 0 {
            return self;
        }
        match self {
            Self::Aff(mut a) => {
                a.set_constant(a.constant_term() + c);
                Self::Aff(a)
            }
            other => {
                let n = other.dim();
                other.plus(Self::constant(n, c))
            }
        }
    }

    /// `self · k`, folding affine operands.
    #[must_use]
    pub fn scale(self, k: i64) -> Self {
        match self {
            Self::Aff(a) => Self::Aff(a * k),
            Self::Any => Self::Any,
            _ if k == 1 => self,
            e => Self::Scale(Box::new(e), k),
        }
    }

    /// `floor(self / d)`.
    #[must_use]
    pub fn floor_div(self, d: i64) -> Self {
        debug_assert!(d > 0);
        match self {
            _ if d == 1 => self,
            Self::Aff(a) if a.coeffs_divisible_by(d) && a.constant_term() % d == 0 => {
                let coeffs: Vec<i64> = a.coeffs().iter().map(|c| c / d).collect();
                Self::Aff(Aff::from_parts(coeffs, a.constant_term() / d))
            }
            Self::Any => Self::Any,
            e => Self::FloorDiv(Box::new(e), d),
        }
    }

    /// `self mod d`.
    #[must_use]
    pub fn modulo(self, d: i64) -> Self {
        debug_assert!(d > 0);
        match self {
            Self::Any => Self::Any,
            e if d == 1 => Self::constant(e.dim(), 0),
            e => Self::Mod(Box::new(e), d),
        }
    }

    /// The affine function, if this expression is affine.
    #[must_use]
    pub fn as_aff(&self) -> Option<&Aff> {
        match self {
            Self::Aff(a) => Some(a),
            _ => None,
        }
    }

    /// Size of the variable space (largest seen).
    #[must_use]
    pub fn dim(&self) -> usize {
        match self {
            Self::Aff(a) => a.dim(),
            Self::Add(a, b) => a.dim().max(b.dim()),
            Self::Scale(e, _) | Self::FloorDiv(e, _) | Self::Mod(e, _) => e.dim(),
            Self::Any => 0,
        }
    }

    /// Returns true if `xᵢ` occurs.
    #[must_use]
    pub fn involves(&self, i: usize) -> bool {
        match self {
            Self::Aff(a) => a.involves(i),
            Self::Add(a, b) => a.involves(i) || b.involves(i),
            Self::Scale(e, _) | Self::FloorDiv(e, _) | Self::Mod(e, _) => e.involves(i),
            Self::Any => false,
        }
    }

    /// Evaluates at `point`; `None` for [`IndexExpr::Any`].
    #[must_use]
    pub fn eval(&self, point: &[i64]) -> Option<i64> {
        Some(match self {
            Self::Aff(a) => a.eval(point),
            Self::Add(a, b) => a.eval(point)? + b.eval(point)?,
            Self::Scale(e, k) => e.eval(point)? * k,
            Self::FloorDiv(e, d) => div_floor(e.eval(point)?, *d),
            Self::Mod(e, d) => e.eval(point)?.rem_euclid(*d),
            Self::Any => return None,
        })
    }

    /// Substitutes `xᵢ := subst[i]`.
    #[must_use]
    pub fn compose(&self, subst: &[IndexExpr]) -> Self {
        let n = subst.iter().map(Self::dim).max().unwrap_or(0);
        match self {
            Self::Aff(a) => a.terms().fold(Self::constant(n, a.constant_term()), |acc, (i, c)| {
                let term = subst.get(i).cloned().unwrap_or(Self::Any);
                acc.plus(term.scale(c))
            }),
            Self::Add(a, b) => a.compose(subst).plus(b.compose(subst)),
            Self::Scale(e, k) => e.compose(subst).scale(*k),
            Self::FloorDiv(e, d) => e.compose(subst).floor_div(*d),
            Self::Mod(e, d) => e.compose(subst).modulo(*d),
            Self::Any => Self::Any,
        }
    }

    /// Bounds the expression when `xᵢ` ranges over `ranges[i]`.
    ///
    /// Returns `None` when no affine lower bound exists, which happens for
    /// [`IndexExpr::Any`] and for floor divisions of outer variables that
    /// the divisor does not divide.
    #[must_use]
    pub fn span(&self, ranges: &[VarRange]) -> Option<Span> {
        match self {
            Self::Aff(a) => {
                let n = ranges.first().map_or(0, |r| r.lower.dim());
                let mut lo = Aff::constant(n, a.constant_term());
                let mut span = 0;
                for (i, c) in a.terms() {
                    let range = ranges.get(i)?;
                    let extra = range.size - 1;
                    lo = lo + range.lower.clone() * c;
                    if c < 0 {
                        lo.set_constant(lo.constant_term() + c * extra);
                    }
                    span += c.abs() * extra;
                }
                Some(Span { lo, span })
            }
            Self::Add(a, b) => {
                let (a, b) = (a.span(ranges)?, b.span(ranges)?);
                Some(Span {
                    lo: a.lo + b.lo,
                    span: a.span + b.span,
                })
            }
            Self::Scale(e, k) => {
                let s = e.span(ranges)?;
                let mut lo = s.lo * *k;
                if *k < 0 {
                    lo.set_constant(lo.constant_term() + k * s.span);
                }
                Some(Span {
                    lo,
                    span: k.abs() * s.span,
                })
            }
            Self::FloorDiv(e, d) => {
                let s = e.span(ranges)?;
                if !s.lo.coeffs_divisible_by(*d) {
                    return None;
                }
                let c = s.lo.constant_term();
                let coeffs: Vec<i64> = s.lo.coeffs().iter().map(|x| x / d).collect();
                Some(Span {
                    lo: Aff::from_parts(coeffs, div_floor(c, *d)),
                    span: div_floor(c + s.span, *d) - div_floor(c, *d),
                })
            }
            Self::Mod(e, d) => {
                let s = e.span(ranges);
                let n = ranges.first().map_or(0, |r| r.lower.dim());
                let full = Span {
                    lo: Aff::zero(n),
                    span: d - 1,
                };
                let Some(s) = s else {
                    return Some(full);
                };
                if !s.lo.coeffs_divisible_by(*d) {
                    return Some(full);
                }
                let c = s.lo.constant_term();
                if div_floor(c, *d) == div_floor(c + s.span, *d) {
                    Some(Span {
                        lo: Aff::constant(n, c.rem_euclid(*d)),
                        span: s.span,
                    })
                } else {
                    Some(full)
                }
            }
            Self::Any => None,
        }
    }

    /// Formats with the given variable names.
    #[must_use]
    pub fn display<'a>(&'a self, names: &'a [String]) -> ExprDisplay<'a> {
        ExprDisplay { expr: self, names }
    }
}

/// Display adapter returned by [`IndexExpr::display`].
pub struct ExprDisplay<'a> {
    expr: &'a IndexExpr,
    names: &'a [String],
}

impl fmt::Display for ExprDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self.names;
        match self.expr {
            IndexExpr::Aff(a) => write!(f, "{}", a.display(names)),
            IndexExpr::Add(a, b) => write!(f, "{} + {}", a.display(names), b.display(names)),
            IndexExpr::Scale(e, k) => write!(f, "{k}*({})", e.display(names)),
            IndexExpr::FloorDiv(e, d) => write!(f, "floor(({})/{d})", e.display(names)),
            IndexExpr::Mod(e, d) => write!(f, "({}) mod {d}", e.display(names)),
            IndexExpr::Any => write!(f, "?"),
        }
    }
}
