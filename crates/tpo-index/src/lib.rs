//! Typed indices and index-addressed vectors.
//!
//! Graph nodes, schedule-tree nodes and tiling axes all live in flat arenas
//! addressed by small integer newtypes. This crate provides the [`Idx`]
//! trait, the [`define_index!`] macro that generates such newtypes, and
//! [`IndexVec`], a `Vec` that can only be indexed by its own index type.
//!
//! ```
//! use tpo_index::{define_index, Idx, IndexVec};
//!
//! define_index! {
//!     /// Index into the node arena.
//!     pub struct NodeId;
//! }
//!
//! let mut nodes: IndexVec<NodeId, &str> = IndexVec::new();
//! let a = nodes.push("root");
//! assert_eq!(a.index(), 0);
//! assert_eq!(nodes[a], "root");
//! ```

#![warn(missing_docs)]

use std::fmt;
use std::marker::PhantomData;
use std::ops::{Index, IndexMut};

/// A type usable as a dense index.
pub trait Idx: Copy + Eq + std::hash::Hash + fmt::Debug + 'static {
    /// Creates an index from a raw `usize`.
    fn new(idx: usize) -> Self;

    /// Returns the raw `usize` value.
    fn index(self) -> usize;
}

impl Idx for usize {
    fn new(idx: usize) -> Self {
        idx
    }

    fn index(self) -> usize {
        self
    }
}

/// Defines one or more `u32` newtype indices implementing [`Idx`].
#[macro_export]
macro_rules! define_index {
    ($($(#[$attr:meta])* $vis:vis struct $name:ident;)*) => {
        $(
            $(#[$attr])*
            #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
            $vis struct $name(u32);

            impl $crate::Idx for $name {
                #[allow(clippy::cast_possible_truncation)]
                fn new(idx: usize) -> Self {
                    debug_assert!(idx <= u32::MAX as usize);
                    Self(idx as u32)
                }

                fn index(self) -> usize {
                    self.0 as usize
                }
            }

            impl ::std::fmt::Display for $name {
                fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        )*
    };
}

/// A vector indexed by a typed index.
#[derive(Clone, PartialEq, Eq)]
pub struct IndexVec<I: Idx, T> {
    raw: Vec<T>,
    _marker: PhantomData<fn(&I)>,
}

impl<I: Idx, T> IndexVec<I, T> {
    /// Creates an empty vector.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            raw: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Creates an empty vector with room for `capacity` elements.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            raw: Vec::with_capacity(capacity),
            _marker: PhantomData,
        }
    }

    /// Appends a value and returns its index.
    pub fn push(&mut self, value: T) -> I {
        let idx = I::new(self.raw.len());
        self.raw.push(value);
        idx
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Returns true if there are no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Returns the element at `idx`, if in bounds.
    #[must_use]
    pub fn get(&self, idx: I) -> Option<&T> {
        self.raw.get(idx.index())
    }

    /// Returns the element at `idx` mutably, if in bounds.
    pub fn get_mut(&mut self, idx: I) -> Option<&mut T> {
        self.raw.get_mut(idx.index())
    }

    /// The index the next `push` will return.
    #[must_use]
    pub fn next_index(&self) -> I {
        I::new(self.raw.len())
    }

    /// Iterates over the elements.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.raw.iter()
    }

    /// Iterates mutably over the elements.
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.raw.iter_mut()
    }

    /// Iterates over `(index, element)` pairs.
    pub fn iter_enumerated(&self) -> impl DoubleEndedIterator<Item = (I, &T)> + '_ {
        self.raw.iter().enumerate().map(|(i, t)| (I::new(i), t))
    }

    /// Iterates over all valid indices.
    pub fn indices(&self) -> impl DoubleEndedIterator<Item = I> + 'static {
        (0..self.raw.len()).map(I::new)
    }

    /// The underlying slice.
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        &self.raw
    }
}

impl<I: Idx, T> Default for IndexVec<I, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Idx, T: fmt::Debug> fmt::Debug for IndexVec<I, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.raw, f)
    }
}

impl<I: Idx, T> Index<I> for IndexVec<I, T> {
    type Output = T;

    fn index(&self, idx: I) -> &T {
        &self.raw[idx.index()]
    }
}

impl<I: Idx, T> IndexMut<I> for IndexVec<I, T> {
    fn index_mut(&mut self, idx: I) -> &mut T {
        &mut self.raw[idx.index()]
    }
}

impl<I: Idx, T> FromIterator<T> for IndexVec<I, T> {
    fn from_iter<It: IntoIterator<Item = T>>(iter: It) -> Self {
        Self {
            raw: iter.into_iter().collect(),
            _marker: PhantomData,
        }
    }
}

impl<'a, I: Idx, T> IntoIterator for &'a IndexVec<I, T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.raw.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    define_index! {
        /// Test index.
        struct TestId;
    }

    #[test]
    fn test_push_and_index() {
        let mut v: IndexVec<TestId, u64> = IndexVec::new();
        let a = v.push(10);
        let b = v.push(20);
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(v[b], 20);
        v[a] = 11;
        assert_eq!(v.get(a), Some(&11));
        assert_eq!(v.get(TestId::new(5)), None);
    }

    #[test]
    fn test_iter_enumerated() {
        let v: IndexVec<TestId, char> = "xyz".chars().collect();
        let pairs: Vec<_> = v.iter_enumerated().map(|(i, c)| (i.index(), *c)).collect();
        assert_eq!(pairs, vec![(0, 'x'), (1, 'y'), (2, 'z')]);
        assert_eq!(v.next_index(), TestId::new(3));
    }

    #[test]
    fn test_display() {
        assert_eq!(TestId::new(7).to_string(), "7");
    }
}
