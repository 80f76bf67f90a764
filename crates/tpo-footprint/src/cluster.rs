//! Clustering the references of one tensor.
//!
//! References are united in statement order. Two clusters share a box
//! when they only read or only write, when their box offsets are equal, or
//! when every dimension is accessed through the same single-variable
//! equality. Otherwise the dimensions that disagree are buffered with the
//! identity map, together with every dimension that depends on a later
//! scoped variable.

use crate::footprint::{FootprintBox, ScopedRef};
use crate::{FootprintError, FootprintResult};
use rustc_hash::FxHashMap;
use tpo_poly::{AccessKind, Aff};
use tracing::{debug, info, warn};

/// References of one tensor sharing a footprint box.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FootprintCluster {
    /// Tensor name.
    pub tensor: String,
    /// References, in statement order.
    pub refs: Vec<ScopedRef>,
    /// The shared box.
    pub footprint: FootprintBox,
}

impl FootprintCluster {
    /// A cluster holding one reference.
    ///
    /// # Errors
    ///
    /// Propagates rank mismatches from the box computation.
    pub fn single(r: ScopedRef) -> FootprintResult<Self> {
        let footprint = FootprintBox::of_refs(std::slice::from_ref(&r))?;
        Ok(Self {
            tensor: r.access.tensor.clone(),
            refs: vec![r],
            footprint,
        })
    }

    /// Clusters every reference of `tensor`, uniting interleaved reads and
    /// writes in statement order.
    ///
    /// # Errors
    ///
    /// Fails with [`FootprintError::EmptyCluster`] when `refs` is empty.
    pub fn build(tensor: &str, mut refs: Vec<ScopedRef>) -> FootprintResult<Self> {
        refs.sort_by_key(|r| (r.stmt, r.position));
        let mut iter = refs.into_iter();
        let Some(first) = iter.next() else {
            return Err(FootprintError::EmptyCluster {
                tensor: tensor.to_string(),
            });
        };
        let mut cluster = Self::single(first)?;
        for r in iter {
            cluster = Self::merge(cluster, Self::single(r)?)?;
        }
        debug!(
            tensor,
            refs = cluster.refs.len(),
            footprint = %cluster.footprint.describe(&cluster.space_names()),
            "clustered references"
        );
        Ok(cluster)
    }

    /// Unites two clusters of the same tensor.
    ///
    /// # Errors
    ///
    /// Propagates rank mismatches from the box computation.
    pub fn merge(a: Self, b: Self) -> FootprintResult<Self> {
        let offsets_equal = plain_equal(&a.footprint.offsets, &b.footprint.offsets);
        let sizes = (a.footprint.num_elements(), b.footprint.num_elements());
        let tensor = a.tensor;
        let mut refs = a.refs;
        refs.extend(b.refs);

        let only_one_kind = refs.iter().all(|r| r.kind() == AccessKind::Read)
            || refs.iter().all(|r| r.kind() == AccessKind::Write);
        let mut unmergeable = Vec::new();
        let mergeable = offsets_equal || equalities_agree(&refs, &mut unmergeable);

        let footprint = if only_one_kind || mergeable {
            let mut footprint = FootprintBox::of_refs(&refs)?;
            if only_one_kind && !mergeable {
                footprint.should_split = true;
            } else if only_one_kind {
                if let (Some(x), Some(y), Some(merged)) = (sizes.0, sizes.1, footprint.num_elements()) {
                    if x + y < merged {
                        warn!(tensor = %tensor, "two footprints are merged, resulting in a larger size");
                    }
                }
            }
            footprint
        } else {
            info!(
                tensor = %tensor,
                dims = ?unmergeable,
                "accesses in different tiles cannot merge"
            );
            recompute(&refs, &unmergeable)?
        };
        Ok(Self {
            tensor,
            refs,
            footprint,
        })
    }

    /// Returns true if some reference reads.
    #[must_use]
    pub fn has_reads(&self) -> bool {
        self.refs.iter().any(|r| r.kind() == AccessKind::Read)
    }

    /// Returns true if some reference writes.
    #[must_use]
    pub fn has_writes(&self) -> bool {
        self.refs.iter().any(|r| r.kind() == AccessKind::Write)
    }

    /// Names of the first reference's scoped space.
    #[must_use]
    pub fn space_names(&self) -> Vec<String> {
        self.refs.first().map(ScopedRef::space_names).unwrap_or_default()
    }
}

/// Returns true if the offsets are the same affine functions.
fn plain_equal(a: &[Aff], b: &[Aff]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| {
            let diff = x.clone() - y.clone();
            diff.is_constant() && diff.constant_term() == 0
        })
}

/// Returns true if every tensor dimension is accessed through the same
/// equality by all references; records the dimensions that are not.
fn equalities_agree(refs: &[ScopedRef], unmergeable: &mut Vec<usize>) -> bool {
    let mut reference = FxHashMap::default();
    let mut agree = true;
    for r in refs {
        for eq in r.equalities() {
            match reference.get(&eq.range_dim) {
                None => {
                    reference.insert(eq.range_dim, eq);
                }
                Some(prev) if *prev != eq => {
                    agree = false;
                    if !unmergeable.contains(&eq.range_dim) {
                        unmergeable.push(eq.range_dim);
                    }
                }
                Some(_) => {}
            }
        }
    }
    agree
}

/// Box for references that cannot share one: dimensions depending on the
/// first scoped variable that an unmergeable offset mentions, or any later
/// one, are buffered with the identity map.
fn recompute(refs: &[ScopedRef], unmergeable: &[usize]) -> FootprintResult<FootprintBox> {
    let footprint = FootprintBox::of_refs(refs)?;
    let first = unmergeable
        .iter()
        .filter_map(|&d| footprint.offsets.get(d))
        .flat_map(|o| o.terms().map(|(v, _)| v))
        .min();
    let Some(first) = first else {
        return Ok(footprint);
    };
    let invalid: Vec<usize> = footprint
        .offsets
        .iter()
        .enumerate()
        .filter(|(_, o)| o.terms().any(|(v, _)| v >= first))
        .map(|(d, _)| d)
        .collect();

    let mut out = FootprintBox::of_refs_with_cutoff(refs, first)?;
    let n = refs.first().map_or(0, ScopedRef::space_dim);
    for &d in &invalid {
        let span = out.sizes[d].map(|s| (s - 1) * out.strides[d]);
        out.strides[d] = 1;
        if out.offsets[d].is_constant() {
            let lo = out.offsets[d].constant_term();
            out.sizes[d] = span.map(|s| s + 1 + lo.max(0));
            out.offsets[d] = Aff::constant(n, lo.min(0));
        } else {
            out.sizes[d] = span.map(|s| s + 1);
        }
    }
    out.valid = false;
    out.invalid_dims = invalid;
    Ok(out)
}
