//! Enumeration of admissible tile vectors.
//!
//! Each band is scanned on its own: axes outermost first, tile values in
//! ascending order, a value dropped as soon as the smallest completion of
//! the vector already overflows a scope. Surviving vectors are kept only
//! when no other vector dominates them. Bands whose leading axes cover the
//! same range must agree on those tiles, so the cross product of the band
//! candidates is pruned on that shared prefix.

use crate::analyze::TilingAnalyzer;
use crate::axis::{AxisId, TileLevel};
use crate::memory::{MemoryEstimator, MemoryUsage};
use tpo_session::{DumpLevel, LogStage, Session};
use tracing::{debug, instrument};

/// Candidates kept per band before the scan stops.
const MAX_BAND_CANDIDATES: usize = 4096;

/// Band combinations kept before composition stops.
const MAX_COMBINATIONS: usize = 16384;

/// One admissible tile vector of a band.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpaceCandidate {
    /// Outer tiles, one per band axis, outermost first.
    pub tiles: Vec<i64>,
    /// Memory the tiles need.
    pub usage: MemoryUsage,
}

impl SpaceCandidate {
    /// Returns true if every tile is at least the other's.
    #[must_use]
    pub fn covers(&self, other: &Self) -> bool {
        self.tiles.len() == other.tiles.len() && self.tiles.iter().zip(&other.tiles).all(|(a, b)| a >= b)
    }
}

/// The admissible tile vectors of every band.
#[derive(Clone, Debug, Default)]
pub struct TileSpace {
    /// Surviving candidates per band.
    pub bands: Vec<Vec<SpaceCandidate>>,
    /// Length of the tile prefix each band shares with band 0.
    pub shared_prefix: Vec<usize>,
    /// Admissible combinations, one candidate index per band.
    pub combinations: Vec<Vec<usize>>,
}

impl TileSpace {
    /// Scans every band and composes the results.
    #[instrument(skip_all, fields(bands = estimators.len()))]
    pub fn collect(analyzer: &TilingAnalyzer, estimators: &[MemoryEstimator], session: &Session) -> Self {
        let mut space = Self::default();
        for est in estimators {
            let cands = scan_band(analyzer, est, session);
            debug!(band = est.band, candidates = cands.len(), "band scanned");
            space.bands.push(cands);
        }
        space.shared_prefix = estimators
            .iter()
            .map(|est| shared_prefix(analyzer, estimators.first().map_or(&[][..], |e| &e.axes), &est.axes))
            .collect();
        space.combine();

        let mut logger = session.logger();
        for (b, cands) in space.bands.iter().enumerate() {
            for c in cands {
                logger.append(
                    LogStage::TilingSpace,
                    DumpLevel::Candidate,
                    format!(
                        "band {b} candidate {:?}: {} bytes, {} aligned",
                        c.tiles, c.usage.bytes, c.usage.aligned_bytes
                    ),
                );
            }
        }
        logger.append(
            LogStage::TilingSpace,
            DumpLevel::General,
            format!("{} combinations", space.combinations.len()),
        );
        space
    }

    /// Returns true if no combination survived.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.combinations.is_empty()
    }

    fn combine(&mut self) {
        let mut combos: Vec<Vec<usize>> = vec![Vec::new()];
        for (b, cands) in self.bands.iter().enumerate() {
            let prefix = self.shared_prefix.get(b).copied().unwrap_or(0);
            let mut next = Vec::new();
            'outer: for combo in &combos {
                for (i, c) in cands.iter().enumerate() {
                    if b > 0 && prefix > 0 {
                        let first = &self.bands[0][combo[0]];
                        if first.tiles[..prefix] != c.tiles[..prefix] {
                            continue;
                        }
                    }
                    let mut extended = combo.clone();
                    extended.push(i);
                    next.push(extended);
                    if next.len() >= MAX_COMBINATIONS {
                        break 'outer;
                    }
                }
            }
            combos = next;
        }
        self.combinations = if self.bands.is_empty() { Vec::new() } else { combos };
    }
}

/// Number of leading axes of `axes` covering the same range as `first`.
fn shared_prefix(analyzer: &TilingAnalyzer, first: &[AxisId], axes: &[AxisId]) -> usize {
    first
        .iter()
        .zip(axes)
        .take_while(|&(&a, &b)| {
            let (a, b) = (analyzer.axes.axis(a), analyzer.axes.axis(b));
            a.range_min == b.range_min && a.range_extent == b.range_extent
        })
        .count()
}

/// Admissible outer tiles of `axis`, ascending.
fn axis_values(analyzer: &TilingAnalyzer, axis: AxisId) -> Vec<i64> {
    let a = analyzer.axes.axis(axis);
    a.l1
        .scan_values(a.forbid_iso)
        .into_iter()
        .filter(|&t| a.tile_is_valid(TileLevel::L1, t))
        .collect()
}

fn scan_band(analyzer: &TilingAnalyzer, est: &MemoryEstimator, session: &Session) -> Vec<SpaceCandidate> {
    let values: Vec<Vec<i64>> = est.axes.iter().map(|&a| axis_values(analyzer, a)).collect();
    if values.iter().any(Vec::is_empty) {
        return Vec::new();
    }
    let mut tiles: Vec<i64> = values.iter().map(|v| v[0]).collect();
    let mut out = Vec::new();
    scan_down(0, &values, &mut tiles, est, session, &mut out);
    out
}

fn scan_down(
    pos: usize,
    values: &[Vec<i64>],
    tiles: &mut [i64],
    est: &MemoryEstimator,
    session: &Session,
    out: &mut Vec<SpaceCandidate>,
) {
    if pos == values.len() {
        let usage = est.usage(tiles);
        if usage.fits(session.target()) {
            append_candidate(
                out,
                SpaceCandidate {
                    tiles: tiles.to_vec(),
                    usage,
                },
            );
        }
        return;
    }
    for &v in &values[pos] {
        if out.len() >= MAX_BAND_CANDIDATES {
            return;
        }
        tiles[pos] = v;
        // deeper axes are at their smallest value here
        if !est.usage(tiles).fits(session.target()) {
            break;
        }
        scan_down(pos + 1, values, tiles, est, session, out);
    }
    tiles[pos] = values[pos][0];
}

/// Adds `cand` unless an existing candidate dominates it; drops the
/// existing candidates it dominates.
fn append_candidate(out: &mut Vec<SpaceCandidate>, cand: SpaceCandidate) {
    let dominated = out.iter().any(|c| {
        c.usage.bytes == cand.usage.bytes && c.usage.aligned_bytes <= cand.usage.aligned_bytes && c.covers(&cand)
    });
    if dominated {
        return;
    }
    out.retain(|c| {
        !(cand.usage.aligned_bytes <= c.usage.aligned_bytes && cand.covers(c))
    });
    out.push(cand);
}
