//! GPU shared-memory and register promotion.
//!
//! Candidates are chosen per outermost band at the configured promotion
//! depth and admitted in name order while the running total fits the
//! scope's budget. The innermost buffer dimension is padded to an odd size
//! so consecutive rows fall into different banks.

use crate::place::{CopyPlacer, HoistOptions};
use crate::FootprintResult;
use rustc_hash::FxHashSet;
use tpo_poly::{NodeId, NodeKind, ScheduleTree, StmtKind};
use tpo_session::Session;
use tpo_target::MemScope;
use tracing::{debug, info, instrument};

/// A tensor promoted by [`SharedMemoryManager::run`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedPromotion {
    /// Promoted tensor.
    pub tensor: String,
    /// Its buffer.
    pub buffer: String,
    /// [`MemScope::Shared`] or [`MemScope::Local`].
    pub scope: MemScope,
    /// Buffer size, padding included.
    pub bytes: u64,
}

/// Chooses and promotes tensors into GPU on-chip memory.
pub struct SharedMemoryManager<'a> {
    session: &'a Session,
}

impl<'a> SharedMemoryManager<'a> {
    /// Creates a manager.
    #[must_use]
    pub fn new(session: &'a Session) -> Self {
        Self { session }
    }

    /// Nodes below which promotion happens: for every outermost band, the
    /// node after the first `shared_depth` band members, counting through
    /// nested bands. A negative depth uses the whole outermost band.
    #[must_use]
    pub fn promotion_nodes(&self, tree: &ScheduleTree) -> Vec<NodeId> {
        let depth = self.session.config().shared_depth;
        let mut out = Vec::new();
        for band in tree.bands() {
            let path = tree.path_to(band);
            let nested = path[..path.len() - 1]
                .iter()
                .any(|&n| matches!(tree.kind(n), NodeKind::Band(_)));
            if nested {
                continue;
            }
            let Ok(first) = tree.band(band) else {
                continue;
            };
            let want = usize::try_from(depth).unwrap_or(first.len());
            if want == 0 {
                out.push(band);
                continue;
            }
            let mut cur = band;
            let mut covered = first.len();
            while covered < want {
                let Some(next) = next_band(tree, cur) else {
                    break;
                };
                covered += tree.band(next).map_or(0, |b| b.len());
                cur = next;
            }
            if let Ok(child) = tree.child(cur, 0) {
                out.push(child);
            }
        }
        out
    }

    /// Tensors to promote below `node`, with their scope, in name order.
    #[must_use]
    pub fn candidates(&self, tree: &ScheduleTree, node: NodeId) -> Vec<(String, MemScope)> {
        let config = self.session.config();
        let mut read = FxHashSet::default();
        let mut written = FxHashSet::default();
        let mut reduced = FxHashSet::default();
        for s in tree.stmts_below(node) {
            let info = tree.stmt(s);
            let StmtKind::Compute { op } = &info.kind else {
                continue;
            };
            for a in info.reads() {
                read.insert(a.tensor.clone());
            }
            for a in info.writes() {
                written.insert(a.tensor.clone());
                if op.starts_with("Reduce") {
                    reduced.insert(a.tensor.clone());
                }
            }
        }

        let mut out: Vec<(String, MemScope)> = Vec::new();
        for tensor in &config.local_tensors {
            if read.contains(tensor) || written.contains(tensor) {
                out.push((tensor.clone(), MemScope::Local));
            }
        }
        if config.use_shared_memory {
            let mut shared: Vec<&String> = read.iter().filter(|t| !written.contains(*t)).collect();
            if config.enable_akg_reduce_lib {
                shared.extend(reduced.iter());
            }
            for tensor in shared {
                if !out.iter().any(|(t, _)| t == tensor) {
                    out.push((tensor.clone(), MemScope::Shared));
                }
            }
        }
        out.sort();
        out.dedup();
        out
    }

    /// Promotes the admitted candidates of every promotion node.
    ///
    /// # Errors
    ///
    /// Propagates footprint and tree-edit failures.
    #[instrument(skip_all)]
    pub fn run(&self, tree: &mut ScheduleTree, placer: &mut CopyPlacer<'_>) -> FootprintResult<Vec<SharedPromotion>> {
        let gpu = &self.session.target().gpu;
        let mut used_shared = 0u64;
        let mut used_local = 0u64;
        let mut promoted = Vec::new();
        for node in self.promotion_nodes(tree) {
            for (tensor, scope) in self.candidates(tree, node) {
                let Some((_, footprint)) = placer.compute_cluster(tree, node, &tensor, None)? else {
                    continue;
                };
                let Some(mut sizes) = footprint.buffer_sizes() else {
                    info!(%tensor, "footprint has no fixed bound, not promoted");
                    continue;
                };
                if let Some(last) = sizes.last_mut() {
                    if *last % 2 == 0 {
                        *last += 1;
                    }
                }
                let elems = u64::try_from(sizes.iter().product::<i64>()).unwrap_or(u64::MAX);
                let bytes = elems.saturating_mul(placer.elem_bytes(&tensor));
                let (used, budget) = match scope {
                    MemScope::Local => (&mut used_local, gpu.reg_bytes),
                    _ => (&mut used_shared, gpu.shared_bytes),
                };
                if used.saturating_add(bytes) > budget {
                    debug!(%tensor, bytes, budget, "over the {scope} budget, not promoted");
                    continue;
                }
                let opts = HoistOptions {
                    pad_odd: true,
                    ..HoistOptions::new(scope)
                };
                let Some(hoisted) = placer.hoist(tree, node, &tensor, &opts)? else {
                    continue;
                };
                *used += bytes;
                promoted.push(SharedPromotion {
                    tensor,
                    buffer: hoisted.buffer,
                    scope,
                    bytes,
                });
            }
        }
        info!(shared = used_shared, local = used_local, count = promoted.len(), "on-chip promotion done");
        Ok(promoted)
    }
}

/// The first band below `band` reached through single children.
fn next_band(tree: &ScheduleTree, band: NodeId) -> Option<NodeId> {
    let mut cur = tree.child(band, 0).ok()?;
    loop {
        match tree.kind(cur) {
            NodeKind::Band(_) => return Some(cur),
            NodeKind::Sequence | NodeKind::Set | NodeKind::Leaf => return None,
            _ => cur = tree.child(cur, 0).ok()?,
        }
    }
}
