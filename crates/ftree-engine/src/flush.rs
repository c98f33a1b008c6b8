//! Moving buffered messages down the tree.
//!
//! Three paths share the routing logic here: `flush_child` drains one parent
//! buffer into the child below it (splits, merges, and gorged-node relief);
//! `apply_ancestor_messages_to_basement` folds the relevant slice of every
//! ancestor buffer into a basement on the query path; and the background
//! flusher runs gorged-node relief off the injecting thread.

use std::sync::mpsc;
use std::sync::Weak;
use std::thread::JoinHandle;

use tracing::{debug, trace};

use ftree_types::{Msn, NodeId};

use crate::apply::{apply_message_to_basement, ApplyCtx};
use crate::message::MessageView;
use crate::metrics::TreeMetrics;
use crate::msgindex::IndexSet;
use crate::node::Node;
use crate::reshape::{maybe_split_basements, node_reactivity, Reactivity};
use crate::residency::ReadIntent;
use crate::tree::{EngineCtx, TreeInner};

/// Drain the parent's buffer for `childnum` into `child`.
///
/// Entries are replayed in physical order, which is MSN order within one
/// buffer; their MSNs and freshness travel with them. The parent's partition
/// is replaced by its empty successor (a new buffer generation). The child
/// may come out of this reactive or gorged; correction is the caller's
/// deferred concern.
pub(crate) fn flush_child(ctx: &EngineCtx<'_>, parent: &mut Node, childnum: usize, child: &mut Node) {
    let Some(bc) = parent.buffered_child_mut(childnum) else {
        return;
    };
    let successor = bc.successor();
    let drained = std::mem::replace(bc, successor);
    if drained.buffer.is_empty() {
        return;
    }
    TreeMetrics::bump(&ctx.metrics.flushes);
    trace!(
        entries = drained.buffer.n_entries(),
        bytes = drained.buffer.bytes_in_use(),
        child_height = child.height,
        "flushing child buffer"
    );
    for (_, view) in drained.buffer.iter() {
        route_into(ctx, child, &view);
    }
    if child.is_leaf() {
        maybe_split_basements(child, ctx.config);
    }
    parent.dirty = true;
    child.dirty = true;
}

/// Deliver one message view into `child`: apply at a leaf, re-buffer at an
/// internal node. Broadcasts fan out to every slot.
pub(crate) fn route_into(ctx: &EngineCtx<'_>, child: &mut Node, view: &MessageView<'_>) {
    if child.is_leaf() {
        let apply_ctx = ApplyCtx {
            cmp: ctx.cmp,
            update_fn: ctx.update_fn,
        };
        if view.is_broadcast() {
            for i in 0..child.n_children() {
                let bn = child
                    .basement_mut(i)
                    .expect("flush target basement is resident");
                note_apply(ctx, apply_message_to_basement(bn, view, &apply_ctx).applied);
            }
        } else {
            let i = child.which_child(ctx.cmp, view.key);
            let bn = child
                .basement_mut(i)
                .expect("flush target basement is resident");
            note_apply(ctx, apply_message_to_basement(bn, view, &apply_ctx).applied);
        }
    } else if view.is_broadcast() {
        for i in 0..child.n_children() {
            append_into_slot(ctx, child, i, view);
        }
    } else {
        let i = child.which_child(ctx.cmp, view.key);
        append_into_slot(ctx, child, i, view);
    }
}

fn note_apply(ctx: &EngineCtx<'_>, applied: bool) {
    if applied {
        TreeMetrics::bump(&ctx.metrics.leaf_applies);
    } else {
        TreeMetrics::bump(&ctx.metrics.messages_gated);
    }
}

/// Append a view into one buffered-child slot, maintaining index and flow.
pub(crate) fn append_into_slot(
    ctx: &EngineCtx<'_>,
    node: &mut Node,
    slot: usize,
    view: &MessageView<'_>,
) {
    let bc = node
        .buffered_child_mut(slot)
        .expect("flush target buffer is resident");
    let offset = bc.buffer.append_view(view);
    bc.index
        .insert(&bc.buffer, ctx.cmp, offset, view.is_broadcast());
    bc.flow.record(bc.buffer.entry_len_at(offset) as u64);
    TreeMetrics::bump(&ctx.metrics.buffer_appends);
}

// ---------------------------------------------------------------------------
// Ancestor merge (query path)
// ---------------------------------------------------------------------------

/// One pinned ancestor on the root-to-leaf path, with the child slot the
/// path descended through.
pub(crate) struct AncestorRef<'a> {
    pub id: NodeId,
    pub node: &'a Node,
    pub childnum: usize,
}

/// Fresh entries observed during an ancestor merge, to be promoted to stale
/// under that ancestor's exclusive pin afterwards.
#[derive(Debug)]
pub(crate) struct ObservedFresh {
    pub id: NodeId,
    pub childnum: usize,
    /// Buffer generation the offsets were read from; promotion is skipped if
    /// the buffer was drained in between.
    pub generation: u64,
    pub offsets: Vec<u32>,
    /// Leaf work attributable to this ancestor's buffer.
    pub workdone: u64,
}

/// Fold every ancestor-buffered message targeting `leaf`'s basement
/// `target` into that basement, in tree-wide MSN order across ancestors.
///
/// MSN gating inside the apply keeps this idempotent, so a message already
/// folded in before an eviction/re-read round-trip is discarded here. Fresh
/// entries that were applied are reported for deferred stale-promotion; the
/// ancestors themselves are not mutated (they are only share-pinned).
pub(crate) fn apply_ancestor_messages_to_basement(
    ctx: &EngineCtx<'_>,
    ancestors: &[AncestorRef<'_>],
    leaf: &mut Node,
    target: usize,
) -> Vec<ObservedFresh> {
    let (lo, hi) = leaf.child_bounds(target);
    let apply_ctx = ApplyCtx {
        cmp: ctx.cmp,
        update_fn: ctx.update_fn,
    };

    // Gather (msn, ancestor, offset, fresh) candidates above the gate.
    let gate = leaf
        .basement(target)
        .expect("target basement is resident")
        .max_msn_applied;
    let mut candidates: Vec<(Msn, usize, u32, bool)> = Vec::new();
    for (a, anc) in ancestors.iter().enumerate() {
        let Some(bc) = anc.node.buffered_child(anc.childnum) else {
            continue;
        };
        for which in [IndexSet::Fresh, IndexSet::Stale] {
            let range = bc
                .index
                .entries_in_child_range(&bc.buffer, ctx.cmp, which, lo, hi);
            for &off in &bc.index.set(which)[range] {
                let msn = bc.buffer.msn_at(off);
                if msn > gate {
                    candidates.push((msn, a, off, which == IndexSet::Fresh));
                }
            }
        }
        for &off in bc.index.broadcasts() {
            let msn = bc.buffer.msn_at(off);
            if msn > gate {
                candidates.push((msn, a, off, false));
            }
        }
    }
    candidates.sort_by_key(|(msn, ..)| *msn);

    let mut observed: Vec<ObservedFresh> = Vec::new();
    for (_, a, off, is_fresh) in candidates {
        let anc = &ancestors[a];
        let bc = anc.node.buffered_child(anc.childnum).expect("checked above");
        let view = bc.buffer.view_at(off);
        let bn = leaf
            .basement_mut(target)
            .expect("target basement is resident");
        let outcome = apply_message_to_basement(bn, &view, &apply_ctx);
        note_apply(ctx, outcome.applied);
        if outcome.applied {
            leaf.dirty = true;
        }
        if is_fresh {
            let rec = match observed.iter_mut().find(|o| o.id == anc.id) {
                Some(rec) => rec,
                None => {
                    observed.push(ObservedFresh {
                        id: anc.id,
                        childnum: anc.childnum,
                        generation: bc.generation,
                        offsets: Vec::new(),
                        workdone: 0,
                    });
                    observed.last_mut().expect("just pushed")
                }
            };
            rec.offsets.push(off);
            rec.workdone += outcome.workdone;
        }
    }
    observed
}

// ---------------------------------------------------------------------------
// Gorged-node relief
// ---------------------------------------------------------------------------

/// Flush the most-loaded child buffer of `node_id`, correcting any reshape
/// the flush provokes. Runs inline or on the background worker.
pub(crate) fn flush_heaviest_child(inner: &TreeInner, node_id: NodeId) {
    let cx = ftree_types::Cx::new();
    let ctx = inner.engine_ctx();
    let Ok(mut parent) = inner
        .cache
        .pin_write(&cx, node_id, &ReadIntent::All, ctx.cmp)
    else {
        // The node was merged away or freed since the flush was scheduled.
        return;
    };
    if parent.is_leaf() {
        return;
    }

    // Roll the flow window while ranking: the previous epoch is what keeps a
    // briefly idle child from looking cold.
    let mut heaviest: Option<(usize, u64)> = None;
    for i in 0..parent.n_children() {
        if let Some(bc) = parent.buffered_child(i) {
            bc.flow.advance_epoch();
            if bc.is_empty() {
                continue;
            }
            let load = bc.buffer.bytes_in_use() as u64 + bc.flow.estimate();
            if heaviest.map_or(true, |(_, best)| load > best) {
                heaviest = Some((i, load));
            }
        }
    }
    let Some((childnum, _)) = heaviest else {
        return;
    };

    let child_id = parent.children[childnum];
    let Ok(mut child) = inner
        .cache
        .pin_write(&cx, child_id, &ReadIntent::All, ctx.cmp)
    else {
        return;
    };
    TreeMetrics::bump(&ctx.metrics.gorged_flushes);
    flush_child(&ctx, &mut parent, childnum, &mut child);

    // Deferred shape correction for the child the flush just loaded.
    match node_reactivity(&child, false, ctx.config) {
        Reactivity::Fissible => {
            crate::reshape::split_child(&ctx, &mut parent, childnum, &mut child);
        }
        Reactivity::Fusible => {
            drop(child);
            crate::reshape::merge_or_rebalance(&ctx, &mut parent, childnum);
            return;
        }
        Reactivity::Stable => {}
    }
    drop(child);
    drop(parent);
}

/// Hands gorged-node flush work to a dedicated worker thread so the
/// injecting thread never pays for it.
pub(crate) struct BackgroundFlusher {
    tx: Option<mpsc::Sender<NodeId>>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundFlusher {
    /// Spawn the worker. It holds only a weak reference: dropping the tree
    /// closes the channel and the worker exits.
    pub(crate) fn spawn(inner: Weak<TreeInner>) -> Self {
        let (tx, rx) = mpsc::channel::<NodeId>();
        let handle = std::thread::Builder::new()
            .name("ftree-flusher".to_owned())
            .spawn(move || {
                while let Ok(node_id) = rx.recv() {
                    let Some(inner) = Weak::upgrade(&inner) else {
                        break;
                    };
                    flush_heaviest_child(&inner, node_id);
                }
                debug!("background flusher exiting");
            })
            .expect("spawn flusher thread");
        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    /// Enqueue one node for relief. Dropped silently if the worker is gone.
    pub(crate) fn schedule(&self, node_id: NodeId) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(node_id);
        }
    }

    /// Close the queue and wait for the worker. If the worker itself is the
    /// thread dropping the last tree reference, it must not join itself —
    /// the closed channel ends it on its own.
    pub(crate) fn shutdown(&mut self) {
        self.tx = None;
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for BackgroundFlusher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
