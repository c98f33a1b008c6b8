//! Message injection and promotion.
//!
//! A message enters at the root and is pushed as deep as it cheaply can be
//! before being buffered (or, at a leaf, applied outright). The walk holds
//! upgradable pins hand-over-hand: the upgrade to exclusive is atomic, so
//! the only retries are the ones reshapes force, and those are explicit
//! `InjectStep` values — no hidden control flow.
//!
//! Promotion rules, in order:
//! - broadcasts are never promoted: they fan into every child buffer here;
//! - a non-empty target buffer stops promotion (those messages must drain
//!   first or per-child MSN order would break);
//! - otherwise promote until height ≤ 1 or depth ≥ 2 from the injection
//!   root — except along the tree's leftmost/rightmost edges, where
//!   promotion runs all the way to the leaf so sequential loads stay cheap;
//! - a contended or not-fully-resident child ends promotion instead of
//!   blocking the caller.

use tracing::trace;

use ftree_error::Result;
use ftree_types::{Cx, Msn};

use crate::apply::{apply_message_to_basement, ApplyCtx};
use crate::cache::{PinnedUpgradable, PinnedWrite};
use crate::flush::{append_into_slot, flush_heaviest_child};
use crate::message::Message;
use crate::metrics::TreeMetrics;
use crate::node::Node;
use crate::reshape::{
    is_gorged, maybe_split_basements, node_reactivity, split_bias_for, split_child_biased,
    split_root, Reactivity,
};
use crate::residency::ReadIntent;
use crate::tree::{EngineCtx, TreeInner};

/// Maximum depth below the injection root an interior message promotes to.
const PROMOTION_DEPTH_LIMIT: usize = 2;

/// One attempt's outcome.
enum InjectStep {
    Done,
    /// Shape changed under us in a way that invalidates the walk; start
    /// over from the root.
    RetryFromRoot,
}

/// A pin that may be shared-upgradable or already exclusive (after a
/// reshape on this node).
enum Pin {
    Up(PinnedUpgradable),
    Write(PinnedWrite),
}

impl Pin {
    fn node(&self) -> &Node {
        match self {
            Pin::Up(p) => p,
            Pin::Write(p) => p,
        }
    }

    fn into_write(self) -> PinnedWrite {
        match self {
            Pin::Up(p) => p.upgrade(),
            Pin::Write(p) => p,
        }
    }
}

/// Inject one message into the tree. Blocks only on node locks and fetches;
/// lock-race invalidations retry internally (unbounded, counted).
pub(crate) fn inject(inner: &TreeInner, cx: &Cx, msg: &Message) -> Result<()> {
    let ctx = inner.engine_ctx();
    TreeMetrics::bump(&ctx.metrics.injects);
    loop {
        match inject_attempt(inner, &ctx, cx, msg)? {
            InjectStep::Done => return Ok(()),
            InjectStep::RetryFromRoot => {
                TreeMetrics::bump(&ctx.metrics.inject_retries);
                trace!("inject retrying from root");
            }
        }
    }
}

fn intent_for<'a>(msg: &'a Message) -> ReadIntent<'a> {
    if msg.is_broadcast() {
        ReadIntent::All
    } else {
        ReadIntent::Keymatch(&msg.key)
    }
}

fn inject_attempt(
    inner: &TreeInner,
    ctx: &EngineCtx<'_>,
    cx: &Cx,
    msg: &Message,
) -> Result<InjectStep> {
    let root_pin = ctx
        .cache
        .pin_upgradable(cx, inner.root, &intent_for(msg), ctx.cmp)?;

    // Root reactivity first: re-check under the exclusive pin, since another
    // thread may have split it while we upgraded.
    if node_reactivity(&root_pin, true, ctx.config) == Reactivity::Fissible {
        let mut root_w = root_pin.upgrade();
        if node_reactivity(&root_w, true, ctx.config) == Reactivity::Fissible {
            split_root(ctx, &mut root_w);
        }
        return Ok(InjectStep::RetryFromRoot);
    }

    let mut pin = Pin::Up(root_pin);
    let mut depth = 0usize;
    let mut leftmost = true;
    let mut rightmost = true;

    loop {
        if pin.node().is_leaf() {
            let mut leaf = pin.into_write();
            let msn = inner.next_msn();
            inject_into_leaf(ctx, &mut leaf, msg, msn);
            return Ok(InjectStep::Done);
        }

        let node = pin.node();
        let at_edge = leftmost || rightmost;
        let childnum = if msg.is_broadcast() {
            0
        } else {
            node.which_child(ctx.cmp, &msg.key)
        };
        let target_nonempty = !msg.is_broadcast()
            && node
                .buffered_child(childnum)
                .is_some_and(|bc| !bc.is_empty());
        let depth_stop = node.height <= 1 || depth >= PROMOTION_DEPTH_LIMIT;
        let inject_here =
            msg.is_broadcast() || target_nonempty || (!at_edge && depth_stop);

        if inject_here {
            inject_into_internal(inner, ctx, pin.into_write(), msg, childnum);
            return Ok(InjectStep::Done);
        }

        // Promotion probe: never block, never fetch.
        let child_id = node.children[childnum];
        let probe = ctx
            .cache
            .try_pin_upgradable(child_id, &intent_for(msg), ctx.cmp)?;
        let child_pin = match probe {
            Some(p) if p.is_fully_resident() => p,
            _ => {
                // Contended or partially evicted: buffer here instead.
                inject_into_internal(inner, ctx, pin.into_write(), msg, childnum);
                return Ok(InjectStep::Done);
            }
        };

        // A reshape discovered mid-promotion runs under exclusive pins, then
        // the decision is retried at this (possibly reshaped) node.
        let child_reactivity = node_reactivity(&child_pin, false, ctx.config);
        if child_reactivity != Reactivity::Stable {
            let mut parent_w = pin.into_write();
            drop(child_pin);
            // Reshape is not cancellable mid-flight: fetch under a fresh
            // context even if the caller's is interrupted.
            let reshape_cx = Cx::new();
            let Ok(mut child_w) =
                ctx.cache
                    .pin_write(&reshape_cx, child_id, &ReadIntent::All, ctx.cmp)
            else {
                // The child vanished (concurrent merge); our picture of the
                // shape is stale.
                return Ok(InjectStep::RetryFromRoot);
            };
            match node_reactivity(&child_w, false, ctx.config) {
                Reactivity::Fissible => {
                    let bias = split_bias_for(&child_w, leftmost, rightmost);
                    split_child_biased(ctx, &mut parent_w, childnum, &mut child_w, bias);
                }
                Reactivity::Fusible => {
                    drop(child_w);
                    crate::reshape::merge_or_rebalance(ctx, &mut parent_w, childnum);
                }
                Reactivity::Stable => {}
            }
            pin = Pin::Write(parent_w);
            continue;
        }

        TreeMetrics::bump(&ctx.metrics.promotions);
        depth += 1;
        leftmost = leftmost && childnum == 0;
        rightmost = rightmost && childnum == node.n_children() - 1;
        // Hand over hand: adopting the child pin releases the parent.
        pin = Pin::Up(child_pin);
    }
}

/// Apply at a leaf: the message's effect is immediate, no buffering.
fn inject_into_leaf(ctx: &EngineCtx<'_>, leaf: &mut PinnedWrite, msg: &Message, msn: Msn) {
    let apply_ctx = ApplyCtx {
        cmp: ctx.cmp,
        update_fn: ctx.update_fn,
    };
    let view = msg.as_view(msn, true);
    if msg.is_broadcast() {
        for i in 0..leaf.n_children() {
            let bn = leaf
                .basement_mut(i)
                .expect("leaf pinned with all partitions");
            let outcome = apply_message_to_basement(bn, &view, &apply_ctx);
            if outcome.applied {
                TreeMetrics::bump(&ctx.metrics.leaf_applies);
            }
        }
    } else {
        let i = leaf.which_child(ctx.cmp, &msg.key);
        let bn = leaf
            .basement_mut(i)
            .expect("leaf pinned with target partition");
        let outcome = apply_message_to_basement(bn, &view, &apply_ctx);
        if outcome.applied {
            TreeMetrics::bump(&ctx.metrics.leaf_applies);
        }
    }
    maybe_split_basements(leaf, ctx.config);
    leaf.dirty = true;
}

/// Buffer at an internal node: append into the target child slot (every slot
/// for broadcasts), then relieve the node if it is gorged. Consumes the pin:
/// relief — background or inline — runs only after the node is released.
fn inject_into_internal(
    inner: &TreeInner,
    ctx: &EngineCtx<'_>,
    mut node: PinnedWrite,
    msg: &Message,
    childnum: usize,
) {
    let msn = inner.next_msn();
    let view = msg.as_view(msn, true);
    if msg.is_broadcast() {
        for i in 0..node.n_children() {
            append_into_slot(ctx, &mut node, i, &view);
        }
    } else {
        append_into_slot(ctx, &mut node, childnum, &view);
    }
    node.dirty = true;

    let gorged = is_gorged(&node, ctx.config);
    let id = node.id();
    drop(node);
    if gorged {
        match inner.flusher() {
            // Off the synchronous path: the worker re-pins and flushes.
            Some(flusher) => flusher.schedule(id),
            None => flush_heaviest_child(inner, id),
        }
    }
}
