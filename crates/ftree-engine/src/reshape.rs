//! Shape maintenance: reactivity classification, splits, merges, and
//! rebalancing.
//!
//! Reshapes fix one violation at a time and tolerate leaving the results
//! out of bounds themselves; a later pass (the next descent, or the
//! background flusher) corrects what remains. The root can split — by
//! pushing its content down under a new root with one child — but is never
//! fusible, having no sibling.

use tracing::debug;

use ftree_types::{Cx, TreeConfig};

use crate::flush::flush_child;
use crate::metrics::TreeMetrics;
use crate::msgindex::MsgIndex;
use crate::node::{BufferedChild, ChildStore, Node, Partition, PartitionState};
use crate::residency::ReadIntent;
use crate::tree::EngineCtx;

/// Whether a node needs reshaping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reactivity {
    Stable,
    /// Too large: wants a split.
    Fissible,
    /// Too small: wants a merge (never the root).
    Fusible,
}

/// Classify one node against the configured thresholds.
///
/// A leaf in the middle of a sequential-insert run is exempt from fusible so
/// shape maintenance does not fight a bulk loader.
#[must_use]
pub fn node_reactivity(node: &Node, is_root: bool, config: &TreeConfig) -> Reactivity {
    if node.is_leaf() {
        let size = node.leaf_data_size();
        if size > config.node_size && node.leaf_row_count() > 1 {
            return Reactivity::Fissible;
        }
        if !is_root && size < config.leaf_fusible_bytes() && !node.leaf_in_seq_insert_run() {
            return Reactivity::Fusible;
        }
    } else {
        if node.n_children() > config.fanout_max {
            return Reactivity::Fissible;
        }
        if !is_root && node.n_children() < config.fanout_fusible() {
            return Reactivity::Fusible;
        }
    }
    Reactivity::Stable
}

/// Whether an internal node has buffered enough work to want a flush: total
/// buffered bytes plus attributed leaf work exceed the budget, and at least
/// one child buffer is non-empty.
#[must_use]
pub fn is_gorged(node: &Node, config: &TreeConfig) -> bool {
    if node.is_leaf() {
        return false;
    }
    let load = node.buffered_bytes() as u64 + node.workdone_total();
    load > config.gorged_bytes() as u64
        && (0..node.n_children()).any(|i| node.buffered_child(i).is_some_and(|bc| !bc.is_empty()))
}

/// Where a split puts its weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitBias {
    Even,
    /// Keep the left side large (sequential ascending inserts: the near-empty
    /// right child absorbs what comes next).
    LeftHeavy,
    /// Keep the right side large (sequential descending inserts).
    RightHeavy,
}

/// Bias for splitting a node on the injection path.
///
/// A live sequential run wins; otherwise the tree edge decides: right-heavy
/// at the left edge, left-heavy at the right edge, even in the interior.
#[must_use]
pub fn split_bias_for(node: &Node, leftmost: bool, rightmost: bool) -> SplitBias {
    if node.is_leaf() && node.leaf_in_seq_insert_run() {
        return SplitBias::LeftHeavy;
    }
    if rightmost {
        SplitBias::LeftHeavy
    } else if leftmost {
        SplitBias::RightHeavy
    } else {
        SplitBias::Even
    }
}

// ---------------------------------------------------------------------------
// Split
// ---------------------------------------------------------------------------

/// Split `parent.children[childnum]` (pinned exclusively as `child`) into
/// two, inserting the new sibling and pivot into the parent and routing the
/// parent's buffered messages for the old child between the pair.
///
/// No guarantee the halves are within bounds afterwards; correction is
/// deferred.
pub(crate) fn split_child(
    ctx: &EngineCtx<'_>,
    parent: &mut Node,
    childnum: usize,
    child: &mut Node,
) {
    split_child_biased(ctx, parent, childnum, child, SplitBias::Even);
}

pub(crate) fn split_child_biased(
    ctx: &EngineCtx<'_>,
    parent: &mut Node,
    childnum: usize,
    child: &mut Node,
    bias: SplitBias,
) {
    TreeMetrics::bump(&ctx.metrics.splits);
    let (pivot, right_node) = split_node(child, bias);
    debug!(
        height = child.height,
        ?bias,
        "split child {childnum} of a {}-way parent",
        parent.n_children()
    );
    let right_id = ctx.cache.allocate(right_node);

    parent.pivots.insert(childnum, pivot.clone());
    parent.children.insert(childnum + 1, right_id);

    // Route the parent's pending messages for the old child between the two
    // new children. Broadcasts go to both sides.
    let old = std::mem::replace(
        parent.partition_mut(childnum),
        Partition::available(ChildStore::Buffered(BufferedChild::new())),
    );
    let (left_bc, right_bc) = match old.state {
        PartitionState::Available(ChildStore::Buffered(bc)) => split_buffered(ctx, &bc, &pivot),
        // Splitting requires the parent's buffer for this child pinned
        // resident; anything else would drop buffered messages.
        _ => panic!("parent partition {childnum} not resident during split"),
    };
    *parent.partition_mut(childnum) = Partition::available(ChildStore::Buffered(left_bc));
    parent.partitions.insert(
        childnum + 1,
        Partition::available(ChildStore::Buffered(right_bc)),
    );

    parent.dirty = true;
    child.dirty = true;
    debug_assert!(parent.pivots_monotonic(ctx.cmp));
}

/// Split one node's content, returning the promoted pivot and the new right
/// sibling. The left half stays in `child`.
fn split_node(child: &mut Node, bias: SplitBias) -> (Box<[u8]>, Node) {
    if child.is_leaf() && child.n_children() == 1 {
        // Row-level split of a single-basement leaf.
        let bn = child.basement_mut(0).expect("split target is resident");
        let n = bn.n_rows();
        debug_assert!(n >= 2, "fissible leaf has more than one row");
        let at = match bias {
            SplitBias::Even => n / 2,
            SplitBias::LeftHeavy => n - 1,
            SplitBias::RightHeavy => 1,
        };
        let right_bn = bn.split_off(at);
        let pivot: Box<[u8]> = right_bn.row_at(0).0.into();
        let right = Node {
            height: 0,
            pivots: Vec::new(),
            children: Vec::new(),
            partitions: vec![Partition::available(ChildStore::Basement(right_bn))],
            dirty: true,
            layout_version: child.layout_version,
        };
        return (pivot, right);
    }

    // Partition-level split (internal nodes and multi-basement leaves).
    let n = child.n_children();
    debug_assert!(n >= 2);
    let at = match bias {
        SplitBias::Even => n / 2,
        SplitBias::LeftHeavy => n - 1,
        SplitBias::RightHeavy => 1,
    };
    let right_pivots = child.pivots.split_off(at);
    let pivot = child.pivots.pop().expect("separator pivot exists");
    let right_children = if child.is_leaf() {
        Vec::new()
    } else {
        child.children.split_off(at)
    };
    let right_partitions = child.partitions.split_off(at);
    let right = Node {
        height: child.height,
        pivots: right_pivots,
        children: right_children,
        partitions: right_partitions,
        dirty: true,
        layout_version: child.layout_version,
    };
    (pivot, right)
}

/// Partition one buffered child's entries around `pivot` into two successor
/// buffers. Keys below the pivot go left, at or above go right; broadcasts
/// are duplicated into both.
fn split_buffered(
    ctx: &EngineCtx<'_>,
    bc: &BufferedChild,
    pivot: &[u8],
) -> (BufferedChild, BufferedChild) {
    let mut left = bc.successor();
    let mut right = bc.successor();
    for (_, view) in bc.buffer.iter() {
        if view.is_broadcast() {
            left.buffer.append_view(&view);
            right.buffer.append_view(&view);
        } else if ctx.cmp.compare(view.key, pivot) == std::cmp::Ordering::Less {
            left.buffer.append_view(&view);
        } else {
            right.buffer.append_view(&view);
        }
    }
    left.index = MsgIndex::rebuild(&left.buffer, ctx.cmp);
    right.index = MsgIndex::rebuild(&right.buffer, ctx.cmp);
    (left, right)
}

/// Split an oversized basement inside a leaf, inserting the new pivot and
/// partition in place. Repeats while the left half is still oversized.
pub(crate) fn maybe_split_basements(leaf: &mut Node, config: &TreeConfig) {
    debug_assert!(leaf.is_leaf());
    let mut i = 0;
    while i < leaf.n_children() {
        let oversized = leaf
            .basement(i)
            .is_some_and(|bn| bn.data_size() > config.basement_size && bn.n_rows() > 1);
        if !oversized {
            i += 1;
            continue;
        }
        let bn = leaf.basement_mut(i).expect("checked above");
        let at = bn.n_rows() / 2;
        let right_bn = bn.split_off(at);
        let pivot: Box<[u8]> = right_bn.row_at(0).0.into();
        leaf.pivots.insert(i, pivot);
        leaf.partitions.insert(
            i + 1,
            Partition::available(ChildStore::Basement(right_bn)),
        );
        leaf.dirty = true;
        // Re-check the left half before moving on.
    }
}

// ---------------------------------------------------------------------------
// Root split
// ---------------------------------------------------------------------------

/// Split the root in place: its content moves to a freshly allocated child
/// (the root's id never changes — an index remap, not pointer surgery), the
/// root becomes an internal node one level up, and the overfull child is
/// split immediately.
pub(crate) fn split_root(ctx: &EngineCtx<'_>, root: &mut Node) {
    TreeMetrics::bump(&ctx.metrics.root_splits);
    let bias = split_bias_for(root, true, true);
    let old = std::mem::replace(root, Node::new_leaf());
    let new_height = old.height + 1;
    let child_id = ctx.cache.allocate(old);
    *root = Node::new_internal(new_height, Vec::new(), vec![child_id]);
    root.dirty = true;
    debug!(new_height, "root split");

    let cx = Cx::new();
    let Ok(mut child) = ctx.cache.pin_write(&cx, child_id, &ReadIntent::All, ctx.cmp) else {
        return;
    };
    split_child_biased(ctx, root, 0, &mut child, bias);
}

// ---------------------------------------------------------------------------
// Merge / rebalance
// ---------------------------------------------------------------------------

/// Resolve a fusible child: drain the parent's buffers for the child and a
/// sibling into both (so the pair sits under empty buffers), then merge them
/// into one node if the combined content fits the budget, or redistribute
/// between them if not. Results may themselves be out of bounds; correction
/// is deferred.
pub(crate) fn merge_or_rebalance(ctx: &EngineCtx<'_>, parent: &mut Node, childnum: usize) {
    if parent.is_leaf() || parent.n_children() < 2 {
        return;
    }
    // Merge with the right sibling, or the left one at the right edge.
    let a = if childnum + 1 < parent.n_children() {
        childnum
    } else {
        childnum - 1
    };
    let b = a + 1;

    // Reshape is not cancellable mid-flight; fetches run under a fresh
    // context.
    let cx = Cx::new();
    if ctx
        .cache
        .partial_fetch(&cx, parent, &ReadIntent::All, ctx.cmp)
        .is_err()
    {
        return;
    }
    let left_id = parent.children[a];
    let right_id = parent.children[b];
    let Ok(mut left) = ctx.cache.pin_write(&cx, left_id, &ReadIntent::All, ctx.cmp) else {
        return;
    };
    let Ok(mut right) = ctx.cache.pin_write(&cx, right_id, &ReadIntent::All, ctx.cmp) else {
        return;
    };

    flush_child(ctx, parent, a, &mut left);
    flush_child(ctx, parent, b, &mut right);

    let fits = if left.is_leaf() {
        left.leaf_data_size() + right.leaf_data_size() <= ctx.config.node_size
    } else {
        left.n_children() + right.n_children() <= ctx.config.fanout_max
    };

    if fits {
        TreeMetrics::bump(&ctx.metrics.merges);
        let sep = parent.pivots[a].clone();
        merge_into_left(&mut left, sep, &mut right);
        parent.pivots.remove(a);
        parent.children.remove(b);
        parent.partitions.remove(b);
        parent.dirty = true;
        debug!(height = left.height, "merged sibling pair");
        drop(right);
        ctx.cache.free(right_id);
    } else {
        TreeMetrics::bump(&ctx.metrics.rebalances);
        rebalance_pair(ctx, parent, a, &mut left, &mut right);
        debug!(height = left.height, "rebalanced sibling pair");
    }
    debug_assert!(parent.pivots_monotonic(ctx.cmp));
}

/// Fold `right`'s content into `left` with `sep` between them.
fn merge_into_left(left: &mut Node, sep: Box<[u8]>, right: &mut Node) {
    left.pivots.push(sep);
    left.pivots.append(&mut right.pivots);
    left.children.append(&mut right.children);
    left.partitions.append(&mut right.partitions);
    left.dirty = true;
}

/// Redistribute content evenly between a sibling pair, updating the parent's
/// separator pivot.
fn rebalance_pair(
    ctx: &EngineCtx<'_>,
    parent: &mut Node,
    a: usize,
    left: &mut Node,
    right: &mut Node,
) {
    if left.is_leaf() && left.n_children() == 1 && right.n_children() == 1 {
        // Row-level: pool both basements, cut at the midpoint.
        let total = left.basement(0).map_or(0, |bn| bn.n_rows())
            + right.basement(0).map_or(0, |bn| bn.n_rows());
        if total < 2 {
            return;
        }
        let Some(rbn) = right.basement_mut(0) else {
            return;
        };
        let moved = rbn.split_off(0);
        let Some(lbn) = left.basement_mut(0) else {
            return;
        };
        lbn.absorb(moved);
        let new_right = lbn.split_off(total / 2);
        parent.pivots[a] = new_right.row_at(0).0.into();
        *right.basement_mut(0).expect("checked above") = new_right;
    } else {
        // Partition-level: pool everything, cut at the midpoint.
        let sep = parent.pivots[a].clone();
        merge_into_left(left, sep, right);
        let n = left.n_children();
        let at = n / 2;
        if at == 0 || at == n {
            return;
        }
        let right_pivots = left.pivots.split_off(at);
        let new_sep = left.pivots.pop().expect("separator pivot exists");
        let right_children = if left.is_leaf() {
            Vec::new()
        } else {
            left.children.split_off(at)
        };
        let right_partitions = left.partitions.split_off(at);
        right.height = left.height;
        right.pivots = right_pivots;
        right.children = right_children;
        right.partitions = right_partitions;
        parent.pivots[a] = new_sep;
    }
    left.dirty = true;
    right.dirty = true;
    parent.dirty = true;
    debug_assert!(left.pivots_monotonic(ctx.cmp) && right.pivots_monotonic(ctx.cmp));
}
