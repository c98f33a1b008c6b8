//! The tree handle: collaborators, configuration, and the public operations.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use ftree_error::Result;
use ftree_types::{Cx, Msn, NodeId, TreeConfig};

use crate::apply::UpdateFn;
use crate::cache::{MemNodeCache, NodeCache, PinnedRead};
use crate::cmp::{KeyCmp, MemcmpKeyCmp};
use crate::flush::{
    apply_ancestor_messages_to_basement, AncestorRef, BackgroundFlusher, ObservedFresh,
};
use crate::gc::{garbage_collect_basement, GcStats, Watermarks};
use crate::message::Message;
use crate::metrics::{MetricsSnapshot, TreeMetrics};
use crate::node::Node;
use crate::reshape::{node_reactivity, Reactivity};
use crate::residency::ReadIntent;
use crate::txn::{NoTxnManager, TxnManager};

/// Borrowed view of a tree's collaborators, threaded through the engine.
pub(crate) struct EngineCtx<'a> {
    pub cache: &'a dyn NodeCache,
    pub cmp: &'a dyn KeyCmp,
    pub config: &'a TreeConfig,
    pub update_fn: Option<&'a dyn UpdateFn>,
    pub metrics: &'a TreeMetrics,
}

/// Shared state behind a [`FractalTree`] handle.
pub struct TreeInner {
    pub(crate) cache: Arc<dyn NodeCache>,
    pub(crate) root: NodeId,
    pub(crate) cmp: Arc<dyn KeyCmp>,
    pub(crate) config: TreeConfig,
    pub(crate) metrics: TreeMetrics,
    pub(crate) update_fn: Option<Arc<dyn UpdateFn>>,
    pub(crate) txn_manager: Arc<dyn TxnManager>,
    pub(crate) watermarks: Mutex<Watermarks>,
    /// Tree-wide MSN issuance. One atomic; incremented only at the moment a
    /// node is write-locked for injection.
    msn_counter: AtomicU64,
    flusher: Option<BackgroundFlusher>,
}

impl TreeInner {
    pub(crate) fn engine_ctx(&self) -> EngineCtx<'_> {
        EngineCtx {
            cache: &*self.cache,
            cmp: &*self.cmp,
            config: &self.config,
            update_fn: self.update_fn.as_deref(),
            metrics: &self.metrics,
        }
    }

    pub(crate) fn next_msn(&self) -> Msn {
        Msn::new(self.msn_counter.fetch_add(1, AtomicOrdering::Relaxed) + 1)
    }

    pub(crate) fn flusher(&self) -> Option<&BackgroundFlusher> {
        self.flusher.as_ref()
    }
}

/// Builder for a [`FractalTree`] handle.
pub struct TreeBuilder {
    config: TreeConfig,
    cache: Option<Arc<dyn NodeCache>>,
    cmp: Arc<dyn KeyCmp>,
    update_fn: Option<Arc<dyn UpdateFn>>,
    txn_manager: Arc<dyn TxnManager>,
}

impl TreeBuilder {
    #[must_use]
    pub fn new(config: TreeConfig) -> Self {
        Self {
            config,
            cache: None,
            cmp: Arc::new(MemcmpKeyCmp),
            update_fn: None,
            txn_manager: Arc::new(NoTxnManager),
        }
    }

    /// Use a caller-owned cache instead of a fresh in-memory one.
    #[must_use]
    pub fn cache(mut self, cache: Arc<dyn NodeCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Inject the key comparator for this handle.
    #[must_use]
    pub fn comparator(mut self, cmp: Arc<dyn KeyCmp>) -> Self {
        self.cmp = cmp;
        self
    }

    /// Install the per-row update callback used by update messages.
    #[must_use]
    pub fn update_fn(mut self, f: Arc<dyn UpdateFn>) -> Self {
        self.update_fn = Some(f);
        self
    }

    /// Connect the transaction-manager collaborator (GC queries).
    #[must_use]
    pub fn txn_manager(mut self, mgr: Arc<dyn TxnManager>) -> Self {
        self.txn_manager = mgr;
        self
    }

    /// Open the tree: an empty single-leaf root.
    #[must_use]
    pub fn open(self) -> FractalTree {
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(MemNodeCache::new(self.config)));
        let root = cache.allocate(Node::new_leaf());
        let background = self.config.background_flush;
        let inner = Arc::new_cyclic(|weak| TreeInner {
            cache,
            root,
            cmp: self.cmp,
            config: self.config,
            metrics: TreeMetrics::new(),
            update_fn: self.update_fn,
            txn_manager: self.txn_manager,
            watermarks: Mutex::new(Watermarks::default()),
            msn_counter: AtomicU64::new(0),
            flusher: background.then(|| BackgroundFlusher::spawn(weak.clone())),
        });
        debug!(root = %inner.root, "opened tree");
        FractalTree { inner }
    }
}

/// A fractal-tree handle: write-buffering B-tree core over a node cache.
///
/// Cheap to clone; all clones share one tree.
#[derive(Clone)]
pub struct FractalTree {
    inner: Arc<TreeInner>,
}

impl std::fmt::Debug for FractalTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FractalTree").finish_non_exhaustive()
    }
}

impl FractalTree {
    /// An in-memory tree with the default collaborators.
    #[must_use]
    pub fn new(config: TreeConfig) -> Self {
        TreeBuilder::new(config).open()
    }

    #[must_use]
    pub fn builder(config: TreeConfig) -> TreeBuilder {
        TreeBuilder::new(config)
    }

    #[must_use]
    pub fn config(&self) -> &TreeConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn root_id(&self) -> NodeId {
        self.inner.root
    }

    /// Point-in-time metrics.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.inner.metrics.reset();
    }

    // -- Mutation -----------------------------------------------------------

    /// Inject an arbitrary message.
    pub fn inject(&self, cx: &Cx, msg: &Message) -> Result<()> {
        crate::inject::inject(&self.inner, cx, msg)
    }

    /// Insert or overwrite.
    pub fn insert(&self, cx: &Cx, key: &[u8], value: &[u8]) -> Result<()> {
        self.inject(cx, &Message::insert(key, value))
    }

    /// Insert only if no visible row exists.
    pub fn insert_unique(&self, cx: &Cx, key: &[u8], value: &[u8]) -> Result<()> {
        self.inject(cx, &Message::insert_unique(key, value))
    }

    /// Delete regardless of current value.
    pub fn delete(&self, cx: &Cx, key: &[u8]) -> Result<()> {
        self.inject(cx, &Message::delete(key))
    }

    /// Run the handle's update function against one row.
    pub fn update(&self, cx: &Cx, key: &[u8], extra: &[u8]) -> Result<()> {
        self.inject(cx, &Message::update(key, extra))
    }

    /// Run the handle's update function against every row.
    pub fn update_broadcast(&self, cx: &Cx, extra: &[u8]) -> Result<()> {
        self.inject(cx, &Message::update_broadcast(extra))
    }

    // -- Query --------------------------------------------------------------

    /// Point lookup.
    ///
    /// Pins the root-to-leaf path, folds the ancestors' buffered messages
    /// into the target basement (promoting what it observed from fresh to
    /// stale afterwards), and answers from the basement. `Ok(None)` is a
    /// definitive not-found; an interrupt surfaces as
    /// [`FtError::Interrupted`](ftree_error::FtError::Interrupted), which
    /// says nothing about presence.
    pub fn lookup(&self, cx: &Cx, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.with_merged_leaf(cx, key, |bn, cmp| {
            bn.find_row(cmp, key)
                .and_then(|entry| entry.visible().map(<[u8]>::to_vec))
        })
    }

    /// Fold every ancestor-buffered message for `key`'s basement into that
    /// basement without reading a row — the merge half of a lookup, useful
    /// ahead of a scan.
    pub fn apply_ancestor_messages_to_leaf(&self, cx: &Cx, key: &[u8]) -> Result<()> {
        self.with_merged_leaf(cx, key, |_, _| ())
    }

    /// Descend to `key`'s leaf holding the whole path (parents stay pinned
    /// so no concurrent flush slips messages past us), merge ancestor
    /// buffers into the target basement, and run `read` against it.
    fn with_merged_leaf<R>(
        &self,
        cx: &Cx,
        key: &[u8],
        read: impl FnOnce(&crate::basement::Basement, &dyn KeyCmp) -> R,
    ) -> Result<R> {
        cx.checkpoint()?;
        let inner = &self.inner;
        let ctx = inner.engine_ctx();
        let intent = ReadIntent::Keymatch(key);

        let mut ancestors: Vec<(PinnedRead, usize)> = Vec::new();
        let mut cur = ctx.cache.pin_read(cx, inner.root, &intent, ctx.cmp)?;
        while !cur.is_leaf() {
            let childnum = cur.which_child(ctx.cmp, key);
            let child_id = cur.children[childnum];
            let next = ctx.cache.pin_read(cx, child_id, &intent, ctx.cmp)?;
            ancestors.push((cur, childnum));
            cur = next;
        }
        let leaf_id = cur.id();
        drop(cur);

        // Between independent steps only: the merge itself is not
        // interruptible.
        cx.checkpoint()?;

        let mut leaf = ctx.cache.pin_write(cx, leaf_id, &intent, ctx.cmp)?;
        let target = leaf.which_child(ctx.cmp, key);
        let observed = {
            let anc_refs: Vec<AncestorRef<'_>> = ancestors
                .iter()
                .map(|(pin, childnum)| AncestorRef {
                    id: pin.id(),
                    node: pin,
                    childnum: *childnum,
                })
                .collect();
            apply_ancestor_messages_to_basement(&ctx, &anc_refs, &mut leaf, target)
        };

        let result = read(
            leaf.basement(target).expect("target basement pinned resident"),
            ctx.cmp,
        );

        ctx.cache.unpin_write(leaf, false);
        while let Some((pin, _)) = ancestors.pop() {
            ctx.cache.unpin_read(pin);
        }

        promote_observed(&ctx, observed);
        Ok(result)
    }

    // -- Shape and residency ------------------------------------------------

    /// Reactivity of one node under this tree's thresholds.
    pub fn reactivity_of(&self, cx: &Cx, id: NodeId) -> Result<Reactivity> {
        let ctx = self.inner.engine_ctx();
        let pin = ctx.cache.pin_read(cx, id, &ReadIntent::All, ctx.cmp)?;
        let is_root = id == self.inner.root;
        Ok(node_reactivity(&pin, is_root, ctx.config))
    }

    /// Serialize-side bookkeeping for one node: garbage-collect leaf
    /// basements against the transaction manager's snapshot and clear the
    /// dirty bit (the cache's write-back made the in-memory state durable).
    pub fn flush_node_to_disk(&self, cx: &Cx, id: NodeId) -> Result<GcStats> {
        let inner = &self.inner;
        let ctx = inner.engine_ctx();
        let mut pin = ctx.cache.pin_write(cx, id, &ReadIntent::All, ctx.cmp)?;

        let mut total = GcStats::default();
        if pin.is_leaf() {
            let wm = {
                let mut wm = inner.watermarks.lock();
                wm.observe(&*inner.txn_manager);
                *wm
            };
            for i in 0..pin.n_children() {
                if let Some(bn) = pin.basement_mut(i) {
                    let stats = garbage_collect_basement(bn, &*inner.txn_manager, &wm);
                    let _ = bn.take_stat_delta();
                    total.rows_examined += stats.rows_examined;
                    total.versions_resolved += stats.versions_resolved;
                    total.rows_removed += stats.rows_removed;
                }
            }
            TreeMetrics::bump(&inner.metrics.gc_passes);
            TreeMetrics::add(&inner.metrics.gc_versions_resolved, total.versions_resolved);
        }
        pin.dirty = false;
        Ok(total)
    }

    /// Evict this node's cold partitions (clock sweep). Returns bytes freed.
    pub fn evict_cold_partitions(&self, cx: &Cx, id: NodeId) -> Result<usize> {
        let ctx = self.inner.engine_ctx();
        let mut pin = ctx
            .cache
            .pin_write(cx, id, &ReadIntent::NoPartitions, ctx.cmp)?;
        let freed = ctx.cache.partial_evict(&mut pin, ctx.cmp);
        if freed > 0 {
            TreeMetrics::bump(&self.inner.metrics.partial_evictions);
        }
        Ok(freed)
    }

    /// Copy-on-write snapshot of one node for checkpoint serialization.
    pub fn clone_for_checkpoint(&self, cx: &Cx, id: NodeId) -> Result<Node> {
        self.inner.cache.clone_for_checkpoint(cx, id)
    }

    #[cfg(test)]
    pub(crate) fn test_cache(&self) -> Arc<dyn NodeCache> {
        Arc::clone(&self.inner.cache)
    }
}

/// Apply deferred fresh-to-stale promotions recorded during a lookup.
///
/// Best-effort by design: the fresh/stale split is a performance hint, so a
/// contended ancestor or a drained buffer (generation mismatch) just skips.
fn promote_observed(ctx: &EngineCtx<'_>, observed: Vec<ObservedFresh>) {
    for o in observed {
        let Ok(Some(pin)) =
            ctx.cache
                .try_pin_upgradable(o.id, &ReadIntent::NoPartitions, ctx.cmp)
        else {
            continue;
        };
        let mut w = pin.upgrade();
        if o.childnum >= w.n_children() {
            continue;
        }
        let Some(bc) = w.buffered_child_mut(o.childnum) else {
            continue;
        };
        if bc.generation != o.generation {
            continue;
        }
        bc.index
            .promote_to_stale(&mut bc.buffer, ctx.cmp, &o.offsets);
        bc.workdone += o.workdone;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> FractalTree {
        FractalTree::new(TreeConfig::small_for_tests())
    }

    #[test]
    fn insert_then_lookup_single_leaf() {
        let t = tree();
        let cx = Cx::new();
        t.insert(&cx, b"k", b"v").unwrap();
        assert_eq!(t.lookup(&cx, b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(t.lookup(&cx, b"missing").unwrap(), None);
    }

    #[test]
    fn latest_insert_wins() {
        let t = tree();
        let cx = Cx::new();
        t.insert(&cx, b"apple", b"1").unwrap();
        t.insert(&cx, b"apple", b"2").unwrap();
        assert_eq!(t.lookup(&cx, b"apple").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn delete_then_lookup_is_none() {
        let t = tree();
        let cx = Cx::new();
        t.insert(&cx, b"k", b"v").unwrap();
        t.delete(&cx, b"k").unwrap();
        assert_eq!(t.lookup(&cx, b"k").unwrap(), None);
    }

    #[test]
    fn many_inserts_grow_and_stay_readable() {
        let t = tree();
        let cx = Cx::new();
        for i in 0..500u32 {
            let key = format!("key-{i:05}");
            let val = format!("val-{i}");
            t.insert(&cx, key.as_bytes(), val.as_bytes()).unwrap();
        }
        for i in 0..500u32 {
            let key = format!("key-{i:05}");
            let val = format!("val-{i}");
            assert_eq!(
                t.lookup(&cx, key.as_bytes()).unwrap(),
                Some(val.into_bytes()),
                "missing {key}"
            );
        }
        let snap = t.metrics();
        assert!(snap.root_splits >= 1, "tree should have grown: {snap}");
    }

    #[test]
    fn interrupted_lookup_is_distinct_from_not_found() {
        let t = tree();
        let cx = Cx::new();
        t.insert(&cx, b"k", b"v").unwrap();

        cx.interrupt_handle().interrupt();
        let err = t.lookup(&cx, b"k").unwrap_err();
        assert!(matches!(err, ftree_error::FtError::Interrupted));
    }

    #[test]
    fn metrics_count_injects() {
        let t = tree();
        let cx = Cx::new();
        t.insert(&cx, b"a", b"1").unwrap();
        t.insert(&cx, b"b", b"2").unwrap();
        assert_eq!(t.metrics().injects, 2);
        t.reset_metrics();
        assert_eq!(t.metrics().injects, 0);
    }

    #[test]
    fn checkpoint_clone_of_root() {
        let t = tree();
        let cx = Cx::new();
        t.insert(&cx, b"k", b"v").unwrap();
        let snapshot = t.clone_for_checkpoint(&cx, t.root_id()).unwrap();
        assert!(!snapshot.dirty);
    }

    #[test]
    fn ancestor_merge_without_read_is_idempotent() {
        let t = tree();
        let cx = Cx::new();
        for i in 0..100u32 {
            let key = format!("key-{i:04}");
            t.insert(&cx, key.as_bytes(), b"v").unwrap();
        }
        t.apply_ancestor_messages_to_leaf(&cx, b"key-0050").unwrap();
        t.apply_ancestor_messages_to_leaf(&cx, b"key-0050").unwrap();
        assert_eq!(t.lookup(&cx, b"key-0050").unwrap(), Some(b"v".to_vec()));
    }
}
