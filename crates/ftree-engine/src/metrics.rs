//! Engine metrics.
//!
//! An explicit collector object owned by the tree handle and passed by
//! reference into the engine — no file-scope statics. Counters are relaxed
//! atomics; the snapshot is a plain value that serializes for diagnostics.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters for one tree.
#[derive(Debug, Default)]
pub struct TreeMetrics {
    pub injects: AtomicU64,
    pub inject_retries: AtomicU64,
    pub promotions: AtomicU64,
    pub buffer_appends: AtomicU64,
    pub leaf_applies: AtomicU64,
    pub messages_gated: AtomicU64,
    pub flushes: AtomicU64,
    pub root_splits: AtomicU64,
    pub splits: AtomicU64,
    pub merges: AtomicU64,
    pub rebalances: AtomicU64,
    pub gorged_flushes: AtomicU64,
    pub partial_evictions: AtomicU64,
    pub gc_passes: AtomicU64,
    pub gc_versions_resolved: AtomicU64,
}

impl TreeMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Point-in-time snapshot.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            injects: self.injects.load(Ordering::Relaxed),
            inject_retries: self.inject_retries.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            buffer_appends: self.buffer_appends.load(Ordering::Relaxed),
            leaf_applies: self.leaf_applies.load(Ordering::Relaxed),
            messages_gated: self.messages_gated.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            root_splits: self.root_splits.load(Ordering::Relaxed),
            splits: self.splits.load(Ordering::Relaxed),
            merges: self.merges.load(Ordering::Relaxed),
            rebalances: self.rebalances.load(Ordering::Relaxed),
            gorged_flushes: self.gorged_flushes.load(Ordering::Relaxed),
            partial_evictions: self.partial_evictions.load(Ordering::Relaxed),
            gc_passes: self.gc_passes.load(Ordering::Relaxed),
            gc_versions_resolved: self.gc_versions_resolved.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter.
    pub fn reset(&self) {
        self.injects.store(0, Ordering::Relaxed);
        self.inject_retries.store(0, Ordering::Relaxed);
        self.promotions.store(0, Ordering::Relaxed);
        self.buffer_appends.store(0, Ordering::Relaxed);
        self.leaf_applies.store(0, Ordering::Relaxed);
        self.messages_gated.store(0, Ordering::Relaxed);
        self.flushes.store(0, Ordering::Relaxed);
        self.root_splits.store(0, Ordering::Relaxed);
        self.splits.store(0, Ordering::Relaxed);
        self.merges.store(0, Ordering::Relaxed);
        self.rebalances.store(0, Ordering::Relaxed);
        self.gorged_flushes.store(0, Ordering::Relaxed);
        self.partial_evictions.store(0, Ordering::Relaxed);
        self.gc_passes.store(0, Ordering::Relaxed);
        self.gc_versions_resolved.store(0, Ordering::Relaxed);
    }
}

/// Plain-value view of [`TreeMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub injects: u64,
    pub inject_retries: u64,
    pub promotions: u64,
    pub buffer_appends: u64,
    pub leaf_applies: u64,
    pub messages_gated: u64,
    pub flushes: u64,
    pub root_splits: u64,
    pub splits: u64,
    pub merges: u64,
    pub rebalances: u64,
    pub gorged_flushes: u64,
    pub partial_evictions: u64,
    pub gc_passes: u64,
    pub gc_versions_resolved: u64,
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "injects={} retries={} promotions={} appends={} leaf_applies={} gated={} \
             flushes={} root_splits={} splits={} merges={} rebalances={} gorged={} \
             evictions={} gc_passes={} gc_resolved={}",
            self.injects,
            self.inject_retries,
            self.promotions,
            self.buffer_appends,
            self.leaf_applies,
            self.messages_gated,
            self.flushes,
            self.root_splits,
            self.splits,
            self.merges,
            self.rebalances,
            self.gorged_flushes,
            self.partial_evictions,
            self.gc_passes,
            self.gc_versions_resolved,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counts() {
        let m = TreeMetrics::new();
        TreeMetrics::bump(&m.injects);
        TreeMetrics::bump(&m.injects);
        TreeMetrics::add(&m.buffer_appends, 5);
        let snap = m.snapshot();
        assert_eq!(snap.injects, 2);
        assert_eq!(snap.buffer_appends, 5);
        assert_eq!(snap.flushes, 0);
    }

    #[test]
    fn reset_zeroes_everything() {
        let m = TreeMetrics::new();
        TreeMetrics::bump(&m.splits);
        m.reset();
        assert_eq!(m.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn snapshot_serializes() {
        let m = TreeMetrics::new();
        TreeMetrics::bump(&m.promotions);
        let json = serde_json::to_string(&m.snapshot()).expect("serialize");
        assert!(json.contains("\"promotions\":1"));
    }

    #[test]
    fn display_is_single_line() {
        let snap = TreeMetrics::new().snapshot();
        let line = snap.to_string();
        assert!(line.starts_with("injects=0"));
        assert!(!line.contains('\n'));
    }
}
