//! Multi-version garbage collection for basements.
//!
//! Runs opportunistically when a leaf partition is flushed to disk. For each
//! row whose version chain is worth the walk, provisional versions that no
//! live or future transaction can observe are resolved: a version whose
//! owner committed long ago is promoted into the committed slot, and rows
//! left without any value are physically dropped.
//!
//! Two transaction-id watermarks gate the work. The *simple* watermark is
//! the manager's current oldest-referenced estimate and may move in either
//! direction between calls. The *known* watermark is the conservative one
//! this node trusts: it never regresses, and it stays below any transaction
//! whose abort message may still be buffered above this node — a version at
//! or above it is never touched.

use tracing::debug;

use ftree_types::TxnId;

use crate::basement::Basement;
use crate::txn::TxnManager;

/// The pair of xid watermarks carried per tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    /// Oldest-referenced estimate at last observation. Precise but volatile.
    pub simple: TxnId,
    /// Conservative oldest-referenced known to this node. Monotone.
    pub known: TxnId,
}

impl Default for Watermarks {
    fn default() -> Self {
        Self {
            simple: TxnId::NONE,
            known: TxnId::NONE,
        }
    }
}

impl Watermarks {
    /// Fold in a fresh estimate from the transaction manager.
    ///
    /// The known watermark only ever moves forward, and never past the
    /// smallest live transaction: an abort for anything at or above that may
    /// still be in flight somewhere above this node.
    pub fn observe(&mut self, manager: &dyn TxnManager) {
        let estimate = manager.oldest_referenced_xid_estimate();
        self.simple = estimate;
        let live_floor = manager
            .live_transaction_snapshot()
            .into_iter()
            .min()
            .unwrap_or(estimate);
        let candidate = estimate.min(live_floor);
        self.known = self.known.max(candidate);
    }
}

/// Counters from one GC pass over one basement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct GcStats {
    pub rows_examined: u64,
    pub versions_resolved: u64,
    pub rows_removed: u64,
}

/// Whether a row's chain is worth walking at all under these watermarks.
///
/// Cheap pre-filter: a clean row has nothing to resolve, and a chain whose
/// outermost provisional owner is at or above the known watermark cannot be
/// touched yet.
#[must_use]
pub fn row_worth_collecting(
    entry: &crate::basement::RowEntry,
    watermarks: &Watermarks,
) -> bool {
    match entry.provisional.first() {
        None => entry.is_logically_deleted(),
        Some(outermost) => outermost.xid < watermarks.known,
    }
}

/// Collect one basement. Resolves provisional versions owned by transactions
/// that are finished and safely below the known watermark, then drops rows
/// with no remaining value.
pub fn garbage_collect_basement(
    bn: &mut Basement,
    manager: &dyn TxnManager,
    watermarks: &Watermarks,
) -> GcStats {
    let mut stats = GcStats::default();
    let mut i = 0;
    while i < bn.n_rows() {
        stats.rows_examined += 1;
        let entry = bn.row_at(i).1;
        if !row_worth_collecting(entry, watermarks) {
            i += 1;
            continue;
        }

        let entry = bn.entry_at_mut(i);
        // Resolve from the outside in; stop at the first version we cannot
        // prove finished.
        while let Some(outermost) = entry.provisional.first().cloned() {
            if outermost.xid >= watermarks.known || manager.is_xid_live(outermost.xid) {
                break;
            }
            entry.commit(outermost.xid);
            stats.versions_resolved += 1;
        }

        if bn.row_at(i).1.is_logically_deleted() {
            bn.remove_at(i);
            stats.rows_removed += 1;
        } else {
            i += 1;
        }
    }
    if stats.versions_resolved > 0 || stats.rows_removed > 0 {
        debug!(
            rows = stats.rows_examined,
            resolved = stats.versions_resolved,
            removed = stats.rows_removed,
            "basement gc pass"
        );
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basement::{RowEntry, VersionValue};
    use crate::cmp::MemcmpKeyCmp;
    use crate::txn::{FixedTxnManager, NoTxnManager};

    fn seeded_basement(rows: &[(&[u8], RowEntry)]) -> Basement {
        let cmp = MemcmpKeyCmp;
        let mut bn = Basement::new();
        for (key, entry) in rows {
            let slot = bn.find(&cmp, key).unwrap_err();
            bn.insert_at(slot, (*key).into(), entry.clone());
        }
        bn
    }

    fn provisional_row(xid: u64, value: &[u8]) -> RowEntry {
        let mut entry = RowEntry::committed(VersionValue::Absent);
        entry.write(
            Some(TxnId::new(xid)),
            VersionValue::Present(value.into()),
        );
        entry
    }

    #[test]
    fn watermark_known_never_regresses() {
        let mut wm = Watermarks::default();
        wm.observe(&FixedTxnManager::new(vec![]).with_oldest_estimate(TxnId::new(50)));
        assert_eq!(wm.known, TxnId::new(50));

        // Estimate moves backward: simple follows, known does not.
        wm.observe(&FixedTxnManager::new(vec![]).with_oldest_estimate(TxnId::new(20)));
        assert_eq!(wm.simple, TxnId::new(20));
        assert_eq!(wm.known, TxnId::new(50));
    }

    #[test]
    fn watermark_known_stays_below_live_floor() {
        let mut wm = Watermarks::default();
        let mgr =
            FixedTxnManager::new(vec![TxnId::new(30)]).with_oldest_estimate(TxnId::new(100));
        wm.observe(&mgr);
        assert_eq!(wm.simple, TxnId::new(100));
        assert_eq!(wm.known, TxnId::new(30), "pending aborts above gate known");
    }

    #[test]
    fn old_finished_provisional_is_promoted() {
        let mut bn = seeded_basement(&[(b"k", provisional_row(5, b"v"))]);
        let mut wm = Watermarks::default();
        let mgr = FixedTxnManager::new(vec![]).with_oldest_estimate(TxnId::new(100));
        wm.observe(&mgr);

        let stats = garbage_collect_basement(&mut bn, &mgr, &wm);
        assert_eq!(stats.versions_resolved, 1);
        let cmp = MemcmpKeyCmp;
        let entry = bn.find_row(&cmp, b"k").unwrap();
        assert!(entry.is_clean());
        assert_eq!(entry.visible(), Some(&b"v"[..]));
    }

    #[test]
    fn live_provisional_is_retained() {
        let mut bn = seeded_basement(&[(b"k", provisional_row(5, b"v"))]);
        let mut wm = Watermarks::default();
        let mgr =
            FixedTxnManager::new(vec![TxnId::new(5)]).with_oldest_estimate(TxnId::new(100));
        wm.observe(&mgr);

        let stats = garbage_collect_basement(&mut bn, &mgr, &wm);
        assert_eq!(stats.versions_resolved, 0);
        let cmp = MemcmpKeyCmp;
        assert!(!bn.find_row(&cmp, b"k").unwrap().is_clean());
    }

    #[test]
    fn version_above_known_watermark_is_retained() {
        let mut bn = seeded_basement(&[(b"k", provisional_row(80, b"v"))]);
        let mut wm = Watermarks::default();
        // known settles at 30 because txn 30 is still live.
        let mgr =
            FixedTxnManager::new(vec![TxnId::new(30)]).with_oldest_estimate(TxnId::new(100));
        wm.observe(&mgr);

        let stats = garbage_collect_basement(&mut bn, &mgr, &wm);
        assert_eq!(stats.versions_resolved, 0, "80 >= known=30 stays put");
    }

    #[test]
    fn resolved_delete_drops_the_row() {
        let mut entry = RowEntry::committed(VersionValue::Present(b"v".as_slice().into()));
        entry.write(Some(TxnId::new(2)), VersionValue::Absent);
        let mut bn = seeded_basement(&[(b"k", entry)]);

        let mut wm = Watermarks::default();
        let mgr = NoTxnManager;
        wm.observe(&mgr);

        let stats = garbage_collect_basement(&mut bn, &mgr, &wm);
        assert_eq!(stats.versions_resolved, 1);
        assert_eq!(stats.rows_removed, 1);
        assert_eq!(bn.n_rows(), 0);
    }
}
