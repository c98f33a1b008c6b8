//! Transaction-manager collaborator interface.
//!
//! The engine never tracks live transactions itself; it consults the
//! manager's read-only queries when deciding what multi-version garbage is
//! safe to collect.

use ftree_types::TxnId;

/// Read-only queries against the transaction manager.
pub trait TxnManager: Send + Sync {
    /// A lower bound on transaction ids that any live or future transaction
    /// may still reference. Everything strictly below is fair game for
    /// simple garbage collection.
    fn oldest_referenced_xid_estimate(&self) -> TxnId;

    /// Ids of the transactions live right now, in no particular order.
    fn live_transaction_snapshot(&self) -> Vec<TxnId>;

    /// Whether `xid` is live right now.
    fn is_xid_live(&self, xid: TxnId) -> bool;
}

/// The manager used when no transactional caller exists: nothing is live and
/// every id is collectible.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTxnManager;

impl TxnManager for NoTxnManager {
    fn oldest_referenced_xid_estimate(&self) -> TxnId {
        TxnId::new(u64::MAX)
    }

    fn live_transaction_snapshot(&self) -> Vec<TxnId> {
        Vec::new()
    }

    fn is_xid_live(&self, _xid: TxnId) -> bool {
        false
    }
}

/// A fixed snapshot, for tests and single-shot GC passes.
#[derive(Debug, Clone, Default)]
pub struct FixedTxnManager {
    live: Vec<TxnId>,
    oldest_estimate: Option<TxnId>,
}

impl FixedTxnManager {
    #[must_use]
    pub fn new(live: Vec<TxnId>) -> Self {
        Self {
            live,
            oldest_estimate: None,
        }
    }

    /// Override the oldest-referenced estimate (defaults to the minimum live
    /// id, or the maximum id when nothing is live).
    #[must_use]
    pub fn with_oldest_estimate(mut self, oldest: TxnId) -> Self {
        self.oldest_estimate = Some(oldest);
        self
    }
}

impl TxnManager for FixedTxnManager {
    fn oldest_referenced_xid_estimate(&self) -> TxnId {
        self.oldest_estimate.unwrap_or_else(|| {
            self.live
                .iter()
                .copied()
                .min()
                .unwrap_or(TxnId::new(u64::MAX))
        })
    }

    fn live_transaction_snapshot(&self) -> Vec<TxnId> {
        self.live.clone()
    }

    fn is_xid_live(&self, xid: TxnId) -> bool {
        self.live.contains(&xid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_txn_manager_collects_everything() {
        let mgr = NoTxnManager;
        assert_eq!(mgr.oldest_referenced_xid_estimate(), TxnId::new(u64::MAX));
        assert!(mgr.live_transaction_snapshot().is_empty());
        assert!(!mgr.is_xid_live(TxnId::new(1)));
    }

    #[test]
    fn fixed_manager_reports_min_live_as_oldest() {
        let mgr = FixedTxnManager::new(vec![TxnId::new(30), TxnId::new(10), TxnId::new(20)]);
        assert_eq!(mgr.oldest_referenced_xid_estimate(), TxnId::new(10));
        assert!(mgr.is_xid_live(TxnId::new(20)));
        assert!(!mgr.is_xid_live(TxnId::new(11)));
    }

    #[test]
    fn fixed_manager_estimate_override() {
        let mgr = FixedTxnManager::new(vec![TxnId::new(30)]).with_oldest_estimate(TxnId::new(5));
        assert_eq!(mgr.oldest_referenced_xid_estimate(), TxnId::new(5));
    }
}
