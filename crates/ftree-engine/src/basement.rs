//! The basement: in-memory row set of one leaf partition.
//!
//! Rows are kept in a sorted array under the handle's comparator, looked up
//! by binary search with a fast path for sequential appends. Each row holds a
//! small multi-version chain: one committed value plus a stack of provisional
//! values tagged by transaction id. `max_msn_applied` is the high-water mark
//! of messages already folded in; re-applying an already-seen message is a
//! no-op, which is what makes ancestor-merge and flush retries idempotent.

use std::cmp::Ordering;

use ftree_types::{Msn, TxnId};

use crate::cmp::KeyCmp;

/// A row's value at one version: present with bytes, or a delete marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionValue {
    Present(Box<[u8]>),
    Absent,
}

impl VersionValue {
    #[must_use]
    pub fn as_present(&self) -> Option<&[u8]> {
        match self {
            Self::Present(v) => Some(v),
            Self::Absent => None,
        }
    }

    #[must_use]
    pub fn payload_len(&self) -> usize {
        match self {
            Self::Present(v) => v.len(),
            Self::Absent => 0,
        }
    }
}

/// One provisional (uncommitted) version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provisional {
    pub xid: TxnId,
    pub value: VersionValue,
}

/// A row's multi-version entry: the committed value plus provisional
/// versions ordered outermost-first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowEntry {
    pub committed: VersionValue,
    pub provisional: Vec<Provisional>,
}

impl RowEntry {
    /// A committed-only entry.
    #[must_use]
    pub fn committed(value: VersionValue) -> Self {
        Self {
            committed: value,
            provisional: Vec::new(),
        }
    }

    /// The value the newest writer would observe: innermost provisional if
    /// any, else the committed value.
    #[must_use]
    pub fn visible(&self) -> Option<&[u8]> {
        match self.provisional.last() {
            Some(p) => p.value.as_present(),
            None => self.committed.as_present(),
        }
    }

    /// No provisional versions outstanding.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.provisional.is_empty()
    }

    /// No value for any transaction: the row is logically deleted and may be
    /// physically removed.
    #[must_use]
    pub fn is_logically_deleted(&self) -> bool {
        self.is_clean() && matches!(self.committed, VersionValue::Absent)
    }

    /// Whether any provisional version belongs to `xid`.
    #[must_use]
    pub fn references(&self, xid: TxnId) -> bool {
        self.provisional.iter().any(|p| p.xid == xid)
    }

    /// Write `value` under the given scope. A committed-scope write replaces
    /// the whole chain; a transactional write replaces that transaction's
    /// provisional version or pushes a new one.
    pub fn write(&mut self, scope: Option<TxnId>, value: VersionValue) {
        match scope {
            None => {
                self.committed = value;
                self.provisional.clear();
            }
            Some(xid) => {
                if let Some(p) = self.provisional.iter_mut().find(|p| p.xid == xid) {
                    p.value = value;
                } else {
                    self.provisional.push(Provisional { xid, value });
                }
            }
        }
    }

    /// Commit `xid`: its version becomes the committed value; it and every
    /// version outside it are dropped, deeper nested versions remain
    /// provisional. No-op if the chain does not reference `xid`.
    pub fn commit(&mut self, xid: TxnId) {
        if let Some(pos) = self.provisional.iter().position(|p| p.xid == xid) {
            self.committed = self.provisional[pos].value.clone();
            self.provisional.drain(..=pos);
        }
    }

    /// Abort `xid`: its version and every version nested inside it are
    /// dropped. No-op if the chain does not reference `xid`.
    pub fn abort(&mut self, xid: TxnId) {
        if let Some(pos) = self.provisional.iter().position(|p| p.xid == xid) {
            self.provisional.truncate(pos);
        }
    }

    /// Commit every provisional version (innermost value wins).
    pub fn commit_all(&mut self) {
        if let Some(p) = self.provisional.last() {
            self.committed = p.value.clone();
            self.provisional.clear();
        }
    }

    /// Abort every provisional version.
    pub fn abort_all(&mut self) {
        self.provisional.clear();
    }

    /// Approximate in-memory payload size of this entry.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.committed.payload_len()
            + self
                .provisional
                .iter()
                .map(|p| p.value.payload_len() + 8)
                .sum::<usize>()
    }
}

/// Row count / byte count drift accumulated since the last flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatDelta {
    pub rows: i64,
    pub bytes: i64,
}

impl StatDelta {
    pub fn add(&mut self, other: StatDelta) {
        self.rows += other.rows;
        self.bytes += other.bytes;
    }
}

/// How many consecutive sequential inserts mark a basement as being in the
/// middle of a sequential-insert run.
const SEQINSERT_RUN: u32 = 8;

/// The ordered row set of one leaf partition.
#[derive(Debug, Clone, Default)]
pub struct Basement {
    rows: Vec<(Box<[u8]>, RowEntry)>,
    /// High-water mark of messages already folded into this basement.
    pub max_msn_applied: Msn,
    /// Aggregate drift since the last flush to disk.
    pub stat_delta: StatDelta,
    /// Consecutive appends that landed past the last row.
    seqinsert_score: u32,
    data_bytes: usize,
}

impl Basement {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Approximate serialized size of the row data.
    #[must_use]
    pub fn data_size(&self) -> usize {
        self.data_bytes
    }

    /// Whether recent traffic looks like an in-order insert run. Such a
    /// basement is exempt from the fusible classification so a merge does not
    /// fight a loader.
    #[must_use]
    pub fn in_seq_insert_run(&self) -> bool {
        self.seqinsert_score >= SEQINSERT_RUN
    }

    /// Binary search for `key`. `Ok(i)` hits, `Err(i)` is the insertion slot.
    ///
    /// Fast path: a key sorting after the last row resolves without the
    /// search and feeds the sequential-insert score.
    pub fn find(&mut self, cmp: &dyn KeyCmp, key: &[u8]) -> Result<usize, usize> {
        if let Some((last_key, _)) = self.rows.last() {
            if cmp.compare(key, last_key) == Ordering::Greater {
                self.seqinsert_score = self.seqinsert_score.saturating_add(1);
                return Err(self.rows.len());
            }
        }
        self.seqinsert_score = 0;
        self.rows
            .binary_search_by(|(k, _)| cmp.compare(k, key))
    }

    /// Non-mutating lookup (no sequential-insert accounting).
    #[must_use]
    pub fn find_row(&self, cmp: &dyn KeyCmp, key: &[u8]) -> Option<&RowEntry> {
        self.rows
            .binary_search_by(|(k, _)| cmp.compare(k, key))
            .ok()
            .map(|i| &self.rows[i].1)
    }

    #[must_use]
    pub fn row_at(&self, i: usize) -> (&[u8], &RowEntry) {
        let (k, e) = &self.rows[i];
        (k, e)
    }

    #[must_use]
    pub fn entry_at_mut(&mut self, i: usize) -> &mut RowEntry {
        &mut self.rows[i].1
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &RowEntry)> {
        self.rows.iter().map(|(k, e)| (&**k, e))
    }

    /// Insert a new row at slot `i` (from [`find`](Self::find)'s `Err`).
    pub fn insert_at(&mut self, i: usize, key: Box<[u8]>, entry: RowEntry) {
        self.data_bytes += key.len() + entry.payload_size();
        self.rows.insert(i, (key, entry));
    }

    /// Replace the entry of the row at `i`, returning the old entry.
    pub fn replace_at(&mut self, i: usize, entry: RowEntry) -> RowEntry {
        let old = std::mem::replace(&mut self.rows[i].1, entry);
        self.data_bytes -= old.payload_size();
        self.data_bytes += self.rows[i].1.payload_size();
        old
    }

    /// Remove the row at `i`, returning it.
    pub fn remove_at(&mut self, i: usize) -> (Box<[u8]>, RowEntry) {
        let (key, entry) = self.rows.remove(i);
        self.data_bytes -= key.len() + entry.payload_size();
        (key, entry)
    }

    /// Recompute the cached byte size after in-place entry mutation.
    pub fn resize_entry_at(&mut self, i: usize, old_payload: usize) {
        let new_payload = self.rows[i].1.payload_size();
        self.data_bytes = self.data_bytes - old_payload + new_payload;
    }

    /// Split off the rows from `at` onward into a new basement.
    ///
    /// Both halves keep the MSN high-water mark: every message folded into
    /// the original has been folded into whichever half now owns its key.
    #[must_use]
    pub fn split_off(&mut self, at: usize) -> Basement {
        let right_rows = self.rows.split_off(at);
        let right_bytes: usize = right_rows
            .iter()
            .map(|(k, e)| k.len() + e.payload_size())
            .sum();
        self.data_bytes -= right_bytes;
        self.seqinsert_score = 0;
        Basement {
            rows: right_rows,
            max_msn_applied: self.max_msn_applied,
            stat_delta: StatDelta::default(),
            seqinsert_score: 0,
            data_bytes: right_bytes,
        }
    }

    /// Append every row of `other` (whose keys all sort after ours).
    pub fn absorb(&mut self, other: Basement) {
        self.data_bytes += other.data_bytes;
        self.max_msn_applied = self.max_msn_applied.max(other.max_msn_applied);
        self.stat_delta.add(other.stat_delta);
        self.rows.extend(other.rows);
        self.seqinsert_score = 0;
    }

    /// Reset the flush-delta accumulators (called when the partition is
    /// serialized and the deltas are folded into the tree's header stats).
    pub fn take_stat_delta(&mut self) -> StatDelta {
        std::mem::take(&mut self.stat_delta)
    }

    /// Reassemble from deserialized rows (already sorted under the handle's
    /// comparator).
    #[must_use]
    pub(crate) fn from_rows(
        rows: Vec<(Box<[u8]>, RowEntry)>,
        max_msn_applied: Msn,
        stat_delta: StatDelta,
    ) -> Self {
        let data_bytes = rows
            .iter()
            .map(|(k, e)| k.len() + e.payload_size())
            .sum();
        Self {
            rows,
            max_msn_applied,
            stat_delta,
            seqinsert_score: 0,
            data_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmp::MemcmpKeyCmp;

    fn present(v: &[u8]) -> VersionValue {
        VersionValue::Present(v.into())
    }

    #[test]
    fn committed_write_replaces_chain() {
        let mut entry = RowEntry::committed(present(b"old"));
        entry.write(Some(TxnId::new(5)), present(b"prov"));
        assert_eq!(entry.visible(), Some(&b"prov"[..]));

        entry.write(None, present(b"new"));
        assert!(entry.is_clean());
        assert_eq!(entry.visible(), Some(&b"new"[..]));
    }

    #[test]
    fn commit_promotes_and_keeps_inner() {
        let mut entry = RowEntry::committed(present(b"base"));
        entry.write(Some(TxnId::new(1)), present(b"outer"));
        entry.write(Some(TxnId::new(2)), present(b"inner"));

        entry.commit(TxnId::new(1));
        assert_eq!(entry.committed, present(b"outer"));
        assert!(entry.references(TxnId::new(2)));
        assert_eq!(entry.visible(), Some(&b"inner"[..]));
    }

    #[test]
    fn abort_drops_nested_versions() {
        let mut entry = RowEntry::committed(present(b"base"));
        entry.write(Some(TxnId::new(1)), present(b"outer"));
        entry.write(Some(TxnId::new(2)), present(b"inner"));

        entry.abort(TxnId::new(1));
        assert!(entry.is_clean());
        assert_eq!(entry.visible(), Some(&b"base"[..]));
    }

    #[test]
    fn delete_then_commit_is_logically_deleted() {
        let mut entry = RowEntry::committed(present(b"v"));
        entry.write(Some(TxnId::new(3)), VersionValue::Absent);
        assert!(!entry.is_logically_deleted());
        entry.commit(TxnId::new(3));
        assert!(entry.is_logically_deleted());
    }

    #[test]
    fn find_uses_sequential_fast_path() {
        let cmp = MemcmpKeyCmp;
        let mut bn = Basement::new();
        for i in 0..20u32 {
            let key = format!("{i:04}");
            let slot = bn.find(&cmp, key.as_bytes()).unwrap_err();
            bn.insert_at(slot, key.as_bytes().into(), RowEntry::committed(present(b"v")));
        }
        assert!(bn.in_seq_insert_run());

        // An out-of-order probe resets the run.
        let _ = bn.find(&cmp, b"0000");
        assert!(!bn.in_seq_insert_run());
    }

    #[test]
    fn split_off_and_absorb_round_trip() {
        let cmp = MemcmpKeyCmp;
        let mut bn = Basement::new();
        for key in [b"a", b"b", b"c", b"d"] {
            let slot = bn.find(&cmp, key).unwrap_err();
            bn.insert_at(slot, (*key).into(), RowEntry::committed(present(b"v")));
        }
        bn.max_msn_applied = Msn::new(9);
        let total = bn.data_size();

        let right = bn.split_off(2);
        assert_eq!(bn.n_rows(), 2);
        assert_eq!(right.n_rows(), 2);
        assert_eq!(right.max_msn_applied, Msn::new(9));
        assert_eq!(bn.data_size() + right.data_size(), total);

        bn.absorb(right);
        assert_eq!(bn.n_rows(), 4);
        assert_eq!(bn.data_size(), total);
        let keys: Vec<&[u8]> = bn.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![&b"a"[..], b"b", b"c", b"d"]);
    }

    #[test]
    fn data_size_tracks_mutations() {
        let cmp = MemcmpKeyCmp;
        let mut bn = Basement::new();
        let slot = bn.find(&cmp, b"k").unwrap_err();
        bn.insert_at(slot, b"k".as_slice().into(), RowEntry::committed(present(b"12345")));
        let sz = bn.data_size();
        assert_eq!(sz, 1 + 5);

        let idx = bn.find(&cmp, b"k").unwrap();
        bn.replace_at(idx, RowEntry::committed(present(b"1")));
        assert_eq!(bn.data_size(), sz - 4);

        bn.remove_at(idx);
        assert_eq!(bn.data_size(), 0);
    }
}
