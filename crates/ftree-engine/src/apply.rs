//! Applying one buffered message to one basement.
//!
//! The caller guarantees the message targets this basement's key range.
//! MSN gating makes application idempotent: a message at or below the
//! basement's high-water mark has already been folded in (possibly before an
//! eviction and re-read) and is discarded without touching row state.

use tracing::debug;

use ftree_types::{MessageType, TxnId};

use crate::basement::{Basement, RowEntry, StatDelta, VersionValue};
use crate::cmp::KeyCmp;
use crate::message::MessageView;

/// What the handle's update callback decided for one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateDecision {
    /// Write this value.
    Set(Box<[u8]>),
    /// Delete the row.
    Delete,
    /// Leave the row unchanged.
    Keep,
}

/// Externally supplied per-row update function, injected per open handle.
///
/// Invoked by `Update` and `UpdateBroadcastAll` messages; it may synthesize
/// an insert or a delete from the row's current visible value and the
/// message's extra payload.
pub trait UpdateFn: Send + Sync {
    fn update(&self, key: &[u8], current: Option<&[u8]>, extra: &[u8]) -> UpdateDecision;
}

/// Shared context for leaf application.
pub struct ApplyCtx<'a> {
    pub cmp: &'a dyn KeyCmp,
    pub update_fn: Option<&'a dyn UpdateFn>,
}

/// Result of applying one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// False when the message was MSN-gated away.
    pub applied: bool,
    /// Bytes of row work performed; feeds cache-pressure heuristics only.
    pub workdone: u64,
    /// Row/byte drift caused by this message.
    pub delta: StatDelta,
}

impl ApplyOutcome {
    fn gated() -> Self {
        Self::default()
    }

    fn merge(&mut self, other: PointOutcome) {
        self.workdone += other.workdone;
        self.delta.add(other.delta);
    }
}

/// Outcome of one row-level mutation.
#[derive(Debug, Clone, Copy, Default)]
struct PointOutcome {
    workdone: u64,
    delta: StatDelta,
}

/// Apply `view` to `bn`. The single entry point for flush, ancestor-merge,
/// and direct leaf injection.
pub fn apply_message_to_basement(
    bn: &mut Basement,
    view: &MessageView<'_>,
    ctx: &ApplyCtx<'_>,
) -> ApplyOutcome {
    if view.msn <= bn.max_msn_applied {
        return ApplyOutcome::gated();
    }

    let mut outcome = ApplyOutcome {
        applied: true,
        ..ApplyOutcome::default()
    };
    let scope = view.xids.innermost();

    match view.mtype {
        MessageType::None => {}
        MessageType::Insert => {
            outcome.merge(apply_write(bn, ctx.cmp, view.key, scope, present(view.value), true));
        }
        MessageType::InsertNoOverwrite => {
            outcome.merge(apply_write(bn, ctx.cmp, view.key, scope, present(view.value), false));
        }
        MessageType::DeleteAny => {
            outcome.merge(apply_delete(bn, ctx.cmp, view.key, scope));
        }
        MessageType::CommitAny => {
            if let Some(xid) = scope {
                outcome.merge(apply_txn_point(bn, ctx.cmp, view.key, xid, TxnOp::Commit));
            }
        }
        MessageType::AbortAny => {
            if let Some(xid) = scope {
                outcome.merge(apply_txn_point(bn, ctx.cmp, view.key, xid, TxnOp::Abort));
            }
        }
        MessageType::Update => {
            outcome.merge(apply_update(bn, ctx, view.key, scope, view.value));
        }
        MessageType::UpdateBroadcastAll => {
            let mut i = 0;
            while i < bn.n_rows() {
                let key = bn.row_at(i).0.to_vec();
                let rows_before = bn.n_rows();
                outcome.merge(apply_update(bn, ctx, &key, scope, view.value));
                // A synthesized delete shrank the collection: stay at i.
                if bn.n_rows() == rows_before {
                    i += 1;
                }
            }
        }
        MessageType::CommitBroadcastAll | MessageType::AbortBroadcastAll => {
            let commit = view.mtype == MessageType::CommitBroadcastAll;
            outcome.merge(walk_unclean(bn, |entry| {
                if commit {
                    entry.commit_all();
                } else {
                    entry.abort_all();
                }
            }));
        }
        MessageType::CommitBroadcastTxn | MessageType::AbortBroadcastTxn => {
            if let Some(xid) = scope {
                let commit = view.mtype == MessageType::CommitBroadcastTxn;
                outcome.merge(walk_referencing(bn, xid, move |entry| {
                    if commit {
                        entry.commit(xid);
                    } else {
                        entry.abort(xid);
                    }
                }));
            }
        }
        MessageType::Optimize | MessageType::OptimizeForUpgrade => {
            outcome.merge(sweep_deleted(bn));
        }
    }

    bn.max_msn_applied = view.msn;
    bn.stat_delta.add(outcome.delta);
    outcome
}

fn present(value: &[u8]) -> VersionValue {
    VersionValue::Present(value.into())
}

fn row_size(key_len: usize, entry: &RowEntry) -> u64 {
    (key_len + entry.payload_size()) as u64
}

/// Mutate the existing row at `i` and settle sizes, visibility deltas, and
/// physical removal of logically-deleted rows.
fn mutate_row(bn: &mut Basement, i: usize, f: impl FnOnce(&mut RowEntry)) -> PointOutcome {
    let (key, entry) = bn.row_at(i);
    let key_len = key.len();
    let old_payload = entry.payload_size();
    let old_size = row_size(key_len, entry);
    let visible_before = entry.visible().is_some();

    f(bn.entry_at_mut(i));
    bn.resize_entry_at(i, old_payload);

    let entry = bn.entry_at_mut(i);
    let visible_after = entry.visible().is_some();
    let new_size = row_size(key_len, entry);
    let logically_deleted = entry.is_logically_deleted();

    let mut delta = StatDelta {
        rows: i64::from(visible_after) - i64::from(visible_before),
        bytes: new_size as i64 - old_size as i64,
    };
    let workdone = if logically_deleted {
        old_size
    } else {
        old_size.max(new_size)
    };
    if logically_deleted {
        let (k, e) = bn.remove_at(i);
        delta.bytes -= row_size(k.len(), &e) as i64;
    }
    PointOutcome { workdone, delta }
}

/// Insert / insert-no-overwrite.
fn apply_write(
    bn: &mut Basement,
    cmp: &dyn KeyCmp,
    key: &[u8],
    scope: Option<TxnId>,
    value: VersionValue,
    overwrite: bool,
) -> PointOutcome {
    match bn.find(cmp, key) {
        Ok(i) => {
            if !overwrite && bn.row_at(i).1.visible().is_some() {
                return PointOutcome::default();
            }
            mutate_row(bn, i, |entry| entry.write(scope, value))
        }
        Err(slot) => {
            let mut entry = RowEntry::committed(VersionValue::Absent);
            entry.write(scope, value);
            let size = row_size(key.len(), &entry);
            let visible = entry.visible().is_some();
            bn.insert_at(slot, key.into(), entry);
            PointOutcome {
                workdone: size,
                delta: StatDelta {
                    rows: i64::from(visible),
                    bytes: size as i64,
                },
            }
        }
    }
}

/// Delete-any: absent row is a no-op with zero delta.
fn apply_delete(
    bn: &mut Basement,
    cmp: &dyn KeyCmp,
    key: &[u8],
    scope: Option<TxnId>,
) -> PointOutcome {
    match bn.find(cmp, key) {
        Ok(i) => mutate_row(bn, i, |entry| entry.write(scope, VersionValue::Absent)),
        Err(_) => PointOutcome::default(),
    }
}

#[derive(Clone, Copy)]
enum TxnOp {
    Commit,
    Abort,
}

/// Pointwise commit/abort: absent row is a no-op.
fn apply_txn_point(
    bn: &mut Basement,
    cmp: &dyn KeyCmp,
    key: &[u8],
    xid: TxnId,
    op: TxnOp,
) -> PointOutcome {
    match bn.find(cmp, key) {
        Ok(i) => mutate_row(bn, i, |entry| match op {
            TxnOp::Commit => entry.commit(xid),
            TxnOp::Abort => entry.abort(xid),
        }),
        Err(_) => PointOutcome::default(),
    }
}

/// Pointwise or broadcast-step update through the injected callback.
fn apply_update(
    bn: &mut Basement,
    ctx: &ApplyCtx<'_>,
    key: &[u8],
    scope: Option<TxnId>,
    extra: &[u8],
) -> PointOutcome {
    let Some(update_fn) = ctx.update_fn else {
        debug!("update message dropped: no update function installed");
        return PointOutcome::default();
    };
    let current: Option<Vec<u8>> = bn
        .find_row(ctx.cmp, key)
        .and_then(|entry| entry.visible().map(<[u8]>::to_vec));
    match update_fn.update(key, current.as_deref(), extra) {
        UpdateDecision::Keep => PointOutcome::default(),
        UpdateDecision::Set(value) => {
            apply_write(bn, ctx.cmp, key, scope, VersionValue::Present(value), true)
        }
        UpdateDecision::Delete => apply_delete(bn, ctx.cmp, key, scope),
    }
}

/// Walk every row with outstanding provisional versions, applying `f`.
/// Clean rows are skipped; rows the mutation logically deletes are removed
/// without advancing the walk index.
fn walk_unclean(bn: &mut Basement, f: impl Fn(&mut RowEntry)) -> PointOutcome {
    let mut total = PointOutcome::default();
    let mut i = 0;
    while i < bn.n_rows() {
        if bn.row_at(i).1.is_clean() {
            i += 1;
            continue;
        }
        let rows_before = bn.n_rows();
        let one = mutate_row(bn, i, &f);
        total.workdone += one.workdone;
        total.delta.add(one.delta);
        if bn.n_rows() == rows_before {
            i += 1;
        }
    }
    total
}

/// Like [`walk_unclean`] but only over rows referencing `xid`.
fn walk_referencing(bn: &mut Basement, xid: TxnId, f: impl Fn(&mut RowEntry)) -> PointOutcome {
    let mut total = PointOutcome::default();
    let mut i = 0;
    while i < bn.n_rows() {
        if !bn.row_at(i).1.references(xid) {
            i += 1;
            continue;
        }
        let rows_before = bn.n_rows();
        let one = mutate_row(bn, i, &f);
        total.workdone += one.workdone;
        total.delta.add(one.delta);
        if bn.n_rows() == rows_before {
            i += 1;
        }
    }
    total
}

/// Optimize: physically drop logically-deleted rows.
fn sweep_deleted(bn: &mut Basement) -> PointOutcome {
    let mut total = PointOutcome::default();
    let mut i = 0;
    while i < bn.n_rows() {
        if bn.row_at(i).1.is_logically_deleted() {
            let (k, e) = bn.remove_at(i);
            total.workdone += row_size(k.len(), &e);
            total.delta.bytes -= row_size(k.len(), &e) as i64;
        } else {
            i += 1;
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmp::MemcmpKeyCmp;
    use crate::message::Message;
    use ftree_types::{Msn, XidChain};

    fn ctx(cmp: &MemcmpKeyCmp) -> ApplyCtx<'_> {
        ApplyCtx {
            cmp,
            update_fn: None,
        }
    }

    fn apply(bn: &mut Basement, msg: &Message, msn: u64) -> ApplyOutcome {
        let cmp = MemcmpKeyCmp;
        apply_message_to_basement(bn, &msg.as_view(Msn::new(msn), true), &ctx(&cmp))
    }

    #[test]
    fn insert_then_read() {
        let cmp = MemcmpKeyCmp;
        let mut bn = Basement::new();
        let out = apply(&mut bn, &Message::insert(b"k", b"v1"), 1);
        assert!(out.applied);
        assert_eq!(out.delta.rows, 1);
        assert_eq!(bn.find_row(&cmp, b"k").unwrap().visible(), Some(&b"v1"[..]));

        let out = apply(&mut bn, &Message::insert(b"k", b"v2"), 2);
        assert_eq!(out.delta.rows, 0);
        assert_eq!(bn.find_row(&cmp, b"k").unwrap().visible(), Some(&b"v2"[..]));
    }

    #[test]
    fn msn_gating_makes_reapply_a_no_op() {
        let cmp = MemcmpKeyCmp;
        let mut bn = Basement::new();
        apply(&mut bn, &Message::insert(b"k", b"v1"), 5);
        // Same MSN again: gated, state unchanged.
        let out = apply(&mut bn, &Message::insert(b"k", b"other"), 5);
        assert!(!out.applied);
        assert_eq!(out.workdone, 0);
        assert_eq!(bn.find_row(&cmp, b"k").unwrap().visible(), Some(&b"v1"[..]));
        assert_eq!(bn.max_msn_applied, Msn::new(5));
    }

    #[test]
    fn insert_no_overwrite_respects_existing_row() {
        let cmp = MemcmpKeyCmp;
        let mut bn = Basement::new();
        apply(&mut bn, &Message::insert(b"k", b"first"), 1);
        apply(&mut bn, &Message::insert_unique(b"k", b"second"), 2);
        assert_eq!(
            bn.find_row(&cmp, b"k").unwrap().visible(),
            Some(&b"first"[..])
        );
        // But it lands when no visible row exists.
        apply(&mut bn, &Message::delete(b"k"), 3);
        apply(&mut bn, &Message::insert_unique(b"k", b"second"), 4);
        assert_eq!(
            bn.find_row(&cmp, b"k").unwrap().visible(),
            Some(&b"second"[..])
        );
    }

    #[test]
    fn delete_missing_row_is_a_no_op_with_zero_delta() {
        let mut bn = Basement::new();
        let out = apply(&mut bn, &Message::delete(b"ghost"), 1);
        assert!(out.applied);
        assert_eq!(out.delta, StatDelta::default());
        assert_eq!(out.workdone, 0);
    }

    #[test]
    fn delete_existing_row_decrements_row_count() {
        let mut bn = Basement::new();
        apply(&mut bn, &Message::insert(b"k", b"v"), 1);
        let out = apply(&mut bn, &Message::delete(b"k"), 2);
        assert_eq!(out.delta.rows, -1);
        assert_eq!(bn.n_rows(), 0);
    }

    #[test]
    fn workdone_accounting() {
        let mut bn = Basement::new();
        let out = apply(&mut bn, &Message::insert(b"key", b"12345678"), 1);
        assert_eq!(out.workdone, 3 + 8); // new row size

        let out = apply(&mut bn, &Message::insert(b"key", b"12"), 2);
        assert_eq!(out.workdone, 3 + 8); // max(old, new)

        let out = apply(&mut bn, &Message::delete(b"key"), 3);
        assert_eq!(out.workdone, 3 + 2); // old row size
    }

    #[test]
    fn provisional_insert_then_commit_broadcast() {
        let cmp = MemcmpKeyCmp;
        let mut bn = Basement::new();
        let xid = ftree_types::TxnId::new(7);
        let msg = Message::insert(b"k", b"v").with_xids(XidChain::single(xid));
        apply(&mut bn, &msg, 1);
        assert!(!bn.find_row(&cmp, b"k").unwrap().is_clean());

        let commit = Message::new(
            MessageType::CommitBroadcastTxn,
            XidChain::single(xid),
            b"",
            b"",
        );
        apply(&mut bn, &commit, 2);
        let entry = bn.find_row(&cmp, b"k").unwrap();
        assert!(entry.is_clean());
        assert_eq!(entry.visible(), Some(&b"v"[..]));
    }

    #[test]
    fn abort_broadcast_reverts_provisional_rows() {
        let cmp = MemcmpKeyCmp;
        let mut bn = Basement::new();
        apply(&mut bn, &Message::insert(b"k", b"base"), 1);
        let xid = ftree_types::TxnId::new(9);
        let msg = Message::insert(b"k", b"dirty").with_xids(XidChain::single(xid));
        apply(&mut bn, &msg, 2);

        let abort = Message::new(MessageType::AbortBroadcastAll, XidChain::root(), b"", b"");
        apply(&mut bn, &abort, 3);
        assert_eq!(
            bn.find_row(&cmp, b"k").unwrap().visible(),
            Some(&b"base"[..])
        );
    }

    #[test]
    fn provisional_delete_committed_removes_row() {
        let mut bn = Basement::new();
        apply(&mut bn, &Message::insert(b"k", b"v"), 1);
        let xid = ftree_types::TxnId::new(3);
        apply(
            &mut bn,
            &Message::delete(b"k").with_xids(XidChain::single(xid)),
            2,
        );
        assert_eq!(bn.n_rows(), 1, "provisional delete keeps the row");

        let commit = Message::new(MessageType::CommitAny, XidChain::single(xid), b"k", b"");
        apply(&mut bn, &commit, 3);
        assert_eq!(bn.n_rows(), 0, "committed delete removes the row");
    }

    #[test]
    fn update_callback_synthesizes_writes() {
        struct Bump;
        impl UpdateFn for Bump {
            fn update(&self, _key: &[u8], current: Option<&[u8]>, extra: &[u8]) -> UpdateDecision {
                match current {
                    Some(v) => {
                        let mut out = v.to_vec();
                        out.extend_from_slice(extra);
                        UpdateDecision::Set(out.into())
                    }
                    None => UpdateDecision::Keep,
                }
            }
        }

        let cmp = MemcmpKeyCmp;
        let bump = Bump;
        let ctx = ApplyCtx {
            cmp: &cmp,
            update_fn: Some(&bump),
        };
        let mut bn = Basement::new();
        apply(&mut bn, &Message::insert(b"k", b"a"), 1);

        let upd = Message::update(b"k", b"b");
        apply_message_to_basement(&mut bn, &upd.as_view(Msn::new(2), true), &ctx);
        assert_eq!(bn.find_row(&cmp, b"k").unwrap().visible(), Some(&b"ab"[..]));

        // Missing key: callback says Keep, nothing is created.
        let upd = Message::update(b"nope", b"b");
        apply_message_to_basement(&mut bn, &upd.as_view(Msn::new(3), true), &ctx);
        assert!(bn.find_row(&cmp, b"nope").is_none());
    }

    #[test]
    fn broadcast_update_visits_every_row_once() {
        struct Erase;
        impl UpdateFn for Erase {
            fn update(&self, _key: &[u8], _cur: Option<&[u8]>, _extra: &[u8]) -> UpdateDecision {
                UpdateDecision::Delete
            }
        }

        let cmp = MemcmpKeyCmp;
        let erase = Erase;
        let ctx = ApplyCtx {
            cmp: &cmp,
            update_fn: Some(&erase),
        };
        let mut bn = Basement::new();
        for (i, key) in [b"a", b"b", b"c"].iter().enumerate() {
            apply(&mut bn, &Message::insert(*key, b"v"), i as u64 + 1);
        }
        let msg = Message::update_broadcast(b"");
        let out = apply_message_to_basement(&mut bn, &msg.as_view(Msn::new(10), true), &ctx);
        assert!(out.applied);
        assert_eq!(bn.n_rows(), 0);
        assert_eq!(out.delta.rows, -3);
    }

    #[test]
    fn optimize_sweeps_logically_deleted_rows() {
        let cmp = MemcmpKeyCmp;
        let mut bn = Basement::new();
        // Build a row that is logically deleted but physically present by
        // inserting directly (bypassing the delete-time sweep).
        let slot = bn.find(&cmp, b"dead").unwrap_err();
        bn.insert_at(
            slot,
            b"dead".as_slice().into(),
            RowEntry::committed(VersionValue::Absent),
        );
        apply(&mut bn, &Message::insert(b"live", b"v"), 1);

        let msg = Message::new(MessageType::Optimize, XidChain::root(), b"", b"");
        apply(&mut bn, &msg, 2);
        assert_eq!(bn.n_rows(), 1);
        assert!(bn.find_row(&cmp, b"live").is_some());
    }

    #[test]
    fn none_message_only_advances_the_high_water_mark() {
        let mut bn = Basement::new();
        let msg = Message::new(MessageType::None, XidChain::root(), b"", b"");
        let out = apply(&mut bn, &msg, 4);
        assert!(out.applied);
        assert_eq!(out.workdone, 0);
        assert_eq!(bn.max_msn_applied, Msn::new(4));
    }
}
