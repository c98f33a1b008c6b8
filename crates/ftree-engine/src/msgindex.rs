//! Ordered indexes over a message buffer's entries.
//!
//! Three structures per buffered child: a `fresh` set for entries no leaf
//! has observed yet, a `stale` set for entries some basement has already
//! folded in, and an insertion-ordered `broadcast` list for entries that
//! apply to every row. The keyed sets are sorted offset arrays ordered by
//! (key, MSN) under the handle's comparator; lookups binary-search the same
//! way the page-level cell pointer arrays do.

use std::cmp::Ordering;
use std::ops::Range;

#[cfg(test)]
use ftree_types::Msn;

use crate::cmp::KeyCmp;
use crate::msgbuf::MessageBuffer;

/// Which keyed set an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexSet {
    Fresh,
    Stale,
}

/// Per-child message index: fresh/stale ordered sets plus the broadcast list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MsgIndex {
    fresh: Vec<u32>,
    stale: Vec<u32>,
    broadcast: Vec<u32>,
}

impl MsgIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of indexed entries across all three structures.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fresh.len() + self.stale.len() + self.broadcast.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn n_fresh(&self) -> usize {
        self.fresh.len()
    }

    #[must_use]
    pub fn n_stale(&self) -> usize {
        self.stale.len()
    }

    /// Offsets of the chosen keyed set, in (key, MSN) order.
    #[must_use]
    pub fn set(&self, which: IndexSet) -> &[u32] {
        match which {
            IndexSet::Fresh => &self.fresh,
            IndexSet::Stale => &self.stale,
        }
    }

    /// Broadcast offsets in insertion (hence MSN) order.
    #[must_use]
    pub fn broadcasts(&self) -> &[u32] {
        &self.broadcast
    }

    /// Record a newly appended entry. Keyed entries start fresh; broadcast
    /// entries go to the unordered list.
    pub fn insert(&mut self, buf: &MessageBuffer, cmp: &dyn KeyCmp, offset: u32, is_broadcast: bool) {
        if is_broadcast {
            self.broadcast.push(offset);
            return;
        }
        self.insert_keyed(buf, cmp, offset, IndexSet::Fresh);
    }

    fn insert_keyed(&mut self, buf: &MessageBuffer, cmp: &dyn KeyCmp, offset: u32, which: IndexSet) {
        let key = buf.key_at(offset);
        let msn = buf.msn_at(offset);
        let set = match which {
            IndexSet::Fresh => &mut self.fresh,
            IndexSet::Stale => &mut self.stale,
        };
        let at = set.partition_point(|&off| {
            match cmp.compare(buf.key_at(off), key) {
                Ordering::Less => true,
                Ordering::Greater => false,
                Ordering::Equal => buf.msn_at(off) < msn,
            }
        });
        set.insert(at, offset);
    }

    /// Reconstruct the three structures from a freshly fetched buffer.
    /// The index is never serialized; the buffer's freshness flags carry
    /// everything needed to rebuild it.
    #[must_use]
    pub fn rebuild(buf: &MessageBuffer, cmp: &dyn KeyCmp) -> Self {
        let mut idx = Self::new();
        for (offset, view) in buf.iter() {
            if view.is_broadcast() {
                idx.broadcast.push(offset);
            } else if view.is_fresh {
                idx.insert_keyed(buf, cmp, offset, IndexSet::Fresh);
            } else {
                idx.insert_keyed(buf, cmp, offset, IndexSet::Stale);
            }
        }
        idx
    }

    /// Entries of `which` whose key falls in `(lower, upper]`.
    ///
    /// The search treats the probe's MSN as maximal, so a bound equal to an
    /// indexed key lands just past that key's entries — which is exactly what
    /// makes the lower bound exclusive and the upper bound inclusive.
    #[must_use]
    pub fn find_range(
        &self,
        buf: &MessageBuffer,
        cmp: &dyn KeyCmp,
        which: IndexSet,
        lower_exclusive: Option<&[u8]>,
        upper_inclusive: Option<&[u8]>,
    ) -> Range<usize> {
        let set = self.set(which);
        let start = match lower_exclusive {
            None => 0,
            Some(lo) => self.past_key(buf, cmp, set, lo),
        };
        let end = match upper_inclusive {
            None => set.len(),
            Some(hi) => self.past_key(buf, cmp, set, hi),
        };
        start..end.max(start)
    }

    /// First position whose key sorts strictly after `key` (probe MSN
    /// maximal: same-key entries all sort before the probe).
    fn past_key(&self, buf: &MessageBuffer, cmp: &dyn KeyCmp, set: &[u32], key: &[u8]) -> usize {
        set.partition_point(|&off| cmp.compare(buf.key_at(off), key) != Ordering::Greater)
    }

    /// Entries of `which` inside a child's key range `[lower, upper)`.
    ///
    /// Child ranges are lower-inclusive/upper-exclusive (a key equal to a
    /// pivot belongs to the child on the pivot's right), unlike
    /// [`find_range`](Self::find_range)'s probe convention.
    #[must_use]
    pub fn entries_in_child_range(
        &self,
        buf: &MessageBuffer,
        cmp: &dyn KeyCmp,
        which: IndexSet,
        lower_inclusive: Option<&[u8]>,
        upper_exclusive: Option<&[u8]>,
    ) -> Range<usize> {
        let set = self.set(which);
        let at_or_past = |key: &[u8]| {
            set.partition_point(|&off| cmp.compare(buf.key_at(off), key) == Ordering::Less)
        };
        let start = lower_inclusive.map_or(0, at_or_past);
        let end = upper_exclusive.map_or(set.len(), at_or_past);
        start..end.max(start)
    }

    /// Move the marked fresh entries to the stale set and flip their
    /// in-buffer freshness flags. Entries no longer present in the fresh set
    /// (for example because the buffer was drained and rebuilt since the
    /// marks were taken) are skipped; the transition is one-way.
    pub fn promote_to_stale(&mut self, buf: &mut MessageBuffer, cmp: &dyn KeyCmp, marked: &[u32]) {
        if marked.is_empty() {
            return;
        }
        let mut moved: Vec<u32> = Vec::with_capacity(marked.len());
        self.fresh.retain(|off| {
            if marked.contains(off) {
                moved.push(*off);
                false
            } else {
                true
            }
        });
        for &off in &moved {
            buf.mark_stale(off);
        }
        // Fresh and stale share one ordering; a single merge keeps stale sorted.
        if !moved.is_empty() {
            let mut merged = Vec::with_capacity(self.stale.len() + moved.len());
            let (mut a, mut b) = (self.stale.iter().peekable(), moved.iter().peekable());
            loop {
                match (a.peek(), b.peek()) {
                    (Some(&&x), Some(&&y)) => {
                        let take_a = match Self::entry_cmp(buf, cmp, x, y) {
                            Ordering::Less | Ordering::Equal => true,
                            Ordering::Greater => false,
                        };
                        if take_a {
                            merged.push(x);
                            a.next();
                        } else {
                            merged.push(y);
                            b.next();
                        }
                    }
                    (Some(&&x), None) => {
                        merged.push(x);
                        a.next();
                    }
                    (None, Some(&&y)) => {
                        merged.push(y);
                        b.next();
                    }
                    (None, None) => break,
                }
            }
            self.stale = merged;
        }
    }

    /// (key, MSN) comparison of two indexed entries.
    fn entry_cmp(buf: &MessageBuffer, cmp: &dyn KeyCmp, a: u32, b: u32) -> Ordering {
        cmp.compare(buf.key_at(a), buf.key_at(b))
            .then_with(|| buf.msn_at(a).cmp(&buf.msn_at(b)))
    }
}
