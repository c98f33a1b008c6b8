pub mod config;
pub mod cx;

pub use config::TreeConfig;
pub use cx::{Cx, Interrupted, InterruptHandle};

use std::fmt;

use smallvec::SmallVec;

/// A message sequence number.
///
/// MSNs are issued exactly once per message from a tree-wide atomic counter,
/// at the moment the message is locked into a node for injection. They give a
/// total order over all messages injected into one tree, and a basement's
/// `max_msn_applied` high-water mark makes re-application idempotent.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
pub struct Msn(u64);

impl Msn {
    /// The MSN below every issued MSN. Freshly created basements start here.
    pub const ZERO: Self = Self(0);

    /// Construct from a raw counter value.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw counter value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Msn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msn:{}", self.0)
    }
}

/// A transaction identifier, assigned by the transaction-manager collaborator.
///
/// `TxnId::NONE` denotes the root/committed scope (no enclosing transaction).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct TxnId(u64);

impl TxnId {
    /// The absent transaction: committed scope.
    pub const NONE: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Whether this is the committed scope rather than a live transaction.
    #[inline]
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// A nested-transaction id chain, outermost first.
///
/// The encoded form is self-describing: `[n: u8][xid: u64-le] * n`. Chains
/// deeper than two levels are rare, hence the inline capacity.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct XidChain(SmallVec<[TxnId; 2]>);

impl XidChain {
    /// Maximum nesting depth representable in the one-byte count prefix.
    pub const MAX_DEPTH: usize = u8::MAX as usize;

    /// The empty chain: a committed (non-transactional) message.
    #[must_use]
    pub fn root() -> Self {
        Self(SmallVec::new())
    }

    /// A single-transaction chain.
    #[must_use]
    pub fn single(xid: TxnId) -> Self {
        let mut v = SmallVec::new();
        v.push(xid);
        Self(v)
    }

    /// Build from outermost-first ids. Panics if deeper than [`Self::MAX_DEPTH`].
    #[must_use]
    pub fn from_ids(ids: &[TxnId]) -> Self {
        assert!(ids.len() <= Self::MAX_DEPTH, "xid chain too deep");
        Self(SmallVec::from_slice(ids))
    }

    #[inline]
    #[must_use]
    pub fn depth(&self) -> usize {
        self.0.len()
    }

    #[inline]
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// The innermost (most deeply nested) transaction, if any.
    #[inline]
    #[must_use]
    pub fn innermost(&self) -> Option<TxnId> {
        self.0.last().copied()
    }

    /// The outermost transaction, if any.
    #[inline]
    #[must_use]
    pub fn outermost(&self) -> Option<TxnId> {
        self.0.first().copied()
    }

    /// Whether `xid` appears anywhere in the chain.
    #[must_use]
    pub fn contains(&self, xid: TxnId) -> bool {
        self.0.contains(&xid)
    }

    /// Outermost-first iteration.
    pub fn iter(&self) -> impl Iterator<Item = TxnId> + '_ {
        self.0.iter().copied()
    }

    /// Exact encoded size in bytes.
    #[inline]
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        1 + self.0.len() * 8
    }

    /// Append the encoded form to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        debug_assert!(self.0.len() <= Self::MAX_DEPTH);
        out.push(self.0.len() as u8);
        for xid in &self.0 {
            out.extend_from_slice(&xid.get().to_le_bytes());
        }
    }

    /// Decode a chain from the front of `bytes`, returning it with the number
    /// of bytes consumed. Returns `None` on truncated input.
    #[must_use]
    pub fn decode_from(bytes: &[u8]) -> Option<(Self, usize)> {
        let (&n, rest) = bytes.split_first()?;
        let n = n as usize;
        if rest.len() < n * 8 {
            return None;
        }
        let mut v = SmallVec::with_capacity(n);
        for i in 0..n {
            let raw = u64::from_le_bytes(rest[i * 8..i * 8 + 8].try_into().ok()?);
            v.push(TxnId::new(raw));
        }
        Some((Self(v), 1 + n * 8))
    }
}

/// The kind of a buffered mutation message.
///
/// Wire values are part of the in-memory buffer entry layout and must stay
/// stable: downstream code computes entry sizes from decoded fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// No-op placeholder.
    None = 0,
    /// Insert or overwrite the row.
    Insert = 1,
    /// Insert only if no row exists for the key.
    InsertNoOverwrite = 2,
    /// Delete the row regardless of its current value.
    DeleteAny = 3,
    /// Commit a provisional pointwise write.
    CommitAny = 4,
    /// Abort a provisional pointwise write.
    AbortAny = 5,
    /// Run the injected update function against one row.
    Update = 6,
    /// Run the injected update function against every row.
    UpdateBroadcastAll = 7,
    /// Commit every provisional write in the tree.
    CommitBroadcastAll = 8,
    /// Abort every provisional write in the tree.
    AbortBroadcastAll = 9,
    /// Commit every provisional write belonging to one transaction.
    CommitBroadcastTxn = 10,
    /// Abort every provisional write belonging to one transaction.
    AbortBroadcastTxn = 11,
    /// Flatten version chains opportunistically.
    Optimize = 12,
    /// Flatten version chains while upgrading from an older layout.
    OptimizeForUpgrade = 13,
}

impl MessageType {
    /// Decode a wire byte. Returns `None` for unknown values.
    #[must_use]
    pub const fn from_wire(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::None,
            1 => Self::Insert,
            2 => Self::InsertNoOverwrite,
            3 => Self::DeleteAny,
            4 => Self::CommitAny,
            5 => Self::AbortAny,
            6 => Self::Update,
            7 => Self::UpdateBroadcastAll,
            8 => Self::CommitBroadcastAll,
            9 => Self::AbortBroadcastAll,
            10 => Self::CommitBroadcastTxn,
            11 => Self::AbortBroadcastTxn,
            12 => Self::Optimize,
            13 => Self::OptimizeForUpgrade,
            _ => return None,
        })
    }

    /// Wire byte for this type.
    #[inline]
    #[must_use]
    pub const fn to_wire(self) -> u8 {
        self as u8
    }

    /// Whether this message applies unconditionally to every row rather than
    /// to a single key. Broadcast messages are never promoted and live in the
    /// buffer's broadcast list instead of the keyed indexes.
    #[must_use]
    pub const fn is_broadcast(self) -> bool {
        matches!(
            self,
            Self::UpdateBroadcastAll
                | Self::CommitBroadcastAll
                | Self::AbortBroadcastAll
                | Self::CommitBroadcastTxn
                | Self::AbortBroadcastTxn
                | Self::Optimize
                | Self::OptimizeForUpgrade
        )
    }

    /// Whether the message carries a meaningful value payload.
    #[must_use]
    pub const fn has_value(self) -> bool {
        matches!(
            self,
            Self::Insert | Self::InsertNoOverwrite | Self::Update | Self::UpdateBroadcastAll
        )
    }
}

/// Stable identity of a node inside the node cache.
///
/// Nodes are arena-indexed: a `NodeId` stays valid across splits, merges, and
/// checkpoint clones; the root swap after a root split is an index remap.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct NodeId(u64);

impl NodeId {
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node:{}", self.0)
    }
}

/// Location of an evicted partition in the cache's backing store.
///
/// Opaque to the engine; the serialization collaborator owns the format
/// behind it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct DiskAddr(u64);

impl DiskAddr {
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// On-disk layout generation a node was read from.
///
/// Partial (per-partition) fetch and eviction require a layout new enough to
/// address partitions independently.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct LayoutVersion(u32);

impl LayoutVersion {
    /// First layout with independently addressable partitions.
    pub const PARTITIONED: Self = Self(2);
    /// Current layout generation.
    pub const CURRENT: Self = Self(2);

    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Whether nodes of this layout support per-partition fetch and evict.
    #[inline]
    #[must_use]
    pub const fn supports_partial_residency(self) -> bool {
        self.0 >= Self::PARTITIONED.0
    }
}
