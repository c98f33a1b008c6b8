//! The tree node model.
//!
//! A node is a height, a pivot array, and one partition per child slot. For
//! internal nodes a partition is the per-child message machinery (buffer +
//! index + flow window) and the child pointer lives alongside it; for leaves
//! a partition is a basement. Residency is an explicit sum type per
//! partition: on-disk, compressed-in-memory, or fully available.
//!
//! Pivot convention: `pivots[i]` separates children `i` and `i+1`; a key
//! equal to a pivot belongs to the child to its right, so child `i` covers
//! `[pivots[i-1], pivots[i])` with virtual infinities at the edges.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};

use ftree_types::{DiskAddr, LayoutVersion, NodeId};

use crate::basement::Basement;
use crate::cmp::KeyCmp;
use crate::msgbuf::MessageBuffer;
use crate::msgindex::MsgIndex;

/// Two-epoch moving window of bytes recently buffered toward one child.
///
/// Purely advisory: it ranks children for proactive flushing. Updates are
/// relaxed atomic adds with no extra synchronization; a lost update skews a
/// heuristic, nothing else.
#[derive(Debug, Default)]
pub struct FlowWindow {
    current: AtomicU64,
    previous: AtomicU64,
}

impl FlowWindow {
    /// Record bytes buffered toward this child.
    pub fn record(&self, bytes: u64) {
        self.current.fetch_add(bytes, AtomicOrdering::Relaxed);
    }

    /// Roll the window: current becomes previous, current clears.
    pub fn advance_epoch(&self) {
        let cur = self.current.swap(0, AtomicOrdering::Relaxed);
        self.previous.store(cur, AtomicOrdering::Relaxed);
    }

    /// Recent-traffic estimate across both epochs.
    #[must_use]
    pub fn estimate(&self) -> u64 {
        self.current.load(AtomicOrdering::Relaxed) + self.previous.load(AtomicOrdering::Relaxed)
    }

    #[must_use]
    fn snapshot(&self) -> Self {
        Self {
            current: AtomicU64::new(self.current.load(AtomicOrdering::Relaxed)),
            previous: AtomicU64::new(self.previous.load(AtomicOrdering::Relaxed)),
        }
    }
}

impl Clone for FlowWindow {
    fn clone(&self) -> Self {
        self.snapshot()
    }
}

/// Message machinery for one internal-node child slot.
#[derive(Debug, Clone, Default)]
pub struct BufferedChild {
    pub buffer: MessageBuffer,
    pub index: MsgIndex,
    pub flow: FlowWindow,
    /// Bytes of leaf work attributed to messages from this buffer; part of
    /// the gorged test.
    pub workdone: u64,
    /// Bumped each time the buffer is drained and rebuilt. Deferred
    /// index maintenance (fresh-to-stale promotion recorded under a shared
    /// pin) checks it before touching offsets.
    pub generation: u64,
}

impl BufferedChild {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The empty buffer that replaces this one after a drain.
    #[must_use]
    pub fn successor(&self) -> Self {
        Self {
            generation: self.generation + 1,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// In-memory footprint estimate.
    #[must_use]
    pub fn memory_size(&self) -> usize {
        self.buffer.bytes_in_use() + self.index.len() * std::mem::size_of::<u32>()
    }
}

/// Payload of an available partition, keyed by the owning node's height.
#[derive(Debug, Clone)]
pub enum ChildStore {
    /// Internal node: buffered messages bound for the child below.
    Buffered(BufferedChild),
    /// Leaf: the row set itself.
    Basement(Basement),
}

impl ChildStore {
    #[must_use]
    pub fn memory_size(&self) -> usize {
        match self {
            Self::Buffered(bc) => bc.memory_size(),
            Self::Basement(bn) => bn.data_size(),
        }
    }
}

/// An available-but-undecoded partition image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedBlob {
    pub bytes: Box<[u8]>,
}

/// Residency of one partition.
#[derive(Debug, Clone)]
pub enum PartitionState {
    /// Not in memory; only the backing location is known.
    OnDisk(DiskAddr),
    /// In memory as an opaque blob, not yet decoded.
    Compressed(CompressedBlob),
    /// Fully decoded and usable.
    Available(ChildStore),
}

/// One child slot: residency state plus the clock-sweep recency bit.
#[derive(Debug)]
pub struct Partition {
    pub state: PartitionState,
    /// Set on access, cleared by the eviction sweep; a partition survives
    /// one sweep after its last touch.
    touched: AtomicBool,
}

impl Partition {
    #[must_use]
    pub fn available(store: ChildStore) -> Self {
        Self {
            state: PartitionState::Available(store),
            touched: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn on_disk(addr: DiskAddr) -> Self {
        Self {
            state: PartitionState::OnDisk(addr),
            touched: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn compressed(blob: CompressedBlob) -> Self {
        Self {
            state: PartitionState::Compressed(blob),
            touched: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        matches!(self.state, PartitionState::Available(_))
    }

    /// Mark recently used. Callable under a shared pin.
    pub fn touch(&self) {
        self.touched.store(true, AtomicOrdering::Relaxed);
    }

    /// Read and clear the recency bit (clock sweep step).
    pub fn sweep_touched(&self) -> bool {
        self.touched.swap(false, AtomicOrdering::Relaxed)
    }

    #[must_use]
    pub fn memory_size(&self) -> usize {
        match &self.state {
            PartitionState::OnDisk(_) => 0,
            PartitionState::Compressed(blob) => blob.bytes.len(),
            PartitionState::Available(store) => store.memory_size(),
        }
    }
}

impl Clone for Partition {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            touched: AtomicBool::new(self.touched.load(AtomicOrdering::Relaxed)),
        }
    }
}

/// A tree node. Height 0 is a leaf.
#[derive(Debug, Clone)]
pub struct Node {
    pub height: u32,
    /// `n_children - 1` keys partitioning the key space.
    pub pivots: Vec<Box<[u8]>>,
    /// Child pointers; empty for leaves. Survive partition eviction: only
    /// the partition payloads are freed, never the shape.
    pub children: Vec<NodeId>,
    /// One per child slot.
    pub partitions: Vec<Partition>,
    pub dirty: bool,
    pub layout_version: LayoutVersion,
}

impl Node {
    /// A leaf with one empty basement.
    #[must_use]
    pub fn new_leaf() -> Self {
        Self {
            height: 0,
            pivots: Vec::new(),
            children: Vec::new(),
            partitions: vec![Partition::available(ChildStore::Basement(Basement::new()))],
            dirty: false,
            layout_version: LayoutVersion::CURRENT,
        }
    }

    /// An internal node over the given children, with empty buffers.
    /// `pivots.len()` must be `children.len() - 1`.
    #[must_use]
    pub fn new_internal(height: u32, pivots: Vec<Box<[u8]>>, children: Vec<NodeId>) -> Self {
        debug_assert!(height > 0);
        debug_assert_eq!(pivots.len() + 1, children.len());
        let partitions = children
            .iter()
            .map(|_| Partition::available(ChildStore::Buffered(BufferedChild::new())))
            .collect();
        Self {
            height,
            pivots,
            children,
            partitions,
            dirty: false,
            layout_version: LayoutVersion::CURRENT,
        }
    }

    #[must_use]
    pub fn n_children(&self) -> usize {
        self.partitions.len()
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.height == 0
    }

    /// Which child slot owns `key`.
    ///
    /// Fast path against the last pivot first: sequential inserts resolve
    /// without the binary search. Single child returns 0; a key equal to a
    /// pivot goes to the child on the pivot's right.
    #[must_use]
    pub fn which_child(&self, cmp: &dyn KeyCmp, key: &[u8]) -> usize {
        match self.pivots.last() {
            None => 0,
            Some(last) if cmp.compare(last, key) != Ordering::Greater => self.pivots.len(),
            Some(_) => self.pivot_partition_point(cmp, key, 0),
        }
    }

    /// Like [`which_child`](Self::which_child) but never returns an index
    /// below `lower_bound` — a pivot bound already established on a previous
    /// pass survives retries without re-scanning excluded subtrees.
    #[must_use]
    pub fn which_child_bounded(&self, cmp: &dyn KeyCmp, key: &[u8], lower_bound: usize) -> usize {
        if lower_bound >= self.pivots.len() {
            return self.pivots.len();
        }
        self.pivot_partition_point(cmp, key, lower_bound)
    }

    fn pivot_partition_point(&self, cmp: &dyn KeyCmp, key: &[u8], from: usize) -> usize {
        from + self.pivots[from..]
            .partition_point(|p| cmp.compare(p, key) != Ordering::Greater)
    }

    /// Key bounds of child `i` as `[lower_inclusive, upper_exclusive)`,
    /// `None` at the tree edges.
    #[must_use]
    pub fn child_bounds(&self, i: usize) -> (Option<&[u8]>, Option<&[u8]>) {
        let lo = if i == 0 {
            None
        } else {
            Some(&*self.pivots[i - 1])
        };
        let hi = self.pivots.get(i).map(|p| &**p);
        (lo, hi)
    }

    /// Whether every partition is available.
    #[must_use]
    pub fn is_fully_resident(&self) -> bool {
        self.partitions.iter().all(Partition::is_available)
    }

    #[must_use]
    pub fn partition(&self, i: usize) -> &Partition {
        &self.partitions[i]
    }

    #[must_use]
    pub fn partition_mut(&mut self, i: usize) -> &mut Partition {
        &mut self.partitions[i]
    }

    /// The buffered-child machinery of slot `i`, if available. Internal
    /// nodes only.
    #[must_use]
    pub fn buffered_child(&self, i: usize) -> Option<&BufferedChild> {
        match &self.partitions[i].state {
            PartitionState::Available(ChildStore::Buffered(bc)) => Some(bc),
            _ => None,
        }
    }

    #[must_use]
    pub fn buffered_child_mut(&mut self, i: usize) -> Option<&mut BufferedChild> {
        match &mut self.partitions[i].state {
            PartitionState::Available(ChildStore::Buffered(bc)) => Some(bc),
            _ => None,
        }
    }

    /// The basement of slot `i`, if available. Leaves only.
    #[must_use]
    pub fn basement(&self, i: usize) -> Option<&Basement> {
        match &self.partitions[i].state {
            PartitionState::Available(ChildStore::Basement(bn)) => Some(bn),
            _ => None,
        }
    }

    #[must_use]
    pub fn basement_mut(&mut self, i: usize) -> Option<&mut Basement> {
        match &mut self.partitions[i].state {
            PartitionState::Available(ChildStore::Basement(bn)) => Some(bn),
            _ => None,
        }
    }

    /// Total buffered bytes across available child buffers.
    #[must_use]
    pub fn buffered_bytes(&self) -> usize {
        (0..self.n_children())
            .filter_map(|i| self.buffered_child(i))
            .map(|bc| bc.buffer.bytes_in_use())
            .sum()
    }

    /// Total attributed work across available child buffers.
    #[must_use]
    pub fn workdone_total(&self) -> u64 {
        (0..self.n_children())
            .filter_map(|i| self.buffered_child(i))
            .map(|bc| bc.workdone)
            .sum()
    }

    /// Estimated serialized size of a leaf's row data.
    #[must_use]
    pub fn leaf_data_size(&self) -> usize {
        (0..self.n_children())
            .filter_map(|i| self.basement(i))
            .map(Basement::data_size)
            .sum()
    }

    /// Total rows across available basements.
    #[must_use]
    pub fn leaf_row_count(&self) -> usize {
        (0..self.n_children())
            .filter_map(|i| self.basement(i))
            .map(Basement::n_rows)
            .sum()
    }

    /// Whether any available basement looks like it is absorbing an in-order
    /// insert run.
    #[must_use]
    pub fn leaf_in_seq_insert_run(&self) -> bool {
        (0..self.n_children())
            .filter_map(|i| self.basement(i))
            .any(Basement::in_seq_insert_run)
    }

    /// Rough in-memory footprint.
    #[must_use]
    pub fn estimated_memory_size(&self) -> usize {
        let pivot_bytes: usize = self.pivots.iter().map(|p| p.len()).sum();
        let partition_bytes: usize = self.partitions.iter().map(Partition::memory_size).sum();
        std::mem::size_of::<Self>() + pivot_bytes + partition_bytes
    }

    /// Copy-on-write snapshot for checkpointing: a deep copy the serializer
    /// can walk while mutation continues on the original. The clone is born
    /// clean; the original keeps its dirty state.
    #[must_use]
    pub fn clone_for_checkpoint(&self) -> Self {
        let mut clone = self.clone();
        clone.dirty = false;
        clone
    }

    /// Validate pivot monotonicity under `cmp`. Hard precondition everywhere
    /// else; violation means corruption.
    #[must_use]
    pub fn pivots_monotonic(&self, cmp: &dyn KeyCmp) -> bool {
        self.pivots
            .windows(2)
            .all(|w| cmp.compare(&w[0], &w[1]) == Ordering::Less)
    }
}
