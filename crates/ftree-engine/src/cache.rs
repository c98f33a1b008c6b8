//! Page-cache collaborator interface and the arena-indexed in-memory cache.
//!
//! The cache owns node residency: the engine only ever holds a pinned
//! reference for the duration of an operation. Nodes are arena-indexed —
//! referred to by a stable [`NodeId`] that survives splits, merges, and
//! checkpoint clones, so identity swaps are index remaps rather than pointer
//! surgery.
//!
//! [`MemNodeCache`] is the in-memory implementation used in tests and as the
//! default residency owner. Evicted partitions round-trip through a
//! checksummed blob store; a checksum mismatch on fetch is unrecoverable
//! corruption and aborts, matching the engine's durability policy.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::lock_api::{
    ArcRwLockReadGuard, ArcRwLockUpgradableReadGuard, ArcRwLockWriteGuard,
};
use parking_lot::{Mutex, RawRwLock, RwLock};
use tracing::trace;
use xxhash_rust::xxh3::xxh3_64;

use ftree_error::{FtError, Result};
use ftree_types::{Cx, DiskAddr, Msn, NodeId, TreeConfig, TxnId};

use crate::basement::{Basement, Provisional, RowEntry, StatDelta, VersionValue};
use crate::cmp::KeyCmp;
use crate::msgbuf::MessageBuffer;
use crate::msgindex::MsgIndex;
use crate::node::{BufferedChild, ChildStore, CompressedBlob, Node, PartitionState};
use crate::residency::{fetch_required, partial_eviction_allowed, partitions_required, ReadIntent};

// ---------------------------------------------------------------------------
// Pins
// ---------------------------------------------------------------------------

/// A shared pin: the node cannot change shape while held.
pub struct PinnedRead {
    id: NodeId,
    guard: ArcRwLockReadGuard<RawRwLock, Node>,
}

impl PinnedRead {
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }
}

impl Deref for PinnedRead {
    type Target = Node;

    fn deref(&self) -> &Node {
        &self.guard
    }
}

/// An upgradable shared pin: concurrent readers allowed, exclusive upgrade
/// is race-free (no unlock window).
pub struct PinnedUpgradable {
    id: NodeId,
    guard: ArcRwLockUpgradableReadGuard<RawRwLock, Node>,
}

impl PinnedUpgradable {
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Atomically upgrade to an exclusive pin.
    #[must_use]
    pub fn upgrade(self) -> PinnedWrite {
        PinnedWrite {
            id: self.id,
            guard: ArcRwLockUpgradableReadGuard::upgrade(self.guard),
        }
    }
}

impl Deref for PinnedUpgradable {
    type Target = Node;

    fn deref(&self) -> &Node {
        &self.guard
    }
}

/// An exclusive pin.
pub struct PinnedWrite {
    id: NodeId,
    guard: ArcRwLockWriteGuard<RawRwLock, Node>,
}

impl PinnedWrite {
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }
}

impl Deref for PinnedWrite {
    type Target = Node;

    fn deref(&self) -> &Node {
        &self.guard
    }
}

impl DerefMut for PinnedWrite {
    fn deref_mut(&mut self) -> &mut Node {
        &mut self.guard
    }
}

// ---------------------------------------------------------------------------
// NodeCache
// ---------------------------------------------------------------------------

/// The page-cache collaborator.
///
/// Pin acquisition may block; the `try_` variants never do and return `None`
/// instead — the promotion engine abandons promotion rather than stall.
/// Pinning with an intent guarantees the intent's partitions are available
/// before the pin is returned.
pub trait NodeCache: Send + Sync {
    /// Admit a new node, returning its stable id.
    fn allocate(&self, node: Node) -> NodeId;

    /// Drop a node entirely (merge victims, abandoned clones).
    fn free(&self, id: NodeId);

    /// Blocking shared pin.
    fn pin_read(
        &self,
        cx: &Cx,
        id: NodeId,
        intent: &ReadIntent<'_>,
        cmp: &dyn KeyCmp,
    ) -> Result<PinnedRead>;

    /// Blocking upgradable pin.
    fn pin_upgradable(
        &self,
        cx: &Cx,
        id: NodeId,
        intent: &ReadIntent<'_>,
        cmp: &dyn KeyCmp,
    ) -> Result<PinnedUpgradable>;

    /// Non-blocking upgradable pin. `None` when the lock is contended or the
    /// intent would require a fetch (the cheap path never does I/O).
    fn try_pin_upgradable(
        &self,
        id: NodeId,
        intent: &ReadIntent<'_>,
        cmp: &dyn KeyCmp,
    ) -> Result<Option<PinnedUpgradable>>;

    /// Blocking exclusive pin.
    fn pin_write(
        &self,
        cx: &Cx,
        id: NodeId,
        intent: &ReadIntent<'_>,
        cmp: &dyn KeyCmp,
    ) -> Result<PinnedWrite>;

    /// Release a shared pin.
    fn unpin_read(&self, pin: PinnedRead) {
        drop(pin);
    }

    /// Release an exclusive pin, optionally marking the node dirty.
    fn unpin_write(&self, mut pin: PinnedWrite, dirty: bool) {
        if dirty {
            pin.dirty = true;
        }
        drop(pin);
    }

    /// Whether serving `intent` on `node` needs partition materialization.
    fn partial_fetch_required(
        &self,
        node: &Node,
        intent: &ReadIntent<'_>,
        cmp: &dyn KeyCmp,
    ) -> bool;

    /// Materialize the partitions `intent` needs.
    fn partial_fetch(
        &self,
        cx: &Cx,
        node: &mut Node,
        intent: &ReadIntent<'_>,
        cmp: &dyn KeyCmp,
    ) -> Result<()>;

    /// Evict cold partitions from a clean node. Returns bytes freed.
    fn partial_evict(&self, node: &mut Node, cmp: &dyn KeyCmp) -> usize;

    /// Copy-on-write snapshot of a node for checkpoint serialization.
    fn clone_for_checkpoint(&self, cx: &Cx, id: NodeId) -> Result<Node>;

    /// Number of resident nodes (diagnostics).
    fn n_nodes(&self) -> usize;
}

// ---------------------------------------------------------------------------
// MemNodeCache
// ---------------------------------------------------------------------------

/// Arena-indexed in-memory node cache with a checksummed blob store standing
/// in for the disk.
pub struct MemNodeCache {
    config: TreeConfig,
    slots: Mutex<Vec<Option<Arc<RwLock<Node>>>>>,
    free_slots: Mutex<Vec<usize>>,
    store: Mutex<HashMap<u64, Box<[u8]>>>,
    next_addr: AtomicU64,
}

impl MemNodeCache {
    #[must_use]
    pub fn new(config: TreeConfig) -> Self {
        Self {
            config,
            slots: Mutex::new(Vec::new()),
            free_slots: Mutex::new(Vec::new()),
            store: Mutex::new(HashMap::new()),
            next_addr: AtomicU64::new(1),
        }
    }

    fn cell(&self, id: NodeId) -> Result<Arc<RwLock<Node>>> {
        let slots = self.slots.lock();
        slots
            .get(id.get() as usize)
            .and_then(Clone::clone)
            .ok_or(FtError::NodeMissing { node: id })
    }

    /// Write a partition image to the blob store, prefixed by its checksum.
    fn store_blob(&self, payload: &[u8]) -> DiskAddr {
        let addr = self.next_addr.fetch_add(1, AtomicOrdering::Relaxed);
        let mut framed = Vec::with_capacity(8 + payload.len());
        framed.extend_from_slice(&xxh3_64(payload).to_le_bytes());
        framed.extend_from_slice(payload);
        self.store.lock().insert(addr, framed.into_boxed_slice());
        DiskAddr::new(addr)
    }

    /// Read a partition image back, verifying its checksum. Corruption here
    /// is unrecoverable by policy.
    fn load_blob(&self, addr: DiskAddr) -> Vec<u8> {
        let store = self.store.lock();
        let framed = store
            .get(&addr.get())
            .unwrap_or_else(|| panic!("partition blob missing at {addr:?}"));
        let want = u64::from_le_bytes(framed[..8].try_into().unwrap());
        let payload = &framed[8..];
        assert!(
            xxh3_64(payload) == want,
            "partition checksum mismatch at {addr:?}"
        );
        payload.to_vec()
    }

    /// Materialize one partition in place.
    fn fetch_partition(&self, node: &mut Node, i: usize, cmp: &dyn KeyCmp) {
        let height = node.height;
        let part = node.partition_mut(i);
        let store = match &part.state {
            PartitionState::Available(_) => {
                part.touch();
                return;
            }
            PartitionState::Compressed(blob) => decode_store(&blob.bytes, height, cmp),
            PartitionState::OnDisk(addr) => {
                let bytes = self.load_blob(*addr);
                decode_store(&bytes, height, cmp)
            }
        };
        part.state = PartitionState::Available(store);
        part.touch();
    }
}

impl NodeCache for MemNodeCache {
    fn allocate(&self, node: Node) -> NodeId {
        let cell = Arc::new(RwLock::new(node));
        let mut slots = self.slots.lock();
        let slot = self.free_slots.lock().pop();
        match slot {
            Some(i) => {
                slots[i] = Some(cell);
                NodeId::new(i as u64)
            }
            None => {
                slots.push(Some(cell));
                NodeId::new((slots.len() - 1) as u64)
            }
        }
    }

    fn free(&self, id: NodeId) {
        let mut slots = self.slots.lock();
        let i = id.get() as usize;
        if i < slots.len() && slots[i].take().is_some() {
            self.free_slots.lock().push(i);
            trace!(node = %id, "freed node slot");
        }
    }

    fn pin_read(
        &self,
        cx: &Cx,
        id: NodeId,
        intent: &ReadIntent<'_>,
        cmp: &dyn KeyCmp,
    ) -> Result<PinnedRead> {
        loop {
            let cell = self.cell(id)?;
            let guard = cell.read_arc();
            if !self.partial_fetch_required(&guard, intent, cmp) {
                for i in partitions_required(&guard, cmp, intent, &self.config) {
                    guard.partition(i).touch();
                }
                return Ok(PinnedRead { id, guard });
            }
            drop(guard);
            let mut write = cell.write_arc();
            self.partial_fetch(cx, &mut write, intent, cmp)?;
            drop(write);
        }
    }

    fn pin_upgradable(
        &self,
        cx: &Cx,
        id: NodeId,
        intent: &ReadIntent<'_>,
        cmp: &dyn KeyCmp,
    ) -> Result<PinnedUpgradable> {
        loop {
            let cell = self.cell(id)?;
            let guard = cell.upgradable_read_arc();
            if !self.partial_fetch_required(&guard, intent, cmp) {
                for i in partitions_required(&guard, cmp, intent, &self.config) {
                    guard.partition(i).touch();
                }
                return Ok(PinnedUpgradable { id, guard });
            }
            drop(guard);
            let mut write = cell.write_arc();
            self.partial_fetch(cx, &mut write, intent, cmp)?;
            drop(write);
        }
    }

    fn try_pin_upgradable(
        &self,
        id: NodeId,
        intent: &ReadIntent<'_>,
        cmp: &dyn KeyCmp,
    ) -> Result<Option<PinnedUpgradable>> {
        let cell = self.cell(id)?;
        let Some(guard) = cell.try_upgradable_read_arc() else {
            return Ok(None);
        };
        if self.partial_fetch_required(&guard, intent, cmp) {
            return Ok(None);
        }
        for i in partitions_required(&guard, cmp, intent, &self.config) {
            guard.partition(i).touch();
        }
        Ok(Some(PinnedUpgradable { id, guard }))
    }

    fn pin_write(
        &self,
        cx: &Cx,
        id: NodeId,
        intent: &ReadIntent<'_>,
        cmp: &dyn KeyCmp,
    ) -> Result<PinnedWrite> {
        let cell = self.cell(id)?;
        let mut guard = cell.write_arc();
        if self.partial_fetch_required(&guard, intent, cmp) {
            self.partial_fetch(cx, &mut guard, intent, cmp)?;
        }
        for i in partitions_required(&guard, cmp, intent, &self.config) {
            guard.partition(i).touch();
        }
        Ok(PinnedWrite { id, guard })
    }

    fn partial_fetch_required(
        &self,
        node: &Node,
        intent: &ReadIntent<'_>,
        cmp: &dyn KeyCmp,
    ) -> bool {
        fetch_required(node, cmp, intent, &self.config)
    }

    fn partial_fetch(
        &self,
        cx: &Cx,
        node: &mut Node,
        intent: &ReadIntent<'_>,
        cmp: &dyn KeyCmp,
    ) -> Result<()> {
        cx.checkpoint()?;
        for i in partitions_required(node, cmp, intent, &self.config) {
            self.fetch_partition(node, i, cmp);
        }
        Ok(())
    }

    fn partial_evict(&self, node: &mut Node, cmp: &dyn KeyCmp) -> usize {
        if !partial_eviction_allowed(node) {
            return 0;
        }
        let compress_buffers = self.config.compress_buffers_on_evict;
        let mut freed = 0usize;
        for i in 0..node.n_children() {
            let part = node.partition(i);
            if !part.is_available() || part.sweep_touched() {
                continue;
            }
            let before = part.memory_size();
            let height = node.height;
            let part = node.partition_mut(i);
            let PartitionState::Available(store) = &part.state else {
                continue;
            };
            let payload = encode_store(store, cmp);
            let is_buffer = height > 0;
            part.state = if is_buffer && compress_buffers {
                PartitionState::Compressed(CompressedBlob {
                    bytes: payload.into_boxed_slice(),
                })
            } else {
                PartitionState::OnDisk(self.store_blob(&payload))
            };
            freed += before.saturating_sub(part.memory_size());
        }
        freed
    }

    fn clone_for_checkpoint(&self, cx: &Cx, id: NodeId) -> Result<Node> {
        let pin = self.pin_read(cx, id, &ReadIntent::NoPartitions, &crate::cmp::MemcmpKeyCmp)?;
        Ok(pin.clone_for_checkpoint())
    }

    fn n_nodes(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }
}

// ---------------------------------------------------------------------------
// Partition codec
// ---------------------------------------------------------------------------
//
// Only the cache speaks this format; the engine's one bit-exact contract is
// the message-buffer entry layout, which is embedded verbatim here.

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn take_u32(bytes: &[u8], pos: &mut usize) -> u32 {
    let v = u32::from_le_bytes(bytes[*pos..*pos + 4].try_into().unwrap());
    *pos += 4;
    v
}

fn take_u64(bytes: &[u8], pos: &mut usize) -> u64 {
    let v = u64::from_le_bytes(bytes[*pos..*pos + 8].try_into().unwrap());
    *pos += 8;
    v
}

fn take_slice<'a>(bytes: &'a [u8], pos: &mut usize) -> &'a [u8] {
    let len = take_u32(bytes, pos) as usize;
    let s = &bytes[*pos..*pos + len];
    *pos += len;
    s
}

fn put_version(out: &mut Vec<u8>, value: &VersionValue) {
    match value {
        VersionValue::Absent => out.push(0),
        VersionValue::Present(v) => {
            out.push(1);
            put_bytes(out, v);
        }
    }
}

fn take_version(bytes: &[u8], pos: &mut usize) -> VersionValue {
    let tag = bytes[*pos];
    *pos += 1;
    match tag {
        0 => VersionValue::Absent,
        1 => VersionValue::Present(take_slice(bytes, pos).into()),
        other => panic!("corrupt version tag {other}"),
    }
}

fn encode_store(store: &ChildStore, _cmp: &dyn KeyCmp) -> Vec<u8> {
    let mut out = Vec::new();
    match store {
        ChildStore::Buffered(bc) => {
            out.push(0);
            out.extend_from_slice(&(bc.buffer.n_entries() as u32).to_le_bytes());
            out.extend_from_slice(&bc.workdone.to_le_bytes());
            out.extend_from_slice(&bc.generation.to_le_bytes());
            put_bytes(&mut out, bc.buffer.raw_bytes());
        }
        ChildStore::Basement(bn) => {
            out.push(1);
            out.extend_from_slice(&bn.max_msn_applied.get().to_le_bytes());
            out.extend_from_slice(&bn.stat_delta.rows.to_le_bytes());
            out.extend_from_slice(&bn.stat_delta.bytes.to_le_bytes());
            out.extend_from_slice(&(bn.n_rows() as u32).to_le_bytes());
            for (key, entry) in bn.iter() {
                put_bytes(&mut out, key);
                put_version(&mut out, &entry.committed);
                out.push(entry.provisional.len() as u8);
                for p in &entry.provisional {
                    out.extend_from_slice(&p.xid.get().to_le_bytes());
                    put_version(&mut out, &p.value);
                }
            }
        }
    }
    out
}

fn decode_store(bytes: &[u8], height: u32, cmp: &dyn KeyCmp) -> ChildStore {
    let mut pos = 0usize;
    let tag = bytes[pos];
    pos += 1;
    match tag {
        0 => {
            assert!(height > 0, "buffered partition on a leaf");
            let n_entries = take_u32(bytes, &mut pos) as usize;
            let workdone = take_u64(bytes, &mut pos);
            let generation = take_u64(bytes, &mut pos);
            let raw = take_slice(bytes, &mut pos).to_vec();
            let buffer = MessageBuffer::from_raw(raw, n_entries);
            let index = MsgIndex::rebuild(&buffer, cmp);
            ChildStore::Buffered(BufferedChild {
                buffer,
                index,
                workdone,
                generation,
                ..BufferedChild::default()
            })
        }
        1 => {
            assert!(height == 0, "basement partition on an internal node");
            let max_msn = Msn::new(take_u64(bytes, &mut pos));
            let delta = StatDelta {
                rows: take_u64(bytes, &mut pos) as i64,
                bytes: take_u64(bytes, &mut pos) as i64,
            };
            let n_rows = take_u32(bytes, &mut pos) as usize;
            let mut rows = Vec::with_capacity(n_rows);
            for _ in 0..n_rows {
                let key: Box<[u8]> = take_slice(bytes, &mut pos).into();
                let committed = take_version(bytes, &mut pos);
                let n_prov = bytes[pos] as usize;
                pos += 1;
                let mut provisional = Vec::with_capacity(n_prov);
                for _ in 0..n_prov {
                    let xid = TxnId::new(take_u64(bytes, &mut pos));
                    let value = take_version(bytes, &mut pos);
                    provisional.push(Provisional { xid, value });
                }
                rows.push((
                    key,
                    RowEntry {
                        committed,
                        provisional,
                    },
                ));
            }
            ChildStore::Basement(Basement::from_rows(rows, max_msn, delta))
        }
        other => panic!("corrupt partition tag {other}"),
    }
}
