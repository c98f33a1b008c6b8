//! The per-child message buffer: an append-only byte arena.
//!
//! Messages are packed back-to-back with no padding:
//!
//! ```text
//! +-------------+-------------+---------+------------+---------+-----------+-----------+-------------+
//! | key_len:u32 | val_len:u32 | type:u8 | is_fresh:u8| msn:u64 | xid_chain | key bytes | value bytes |
//! +-------------+-------------+---------+------------+---------+-----------+-----------+-------------+
//! ```
//!
//! All integers little-endian. The xid chain is self-describing
//! (`[n:u8][xid:u64]*n`), so an entry's size is computable from its own
//! fields. Offsets into the arena stay valid for the life of the buffer:
//! growth reallocates but never moves an entry relative to the arena start,
//! never reorders, and the arena never shrinks.

use ftree_types::{MessageType, Msn, XidChain};

use crate::message::{Message, MessageView};

/// Fixed-width prefix before the xid chain: two u32 lengths, the type byte,
/// the freshness byte, and the u64 MSN.
const ENTRY_FIXED_PREFIX: usize = 4 + 4 + 1 + 1 + 8;

/// Byte offset of the freshness flag within an entry.
const FRESH_FLAG_AT: usize = 4 + 4 + 1;

/// Minimum arena capacity; growth targets are rounded up to a power of two
/// at or above this.
pub const INITIAL_CAPACITY: usize = 4096;

/// An append-only arena of serialized messages for one tree-node child slot.
#[derive(Debug, Clone, Default)]
pub struct MessageBuffer {
    data: Vec<u8>,
    n_entries: usize,
}

/// Two buffers are equal iff their occupied bytes are byte-identical.
/// Capacity (the growth path taken) is observationally transparent.
impl PartialEq for MessageBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for MessageBuffer {}

impl MessageBuffer {
    /// An empty buffer. The arena is allocated lazily on first append.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries appended so far.
    #[must_use]
    pub fn n_entries(&self) -> usize {
        self.n_entries
    }

    /// Whether no entry has been appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.n_entries == 0
    }

    /// Occupied bytes: the sum of every entry's exact encoded size.
    #[must_use]
    pub fn bytes_in_use(&self) -> usize {
        self.data.len()
    }

    /// Exact encoded size of a message with the given key/value/xids.
    #[must_use]
    pub fn encoded_len(xids: &XidChain, key: &[u8], value: &[u8]) -> usize {
        ENTRY_FIXED_PREFIX + xids.encoded_len() + key.len() + value.len()
    }

    /// Append a sequenced message, returning its arena offset.
    ///
    /// Never fails: exhausting the arena's 32-bit offset space means the
    /// engine's memory accounting is broken, and the process aborts rather
    /// than risk dropping a durable mutation.
    pub fn append(
        &mut self,
        mtype: MessageType,
        is_fresh: bool,
        msn: Msn,
        xids: &XidChain,
        key: &[u8],
        value: &[u8],
    ) -> u32 {
        let entry_len = Self::encoded_len(xids, key, value);
        let offset = self.data.len();
        let end = offset
            .checked_add(entry_len)
            .filter(|&e| e <= u32::MAX as usize)
            .unwrap_or_else(|| panic!("message buffer arena exhausted at {offset} bytes"));
        self.grow_to(end);

        debug_assert!(u32::try_from(key.len()).is_ok() && u32::try_from(value.len()).is_ok());
        self.data.extend_from_slice(&(key.len() as u32).to_le_bytes());
        self.data
            .extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.data.push(mtype.to_wire());
        self.data.push(u8::from(is_fresh));
        self.data.extend_from_slice(&msn.get().to_le_bytes());
        xids.encode_into(&mut self.data);
        self.data.extend_from_slice(key);
        self.data.extend_from_slice(value);
        debug_assert_eq!(self.data.len(), end);

        self.n_entries += 1;
        offset as u32
    }

    /// Append from an owned message.
    pub fn append_message(&mut self, msg: &Message, msn: Msn, is_fresh: bool) -> u32 {
        self.append(msg.mtype, is_fresh, msn, &msg.xids, &msg.key, &msg.value)
    }

    /// Append a copy of a decoded view (used when a flush moves an entry one
    /// level down: the MSN and freshness travel with it).
    pub fn append_view(&mut self, view: &MessageView<'_>) -> u32 {
        self.append(
            view.mtype,
            view.is_fresh,
            view.msn,
            &view.xids,
            view.key,
            view.value,
        )
    }

    /// Decode the entry at `offset`.
    ///
    /// Offsets are produced by [`append`](Self::append) and remain valid for
    /// the buffer's lifetime; anything else is corruption and aborts.
    #[must_use]
    pub fn view_at(&self, offset: u32) -> MessageView<'_> {
        let at = offset as usize;
        let bytes = &self.data;
        assert!(
            at + ENTRY_FIXED_PREFIX <= bytes.len(),
            "message buffer offset {offset} out of bounds"
        );
        let key_len = u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap()) as usize;
        let val_len = u32::from_le_bytes(bytes[at + 4..at + 8].try_into().unwrap()) as usize;
        let mtype = MessageType::from_wire(bytes[at + 8])
            .unwrap_or_else(|| panic!("corrupt message type at offset {offset}"));
        let is_fresh = bytes[at + 9] != 0;
        let msn = Msn::new(u64::from_le_bytes(bytes[at + 10..at + 18].try_into().unwrap()));
        let (xids, xids_len) = XidChain::decode_from(&bytes[at + ENTRY_FIXED_PREFIX..])
            .unwrap_or_else(|| panic!("corrupt xid chain at offset {offset}"));
        let key_at = at + ENTRY_FIXED_PREFIX + xids_len;
        let val_at = key_at + key_len;
        assert!(val_at + val_len <= bytes.len(), "corrupt entry lengths");
        MessageView {
            mtype,
            is_fresh,
            msn,
            xids,
            key: &bytes[key_at..val_at],
            value: &bytes[val_at..val_at + val_len],
        }
    }

    /// Key bytes of the entry at `offset` without decoding the whole entry.
    #[must_use]
    pub fn key_at(&self, offset: u32) -> &[u8] {
        let at = offset as usize;
        let bytes = &self.data;
        let key_len = u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap()) as usize;
        let xids_len = 1 + bytes[at + ENTRY_FIXED_PREFIX] as usize * 8;
        let key_at = at + ENTRY_FIXED_PREFIX + xids_len;
        &bytes[key_at..key_at + key_len]
    }

    /// MSN of the entry at `offset`.
    #[must_use]
    pub fn msn_at(&self, offset: u32) -> Msn {
        let at = offset as usize;
        Msn::new(u64::from_le_bytes(
            self.data[at + 10..at + 18].try_into().unwrap(),
        ))
    }

    /// Total encoded size of the entry at `offset`.
    #[must_use]
    pub fn entry_len_at(&self, offset: u32) -> usize {
        let at = offset as usize;
        let bytes = &self.data;
        let key_len = u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap()) as usize;
        let val_len = u32::from_le_bytes(bytes[at + 4..at + 8].try_into().unwrap()) as usize;
        let xids_len = 1 + bytes[at + ENTRY_FIXED_PREFIX] as usize * 8;
        ENTRY_FIXED_PREFIX + xids_len + key_len + val_len
    }

    /// Flip the entry at `offset` from fresh to stale, in place.
    ///
    /// The transition is one-way; flipping an already-stale entry is a no-op.
    pub fn mark_stale(&mut self, offset: u32) {
        let at = offset as usize + FRESH_FLAG_AT;
        self.data[at] = 0;
    }

    /// A restartable iterator over decoded entries in physical append order.
    #[must_use]
    pub fn iter(&self) -> MessageBufferIter<'_> {
        MessageBufferIter { buf: self, pos: 0 }
    }

    /// The occupied arena bytes, for partition serialization.
    #[must_use]
    pub fn raw_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Rebuild a buffer from serialized arena bytes.
    #[must_use]
    pub(crate) fn from_raw(data: Vec<u8>, n_entries: usize) -> Self {
        Self { data, n_entries }
    }

    /// Grow the arena so `required` occupied bytes fit.
    ///
    /// Capacity targets round up to the next power of two at or above
    /// [`INITIAL_CAPACITY`]; existing bytes are preserved verbatim so every
    /// previously issued offset stays valid.
    fn grow_to(&mut self, required: usize) {
        if required <= self.data.capacity() {
            return;
        }
        let target = required.next_power_of_two().max(INITIAL_CAPACITY);
        self.data.reserve_exact(target - self.data.len());
    }
}

/// Iterator over a buffer's entries in physical order. Each call to
/// [`MessageBuffer::iter`] restarts from the first entry.
#[derive(Debug, Clone)]
pub struct MessageBufferIter<'a> {
    buf: &'a MessageBuffer,
    pos: usize,
}

impl<'a> Iterator for MessageBufferIter<'a> {
    type Item = (u32, MessageView<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.buf.data.len() {
            return None;
        }
        let offset = self.pos as u32;
        let view = self.buf.view_at(offset);
        self.pos += self.buf.entry_len_at(offset);
        Some((offset, view))
    }
}
