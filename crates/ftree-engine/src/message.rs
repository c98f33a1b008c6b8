//! Mutation messages and their decoded in-buffer views.

use ftree_types::{MessageType, Msn, XidChain};

/// An un-sequenced mutation handed to the injection engine.
///
/// A message has no MSN of its own: the sequence number is issued by the
/// tree's atomic counter at the moment a node is write-locked for the actual
/// injection, never earlier. Once built, a message is immutable; it transfers
/// into a message buffer by byte copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// What the message does when it reaches a row.
    pub mtype: MessageType,
    /// Nested-transaction scope, outermost first.
    pub xids: XidChain,
    /// Target key. Ignored by broadcast types.
    pub key: Box<[u8]>,
    /// Payload. Empty for types without one.
    pub value: Box<[u8]>,
}

impl Message {
    /// An insert-or-overwrite in the committed scope.
    #[must_use]
    pub fn insert(key: &[u8], value: &[u8]) -> Self {
        Self {
            mtype: MessageType::Insert,
            xids: XidChain::root(),
            key: key.into(),
            value: value.into(),
        }
    }

    /// An insert that is dropped if a visible row already exists.
    #[must_use]
    pub fn insert_unique(key: &[u8], value: &[u8]) -> Self {
        Self {
            mtype: MessageType::InsertNoOverwrite,
            xids: XidChain::root(),
            key: key.into(),
            value: value.into(),
        }
    }

    /// A delete regardless of current value.
    #[must_use]
    pub fn delete(key: &[u8]) -> Self {
        Self {
            mtype: MessageType::DeleteAny,
            xids: XidChain::root(),
            key: key.into(),
            value: Box::default(),
        }
    }

    /// A pointwise application of the handle's update function.
    #[must_use]
    pub fn update(key: &[u8], extra: &[u8]) -> Self {
        Self {
            mtype: MessageType::Update,
            xids: XidChain::root(),
            key: key.into(),
            value: extra.into(),
        }
    }

    /// A broadcast application of the handle's update function.
    #[must_use]
    pub fn update_broadcast(extra: &[u8]) -> Self {
        Self {
            mtype: MessageType::UpdateBroadcastAll,
            xids: XidChain::root(),
            key: Box::default(),
            value: extra.into(),
        }
    }

    /// Attach a transaction scope.
    #[must_use]
    pub fn with_xids(mut self, xids: XidChain) -> Self {
        self.xids = xids;
        self
    }

    /// Construct with an explicit type, scope, key, and value.
    #[must_use]
    pub fn new(mtype: MessageType, xids: XidChain, key: &[u8], value: &[u8]) -> Self {
        Self {
            mtype,
            xids,
            key: key.into(),
            value: value.into(),
        }
    }

    /// Whether this message applies to every row rather than one key.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.mtype.is_broadcast()
    }

    /// The decoded-view form of this message once sequenced.
    #[must_use]
    pub fn as_view(&self, msn: Msn, is_fresh: bool) -> MessageView<'_> {
        MessageView {
            mtype: self.mtype,
            is_fresh,
            msn,
            xids: self.xids.clone(),
            key: &self.key,
            value: &self.value,
        }
    }
}

/// A decoded message as stored in a message buffer.
///
/// Key and value borrow from the buffer's arena; the xid chain is small and
/// decoded inline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageView<'a> {
    pub mtype: MessageType,
    pub is_fresh: bool,
    pub msn: Msn,
    pub xids: XidChain,
    pub key: &'a [u8],
    pub value: &'a [u8],
}

impl MessageView<'_> {
    /// Whether this view applies to every row rather than one key.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.mtype.is_broadcast()
    }

    /// An owned message equivalent to this view (drops the MSN: re-injection
    /// into another tree would sequence it anew).
    #[must_use]
    pub fn to_message(&self) -> Message {
        Message {
            mtype: self.mtype,
            xids: self.xids.clone(),
            key: self.key.into(),
            value: self.value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ftree_types::TxnId;

    #[test]
    fn constructors_set_types() {
        assert_eq!(Message::insert(b"k", b"v").mtype, MessageType::Insert);
        assert_eq!(
            Message::insert_unique(b"k", b"v").mtype,
            MessageType::InsertNoOverwrite
        );
        assert_eq!(Message::delete(b"k").mtype, MessageType::DeleteAny);
        assert_eq!(Message::update(b"k", b"x").mtype, MessageType::Update);
        assert!(Message::update_broadcast(b"x").is_broadcast());
    }

    #[test]
    fn view_round_trip() {
        let msg = Message::insert(b"key", b"val").with_xids(XidChain::single(TxnId::new(9)));
        let view = msg.as_view(Msn::new(5), true);
        assert_eq!(view.msn, Msn::new(5));
        assert!(view.is_fresh);
        assert_eq!(view.key, b"key");
        assert_eq!(view.to_message(), msg);
    }
}
