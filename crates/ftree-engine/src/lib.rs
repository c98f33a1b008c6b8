//! Ferrotree engine: the write-buffering and shape-maintenance core of a
//! fractal-tree storage engine.
//!
//! Mutations enter as [`Message`]s and are buffered in per-child byte arenas
//! inside internal nodes, pushed toward the leaves either eagerly (promotion
//! at injection time) or lazily (buffer flushes), and folded into leaf row
//! sets on read or flush with multi-version garbage collection. Node shape
//! is maintained by split/merge against configured thresholds, and each
//! partition of a node tracks its own residency so a node can be only
//! partially in memory.
//!
//! Collaborators are explicit seams: the page cache ([`NodeCache`]), the
//! transaction manager ([`TxnManager`]), the key comparator ([`KeyCmp`]),
//! and the per-row update callback ([`UpdateFn`]).

pub mod apply;
pub mod basement;
pub mod cache;
pub mod cmp;
pub mod gc;
pub mod message;
pub mod metrics;
pub mod msgbuf;
pub mod msgindex;
pub mod node;
pub mod registry;
pub mod reshape;
pub mod residency;
pub mod tree;
pub mod txn;

mod flush;
mod inject;

#[cfg(test)]
mod tree_invariant_tests;

pub use apply::{apply_message_to_basement, ApplyCtx, ApplyOutcome, UpdateDecision, UpdateFn};
pub use basement::{Basement, Provisional, RowEntry, StatDelta, VersionValue};
pub use cache::{MemNodeCache, NodeCache, PinnedRead, PinnedUpgradable, PinnedWrite};
pub use cmp::{KeyCmp, MemcmpKeyCmp};
pub use gc::{garbage_collect_basement, GcStats, Watermarks};
pub use message::{Message, MessageView};
pub use metrics::{MetricsSnapshot, TreeMetrics};
pub use msgbuf::{MessageBuffer, MessageBufferIter};
pub use msgindex::{IndexSet, MsgIndex};
pub use node::{BufferedChild, ChildStore, FlowWindow, Node, Partition, PartitionState};
pub use registry::HandleRegistry;
pub use reshape::{is_gorged, node_reactivity, Reactivity, SplitBias};
pub use residency::{partitions_required, ReadIntent};
pub use tree::{FractalTree, TreeBuilder};
pub use txn::{FixedTxnManager, NoTxnManager, TxnManager};
