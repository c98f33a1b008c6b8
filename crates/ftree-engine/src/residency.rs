//! Partial residency: what a read intent requires, and when a partition may
//! be evicted independently of its node.
//!
//! Each partition moves between `OnDisk`, `Compressed`, and `Available`
//! (see [`crate::node::PartitionState`]). Fetch materializes exactly the
//! partitions an intent needs; partial eviction drops payloads whose
//! clock-sweep bit shows no recent use, but only on clean nodes read from a
//! layout new enough to address partitions independently.

use ftree_types::TreeConfig;

use crate::cmp::KeyCmp;
use crate::node::Node;

/// What a pin is about to do with the node's partitions.
#[derive(Debug, Clone, Copy)]
pub enum ReadIntent<'a> {
    /// Shape-only access: pivots and child pointers, no payloads.
    NoPartitions,
    /// Every partition (flush, split, merge, full serialization).
    All,
    /// Only the partition owning one key.
    Keymatch(&'a [u8]),
    /// The partitions overlapping an inclusive key range.
    Range { lo: &'a [u8], hi: &'a [u8] },
    /// Forward-looking range starting at a key; best-effort, disabled by
    /// configuration.
    Prefetch { start: &'a [u8] },
}

/// Partition slots the intent requires to be available.
#[must_use]
pub fn partitions_required(
    node: &Node,
    cmp: &dyn KeyCmp,
    intent: &ReadIntent<'_>,
    config: &TreeConfig,
) -> Vec<usize> {
    match intent {
        ReadIntent::NoPartitions => Vec::new(),
        ReadIntent::All => (0..node.n_children()).collect(),
        ReadIntent::Keymatch(key) => vec![node.which_child(cmp, key)],
        ReadIntent::Range { lo, hi } => {
            let first = node.which_child(cmp, lo);
            let last = node.which_child(cmp, hi);
            (first..=last.max(first)).collect()
        }
        ReadIntent::Prefetch { start } => {
            if config.prefetch_enabled {
                (node.which_child(cmp, start)..node.n_children()).collect()
            } else {
                Vec::new()
            }
        }
    }
}

/// Whether the intent needs a fetch before the node is usable.
#[must_use]
pub fn fetch_required(
    node: &Node,
    cmp: &dyn KeyCmp,
    intent: &ReadIntent<'_>,
    config: &TreeConfig,
) -> bool {
    partitions_required(node, cmp, intent, config)
        .into_iter()
        .any(|i| !node.partition(i).is_available())
}

/// Whether this node may partially evict at all: only clean nodes whose
/// on-disk layout supports independent partition fetch.
#[must_use]
pub fn partial_eviction_allowed(node: &Node) -> bool {
    !node.dirty && node.layout_version.supports_partial_residency()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmp::MemcmpKeyCmp;
    use crate::node::{Node, Partition};
    use ftree_types::{DiskAddr, LayoutVersion, NodeId};

    fn node_with_pivots(pivots: &[&[u8]]) -> Node {
        let children = (0..=pivots.len() as u64).map(NodeId::new).collect();
        Node::new_internal(1, pivots.iter().map(|p| (*p).into()).collect(), children)
    }

    #[test]
    fn intents_map_to_partitions() {
        let cmp = MemcmpKeyCmp;
        let cfg = TreeConfig::default();
        let node = node_with_pivots(&[b"g", b"p"]);

        assert!(partitions_required(&node, &cmp, &ReadIntent::NoPartitions, &cfg).is_empty());
        assert_eq!(
            partitions_required(&node, &cmp, &ReadIntent::All, &cfg),
            vec![0, 1, 2]
        );
        assert_eq!(
            partitions_required(&node, &cmp, &ReadIntent::Keymatch(b"h"), &cfg),
            vec![1]
        );
        assert_eq!(
            partitions_required(
                &node,
                &cmp,
                &ReadIntent::Range { lo: b"a", hi: b"h" },
                &cfg
            ),
            vec![0, 1]
        );
    }

    #[test]
    fn prefetch_respects_configuration() {
        let cmp = MemcmpKeyCmp;
        let node = node_with_pivots(&[b"g", b"p"]);
        let on = TreeConfig::default();
        let off = TreeConfig {
            prefetch_enabled: false,
            ..TreeConfig::default()
        };

        assert_eq!(
            partitions_required(&node, &cmp, &ReadIntent::Prefetch { start: b"h" }, &on),
            vec![1, 2]
        );
        assert!(
            partitions_required(&node, &cmp, &ReadIntent::Prefetch { start: b"h" }, &off)
                .is_empty()
        );
    }

    #[test]
    fn fetch_required_only_for_missing_partitions() {
        let cmp = MemcmpKeyCmp;
        let cfg = TreeConfig::default();
        let mut node = node_with_pivots(&[b"g"]);
        node.partitions[1] = Partition::on_disk(DiskAddr::new(1));

        assert!(!fetch_required(&node, &cmp, &ReadIntent::Keymatch(b"a"), &cfg));
        assert!(fetch_required(&node, &cmp, &ReadIntent::Keymatch(b"z"), &cfg));
        assert!(fetch_required(&node, &cmp, &ReadIntent::All, &cfg));
    }

    #[test]
    fn eviction_needs_clean_node_and_new_layout() {
        let mut node = node_with_pivots(&[b"g"]);
        assert!(partial_eviction_allowed(&node));

        node.dirty = true;
        assert!(!partial_eviction_allowed(&node));

        node.dirty = false;
        node.layout_version = LayoutVersion::new(1);
        assert!(!partial_eviction_allowed(&node));
    }
}
