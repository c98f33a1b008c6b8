//! Tree shape and flush-heuristic configuration.

/// Configuration for one fractal tree.
///
/// Every threshold the reshape and flush heuristics consult lives here; the
/// engine hard-codes none of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TreeConfig {
    /// Target serialized size of one node, in bytes. A leaf whose rows exceed
    /// this is fissible; an internal node whose buffered bytes plus
    /// accumulated work exceed `node_size * gorged_factor` is a flush
    /// candidate.
    pub node_size: usize,
    /// Target serialized size of one basement (leaf partition), in bytes.
    pub basement_size: usize,
    /// Maximum fanout of an internal node before it is fissible.
    pub fanout_max: usize,
    /// Denominator of the fusible fraction: a node under
    /// `1/fusible_fraction_den` of its budget wants a merge. Defaults to
    /// one quarter.
    pub fusible_fraction_den: usize,
    /// Multiplier applied to `node_size` in the gorged test.
    pub gorged_factor: usize,
    /// Whether internal-node buffers are compressed in memory on partial
    /// eviction instead of being written back and dropped.
    pub compress_buffers_on_evict: bool,
    /// Whether forward-looking prefetch read intents fetch anything.
    pub prefetch_enabled: bool,
    /// Whether gorged-node child flushes run on a background worker instead
    /// of the injecting thread.
    pub background_flush: bool,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            node_size: 4 << 20,
            basement_size: 128 << 10,
            fanout_max: 16,
            fusible_fraction_den: 4,
            gorged_factor: 1,
            compress_buffers_on_evict: true,
            prefetch_enabled: true,
            background_flush: true,
        }
    }
}

impl TreeConfig {
    /// A small-threshold configuration for tests: shapes react after a
    /// handful of rows instead of megabytes.
    #[must_use]
    pub fn small_for_tests() -> Self {
        Self {
            node_size: 512,
            basement_size: 256,
            fanout_max: 4,
            background_flush: false,
            ..Self::default()
        }
    }

    /// Byte threshold under which a leaf is fusible.
    #[must_use]
    pub fn leaf_fusible_bytes(&self) -> usize {
        self.node_size / self.fusible_fraction_den.max(1)
    }

    /// Fanout under which an internal node is fusible.
    #[must_use]
    pub fn fanout_fusible(&self) -> usize {
        self.fanout_max / self.fusible_fraction_den.max(1)
    }

    /// Buffered-work threshold above which an internal node is gorged.
    #[must_use]
    pub fn gorged_bytes(&self) -> usize {
        self.node_size.saturating_mul(self.gorged_factor.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_thresholds() {
        let cfg = TreeConfig::default();
        assert_eq!(cfg.node_size, 4 << 20);
        assert_eq!(cfg.fanout_max, 16);
        assert_eq!(cfg.leaf_fusible_bytes(), (4 << 20) / 4);
        assert_eq!(cfg.fanout_fusible(), 4);
        assert_eq!(cfg.gorged_bytes(), 4 << 20);
    }

    #[test]
    fn fusible_fraction_is_configurable() {
        let cfg = TreeConfig {
            fusible_fraction_den: 8,
            ..TreeConfig::default()
        };
        assert_eq!(cfg.leaf_fusible_bytes(), (4 << 20) / 8);
        assert_eq!(cfg.fanout_fusible(), 2);
    }

    #[test]
    fn config_serializes() {
        let cfg = TreeConfig::default();
        let json = serde_json::to_string(&cfg).expect("serialize");
        let back: TreeConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, cfg);
    }
}
