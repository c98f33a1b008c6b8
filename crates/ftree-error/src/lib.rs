use ftree_types::cx::Interrupted;
use ftree_types::NodeId;
use thiserror::Error;

/// Primary error type for Ferrotree operations.
///
/// Structured variants for the conditions callers can act on. Engine-level
/// invariant violations (pivot monotonicity, MSN monotonicity, buffer byte
/// layout, arena exhaustion, fetch checksum mismatch) are *not* represented
/// here: they indicate unrecoverable corruption and abort the process at the
/// point of detection.
#[derive(Error, Debug)]
pub enum FtError {
    // === Search outcomes ===
    /// A point lookup found no visible row for the key.
    #[error("key not found")]
    NotFound,

    /// The caller interrupted a long-running operation.
    #[error("operation interrupted by caller")]
    Interrupted,

    // === Cache collaborator ===
    /// The cache could not produce the requested node.
    #[error("node {node} is not present in the cache")]
    NodeMissing { node: NodeId },

    /// A non-blocking pin attempt found the node held in a conflicting mode.
    #[error("node {node} is pinned in a conflicting mode")]
    PinContended { node: NodeId },

    /// A partition fetch was requested for a node whose layout cannot
    /// address partitions independently.
    #[error("node {node} layout does not support partial fetch")]
    PartialFetchUnsupported { node: NodeId },

    // === Handle registry ===
    /// A tree with this name is already open.
    #[error("tree '{name}' is already open")]
    AlreadyOpen { name: String },

    /// No open tree with this name.
    #[error("tree '{name}' is not open")]
    NotOpen { name: String },

    // === Internal ===
    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl FtError {
    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error is transient and the operation may succeed if
    /// simply retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::PinContended { .. })
    }

    /// Whether this is a definitive search outcome rather than a failure.
    #[must_use]
    pub const fn is_search_outcome(&self) -> bool {
        matches!(self, Self::NotFound | Self::Interrupted)
    }
}

impl From<Interrupted> for FtError {
    fn from(_: Interrupted) -> Self {
        Self::Interrupted
    }
}

/// Result type alias using [`FtError`].
pub type Result<T> = std::result::Result<T, FtError>;

#[cfg(test)]
mod tests {
    use super::*;
    use ftree_types::Cx;

    #[test]
    fn error_display() {
        assert_eq!(FtError::NotFound.to_string(), "key not found");
        let err = FtError::NodeMissing {
            node: NodeId::new(3),
        };
        assert_eq!(err.to_string(), "node node:3 is not present in the cache");
    }

    #[test]
    fn transient_classification() {
        assert!(FtError::PinContended {
            node: NodeId::new(1)
        }
        .is_transient());
        assert!(!FtError::NotFound.is_transient());
        assert!(!FtError::internal("bug").is_transient());
    }

    #[test]
    fn search_outcomes_are_not_failures() {
        assert!(FtError::NotFound.is_search_outcome());
        assert!(FtError::Interrupted.is_search_outcome());
        assert!(!FtError::AlreadyOpen {
            name: "t".to_owned()
        }
        .is_search_outcome());
    }

    #[test]
    fn interrupted_converts_from_checkpoint() {
        let cx = Cx::new();
        cx.interrupt_handle().interrupt();
        let err: FtError = cx.checkpoint().unwrap_err().into();
        assert!(matches!(err, FtError::Interrupted));
    }
}
