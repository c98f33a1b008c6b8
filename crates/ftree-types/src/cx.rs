//! Caller context threaded through long-running tree operations.
//!
//! `Cx` carries an interrupt flag shared with the caller. Operations in this
//! engine are not cancellable mid-flight: `checkpoint` is consulted only
//! between independent top-level steps (for example between a scan's
//! "no acceptable row here, continue to the next leaf?" decisions), never
//! inside a locked region.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The operation was interrupted by the caller.
///
/// Distinct from "not found": an interrupted search says nothing about
/// whether the key exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation interrupted by caller")
    }
}

impl std::error::Error for Interrupted {}

/// Shared interrupt state between a `Cx` and its [`InterruptHandle`]s.
#[derive(Debug, Default)]
struct Shared {
    interrupted: AtomicBool,
}

/// Caller context: interrupt checkpointing for long-running operations.
#[derive(Debug, Clone, Default)]
pub struct Cx {
    shared: Arc<Shared>,
}

impl Cx {
    /// A context that is never interrupted unless a handle requests it.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle the caller can use to interrupt from another thread.
    #[must_use]
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Whether an interrupt has been requested.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.shared.interrupted.load(Ordering::Acquire)
    }

    /// Fail with [`Interrupted`] if an interrupt has been requested.
    ///
    /// Call this only between independent top-level steps.
    pub fn checkpoint(&self) -> Result<(), Interrupted> {
        if self.is_interrupted() {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }
}

/// Requests interruption of every operation sharing the originating `Cx`.
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    shared: Arc<Shared>,
}

impl InterruptHandle {
    /// Request interruption. Idempotent.
    pub fn interrupt(&self) {
        self.shared.interrupted.store(true, Ordering::Release);
    }
}
