//! Open-handle registry.
//!
//! An explicit object with its own lifecycle, owned by the surrounding
//! engine context — opening and closing trees goes through it rather than
//! through process-wide statics.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use ftree_error::{FtError, Result};

use crate::tree::FractalTree;

/// Registry of open tree handles, keyed by name.
#[derive(Default)]
pub struct HandleRegistry {
    open: Mutex<HashMap<String, Arc<FractalTree>>>,
}

impl HandleRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly opened tree. Fails if the name is taken.
    pub fn register(&self, name: &str, tree: FractalTree) -> Result<Arc<FractalTree>> {
        let mut open = self.open.lock();
        if open.contains_key(name) {
            return Err(FtError::AlreadyOpen {
                name: name.to_owned(),
            });
        }
        let handle = Arc::new(tree);
        open.insert(name.to_owned(), Arc::clone(&handle));
        debug!(name, "registered tree handle");
        Ok(handle)
    }

    /// Fetch an open handle.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<FractalTree>> {
        self.open.lock().get(name).cloned()
    }

    /// Close a handle. Outstanding clones stay usable; the name frees up.
    pub fn close(&self, name: &str) -> Result<()> {
        match self.open.lock().remove(name) {
            Some(_) => {
                debug!(name, "closed tree handle");
                Ok(())
            }
            None => Err(FtError::NotOpen {
                name: name.to_owned(),
            }),
        }
    }

    /// Names of the currently open handles, unordered.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.open.lock().keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.open.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.open.lock().is_empty()
    }
}
