//! Key comparison, injected per open tree handle.

use std::cmp::Ordering;
use std::fmt;

/// A total order over keys.
///
/// Every ordered structure in the engine — pivots, message indexes, basement
/// rows — consults the handle's comparator; none of them assume byte order.
pub trait KeyCmp: Send + Sync {
    /// Three-way comparison of two keys.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Name for diagnostics.
    fn name(&self) -> &'static str {
        "custom"
    }
}

impl fmt::Debug for dyn KeyCmp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyCmp({})", self.name())
    }
}

/// The default comparator: plain byte order.
///
/// Sequential byte access, no pointer chasing; ties broken by length.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemcmpKeyCmp;

impl KeyCmp for MemcmpKeyCmp {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        let common = a.len().min(b.len());
        for idx in 0..common {
            let l = a[idx];
            let r = b[idx];
            if l != r {
                return l.cmp(&r);
            }
        }
        a.len().cmp(&b.len())
    }

    fn name(&self) -> &'static str {
        "memcmp"
    }
}
