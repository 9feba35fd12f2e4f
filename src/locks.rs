//! Advisory reentrancy lock registry.
//!
//! Generated call sites wrapping overlapping asynchronous invocations into
//! the same instance use this to detect whether a higher-numbered call is
//! still outstanding and defer their own arena reset accordingly. It is
//! bookkeeping, not enforcement: the core never takes a lock internally, and
//! a caller that ignores the registry gets the original racy behavior.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashSet;

/// Sentinel returned when no holds are outstanding.
pub const NO_LOCKS: i64 = -1;

/// Set of outstanding hold identifiers plus the cached maximum.
///
/// Invariant: `max` equals the greatest element in `held`, or [`NO_LOCKS`]
/// when the set is empty.
#[derive(Debug, Default)]
pub struct LockRegistry {
    held: HashSet<i64>,
    max: Option<i64>,
}

impl LockRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a hold and return the new maximum outstanding identifier.
    pub fn add(&mut self, id: i64) -> i64 {
        self.held.insert(id);
        if self.max.map_or(true, |m| id > m) {
            self.max = Some(id);
        }
        self.max.unwrap_or(NO_LOCKS)
    }

    /// Remove a hold and return the new maximum, or [`NO_LOCKS`] when the
    /// set becomes empty.
    pub fn remove(&mut self, id: i64) -> i64 {
        self.held.remove(&id);
        if self.max == Some(id) {
            self.max = self.held.iter().copied().max();
        }
        self.max.unwrap_or(NO_LOCKS)
    }

    /// The greatest outstanding identifier, or [`NO_LOCKS`] when empty.
    pub fn max(&self) -> i64 {
        self.max.unwrap_or(NO_LOCKS)
    }

    /// Number of outstanding holds.
    pub fn len(&self) -> usize {
        self.held.len()
    }

    /// Check whether no holds are outstanding.
    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

// Process-wide shared state, initialized on first use. Not per-instance:
// generated call sites coordinate across every wrapped module in the process.
static LOCKS: Lazy<Mutex<LockRegistry>> = Lazy::new(|| Mutex::new(LockRegistry::new()));

/// Insert `id` into the process-wide hold set and return the new maximum.
pub fn add_lock(id: i64) -> i64 {
    LOCKS.lock().add(id)
}

/// Remove `id` from the process-wide hold set and return the new maximum,
/// or [`NO_LOCKS`] when the set becomes empty.
pub fn remove_lock(id: i64) -> i64 {
    LOCKS.lock().remove(id)
}
