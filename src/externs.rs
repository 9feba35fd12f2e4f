//! Identity-preserving storage for host values that cannot be copied into
//! WASM linear memory.
//!
//! Entries are minted during lowering and invalidated en masse by the arena
//! reset; there is no per-entry free. Handles are monotonically increasing
//! and never reused within a table's lifetime, so a stale handle from before
//! a reset fails to resolve instead of aliasing a newer entry.

use crate::error::{GlueError, Result};
use crate::value::Value;
use std::collections::HashMap;

/// Per-instance mapping from integer handle to host value.
#[derive(Default)]
pub struct ExternTable {
    entries: HashMap<u32, Value>,
    next_handle: u32,
}

impl ExternTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value under a freshly minted handle.
    ///
    /// The same value stored twice yields two distinct handles; there is no
    /// deduplication.
    pub fn insert(&mut self, value: Value) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.entries.insert(handle, value);
        handle
    }

    /// Resolve a handle minted in the current arena epoch.
    pub fn get(&self, handle: u32) -> Result<&Value> {
        self.entries
            .get(&handle)
            .ok_or(GlueError::ExternNotFound { handle })
    }

    /// Invalidate every entry. Handles keep increasing across clears.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check whether the table holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn handles_are_monotonic_and_distinct() {
        let mut table = ExternTable::new();
        let obj = Value::extern_val(42u64);
        let h0 = table.insert(obj.clone());
        let h1 = table.insert(obj.clone());
        assert_eq!(h0, 0);
        assert_eq!(h1, 1);
        // no dedup: both handles resolve, by identity
        assert_eq!(table.get(h0).unwrap(), &obj);
        assert_eq!(table.get(h1).unwrap(), &obj);
    }

    #[test]
    fn clear_invalidates_but_does_not_reset_handles() {
        let mut table = ExternTable::new();
        let h0 = table.insert(Value::Int(1));
        table.clear();
        assert!(table.is_empty());
        assert!(matches!(
            table.get(h0),
            Err(GlueError::ExternNotFound { handle: 0 })
        ));
        let h1 = table.insert(Value::Int(2));
        assert_eq!(h1, 1);
    }

    #[test]
    fn identity_preserved_through_table() {
        let mut table = ExternTable::new();
        let payload: Arc<dyn std::any::Any + Send + Sync> = Arc::new("hello".to_string());
        let h = table.insert(Value::Extern(Arc::clone(&payload)));
        let got = table.get(h).unwrap();
        let Value::Extern(stored) = got else {
            panic!("expected extern");
        };
        assert!(Arc::ptr_eq(stored, &payload));
    }
}
