//! Host intrinsics for the reserved `js` import module.
//!
//! Generated guest modules import well-known host globals by name
//! (`console.log` and friends). Names resolve through an explicit registry
//! populated at startup; an unresolved name fails when the module is
//! wrapped, not when the guest first calls it.

use crate::error::{GlueError, Result};
use crate::value::Value;
use crate::wrapper::{ImportContext, ImportFn};
use std::collections::HashMap;
use std::sync::Arc;

/// Named host functions available to guest imports from the reserved
/// module.
///
/// The default registry routes `console.log`, `console.warn`, and
/// `console.error` to `tracing` events at the matching level.
#[derive(Clone)]
pub struct IntrinsicRegistry {
    entries: HashMap<String, ImportFn>,
}

impl Default for IntrinsicRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("console.log", |_, args| {
            tracing::info!(target: "wasmglue::guest", "{}", format_args(args));
            Ok(Value::Null)
        });
        registry.register("console.warn", |_, args| {
            tracing::warn!(target: "wasmglue::guest", "{}", format_args(args));
            Ok(Value::Null)
        });
        registry.register("console.error", |_, args| {
            tracing::error!(target: "wasmglue::guest", "{}", format_args(args));
            Ok(Value::Null)
        });
        registry
    }
}

impl IntrinsicRegistry {
    /// Create a registry with no entries at all, not even the console
    /// defaults.
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Create a registry with the default console entries.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) an intrinsic under `name`.
    pub fn register(
        &mut self,
        name: &str,
        f: impl Fn(&mut ImportContext<'_, '_>, &[Value]) -> Result<Value> + Send + Sync + 'static,
    ) -> &mut Self {
        self.entries.insert(name.to_string(), Arc::new(f));
        self
    }

    /// Resolve a name to its host function.
    pub fn resolve(&self, name: &str) -> Result<ImportFn> {
        self.entries
            .get(name)
            .map(Arc::clone)
            .ok_or_else(|| GlueError::IntrinsicUnknown {
                name: name.to_string(),
            })
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}

/// Space-join arguments the way a console call displays them.
fn format_args(args: &[Value]) -> String {
    let mut out = String::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&arg.to_string());
    }
    out
}
