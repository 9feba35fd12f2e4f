//! Instance lifecycle management.
//!
//! Owns the relationship between a compiled module and its current (possibly
//! absent) live instance: lazy instantiation, the per-call arena reset, and
//! memory-ceiling recycling. States: Uninstantiated → Live → Disposed, where
//! Disposed behaves identically to Uninstantiated for future calls (the
//! module stays cached and the next call re-instantiates fresh). Disposal
//! only ever happens between calls, as the final step of cleanup.

use crate::error::{GlueError, Result};
use crate::externs::ExternTable;
use crate::runtime::CompiledModule;
use std::sync::Arc;
use wasmtime::{Engine, Instance, Linker, Memory, Store, Table, TypedFunc};

/// Guest export names required by the wrapper ABI.
pub(crate) const EXPORT_MEMORY: &str = "memory";
pub(crate) const EXPORT_ALLOC: &str = "alloc";
pub(crate) const EXPORT_RESET: &str = "reset";
pub(crate) const EXPORT_TABLE: &str = "table";

/// Host-side state carried by the store: the extern table for the current
/// arena epoch.
#[derive(Default)]
pub struct HostState {
    pub(crate) externs: ExternTable,
}

/// Handles resolved from a live instance's ABI exports.
pub(crate) struct LiveInstance {
    pub(crate) instance: Instance,
    pub(crate) memory: Memory,
    pub(crate) alloc: TypedFunc<u32, u32>,
    pub(crate) reset: TypedFunc<(), ()>,
    pub(crate) table: Option<Table>,
}

/// Lazily instantiates and recycles instances of one compiled module.
pub struct InstanceManager {
    engine: Engine,
    module: Arc<CompiledModule>,
    linker: Linker<HostState>,
    store: Store<HostState>,
    live: Option<LiveInstance>,
    // set when a disposed instance's store still holds its memory; the next
    // instantiation replaces the store so the memory is actually released
    store_stale: bool,
    memory_ceiling: usize,
    instantiations: u64,
}

impl InstanceManager {
    /// Create a manager in the uninstantiated state.
    ///
    /// Import bindings on `linker` are registered once by the binder and
    /// reused for every re-instantiation.
    pub(crate) fn new(
        engine: Engine,
        module: Arc<CompiledModule>,
        linker: Linker<HostState>,
        memory_ceiling: usize,
    ) -> Self {
        let store = Store::new(&engine, HostState::default());
        Self {
            engine,
            module,
            linker,
            store,
            live: None,
            store_stale: false,
            memory_ceiling,
            instantiations: 0,
        }
    }

    /// Whether a live instance currently exists.
    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    /// How many times the module has been instantiated so far.
    pub fn instantiation_count(&self) -> u64 {
        self.instantiations
    }

    /// Current linear-memory size of the live instance, if any.
    pub fn memory_size(&self) -> Option<usize> {
        self.live.as_ref().map(|l| l.memory.data_size(&self.store))
    }

    /// Number of live extern-table entries in the current arena epoch.
    pub fn extern_count(&self) -> usize {
        self.store.data().externs.len()
    }

    /// Instantiate lazily if no live instance exists.
    pub(crate) fn ensure_live(&mut self) -> Result<()> {
        if self.live.is_some() {
            return Ok(());
        }
        if self.store_stale {
            self.store = Store::new(&self.engine, HostState::default());
            self.store_stale = false;
        }

        let instance = self
            .linker
            .instantiate(&mut self.store, self.module.module())
            .map_err(|e| GlueError::Instantiate {
                cause: e.to_string(),
            })?;

        let memory = instance
            .get_memory(&mut self.store, EXPORT_MEMORY)
            .ok_or_else(|| GlueError::ExportMissing {
                name: EXPORT_MEMORY.to_string(),
            })?;
        let alloc = instance
            .get_typed_func::<u32, u32>(&mut self.store, EXPORT_ALLOC)
            .map_err(|_| GlueError::ExportMissing {
                name: EXPORT_ALLOC.to_string(),
            })?;
        let reset = instance
            .get_typed_func::<(), ()>(&mut self.store, EXPORT_RESET)
            .map_err(|_| GlueError::ExportMissing {
                name: EXPORT_RESET.to_string(),
            })?;
        let table = instance.get_table(&mut self.store, EXPORT_TABLE);

        self.instantiations += 1;
        tracing::debug!(
            instantiations = self.instantiations,
            "instantiated wrapped module"
        );

        self.live = Some(LiveInstance {
            instance,
            memory,
            alloc,
            reset,
            table,
        });
        Ok(())
    }

    /// Split borrows for a call: the store plus the live instance handles.
    ///
    /// Callers must have run [`ensure_live`](Self::ensure_live) first.
    pub(crate) fn parts_mut(&mut self) -> Result<(&mut Store<HostState>, &LiveInstance)> {
        let live = self.live.as_ref().ok_or(GlueError::Instantiate {
            cause: "no live instance".to_string(),
        })?;
        Ok((&mut self.store, live))
    }

    /// Arena reset: invoke the guest `reset` export and invalidate the
    /// extern table, then dispose the instance if its memory has grown to or
    /// past the ceiling.
    ///
    /// Idempotent; a no-op when no live instance exists.
    pub(crate) fn cleanup(&mut self) -> Result<()> {
        let Some(live) = &self.live else {
            return Ok(());
        };
        live.reset
            .call(&mut self.store, ())
            .map_err(|e| GlueError::Call {
                name: EXPORT_RESET.to_string(),
                cause: e.to_string(),
            })?;
        self.store.data_mut().externs.clear();

        let size = live.memory.data_size(&self.store);
        if size >= self.memory_ceiling {
            tracing::warn!(
                size,
                ceiling = self.memory_ceiling,
                "instance memory ceiling exceeded, disposing instance"
            );
            self.live = None;
            self.store_stale = true;
        }
        Ok(())
    }
}
