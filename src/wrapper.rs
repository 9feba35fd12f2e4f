//! The wrapped-module surface: export binding, import binding, and the
//! call cycle.
//!
//! A [`WrappedModule`] binds a compiled module's declared exports and imports
//! by name. Export and import names may carry a `#`-separated flag suffix
//! (`"sum"`, `"log#instance,lift"`); the suffix selects per-binding behavior
//! and the full name, suffix included, is what the WASM binary declares.
//!
//! The call cycle for an export is: lazily instantiate, lower arguments into
//! the guest's arena, invoke, optionally lift the pointer result back into a
//! [`Value`], then reset the arena (unless `noAutoFree` suppresses it).

use crate::codec::{self, Lowered};
use crate::error::{GlueError, Result};
use crate::instance::{
    HostState, InstanceManager, LiveInstance, EXPORT_ALLOC, EXPORT_MEMORY,
};
use crate::intrinsics::IntrinsicRegistry;
use crate::runtime::{WasmRuntime, WasmSource};
use crate::value::{FuncRef, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use wasmtime::{
    Caller, Extern, ExternType, Func, Linker, Memory, Module, Ref, Store, TypedFunc, Val, ValType,
};

/// Reserved import module whose names resolve through the intrinsic
/// registry when no explicit binding is provided.
pub const INTRINSIC_MODULE: &str = "js";

/// Per-binding behavior flags, parsed from a `#`-suffixed name.
///
/// `lower` is accepted in the suffix but carries no state: results are
/// always lowered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    /// Treat pointer values as tagged records and decode them.
    pub lift: bool,
    /// Expose instance memory to the host import through [`ImportContext`].
    pub instance: bool,
    /// Skip the automatic arena reset after each call.
    pub no_auto_free: bool,
}

impl Flags {
    /// Split `name#flag,flag` into the bare name and its flags.
    ///
    /// Unknown flags are ignored with a debug log, so generated bindings can
    /// carry annotations this host does not act on.
    pub fn parse(name: &str) -> (&str, Flags) {
        let Some((base, suffix)) = name.split_once('#') else {
            return (name, Flags::default());
        };
        let mut flags = Flags::default();
        for flag in suffix.split(',') {
            match flag {
                "lift" => flags.lift = true,
                "instance" => flags.instance = true,
                "noAutoFree" => flags.no_auto_free = true,
                // always in effect
                "lower" => {}
                other => tracing::debug!(name = base, flag = other, "ignoring unknown flag"),
            }
        }
        (base, flags)
    }
}

/// Host-side view of the running instance, handed to import closures.
///
/// Memory access is gated on the `instance` flag of the import binding;
/// without it every accessor returns [`GlueError::InstanceNotExposed`].
pub struct ImportContext<'a, 'b> {
    caller: &'a mut Caller<'b, HostState>,
    exposed: bool,
}

impl<'a, 'b> ImportContext<'a, 'b> {
    pub(crate) fn new(caller: &'a mut Caller<'b, HostState>, exposed: bool) -> Self {
        Self { caller, exposed }
    }

    fn ensure_exposed(&self) -> Result<()> {
        if self.exposed {
            Ok(())
        } else {
            Err(GlueError::InstanceNotExposed)
        }
    }

    fn memory(&mut self) -> Result<Memory> {
        match self.caller.get_export(EXPORT_MEMORY) {
            Some(Extern::Memory(m)) => Ok(m),
            _ => Err(GlueError::ExportMissing {
                name: EXPORT_MEMORY.to_string(),
            }),
        }
    }

    /// Current size of the instance's linear memory in bytes.
    pub fn memory_size(&mut self) -> Result<usize> {
        self.ensure_exposed()?;
        let memory = self.memory()?;
        Ok(memory.data_size(&*self.caller))
    }

    /// Copy `len` bytes out of linear memory at `offset`.
    pub fn read_memory(&mut self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.ensure_exposed()?;
        let memory = self.memory()?;
        let data = memory.data(&*self.caller);
        data.get(offset..offset + len)
            .map(|s| s.to_vec())
            .ok_or(GlueError::MemoryOutOfBounds { offset, len })
    }

    /// Write `data` into linear memory at `offset`.
    pub fn write_memory(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.ensure_exposed()?;
        let memory = self.memory()?;
        let mem = memory.data_mut(&mut *self.caller);
        let dest = mem
            .get_mut(offset..offset + data.len())
            .ok_or(GlueError::MemoryOutOfBounds {
                offset,
                len: data.len(),
            })?;
        dest.copy_from_slice(data);
        Ok(())
    }
}

/// A host function bound to a WASM import.
pub type ImportFn =
    Arc<dyn Fn(&mut ImportContext<'_, '_>, &[Value]) -> Result<Value> + Send + Sync>;

/// What a WASM import resolves to.
#[derive(Clone)]
pub enum ImportValue {
    /// A host closure.
    Func(ImportFn),
    /// A named intrinsic, resolved through the registry at wrap time.
    Intrinsic(String),
}

/// Import bindings, keyed by import module name then import name.
///
/// Keys may be the full declared name (flag suffix included) or the bare
/// name; the full name is checked first.
#[derive(Default, Clone)]
pub struct Imports {
    modules: HashMap<String, HashMap<String, ImportValue>>,
}

impl Imports {
    /// Create an empty import set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a host closure to an import.
    pub fn with_func(
        mut self,
        module: &str,
        name: &str,
        f: impl Fn(&mut ImportContext<'_, '_>, &[Value]) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        self.modules
            .entry(module.to_string())
            .or_default()
            .insert(name.to_string(), ImportValue::Func(Arc::new(f)));
        self
    }

    /// Bind an import to a named intrinsic.
    pub fn with_intrinsic(mut self, module: &str, name: &str, intrinsic: &str) -> Self {
        self.modules
            .entry(module.to_string())
            .or_default()
            .insert(name.to_string(), ImportValue::Intrinsic(intrinsic.to_string()));
        self
    }

    fn get(&self, module: &str, name: &str) -> Option<&ImportValue> {
        self.modules.get(module)?.get(name)
    }
}

/// Options applied to every export of a wrapped module.
#[derive(Default)]
pub struct WrapOptions {
    /// Suppress the automatic arena reset after each call; callers manage
    /// lifetime with [`WrappedModule::reset`].
    pub no_auto_free: bool,
    /// Registry backing intrinsic imports.
    pub intrinsics: IntrinsicRegistry,
}

impl WrapOptions {
    /// Suppress automatic arena resets for every export.
    pub fn with_no_auto_free(mut self, enabled: bool) -> Self {
        self.no_auto_free = enabled;
        self
    }

    /// Replace the intrinsic registry.
    pub fn with_intrinsics(mut self, intrinsics: IntrinsicRegistry) -> Self {
        self.intrinsics = intrinsics;
        self
    }
}

/// One bound export: the full declared name plus its parsed flags.
#[derive(Clone)]
struct ExportBinding {
    wasm_name: String,
    flags: Flags,
}

/// Outcome of resolving and invoking an export.
enum Invoked {
    /// A function was called; the arena may need resetting.
    Called(Value),
    /// The export is not a function; nothing ran.
    Raw(Value),
}

/// A compiled module wrapped with named, flagged call bindings.
pub struct WrappedModule {
    manager: InstanceManager,
    exports: HashMap<String, ExportBinding>,
    export_order: Vec<String>,
}

impl fmt::Debug for WrappedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrappedModule")
            .field("exports", &self.export_order)
            .field("live", &self.manager.is_live())
            .field("instantiations", &self.manager.instantiation_count())
            .finish()
    }
}

impl WrappedModule {
    /// Wrap a module: compile it, bind every declared import, and register
    /// the listed exports under their bare names.
    ///
    /// Imports with no binding and unknown intrinsics fail here, not at
    /// call time. Nothing is instantiated until the first call.
    pub fn wrap(
        runtime: &WasmRuntime,
        source: impl Into<WasmSource>,
        exports: &[&str],
        imports: Imports,
        options: WrapOptions,
    ) -> Result<Self> {
        let compiled = runtime.compile_source("wrapped", source.into())?;

        let mut linker: Linker<HostState> = Linker::new(runtime.engine());
        bind_imports(&mut linker, compiled.module(), &imports, &options.intrinsics)?;

        let mut export_map = HashMap::with_capacity(exports.len());
        let mut export_order = Vec::with_capacity(exports.len());
        for name in exports {
            let (base, mut flags) = Flags::parse(name);
            if options.no_auto_free {
                flags.no_auto_free = true;
            }
            let binding = ExportBinding {
                wasm_name: (*name).to_string(),
                flags,
            };
            if export_map.insert(base.to_string(), binding).is_none() {
                export_order.push(base.to_string());
            }
        }

        let manager = InstanceManager::new(
            runtime.engine().clone(),
            compiled,
            linker,
            runtime.config().memory_ceiling,
        );
        Ok(Self {
            manager,
            exports: export_map,
            export_order,
        })
    }

    /// Bare names of the bound exports, in declaration order.
    pub fn export_names(&self) -> impl Iterator<Item = &str> {
        self.export_order.iter().map(String::as_str)
    }

    /// Whether `name` is a bound export.
    pub fn has_export(&self, name: &str) -> bool {
        self.exports.contains_key(name)
    }

    /// Whether a live instance currently exists.
    pub fn is_live(&self) -> bool {
        self.manager.is_live()
    }

    /// How many times the module has been instantiated.
    pub fn instantiation_count(&self) -> u64 {
        self.manager.instantiation_count()
    }

    /// Current linear-memory size of the live instance, if any.
    pub fn memory_size(&self) -> Option<usize> {
        self.manager.memory_size()
    }

    /// Number of live extern-table entries.
    pub fn extern_count(&self) -> usize {
        self.manager.extern_count()
    }

    /// Call a bound export by its bare name.
    ///
    /// Arguments beyond the export's arity are ignored; missing arguments
    /// are treated as [`Value::Null`]. Non-function exports return the raw
    /// export wrapped as [`Value::Extern`] without touching the arena.
    pub fn call(&mut self, name: &str, args: &[Value]) -> Result<Value> {
        let binding = self
            .exports
            .get(name)
            .cloned()
            .ok_or_else(|| GlueError::ExportMissing {
                name: name.to_string(),
            })?;
        self.manager.ensure_live()?;

        match self.invoke(&binding, args) {
            Ok(Invoked::Raw(value)) => Ok(value),
            Ok(Invoked::Called(value)) => {
                if binding.flags.no_auto_free {
                    Ok(value)
                } else {
                    self.manager.cleanup()?;
                    Ok(value)
                }
            }
            Err(err) => {
                // The call failed; still reclaim the arena, but the call
                // error is what the caller sees.
                if !binding.flags.no_auto_free {
                    let _ = self.manager.cleanup();
                }
                Err(err)
            }
        }
    }

    /// Invoke a lifted function reference through the guest's exported
    /// table.
    ///
    /// Always lifts the result and always resets the arena afterwards.
    pub fn call_function(&mut self, func_ref: FuncRef, args: &[Value]) -> Result<Value> {
        self.manager.ensure_live()?;
        match self.invoke_table(func_ref, args) {
            Ok(value) => {
                self.manager.cleanup()?;
                Ok(value)
            }
            Err(err) => {
                let _ = self.manager.cleanup();
                Err(err)
            }
        }
    }

    /// Manually reset the arena: for `noAutoFree` bindings, when the caller
    /// is done with the guest memory the last call returned.
    pub fn reset(&mut self) -> Result<()> {
        self.manager.cleanup()
    }

    fn invoke(&mut self, binding: &ExportBinding, args: &[Value]) -> Result<Invoked> {
        let (store, live) = self.manager.parts_mut()?;
        let export = live
            .instance
            .get_export(&mut *store, &binding.wasm_name)
            .ok_or_else(|| GlueError::ExportMissing {
                name: binding.wasm_name.clone(),
            })?;
        let func = match export {
            Extern::Func(f) => f,
            Extern::Memory(m) => return Ok(Invoked::Raw(Value::extern_val(m))),
            Extern::Table(t) => return Ok(Invoked::Raw(Value::extern_val(t))),
            Extern::Global(g) => return Ok(Invoked::Raw(Value::extern_val(g))),
            other => return Ok(Invoked::Raw(Value::extern_val(other))),
        };
        call_func(
            store,
            live,
            &func,
            args,
            binding.flags.lift,
            &binding.wasm_name,
        )
        .map(Invoked::Called)
    }

    fn invoke_table(&mut self, func_ref: FuncRef, args: &[Value]) -> Result<Value> {
        let (store, live) = self.manager.parts_mut()?;
        let table = live.table.ok_or(GlueError::TableMissing)?;
        let entry = table
            .get(&mut *store, func_ref.index)
            .ok_or(GlueError::TableEntryMissing {
                index: func_ref.index,
            })?;
        let Ref::Func(Some(func)) = entry else {
            return Err(GlueError::TableEntryMissing {
                index: func_ref.index,
            });
        };
        let name = format!("table[{}]", func_ref.index);
        call_func(store, live, &func, args, true, &name)
    }
}

/// Lower arguments against the callee's declared signature, invoke, and
/// decode the (single) result.
fn call_func(
    store: &mut Store<HostState>,
    live: &LiveInstance,
    func: &Func,
    args: &[Value],
    do_lift: bool,
    name: &str,
) -> Result<Value> {
    let ty = func.ty(&*store);
    let param_tys: Vec<ValType> = ty.params().collect();

    let mut params = Vec::with_capacity(param_tys.len());
    for (i, pty) in param_tys.iter().enumerate() {
        let lowered = match args.get(i) {
            Some(value) => codec::lower(&mut *store, live.memory, &live.alloc, value)?,
            None => Lowered::Absent,
        };
        params.push(lowered.to_val(pty));
    }

    let mut results: Vec<Val> = ty.results().map(|t| codec::zero_val(&t)).collect();
    func.call(&mut *store, &params, &mut results)
        .map_err(|e| match e.downcast::<GlueError>() {
            // host bindings surface their own error, not a generic trap
            Ok(err) => err,
            Err(e) => GlueError::Call {
                name: name.to_string(),
                cause: e.to_string(),
            },
        })?;

    match results.first() {
        None => Ok(Value::Null),
        Some(val) if do_lift => {
            let ptr = codec::val_as_ptr(val)?;
            codec::lift(&*store, live.memory, ptr)
        }
        Some(val) => Ok(codec::raw_to_value(val)),
    }
}

/// Register a host binding for every function import the module declares.
fn bind_imports(
    linker: &mut Linker<HostState>,
    module: &Module,
    imports: &Imports,
    intrinsics: &IntrinsicRegistry,
) -> Result<()> {
    let mut bound: HashSet<(String, String)> = HashSet::new();
    for import in module.imports() {
        let module_name = import.module().to_string();
        let import_name = import.name().to_string();
        if !bound.insert((module_name.clone(), import_name.clone())) {
            continue;
        }
        let ExternType::Func(func_ty) = import.ty() else {
            return Err(GlueError::ImportNotFunction {
                module: module_name,
                name: import_name,
            });
        };
        let (base, flags) = Flags::parse(&import_name);

        let func: ImportFn = match imports
            .get(&module_name, &import_name)
            .or_else(|| imports.get(&module_name, base))
        {
            Some(ImportValue::Func(f)) => Arc::clone(f),
            Some(ImportValue::Intrinsic(intrinsic)) => intrinsics.resolve(intrinsic)?,
            // the reserved module resolves through the registry by name
            None if module_name == INTRINSIC_MODULE => intrinsics.resolve(base)?,
            None => {
                return Err(GlueError::ImportMissing {
                    module: module_name,
                    name: import_name,
                })
            }
        };

        let result_tys: Vec<ValType> = func_ty.results().collect();
        linker
            .func_new(
                &module_name,
                &import_name,
                func_ty.clone(),
                move |mut caller, params, results| {
                    host_trampoline(&mut caller, &func, flags, params, results, &result_tys)
                        .map_err(wasmtime::Error::new)
                },
            )
            .map_err(|e| GlueError::ImportBind {
                module: module_name,
                name: import_name,
                cause: e.to_string(),
            })?;
    }
    Ok(())
}

/// Bridge one guest-to-host call: decode arguments, run the host closure,
/// lower its return value into the result slot.
fn host_trampoline(
    caller: &mut Caller<'_, HostState>,
    func: &ImportFn,
    flags: Flags,
    params: &[Val],
    results: &mut [Val],
    result_tys: &[ValType],
) -> Result<()> {
    let args = if flags.lift {
        let memory = caller_memory(caller)?;
        let mut lifted = Vec::with_capacity(params.len());
        for val in params {
            let ptr = codec::val_as_ptr(val)?;
            lifted.push(codec::lift(&mut *caller, memory, ptr)?);
        }
        lifted
    } else {
        params.iter().map(codec::raw_to_value).collect()
    };

    let ret = {
        let mut ctx = ImportContext::new(caller, flags.instance);
        (func)(&mut ctx, &args)?
    };

    let Some(slot) = results.first_mut() else {
        return Ok(());
    };
    let memory = caller_memory(caller)?;
    let alloc = caller_alloc(caller)?;
    let lowered = codec::lower(&mut *caller, memory, &alloc, &ret)?;
    *slot = lowered.to_val(&result_tys[0]);
    Ok(())
}

fn caller_memory(caller: &mut Caller<'_, HostState>) -> Result<Memory> {
    match caller.get_export(EXPORT_MEMORY) {
        Some(Extern::Memory(m)) => Ok(m),
        _ => Err(GlueError::ExportMissing {
            name: EXPORT_MEMORY.to_string(),
        }),
    }
}

fn caller_alloc(caller: &mut Caller<'_, HostState>) -> Result<TypedFunc<u32, u32>> {
    let func = match caller.get_export(EXPORT_ALLOC) {
        Some(Extern::Func(f)) => f,
        _ => {
            return Err(GlueError::ExportMissing {
                name: EXPORT_ALLOC.to_string(),
            })
        }
    };
    func.typed::<u32, u32>(&*caller)
        .map_err(|_| GlueError::ExportMissing {
            name: EXPORT_ALLOC.to_string(),
        })
}
