//! wasmglue: a host-side bridge for calling WebAssembly modules with rich
//! values.
//!
//! A wrapped module exposes its exports as host functions taking and
//! returning [`Value`]s. Scalars pass by value; strings, byte buffers, and
//! u64 arrays are copied into guest arena memory; arrays, records, and
//! opaque host objects pass by handle through an extern table. Structured
//! results come back as tagged records decoded by the codec.
//!
//! The guest side of the contract is small: export `memory`, an arena
//! allocator `alloc(size) -> ptr` that stores the allocation length in the
//! 8 bytes preceding the returned pointer, a bulk `reset()`, and optionally
//! `table` for first-class function references. Instantiation is lazy (the
//! first call creates the instance), every call ends with an arena reset
//! unless suppressed, and an instance whose memory has grown past a ceiling
//! is disposed and transparently re-created on the next call.
//!
//! ```no_run
//! use wasmglue::{Imports, Value, WasmRuntime, WrapOptions, WrappedModule};
//!
//! # fn main() -> wasmglue::Result<()> {
//! let runtime = WasmRuntime::with_defaults()?;
//! let wasm: Vec<u8> = std::fs::read("module.wasm").unwrap();
//! let mut module = WrappedModule::wrap(
//!     &runtime,
//!     wasm,
//!     &["sum"],
//!     Imports::new(),
//!     WrapOptions::default(),
//! )?;
//! let total = module.call("sum", &[Value::from(vec![1u8, 2, 3, 4])])?;
//! assert_eq!(total.as_i32(), Some(10));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod codec;
mod error;
mod externs;
mod instance;
mod intrinsics;
mod locks;
mod runtime;
mod value;
mod wrapper;

pub use error::{GlueError, Result};
pub use intrinsics::IntrinsicRegistry;
pub use locks::{add_lock, remove_lock, LockRegistry, NO_LOCKS};
pub use runtime::{
    decode_base64, CompiledModule, WasmRuntime, WasmRuntimeConfig, WasmSource,
    DEFAULT_MEMORY_CEILING,
};
pub use value::{ExternVal, FuncRef, Value};
pub use wrapper::{
    Flags, ImportContext, ImportFn, ImportValue, Imports, WrapOptions, WrappedModule,
    INTRINSIC_MODULE,
};

/// Commonly used types, importable in one line.
pub mod prelude {
    pub use crate::error::{GlueError, Result};
    pub use crate::intrinsics::IntrinsicRegistry;
    pub use crate::runtime::{WasmRuntime, WasmRuntimeConfig, WasmSource};
    pub use crate::value::{FuncRef, Value};
    pub use crate::wrapper::{Imports, WrapOptions, WrappedModule};
}
