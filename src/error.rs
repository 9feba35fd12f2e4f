//! Error types for wasmglue.
//!
//! This module provides strongly-typed errors with actionable context.
//! All errors include the identifiers needed to locate the failure (export
//! name, memory offset, extern handle, etc.).

use thiserror::Error;

/// The main error type for wasmglue operations.
#[derive(Error, Debug)]
pub enum GlueError {
    // =========================================================================
    // Module Errors (E001-E099)
    // =========================================================================
    /// Failed to decode an embedded base64 module string.
    #[error("E001: Failed to decode base64 module: {cause}")]
    ModuleDecode {
        /// Reason for the decode failure.
        cause: String,
    },

    /// Failed to compile WASM bytes into a module.
    #[error("E002: Failed to compile module '{name}': {cause}")]
    ModuleCompile {
        /// Name given to the module being compiled.
        name: String,
        /// Reason for the compile failure.
        cause: String,
    },

    /// Failed to create the WASM engine.
    #[error("E003: Failed to create engine: {cause}")]
    EngineCreate {
        /// Reason for the engine creation failure.
        cause: String,
    },

    /// Module instantiation failed.
    #[error("E004: Failed to instantiate module: {cause}")]
    Instantiate {
        /// Reason for the instantiation failure.
        cause: String,
    },

    /// A required guest export is missing.
    #[error("E005: Module does not export '{name}'")]
    ExportMissing {
        /// The missing export name.
        name: String,
    },

    /// A WASM import has no host-provided binding.
    #[error("E006: No binding provided for import '{module}'::'{name}'")]
    ImportMissing {
        /// The import module name.
        module: String,
        /// The import name (including any flag suffix).
        name: String,
    },

    /// An intrinsic import names an unknown host global.
    #[error("E007: Unknown intrinsic '{name}'")]
    IntrinsicUnknown {
        /// The unresolved intrinsic name.
        name: String,
    },

    /// A WASM import has a non-function type that cannot be bound.
    #[error("E008: Import '{module}'::'{name}' is not a function import")]
    ImportNotFunction {
        /// The import module name.
        module: String,
        /// The import name.
        name: String,
    },

    /// Registering a host binding with the engine failed.
    #[error("E009: Failed to bind import '{module}'::'{name}': {cause}")]
    ImportBind {
        /// The import module name.
        module: String,
        /// The import name.
        name: String,
        /// Reason reported by the engine.
        cause: String,
    },

    // =========================================================================
    // Codec Errors (E100-E199)
    // =========================================================================
    /// A host value has no lowering rule.
    #[error("E101: Lowering value of type '{type_name}' is not supported")]
    UnsupportedValue {
        /// The host-side type that could not be lowered.
        type_name: &'static str,
    },

    /// A read or write went past the end of linear memory.
    #[error("E102: Memory access out of bounds: offset {offset}, length {len}")]
    MemoryOutOfBounds {
        /// Offset of the attempted access.
        offset: usize,
        /// Length of the attempted access.
        len: usize,
    },

    /// A tagged record carried an unknown type tag.
    #[error("E103: Unknown value tag {tag} at offset {offset}")]
    UnknownTag {
        /// The unrecognized tag byte.
        tag: u8,
        /// Offset of the tag byte in linear memory.
        offset: usize,
    },

    /// A tagged record is structurally malformed.
    #[error("E104: Malformed record at offset {offset}: {cause}")]
    MalformedRecord {
        /// Offset where decoding failed.
        offset: usize,
        /// Description of the problem.
        cause: String,
    },

    /// An extern handle does not resolve in the current arena epoch.
    #[error("E105: Extern handle {handle} not found (reset since it was minted?)")]
    ExternNotFound {
        /// The stale handle.
        handle: u32,
    },

    /// Guest allocation failed.
    #[error("E106: Guest allocation of {requested} bytes failed: {cause}")]
    AllocFailed {
        /// Number of bytes requested.
        requested: u64,
        /// Reason reported by the guest allocator.
        cause: String,
    },

    // =========================================================================
    // Call Errors (E200-E299)
    // =========================================================================
    /// A call into the guest trapped or otherwise failed.
    #[error("E201: Call to '{name}' failed: {cause}")]
    Call {
        /// The export or table entry that was invoked.
        name: String,
        /// The trap or failure reported by the engine.
        cause: String,
    },

    /// The guest does not export a function table.
    #[error("E202: Module does not export 'table'; cannot invoke function reference")]
    TableMissing,

    /// A function-reference index does not resolve to a callable entry.
    #[error("E203: Table entry {index} is empty or not a function")]
    TableEntryMissing {
        /// The table index that failed to resolve.
        index: u32,
    },

    /// A host import accessed instance state without the `instance` flag.
    #[error("E204: Import was not bound with the 'instance' flag; instance access denied")]
    InstanceNotExposed,
}

/// Convenience result type for wasmglue operations.
pub type Result<T> = std::result::Result<T, GlueError>;
