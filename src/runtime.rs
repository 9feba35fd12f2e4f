//! WASM runtime management using Wasmtime.
//!
//! Provides engine configuration, module compilation, and caching. One
//! runtime can back any number of wrapped modules; the engine and the
//! compiled-module cache are shared.

use crate::error::{GlueError, Result};
use base64::Engine as _;
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use wasmtime::{Config, Engine, Module};

/// Default ceiling on an instance's linear memory before it is recycled
/// (10 MB).
pub const DEFAULT_MEMORY_CEILING: usize = 10_000_000;

/// Configuration for the WASM runtime.
#[derive(Debug, Clone)]
pub struct WasmRuntimeConfig {
    /// Whether to cache compiled modules by content hash.
    pub cache_modules: bool,
    /// Enable debug info in compiled modules.
    pub debug_info: bool,
    /// Linear-memory size at or past which an instance is disposed after
    /// cleanup, to be lazily re-instantiated on the next call.
    pub memory_ceiling: usize,
}

impl Default for WasmRuntimeConfig {
    fn default() -> Self {
        Self {
            cache_modules: true,
            debug_info: false,
            memory_ceiling: DEFAULT_MEMORY_CEILING,
        }
    }
}

impl WasmRuntimeConfig {
    /// Enable or disable module caching.
    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache_modules = enabled;
        self
    }

    /// Enable or disable debug info.
    pub fn with_debug_info(mut self, enabled: bool) -> Self {
        self.debug_info = enabled;
        self
    }

    /// Set the memory ceiling in bytes.
    pub fn with_memory_ceiling(mut self, bytes: usize) -> Self {
        self.memory_ceiling = bytes;
        self
    }

    fn to_wasmtime_config(&self) -> Config {
        let mut config = Config::new();
        config.debug_info(self.debug_info);
        config.strategy(wasmtime::Strategy::Cranelift);
        config
    }
}

/// WebAssembly program input: raw bytes or an embedded base64 string.
#[derive(Debug, Clone)]
pub enum WasmSource {
    /// Raw `.wasm` bytes.
    Bytes(Vec<u8>),
    /// Base64-encoded `.wasm` bytes, as emitted into generated glue modules.
    Base64(String),
}

impl WasmSource {
    /// Resolve to raw bytes, decoding base64 input.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            Self::Bytes(bytes) => Ok(bytes),
            Self::Base64(text) => decode_base64(&text),
        }
    }
}

impl From<Vec<u8>> for WasmSource {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<&[u8]> for WasmSource {
    fn from(bytes: &[u8]) -> Self {
        Self::Bytes(bytes.to_vec())
    }
}

impl From<&str> for WasmSource {
    fn from(text: &str) -> Self {
        Self::Base64(text.to_string())
    }
}

/// Decode a base64 module string, tolerating both padded and unpadded input.
pub fn decode_base64(text: &str) -> Result<Vec<u8>> {
    let stripped: String = text.chars().filter(|c| *c != '=').collect();
    base64::engine::general_purpose::STANDARD_NO_PAD
        .decode(stripped.as_bytes())
        .map_err(|e| GlueError::ModuleDecode {
            cause: e.to_string(),
        })
}

/// A compiled WASM module ready for instantiation.
pub struct CompiledModule {
    module: Module,
    hash: u64,
}

impl CompiledModule {
    /// Get the underlying Wasmtime module.
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Get the content hash of this module.
    pub fn hash(&self) -> u64 {
        self.hash
    }
}

/// WASM runtime managing the Wasmtime engine and compiled modules.
pub struct WasmRuntime {
    engine: Engine,
    config: WasmRuntimeConfig,
    module_cache: DashMap<u64, Arc<CompiledModule>>,
}

impl WasmRuntime {
    /// Create a new WASM runtime with the given configuration.
    pub fn new(config: WasmRuntimeConfig) -> Result<Self> {
        let engine =
            Engine::new(&config.to_wasmtime_config()).map_err(|e| GlueError::EngineCreate {
                cause: e.to_string(),
            })?;
        Ok(Self {
            engine,
            config,
            module_cache: DashMap::new(),
        })
    }

    /// Create a runtime with default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(WasmRuntimeConfig::default())
    }

    /// Get the Wasmtime engine.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Get the runtime configuration.
    pub fn config(&self) -> &WasmRuntimeConfig {
        &self.config
    }

    /// Compile WASM bytes into a module.
    ///
    /// If caching is enabled and the same bytes were compiled before, the
    /// cached module is returned.
    pub fn compile(&self, name: &str, wasm_bytes: &[u8]) -> Result<Arc<CompiledModule>> {
        let hash = hash_bytes(wasm_bytes);

        if self.config.cache_modules {
            if let Some(cached) = self.module_cache.get(&hash) {
                return Ok(Arc::clone(&cached));
            }
        }

        let module =
            Module::new(&self.engine, wasm_bytes).map_err(|e| GlueError::ModuleCompile {
                name: name.to_string(),
                cause: e.to_string(),
            })?;
        let compiled = Arc::new(CompiledModule { module, hash });

        if self.config.cache_modules {
            self.module_cache.insert(hash, Arc::clone(&compiled));
        }

        Ok(compiled)
    }

    /// Compile a WASM module from a source (raw bytes or base64).
    pub fn compile_source(&self, name: &str, source: WasmSource) -> Result<Arc<CompiledModule>> {
        let bytes = source.into_bytes()?;
        self.compile(name, &bytes)
    }

    /// Compile a `.wasm` file from disk.
    pub fn compile_file(&self, path: impl AsRef<Path>) -> Result<Arc<CompiledModule>> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| GlueError::ModuleDecode {
            cause: format!("{}: {e}", path.display()),
        })?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("module");
        self.compile(name, &bytes)
    }

    /// Clear the module cache.
    pub fn clear_cache(&self) {
        self.module_cache.clear();
    }

    /// Get the number of cached modules.
    pub fn cache_size(&self) -> usize {
        self.module_cache.len()
    }
}

/// Compute a hash of bytes (for the cache key). Not cryptographic.
fn hash_bytes(bytes: &[u8]) -> u64 {
    use std::hash::{Hash, Hasher};

    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}
