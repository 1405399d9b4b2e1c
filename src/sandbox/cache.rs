//! Compiled interpreter cache.
//!
//! Compiling the RustPython module takes seconds, so it happens once per
//! process for each interpreter file and engine flavour. Every cached engine
//! owns one epoch ticker thread; runs measure their deadlines in its ticks.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, PoisonError, RwLock};
use std::thread;
use std::time::Duration;

use tracing::info;
use wasmtime::{Engine, Module};

use crate::error::{Result, SandboxError};

/// Interval between epoch increments.
pub const EPOCH_TICK: Duration = Duration::from_millis(10);

/// Wasm stack available to the interpreter. Python recursion up to the
/// configured depth has to fit in here.
const MAX_WASM_STACK: usize = 8 * 1024 * 1024;

/// An engine paired with the interpreter module compiled for it.
#[derive(Clone)]
pub struct Interpreter {
    engine: Engine,
    module: Module,
    fuel: bool,
}

impl std::fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter")
            .field("engine", &"<wasmtime::Engine>")
            .field("fuel", &self.fuel)
            .finish()
    }
}

impl Interpreter {
    /// The engine the module was compiled for.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// The compiled interpreter module.
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Whether stores created from this engine must be given fuel.
    pub fn meters_fuel(&self) -> bool {
        self.fuel
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    path: PathBuf,
    fuel: bool,
}

/// A thread-safe cache of compiled interpreters, keyed by canonical path
/// and by whether fuel metering is compiled in.
#[derive(Debug, Default)]
pub struct InterpreterCache {
    entries: RwLock<HashMap<CacheKey, Arc<Interpreter>>>,
}

impl InterpreterCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a cached interpreter or compile it.
    ///
    /// A missing file is reported as [`SandboxError::InterpreterNotFound`].
    pub fn get_or_load(&self, path: impl AsRef<Path>, fuel: bool) -> Result<Arc<Interpreter>> {
        let path = path.as_ref();
        let canonical = std::fs::canonicalize(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SandboxError::InterpreterNotFound(path.display().to_string())
            } else {
                SandboxError::Io(e)
            }
        })?;
        let key = CacheKey {
            path: canonical,
            fuel,
        };

        if let Some(found) = self.read_entry(&key) {
            return Ok(found);
        }

        // Compile outside the lock; a racing loader may win, which is fine.
        let loaded = Arc::new(load(&key)?);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        Ok(Arc::clone(entries.entry(key).or_insert(loaded)))
    }

    /// Check whether an interpreter is cached.
    pub fn contains(&self, path: impl AsRef<Path>, fuel: bool) -> bool {
        std::fs::canonicalize(path)
            .map(|path| self.read_entry(&CacheKey { path, fuel }).is_some())
            .unwrap_or(false)
    }

    /// Number of cached interpreters.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_entry(&self, key: &CacheKey) -> Option<Arc<Interpreter>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).map(Arc::clone)
    }
}

static GLOBAL_CACHE: LazyLock<InterpreterCache> = LazyLock::new(InterpreterCache::new);

/// The process-wide interpreter cache.
pub fn global_cache() -> &'static InterpreterCache {
    &GLOBAL_CACHE
}

/// Create an engine with epoch interruption and, optionally, fuel metering.
pub fn new_engine(fuel: bool) -> Result<Engine> {
    let mut config = wasmtime::Config::new();
    config.epoch_interruption(true);
    config.consume_fuel(fuel);
    config.max_wasm_stack(MAX_WASM_STACK);
    Engine::new(&config).map_err(SandboxError::RuntimeInit)
}

fn load(key: &CacheKey) -> Result<Interpreter> {
    let engine = new_engine(key.fuel)?;
    let bytes = std::fs::read(&key.path)?;
    let module = Module::new(&engine, &bytes).map_err(SandboxError::ModuleLoad)?;
    spawn_ticker(engine.clone())?;
    info!(path = %key.path.display(), fuel = key.fuel, "interpreter module compiled");
    Ok(Interpreter {
        engine,
        module,
        fuel: key.fuel,
    })
}

/// Cached engines live for the rest of the process, and so do their tickers.
fn spawn_ticker(engine: Engine) -> Result<()> {
    thread::Builder::new()
        .name("cq-epoch".to_string())
        .spawn(move || loop {
            thread::sleep(EPOCH_TICK);
            engine.increment_epoch();
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_new() {
        let cache = InterpreterCache::new();
        assert!(cache.is_empty());
        assert!(!cache.contains("assets/rustpython.wasm", false));
    }

    #[test]
    fn test_missing_interpreter() {
        let cache = InterpreterCache::new();
        let err = cache.get_or_load("does/not/exist.wasm", false).unwrap_err();
        assert!(matches!(err, SandboxError::InterpreterNotFound(ref p) if p == "does/not/exist.wasm"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_garbage_module_fails_to_load() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"not wasm").unwrap();
        let err = InterpreterCache::new().get_or_load(file.path(), false).unwrap_err();
        assert!(matches!(err, SandboxError::ModuleLoad(_)));
    }

    #[test]
    fn test_engine_flavours() {
        let plain = new_engine(false).unwrap();
        plain.increment_epoch();
        new_engine(true).unwrap().increment_epoch();
    }

    #[test]
    #[ignore = "requires rustpython.wasm"]
    fn test_cache_reuses_compiled_module() {
        let cache = InterpreterCache::new();
        let first = cache.get_or_load("assets/rustpython.wasm", false).unwrap();
        let second = cache.get_or_load("./assets/rustpython.wasm", false).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let metered = cache.get_or_load("assets/rustpython.wasm", true).unwrap();
        assert!(!Arc::ptr_eq(&first, &metered));
        assert!(metered.meters_fuel());
        assert_eq!(cache.len(), 2);
    }
}
