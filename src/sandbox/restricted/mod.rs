//! Restricted executor: RustPython compiled to wasm, run under wasmtime.
//!
//! The guest gets piped stdio and nothing else: no preopened directories, no
//! environment, no sockets. A small bootstrap script reads the submission
//! from stdin and runs it against an allow-listed builtins table, rendering
//! uncaught exceptions the way CPython does.
//!
//! Each run gets a fresh store on its own worker thread. The async side
//! waits on a oneshot channel with a timeout; the store's epoch deadline
//! stops an abandoned run shortly after, and whatever it printed is dropped
//! together with it.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use wasmtime::{Linker, Store, Trap};
use wasmtime_wasi::pipe::MemoryInputPipe;
use wasmtime_wasi::preview1;
use wasmtime_wasi::{I32Exit, WasiCtxBuilder};

use crate::error::{Result, SandboxError};
use crate::sandbox::cache::{global_cache, Interpreter};
use crate::sandbox::config::{EngineConfig, ResourceLimits};
use crate::sandbox::executor::Executor;
use crate::sandbox::io::{CapturedOutput, SharedOutput};
use crate::sandbox::limits::{StoreData, StoreLimiterExt};
use crate::sandbox::outcome::RawRun;

/// Runs inside the guest as `python -c`. Arguments: recursion limit,
/// allowed builtins, allowed modules.
const BOOTSTRAP: &str = include_str!("bootstrap.py");

/// Builtins visible to submitted code. Anything that reaches attributes by
/// name, evaluates code or touches the host is left out.
pub const ALLOWED_BUILTINS: &[&str] = &[
    "__build_class__",
    "abs",
    "all",
    "any",
    "bin",
    "bool",
    "callable",
    "chr",
    "classmethod",
    "dict",
    "divmod",
    "enumerate",
    "filter",
    "float",
    "format",
    "frozenset",
    "hash",
    "hex",
    "int",
    "isinstance",
    "issubclass",
    "iter",
    "len",
    "list",
    "map",
    "max",
    "min",
    "next",
    "object",
    "oct",
    "ord",
    "pow",
    "print",
    "property",
    "range",
    "repr",
    "reversed",
    "round",
    "set",
    "slice",
    "sorted",
    "staticmethod",
    "str",
    "sum",
    "super",
    "tuple",
    "type",
    "zip",
    "ArithmeticError",
    "AssertionError",
    "AttributeError",
    "BaseException",
    "Exception",
    "ImportError",
    "IndentationError",
    "IndexError",
    "KeyError",
    "LookupError",
    "MemoryError",
    "NameError",
    "NotImplementedError",
    "OverflowError",
    "RecursionError",
    "RuntimeError",
    "StopIteration",
    "SyntaxError",
    "SystemExit",
    "TypeError",
    "UnboundLocalError",
    "ValueError",
    "ZeroDivisionError",
];

/// Modules submitted code may import. Everything else raises `ImportError`.
pub const ALLOWED_MODULES: &[&str] = &["math"];

/// Host stack for worker threads. Wasm frames run on it, so it must exceed
/// the engine's wasm stack limit by a margin.
const WORKER_STACK_SIZE: usize = 32 * 1024 * 1024;

/// Executor that runs programs inside a wasm sandbox.
#[derive(Debug, Clone)]
pub struct RestrictedExecutor {
    interpreter: Arc<Interpreter>,
    limits: ResourceLimits,
}

impl RestrictedExecutor {
    /// Load (or reuse) the interpreter named by `config`.
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let fuel = config.limits.max_steps.is_some();
        let interpreter = global_cache().get_or_load(&config.interpreter_path, fuel)?;
        Ok(Self {
            interpreter,
            limits: config.limits.clone(),
        })
    }
}

#[async_trait]
impl Executor for RestrictedExecutor {
    fn name(&self) -> &'static str {
        "restricted"
    }

    async fn run(&self, code: &str) -> Result<RawRun> {
        let (tx, rx) = oneshot::channel();

        let code = code.to_owned();
        let limits = self.limits.clone();
        let interpreter = Arc::clone(&self.interpreter);
        thread::Builder::new()
            .name("cq-restricted".to_string())
            .stack_size(WORKER_STACK_SIZE)
            .spawn(move || {
                let result = run_guarded(|| run_program(&interpreter, &code, &limits));
                // The receiver is gone if the run was abandoned.
                let _ = tx.send(result);
            })?;

        match tokio::time::timeout(self.limits.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SandboxError::Runtime(anyhow::anyhow!(
                "interpreter worker stopped without reporting a result"
            ))),
            Err(_) => {
                warn!(timeout = ?self.limits.timeout, "restricted run timed out; abandoning it");
                Err(SandboxError::Timeout(self.limits.timeout))
            }
        }
    }
}

/// Run `f`, turning a host-side panic into a `SystemError` the program sees
/// as its own failure.
fn run_guarded<F>(f: F) -> Result<RawRun>
where
    F: FnOnce() -> Result<RawRun>,
{
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let detail = panic_message(payload.as_ref());
        warn!(%detail, "interpreter host panicked");
        Ok(RawRun {
            stdout: String::new(),
            stderr: format!("SystemError: interpreter crashed: {detail}"),
            exit_status: 1,
            truncated: false,
        })
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Instantiate a fresh store and run one program on the current thread.
pub(crate) fn run_program(interpreter: &Interpreter, code: &str, limits: &ResourceLimits) -> Result<RawRun> {
    let stdout = SharedOutput::with_limit(limits.max_output_bytes);
    let stderr = SharedOutput::with_limit(limits.max_output_bytes);
    let depth = limits.max_recursion.to_string();
    let builtins = ALLOWED_BUILTINS.join(",");
    let modules = ALLOWED_MODULES.join(",");

    let wasi = WasiCtxBuilder::new()
        .args(&["python", "-c", BOOTSTRAP, depth.as_str(), builtins.as_str(), modules.as_str()])
        .stdin(MemoryInputPipe::new(code.to_owned()))
        .stdout(stdout.clone())
        .stderr(stderr.clone())
        .build_p1();

    let engine = interpreter.engine();
    let mut store = Store::new(engine, StoreData::new(limits.memory, wasi));
    store.configure_limits(limits.timeout);
    if interpreter.meters_fuel() {
        store
            .set_fuel(limits.max_steps.unwrap_or(u64::MAX))
            .map_err(SandboxError::Runtime)?;
    }

    let mut linker = Linker::new(engine);
    preview1::add_to_linker_sync(&mut linker, |data: &mut StoreData| &mut data.wasi)
        .map_err(SandboxError::Runtime)?;

    let instance = match linker.instantiate(&mut store, interpreter.module()) {
        Ok(instance) => instance,
        Err(_) if store.data().limiter.limit_exceeded() => {
            return Err(SandboxError::Config(format!(
                "memory ceiling of {} bytes is below what the interpreter needs to start",
                limits.memory
            )))
        }
        Err(e) => return Err(SandboxError::ModuleLoad(e)),
    };
    let start = instance
        .get_typed_func::<(), ()>(&mut store, "_start")
        .map_err(SandboxError::ModuleLoad)?;

    let stop = match start.call(&mut store, ()) {
        Ok(()) => Stop::Exited(0),
        Err(e) => classify(&e, store.data().limiter.limit_exceeded()),
    };
    debug!(
        ?stop,
        peak_memory = store.data().limiter.peak_memory(),
        "restricted run finished"
    );

    finish(stop, stdout.snapshot(), stderr.snapshot(), limits)
}

/// How the guest stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Stop {
    Exited(i32),
    OutOfMemory,
    StackOverflow,
    Interrupted,
    OutOfFuel,
    Crashed(String),
}

fn classify(error: &anyhow::Error, memory_denied: bool) -> Stop {
    if let Some(exit) = error.downcast_ref::<I32Exit>() {
        return Stop::Exited(exit.0);
    }
    // A denied grow surfaces as an abort inside the guest allocator.
    if memory_denied {
        return Stop::OutOfMemory;
    }
    match error.downcast_ref::<Trap>() {
        Some(Trap::Interrupt) => Stop::Interrupted,
        Some(Trap::OutOfFuel) => Stop::OutOfFuel,
        Some(Trap::StackOverflow) => Stop::StackOverflow,
        Some(trap) => Stop::Crashed(trap.to_string()),
        None => Stop::Crashed(format!("{error:#}")),
    }
}

fn finish(stop: Stop, stdout: CapturedOutput, stderr: CapturedOutput, limits: &ResourceLimits) -> Result<RawRun> {
    let truncated = stdout.is_truncated() || stderr.is_truncated();
    let (stdout, _) = stdout.into_parts();
    let (mut stderr, _) = stderr.into_parts();

    let fault = match stop {
        Stop::Exited(code) => {
            return Ok(RawRun {
                stdout,
                stderr,
                exit_status: i64::from(code),
                truncated,
            })
        }
        Stop::Interrupted => return Err(SandboxError::Timeout(limits.timeout)),
        Stop::OutOfFuel => {
            return Err(SandboxError::StepBudgetExhausted(limits.max_steps.unwrap_or_default()))
        }
        Stop::OutOfMemory => "MemoryError: memory limit exceeded".to_string(),
        Stop::StackOverflow => "RecursionError: maximum recursion depth exceeded".to_string(),
        Stop::Crashed(detail) => format!("SystemError: interpreter aborted: {detail}"),
    };

    if !stderr.is_empty() && !stderr.ends_with('\n') {
        stderr.push('\n');
    }
    stderr.push_str(&fault);
    Ok(RawRun {
        stdout,
        stderr,
        exit_status: 1,
        truncated,
    })
}
