//! Error types for the sandbox engine.
//!
//! `SandboxError` is the internal failure type. It never crosses
//! [`Sandbox::execute`](crate::Sandbox::execute); the result normalizer folds
//! it into an [`ExecutionOutcome`](crate::ExecutionOutcome).

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while setting up or running an execution.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// The execution exceeded the configured wall-clock timeout.
    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    /// The interpreter used up its fuel budget.
    #[error("execution ran out of fuel after {0} units")]
    StepBudgetExhausted(u64),

    /// The wasm engine could not be created.
    #[error("failed to initialize runtime: {0}")]
    RuntimeInit(#[source] anyhow::Error),

    /// The interpreter module failed to compile or instantiate.
    #[error("failed to load Python interpreter: {0}")]
    ModuleLoad(#[source] anyhow::Error),

    /// The interpreter wasm file does not exist.
    #[error("Python interpreter wasm not found at: {0}")]
    InterpreterNotFound(String),

    /// Invalid engine configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A block pattern failed to compile.
    #[error("invalid block pattern `{pattern}`: {source}")]
    InvalidPattern {
        /// The offending pattern text.
        pattern: String,
        /// The regex compilation error.
        #[source]
        source: regex::Error,
    },

    /// The container daemon rejected a request.
    #[error("container backend error: {0}")]
    Backend(#[from] bollard::errors::Error),

    /// The container daemon could not be reached in time.
    #[error("container backend unavailable: {0}")]
    BackendUnavailable(String),

    /// I/O error while preparing an execution unit.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other runtime failure (wasm linking, join errors).
    #[error("runtime failure: {0}")]
    Runtime(#[source] anyhow::Error),
}

impl SandboxError {
    /// Check if this error means the run hit its time or step ceiling.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            SandboxError::Timeout(_) | SandboxError::StepBudgetExhausted(_)
        )
    }

    /// Check if this error comes from the container infrastructure.
    pub fn is_backend(&self) -> bool {
        matches!(
            self,
            SandboxError::Backend(_) | SandboxError::BackendUnavailable(_)
        )
    }
}

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

/// A Python exception recovered from a failed run's stderr.
///
/// Both backends render uncaught exceptions in CPython's format, so the same
/// parser works for either.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramFault {
    /// Exception class name, e.g. `ZeroDivisionError`.
    pub exception_type: String,
    /// Exception message, possibly empty.
    pub message: String,
    /// Traceback text up to and including the exception line.
    pub traceback: Option<String>,
}

impl ProgramFault {
    /// Parse the last exception line (and traceback, if any) from stderr.
    pub fn parse(stderr: &str) -> Option<Self> {
        if stderr.trim().is_empty() {
            return None;
        }

        let lines: Vec<&str> = stderr.lines().collect();
        let mut exception_line = None;
        let mut traceback_start = None;

        for (i, line) in lines.iter().enumerate() {
            if line.starts_with("Traceback (most recent call last):") {
                traceback_start = Some(i);
                continue;
            }
            if !line.starts_with(' ') && looks_like_exception(line) {
                exception_line = Some((i, *line));
            }
        }

        let (line_idx, exception_str) = exception_line?;
        let (exception_type, message) = match exception_str.split_once(':') {
            Some((ty, msg)) => (ty.trim().to_string(), msg.trim().to_string()),
            None => (exception_str.trim().to_string(), String::new()),
        };

        let traceback = traceback_start
            .filter(|start| *start < line_idx)
            .map(|start| lines[start..=line_idx].join("\n"));

        Some(Self {
            exception_type,
            message,
            traceback,
        })
    }
}

/// Check if a line looks like `SomeError: message` or a bare exception name.
fn looks_like_exception(line: &str) -> bool {
    const SUFFIXES: [&str; 3] = ["Error", "Exception", "Warning"];
    const STANDALONE: [&str; 4] = [
        "KeyboardInterrupt",
        "SystemExit",
        "StopIteration",
        "GeneratorExit",
    ];

    if !line.chars().next().is_some_and(|c| c.is_ascii_uppercase()) {
        return false;
    }

    let name = match line.find(':') {
        Some(idx) => &line[..idx],
        None => line.trim_end(),
    };
    if name.contains(char::is_whitespace) {
        return false;
    }
    // Dotted names such as `json.decoder.JSONDecodeError`.
    let last = name.rsplit('.').next().unwrap_or(name);

    SUFFIXES.iter().any(|s| last.ends_with(s)) || STANDALONE.contains(&last)
}
