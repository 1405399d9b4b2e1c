//! Execution outcomes and the normalizer that produces them.

use std::time::Duration;

use serde::Serialize;

use crate::error::{ProgramFault, SandboxError};

/// What a backend hands back for a run that finished on its own.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRun {
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Process exit status (0 for success).
    pub exit_status: i64,
    /// Whether output was cut at the configured cap.
    pub truncated: bool,
}

impl RawRun {
    /// Check if the run exited with status 0.
    pub fn is_success(&self) -> bool {
        self.exit_status == 0
    }
}

/// The single typed result of one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// The pre-filter rejected the code; nothing ran.
    Blocked {
        /// Which rule matched.
        reason: String,
    },
    /// The program ran to completion, successfully or not.
    Completed {
        /// Program output. Always empty when the program failed.
        stdout: String,
        /// Program error output; non-empty means the program failed.
        stderr: String,
        /// Exit status reported by the backend.
        exit_status: i64,
    },
    /// The run hit its wall-clock (or step) ceiling and was abandoned.
    TimedOut {
        /// The ceiling that was exceeded.
        #[serde(with = "duration_ms")]
        after: Duration,
    },
    /// The isolation infrastructure failed; the program's fate is unknown.
    BackendError {
        /// Human-readable description of the failure.
        detail: String,
    },
}

impl ExecutionOutcome {
    /// Check if the program completed with status 0 and no error output.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ExecutionOutcome::Completed { stderr, exit_status: 0, .. } if stderr.is_empty()
        )
    }

    /// Program stdout, when the run completed.
    pub fn stdout(&self) -> Option<&str> {
        match self {
            ExecutionOutcome::Completed { stdout, .. } => Some(stdout),
            _ => None,
        }
    }

    /// Program stderr, when the run completed.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            ExecutionOutcome::Completed { stderr, .. } => Some(stderr),
            _ => None,
        }
    }

    /// The uncaught exception behind a failed run, if one can be recognised.
    pub fn fault(&self) -> Option<ProgramFault> {
        self.stderr().and_then(ProgramFault::parse)
    }

    /// Short human-readable description of a non-completion.
    pub fn detail(&self) -> Option<String> {
        match self {
            ExecutionOutcome::Blocked { reason } => Some(reason.clone()),
            ExecutionOutcome::TimedOut { after } => Some(format!("timed out after {after:?}")),
            ExecutionOutcome::BackendError { detail } => Some(detail.clone()),
            ExecutionOutcome::Completed { .. } => None,
        }
    }

    /// Stable lowercase name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionOutcome::Blocked { .. } => "blocked",
            ExecutionOutcome::Completed { .. } => "completed",
            ExecutionOutcome::TimedOut { .. } => "timed_out",
            ExecutionOutcome::BackendError { .. } => "backend_error",
        }
    }
}

/// Bookkeeping about a run, returned next to its outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionMetadata {
    /// Name of the backend that handled the request.
    pub backend: &'static str,
    /// Wall-clock time spent inside the engine.
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    /// Whether output was cut at the configured cap.
    pub output_truncated: bool,
}

/// Fold a backend result into an outcome.
///
/// Both streams lose trailing whitespace. A failed run never carries stdout:
/// whatever it printed is moved in front of its error output.
pub fn normalize(result: Result<RawRun, SandboxError>, timeout: Duration) -> ExecutionOutcome {
    match result {
        Ok(run) => {
            let stdout = run.stdout.trim_end();
            let stderr = run.stderr.trim_end();
            let failed = run.exit_status != 0 || !stderr.is_empty();

            if !failed {
                return ExecutionOutcome::Completed {
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                    exit_status: run.exit_status,
                };
            }

            let mut combined = String::with_capacity(stdout.len() + stderr.len() + 1);
            if !stdout.is_empty() {
                combined.push_str(stdout);
                combined.push('\n');
            }
            combined.push_str(stderr);
            if combined.is_empty() {
                combined = format!("process exited with status {}", run.exit_status);
            }

            ExecutionOutcome::Completed {
                stdout: String::new(),
                stderr: combined,
                exit_status: run.exit_status,
            }
        }
        Err(SandboxError::Timeout(after)) => ExecutionOutcome::TimedOut { after },
        Err(SandboxError::StepBudgetExhausted(_)) => ExecutionOutcome::TimedOut { after: timeout },
        Err(e) => ExecutionOutcome::BackendError {
            detail: e.to_string(),
        },
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}
