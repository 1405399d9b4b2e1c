//! Run one Python submission through the sandbox from the command line.

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use codequest_sandbox::prelude::*;

#[derive(Parser)]
#[command(name = "codequest-sandbox")]
#[command(about = "Execute a Python submission inside the sandbox.", long_about = None)]
struct Cli {
    /// Program to run; `-` or nothing reads stdin.
    file: Option<PathBuf>,

    /// Backend to use: auto, container or restricted.
    #[arg(long)]
    backend: Option<String>,

    /// Wall-clock ceiling in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// RustPython wasm module for the restricted backend.
    #[arg(long)]
    interpreter: Option<PathBuf>,

    /// Print the outcome as JSON.
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("codequest_sandbox=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("codequest-sandbox: {err:#}");
            ExitCode::from(4)
        }
    }
}

#[tokio::main]
async fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let code = read_program(cli.file.as_deref())?;

    let mut config = EngineConfig::from_env().context("invalid SANDBOX_* configuration")?;
    if let Some(backend) = cli.backend.as_deref() {
        config.backend = backend.parse()?;
    }
    if let Some(ms) = cli.timeout_ms {
        config.limits.timeout = Duration::from_millis(ms);
    }
    if let Some(path) = cli.interpreter {
        config.interpreter_path = path;
    }

    let sandbox = Sandbox::new(config).await?;
    let (outcome, metadata) = sandbox.execute_with_metadata(&code).await;

    if cli.json {
        let report = serde_json::json!({ "result": outcome, "metadata": metadata });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_outcome(&outcome);
    }

    Ok(ExitCode::from(exit_code(&outcome)))
}

fn read_program(file: Option<&std::path::Path>) -> Result<String> {
    match file {
        Some(path) if path.as_os_str() != "-" => std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display())),
        _ => {
            let mut code = String::new();
            std::io::stdin()
                .read_to_string(&mut code)
                .context("cannot read program from stdin")?;
            Ok(code)
        }
    }
}

fn print_outcome(outcome: &ExecutionOutcome) {
    let (stdout, stderr) = render_outcome(outcome);
    if let Some(text) = stdout {
        println!("{text}");
    }
    if let Some(text) = stderr {
        eprintln!("{text}");
    }
}

/// Text for stdout and stderr, in that order.
fn render_outcome(outcome: &ExecutionOutcome) -> (Option<String>, Option<String>) {
    let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
    match outcome {
        ExecutionOutcome::Completed { stdout, stderr, .. } => (non_empty(stdout), non_empty(stderr)),
        // The reason already names itself as a block.
        ExecutionOutcome::Blocked { reason } => (None, Some(reason.clone())),
        ExecutionOutcome::TimedOut { after } => (None, Some(format!("timed out after {after:?}"))),
        ExecutionOutcome::BackendError { detail } => (None, Some(format!("backend error: {detail}"))),
    }
}

fn exit_code(outcome: &ExecutionOutcome) -> u8 {
    match outcome {
        ExecutionOutcome::Completed { stderr, .. } if stderr.is_empty() => 0,
        ExecutionOutcome::Completed { .. } => 1,
        ExecutionOutcome::Blocked { .. } => 2,
        ExecutionOutcome::TimedOut { .. } => 3,
        ExecutionOutcome::BackendError { .. } => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_reason_is_printed_once() {
        let rules = codequest_sandbox::BlockRules::new(&[]).unwrap();
        let codequest_sandbox::Screening::Blocked(reason) = rules.screen("import os") else {
            panic!("import os must be blocked");
        };
        let outcome = ExecutionOutcome::Blocked { reason };

        let (stdout, stderr) = render_outcome(&outcome);
        let stderr = stderr.unwrap();
        assert!(stdout.is_none());
        assert!(stderr.starts_with("blocked: "));
        assert_eq!(stderr.matches("blocked:").count(), 1);
        assert_eq!(exit_code(&outcome), 2);
    }

    #[test]
    fn test_rendering_per_outcome() {
        let outcome = ExecutionOutcome::Completed {
            stdout: "cat".to_string(),
            stderr: String::new(),
            exit_status: 0,
        };
        assert_eq!(render_outcome(&outcome), (Some("cat".to_string()), None));
        assert_eq!(exit_code(&outcome), 0);

        let outcome = ExecutionOutcome::TimedOut {
            after: Duration::from_secs(3),
        };
        assert_eq!(render_outcome(&outcome).1.as_deref(), Some("timed out after 3s"));
        assert_eq!(exit_code(&outcome), 3);
    }
}
