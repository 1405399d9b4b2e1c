//! End-to-end behaviour of the execution engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bollard::query_parameters::ListContainersOptions;
use bollard::Docker;
use codequest_sandbox::prelude::*;

/// Backend that prints the submission back, for tests that never need Python.
struct Echo;

#[async_trait]
impl Executor for Echo {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn run(&self, code: &str) -> Result<RawRun> {
        Ok(RawRun {
            stdout: code.to_string(),
            ..RawRun::default()
        })
    }
}

async fn restricted() -> Sandbox {
    let config = EngineConfig::builder()
        .timeout(Duration::from_secs(5))
        .backend(BackendSelection::Restricted)
        .build();
    Sandbox::new(config).await.unwrap()
}

#[tokio::test]
#[ignore = "requires rustpython.wasm"]
async fn test_prints_output() {
    let sandbox = restricted().await;
    let outcome = sandbox.execute("print('cat')").await;
    assert_eq!(
        outcome,
        ExecutionOutcome::Completed {
            stdout: "cat".to_string(),
            stderr: String::new(),
            exit_status: 0,
        }
    );
}

#[tokio::test]
#[ignore = "requires rustpython.wasm"]
async fn test_empty_program() {
    let sandbox = restricted().await;
    let outcome = sandbox.execute("").await;
    assert!(outcome.is_success());
    assert_eq!(outcome.stdout(), Some(""));
    assert_eq!(outcome.stderr(), Some(""));
}

#[tokio::test]
#[ignore = "requires rustpython.wasm"]
async fn test_division_by_zero() {
    let sandbox = restricted().await;
    let outcome = sandbox.execute("print(1/0)").await;
    assert!(!outcome.is_success());
    assert_eq!(outcome.stdout(), Some(""));
    let fault = outcome.fault().unwrap();
    assert_eq!(fault.exception_type, "ZeroDivisionError");
    assert_eq!(fault.message, "division by zero");
    assert!(fault.traceback.is_some());
}

#[tokio::test]
#[ignore = "requires rustpython.wasm"]
async fn test_failed_run_keeps_earlier_output_in_stderr() {
    let sandbox = restricted().await;
    let outcome = sandbox.execute("print('before')\nx = [1, 2]\nprint(x[5])\n").await;
    let stderr = outcome.stderr().unwrap();
    assert!(stderr.starts_with("before\nTraceback (most recent call last):"));
    assert!(stderr.ends_with("IndexError: list index out of range"));
    assert_eq!(outcome.stdout(), Some(""));
}

#[tokio::test]
#[ignore = "requires rustpython.wasm"]
async fn test_typical_beginner_program() {
    let sandbox = restricted().await;
    let code = r#"
scores = {"ana": 3, "ben": 5}
scores["cy"] = 4

def best(table):
    name = max(table, key=lambda k: table[k])
    return name, table[name]

who, points = best(scores)
print(f"{who} wins with {points} points")
for i, name in enumerate(sorted(scores)):
    print(i + 1, name.upper())
print([n * n for n in range(5) if n % 2 == 0])
"#;
    let outcome = sandbox.execute(code).await;
    assert_eq!(
        outcome.stdout(),
        Some("ben wins with 5 points\n1 ANA\n2 BEN\n3 CY\n[0, 4, 16]")
    );
}

#[tokio::test]
#[ignore = "requires rustpython.wasm"]
async fn test_concurrent_runs_are_independent() {
    let sandbox = Arc::new(restricted().await);

    let a = tokio::spawn({
        let sandbox = Arc::clone(&sandbox);
        async move { sandbox.execute("print('A')").await }
    });
    let b = tokio::spawn({
        let sandbox = Arc::clone(&sandbox);
        async move { sandbox.execute("print('B')").await }
    });

    assert_eq!(a.await.unwrap().stdout(), Some("A"));
    assert_eq!(b.await.unwrap().stdout(), Some("B"));
}

#[tokio::test]
#[ignore = "requires rustpython.wasm"]
async fn test_many_concurrent_runs() {
    let sandbox = Arc::new(restricted().await);

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let sandbox = Arc::clone(&sandbox);
            tokio::spawn(async move {
                let outcome = sandbox.execute(&format!("print({i} * 2)")).await;
                (i, outcome)
            })
        })
        .collect();

    for handle in handles {
        let (i, outcome) = handle.await.unwrap();
        assert_eq!(outcome.stdout(), Some((i * 2).to_string().as_str()));
    }
}

#[tokio::test]
#[ignore = "requires rustpython.wasm"]
async fn test_timeout_does_not_block_other_runs() {
    let config = EngineConfig::builder()
        .timeout(Duration::from_millis(500))
        .backend(BackendSelection::Restricted)
        .build();
    let sandbox = Arc::new(Sandbox::new(config).await.unwrap());

    let slow = tokio::spawn({
        let sandbox = Arc::clone(&sandbox);
        async move { sandbox.execute("while True: pass").await }
    });
    let fast = sandbox.execute("print('still here')").await;

    assert_eq!(fast.stdout(), Some("still here"));
    assert!(matches!(slow.await.unwrap(), ExecutionOutcome::TimedOut { .. }));
}

#[tokio::test]
#[ignore = "requires rustpython.wasm"]
async fn test_step_budget_reports_timeout() {
    let config = EngineConfig::builder()
        .timeout(Duration::from_secs(30))
        .backend(BackendSelection::Restricted)
        .max_steps(50_000_000)
        .build();
    let sandbox = Sandbox::new(config).await.unwrap();

    let outcome = sandbox.execute("n = 0\nwhile True:\n    n += 1\n").await;
    assert!(matches!(outcome, ExecutionOutcome::TimedOut { .. }));
}

#[tokio::test]
#[ignore = "requires rustpython.wasm"]
async fn test_metadata_names_backend() {
    let sandbox = restricted().await;
    let (outcome, metadata) = sandbox.execute_with_metadata("print(2 ** 10)").await;
    assert_eq!(outcome.stdout(), Some("1024"));
    assert_eq!(metadata.backend, "restricted");
    assert!(!metadata.output_truncated);
}

#[tokio::test]
async fn test_outcome_serializes_with_tag() {
    let sandbox = Sandbox::with_executor(EngineConfig::default(), Arc::new(Echo)).unwrap();
    let outcome = sandbox.execute("import os").await;
    let json = serde_json::to_value(&outcome).unwrap();
    assert_eq!(json["outcome"], "blocked");
    assert!(json["reason"].as_str().unwrap().contains("filesystem access"));
}

#[tokio::test]
async fn test_extra_block_pattern() {
    let config = EngineConfig::builder().block_pattern(r"\binput\s*\(").build();
    let sandbox = Sandbox::with_executor(config, Arc::new(Echo)).unwrap();
    assert!(matches!(
        sandbox.execute("name = input()").await,
        ExecutionOutcome::Blocked { .. }
    ));
    assert!(sandbox.execute("print('ok')").await.is_success());
}

#[tokio::test]
async fn test_invalid_extra_pattern_is_rejected() {
    let config = EngineConfig::builder()
        .backend(BackendSelection::Restricted)
        .block_pattern("(unclosed")
        .build();
    assert!(matches!(
        Sandbox::new(config).await,
        Err(SandboxError::InvalidPattern { .. })
    ));
}

#[tokio::test]
async fn test_missing_interpreter_fails_startup() {
    let config = EngineConfig::builder()
        .backend(BackendSelection::Restricted)
        .interpreter_path("no/such/rustpython.wasm")
        .build();
    assert!(matches!(
        Sandbox::new(config).await,
        Err(SandboxError::InterpreterNotFound(_))
    ));
}

#[tokio::test]
async fn test_unreachable_container_backend_is_backend_error() {
    let config = EngineConfig::builder()
        .backend(BackendSelection::Container)
        .docker_endpoint("tcp://127.0.0.1:1")
        .backend_timeout(Duration::from_secs(2))
        .build();
    let sandbox = Sandbox::new(config).await.unwrap();
    assert_eq!(sandbox.backend_name(), "container");

    let started = Instant::now();
    let outcome = sandbox.execute("print('cat')").await;
    assert!(
        matches!(outcome, ExecutionOutcome::BackendError { .. }),
        "expected backend error, got {outcome:?}"
    );
    assert!(started.elapsed() < Duration::from_secs(10));

    // Blocked code is still blocked, even with a broken backend.
    assert!(matches!(
        sandbox.execute("import socket").await,
        ExecutionOutcome::Blocked { .. }
    ));
}

fn docker_config(timeout: Duration) -> EngineConfig {
    EngineConfig::builder()
        .backend(BackendSelection::Container)
        .docker_endpoint("local")
        .timeout(timeout)
        .build()
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_container_prints_output() {
    let sandbox = Sandbox::new(docker_config(Duration::from_secs(20))).await.unwrap();
    let outcome = sandbox.execute("print('cat')").await;
    assert_eq!(outcome.stdout(), Some("cat"));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_container_division_by_zero() {
    let sandbox = Sandbox::new(docker_config(Duration::from_secs(20))).await.unwrap();
    let outcome = sandbox.execute("print(1/0)").await;
    assert_eq!(outcome.stdout(), Some(""));
    assert_eq!(outcome.fault().unwrap().exception_type, "ZeroDivisionError");
}

/// Names of leftover run containers, stopped or not.
async fn run_containers(docker: &Docker) -> Vec<String> {
    let options = ListContainersOptions {
        all: true,
        filters: Some(HashMap::from([(
            "name".to_string(),
            vec!["cq-run-".to_string()],
        )])),
        ..Default::default()
    };
    docker
        .list_containers(Some(options))
        .await
        .unwrap()
        .into_iter()
        .flat_map(|c| c.names.unwrap_or_default())
        .collect()
}

/// Leftover program directories in the system temp dir.
fn run_dirs() -> Vec<String> {
    std::fs::read_dir(std::env::temp_dir())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("cq_"))
        .collect()
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_container_infinite_loop_times_out() {
    let sandbox = Sandbox::new(docker_config(Duration::from_secs(2))).await.unwrap();
    let started = Instant::now();
    let outcome = sandbox.execute("while True: pass").await;
    assert!(matches!(outcome, ExecutionOutcome::TimedOut { .. }));
    assert!(started.elapsed() < Duration::from_secs(15));

    // Other docker tests may still be tearing down their own units.
    let docker = Docker::connect_with_local_defaults().unwrap();
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let containers = run_containers(&docker).await;
        let dirs = run_dirs();
        if containers.is_empty() && dirs.is_empty() {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "execution units left behind: {containers:?} {dirs:?}"
        );
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}
