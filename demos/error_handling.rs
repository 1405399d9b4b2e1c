//! Example demonstrating how failures surface as outcomes.
//!
//! This example shows how to handle the different kinds of failure:
//! - Python exceptions
//! - Syntax errors
//! - Timeouts
//! - Blocked submissions
//! - Configuration errors
//!
//! Needs the RustPython wasm build at `assets/rustpython.wasm`.
//!
//! Run with: cargo run --example error_handling

use std::time::Duration;

use codequest_sandbox::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    println!("=== Error Handling Example ===\n");

    let config = EngineConfig::builder()
        .timeout(Duration::from_secs(2))
        .backend(BackendSelection::Restricted)
        .build();
    let sandbox = Sandbox::new(config).await?;

    // Example 1: ValueError
    println!("--- Test 1: Python ValueError ---");
    {
        let outcome = sandbox.execute("int('not a number')").await;

        if let Some(fault) = outcome.fault() {
            println!("stderr:\n{}", outcome.stderr().unwrap_or_default());
            println!("\nParsed exception:");
            println!("  Type: {}", fault.exception_type);
            println!("  Message: {}", fault.message);
            if let Some(tb) = fault.traceback {
                println!("  Has traceback: {} lines", tb.lines().count());
            }
        }
    }
    println!();

    // Example 2: NameError, TypeError, ZeroDivisionError
    println!("--- Test 2: Common beginner mistakes ---");
    for code in ["print(undefined_variable)", "'string' + 42", "print(1/0)"] {
        let outcome = sandbox.execute(code).await;
        if let Some(fault) = outcome.fault() {
            println!("{code:<28} -> {}: {}", fault.exception_type, fault.message);
        }
    }
    println!();

    // Example 3: Output printed before a failure moves to stderr
    println!("--- Test 3: Output before an exception ---");
    {
        let code = "print('step 1')\nprint('step 2')\nitems = []\nprint(items[0])\n";
        let outcome = sandbox.execute(code).await;
        println!("stdout: {:?}", outcome.stdout().unwrap_or_default());
        println!("stderr:\n{}", outcome.stderr().unwrap_or_default());
    }
    println!();

    // Example 4: Syntax error
    println!("--- Test 4: Syntax Error ---");
    {
        let outcome = sandbox.execute("if True print('missing colon')").await;
        if let Some(fault) = outcome.fault() {
            println!("Caught: {}: {}", fault.exception_type, fault.message);
        }
    }
    println!();

    // Example 5: Handling errors inside the program
    println!("--- Test 5: Successful Execution ---");
    {
        let code = r#"
def calculate(x, y):
    try:
        return x / y
    except ZeroDivisionError:
        return None

results = [calculate(10, 2), calculate(10, 0), calculate(15, 3)]

for i, r in enumerate(results):
    if r is not None:
        print(f"Result {i+1}: {r}")
    else:
        print(f"Result {i+1}: Division by zero handled")
"#;
        let outcome = sandbox.execute(code).await;
        if outcome.is_success() {
            println!("Execution successful!");
            println!("Output:\n{}", outcome.stdout().unwrap_or_default());
        }
    }
    println!();

    // Example 6: Outcome classification helper
    println!("--- Test 6: Outcome Classification ---");
    {
        fn classify(outcome: &ExecutionOutcome) -> String {
            match outcome {
                ExecutionOutcome::Completed { .. } if outcome.is_success() => "Success".to_string(),
                ExecutionOutcome::Completed { exit_status, .. } => match outcome.fault() {
                    Some(fault) => format!("Python {}", fault.exception_type),
                    None => format!("Python error (exit status {exit_status})"),
                },
                ExecutionOutcome::TimedOut { after } => format!("Timeout after {after:?}"),
                ExecutionOutcome::Blocked { reason } => reason.clone(),
                ExecutionOutcome::BackendError { detail } => format!("Backend error: {detail}"),
            }
        }

        let test_cases = vec![
            ("print(42)", "Simple print"),
            ("int('x')", "Invalid conversion"),
            ("x = 1/0", "Division by zero"),
            ("def f(): f()\nf()", "Recursion limit"),
            ("while True: pass", "Infinite loop"),
            ("import subprocess", "Process spawning"),
        ];

        println!("Classification results:");
        for (code, description) in test_cases {
            let outcome = sandbox.execute(code).await;
            println!("  {:<20} -> {}", description, classify(&outcome));
        }
    }
    println!();

    // Example 7: Configuration errors are the only errors callers see
    println!("--- Test 7: Configuration Error ---");
    {
        let config = EngineConfig::builder().timeout(Duration::ZERO).build();
        match Sandbox::new(config).await {
            Ok(_) => println!("unexpectedly accepted"),
            Err(e) => println!("Rejected: {e}"),
        }
    }

    // Example 8: The restricted backend needs its interpreter module
    println!("\n--- Test 8: Missing Interpreter ---");
    {
        let config = EngineConfig::builder()
            .backend(BackendSelection::Restricted)
            .interpreter_path("missing/rustpython.wasm")
            .build();
        match Sandbox::new(config).await {
            Ok(_) => println!("unexpectedly loaded"),
            Err(e) => println!("Rejected: {e}"),
        }
    }

    println!("\n=== Error handling examples completed ===");
    Ok(())
}
