//! Basic example of executing Python code in the sandbox.
//!
//! Run with: cargo run --example basic_execution
//!
//! Set `SANDBOX_DOCKER_HOST=local` to use a local Docker daemon; without it
//! the restricted interpreter runs the programs. It needs the RustPython wasm
//! build at `assets/rustpython.wasm` (or `SANDBOX_INTERPRETER_PATH`).

use codequest_sandbox::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("codequest_sandbox=info")),
        )
        .init();

    // Configure the engine from SANDBOX_* variables
    let config = EngineConfig::from_env()?;
    println!("Creating sandbox with config: {:?}", config);

    let sandbox = Sandbox::new(config).await?;
    println!("Selected backend: {}", sandbox.backend_name());

    // Execute simple arithmetic
    println!("\n=== Test 1: Simple arithmetic ===");
    let (outcome, metadata) = sandbox.execute_with_metadata("print(1 + 1)").await;
    println!("outcome: {}", outcome.kind());
    println!("stdout: {}", outcome.stdout().unwrap_or_default());
    println!("duration: {:?}", metadata.duration);

    // Execute with a loop
    println!("\n=== Test 2: Loop execution ===");
    let code = r#"
for i in range(5):
    print(f"Count: {i}")
"#;
    let outcome = sandbox.execute(code).await;
    println!("stdout:\n{}", outcome.stdout().unwrap_or_default());

    // Functions and data structures
    println!("\n=== Test 3: Functions ===");
    let code = r#"
def fibonacci(n):
    if n <= 1:
        return n
    return fibonacci(n - 1) + fibonacci(n - 2)

pets = {"cat": 3, "dog": 5}
for name, age in pets.items():
    print(name, "is", age)
print([fibonacci(i) for i in range(10)])
"#;
    let outcome = sandbox.execute(code).await;
    println!("stdout:\n{}", outcome.stdout().unwrap_or_default());

    // A blocked submission never runs
    println!("\n=== Test 4: Blocked code ===");
    let outcome = sandbox.execute("import os\nprint(os.getcwd())").await;
    println!("{}: {}", outcome.kind(), outcome.detail().unwrap_or_default());

    println!("\n=== All tests completed ===");
    Ok(())
}
