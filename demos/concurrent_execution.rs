//! Example of concurrent executions sharing one engine.
//!
//! Every request gets its own execution state, so a single `Sandbox` behind
//! an `Arc` can serve many programs at once.
//!
//! Needs the RustPython wasm build at `assets/rustpython.wasm`.
//!
//! Run with: cargo run --example concurrent_execution

use std::sync::Arc;
use std::time::{Duration, Instant};

use codequest_sandbox::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    println!("=== Concurrent Execution Example ===\n");

    let config = EngineConfig::builder()
        .timeout(Duration::from_secs(10))
        .backend(BackendSelection::Restricted)
        .build();
    let sandbox = Arc::new(Sandbox::new(config).await?);

    // Define some Python tasks to run concurrently
    let tasks = vec![
        ("Task 1", "sum([i**2 for i in range(100)])", "Sum of squares"),
        (
            "Task 2",
            "len([x for x in range(1000) if x % 3 == 0])",
            "Count divisible by 3",
        ),
        ("Task 3", "'-'.join([str(i) for i in range(10)])", "Join digits"),
        (
            "Task 4",
            "max([i * (100 - i) for i in range(101)])",
            "Maximum product",
        ),
        ("Task 5", "1 / 0", "Deliberate failure"),
    ];

    println!("Starting {} concurrent tasks...\n", tasks.len());
    let start = Instant::now();

    // Spawn all tasks concurrently
    let mut handles = Vec::new();
    for (name, code, description) in tasks {
        let sandbox = Arc::clone(&sandbox);
        handles.push(tokio::spawn(async move {
            let full_code = format!("print({})", code);
            let (outcome, metadata) = sandbox.execute_with_metadata(&full_code).await;
            (name, description, outcome, metadata.duration)
        }));
    }

    // Collect results
    println!("Results:");
    println!("{:-<60}", "");
    for handle in handles {
        match handle.await {
            Ok((name, description, outcome, duration)) => match outcome.stdout() {
                Some(output) if outcome.is_success() => {
                    println!("{}: {} = {} (took {:?})", name, description, output, duration);
                }
                _ => {
                    let fault = outcome.fault().map(|f| f.exception_type);
                    println!("{}: {} failed ({:?})", name, description, fault);
                }
            },
            Err(e) => println!("Join error: {}", e),
        }
    }
    println!("{:-<60}", "");

    let total_time = start.elapsed();
    println!("\nTotal wall-clock time: {:?}", total_time);
    println!("(Tasks ran concurrently, so total time < sum of individual times)");

    Ok(())
}
