//! Benchmarks for the execution engine.
//!
//! Run with: cargo bench
//!
//! Only the restricted backend and the pre-filter are measured; the
//! container backend is dominated by daemon latency. Execution benchmarks
//! need the RustPython wasm build at `assets/rustpython.wasm`.

use std::sync::Arc;
use std::time::Duration;

use codequest_sandbox::prelude::*;
use codequest_sandbox::BlockRules;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

fn restricted_config() -> EngineConfig {
    EngineConfig::builder()
        .timeout(Duration::from_secs(30))
        .backend(BackendSelection::Restricted)
        .build()
}

/// Benchmark the pre-filter on benign and blocked input.
fn bench_screening(c: &mut Criterion) {
    let rules = BlockRules::new(&[]).unwrap();
    let benign = "def area(w, h):\n    return w * h\n\nfor i in range(10):\n    print(area(i, i + 1))\n"
        .repeat(20);

    let mut group = c.benchmark_group("screening");
    group.throughput(Throughput::Bytes(benign.len() as u64));

    group.bench_function("benign_program", |b| {
        b.iter(|| black_box(rules.screen(black_box(&benign))));
    });

    group.bench_function("blocked_import", |b| {
        b.iter(|| black_box(rules.screen(black_box("import math, os\nprint(1)\n"))));
    });

    group.bench_function("rule_set_construction", |b| {
        b.iter(|| black_box(BlockRules::new(&[]).unwrap()));
    });

    group.finish();
}

/// Benchmark basic execution on the restricted backend.
fn bench_execution(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let sandbox = rt.block_on(Sandbox::new(restricted_config())).unwrap();

    let mut group = c.benchmark_group("execution");

    group.bench_function("simple_print", |b| {
        b.iter(|| rt.block_on(async { black_box(sandbox.execute("print(1 + 1)").await) }));
    });

    group.bench_function("loop_100", |b| {
        let code = "total = 0\nfor i in range(100):\n    total += i\nprint(total)\n";
        b.iter(|| rt.block_on(async { black_box(sandbox.execute(code).await) }));
    });

    group.bench_function("string_ops", |b| {
        let code = "s = 'hello world'\nwords = s.split()\nprint('-'.join(w.upper() for w in words))\n";
        b.iter(|| rt.block_on(async { black_box(sandbox.execute(code).await) }));
    });

    group.bench_function("recursive_fib", |b| {
        let code = "def fib(n):\n    return n if n < 2 else fib(n - 1) + fib(n - 2)\nprint(fib(15))\n";
        b.iter(|| rt.block_on(async { black_box(sandbox.execute(code).await) }));
    });

    group.bench_function("traceback", |b| {
        b.iter(|| rt.block_on(async { black_box(sandbox.execute("print(1/0)").await) }));
    });

    group.finish();
}

/// Benchmark concurrent executions sharing one engine.
fn bench_concurrent_execution(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let sandbox = Arc::new(rt.block_on(Sandbox::new(restricted_config())).unwrap());

    let mut group = c.benchmark_group("concurrent");
    group.sample_size(10);

    for concurrency in [1, 2, 4, 8].iter() {
        group.throughput(Throughput::Elements(*concurrency as u64));
        group.bench_with_input(
            BenchmarkId::new("executions", concurrency),
            concurrency,
            |b, &concurrency| {
                b.iter(|| {
                    rt.block_on(async {
                        let mut handles = Vec::new();

                        for i in 0..concurrency {
                            let sandbox = Arc::clone(&sandbox);
                            handles.push(tokio::spawn(async move {
                                sandbox.execute(&format!("print({i} + 1)")).await
                            }));
                        }

                        for handle in handles {
                            black_box(handle.await.unwrap());
                        }
                    });
                });
            },
        );
    }

    group.finish();
}

/// Benchmark the cost of fuel metering on a tight loop.
fn bench_fuel(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let code = "n = 0\nwhile n < 10000:\n    n += 1\n";

    let mut group = c.benchmark_group("fuel");
    group.sample_size(20);

    let unbounded = rt.block_on(Sandbox::new(restricted_config())).unwrap();
    group.bench_function("epoch_only", |b| {
        b.iter(|| rt.block_on(async { black_box(unbounded.execute(code).await) }));
    });

    let config = EngineConfig::builder()
        .timeout(Duration::from_secs(30))
        .backend(BackendSelection::Restricted)
        .max_steps(10_000_000_000)
        .build();
    let budgeted = rt.block_on(Sandbox::new(config)).unwrap();
    group.bench_function("metered", |b| {
        b.iter(|| rt.block_on(async { black_box(budgeted.execute(code).await) }));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_screening,
    bench_execution,
    bench_concurrent_execution,
    bench_fuel,
);

criterion_main!(benches);
