use std::sync::Arc;
use std::time::Instant;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use sweepbench::{
    hash, CacheConfig, CacheHandle, ExecutorConfig, Record, ResultVariable, RunOptions,
    SweepOrchestrator, SweepSpecification, SweepVariable, Worker, WorkerError,
};

fn spec(level: u32) -> SweepSpecification {
    SweepSpecification::builder("bench")
        .input(SweepVariable::float("x", 0.0, 1.0).unwrap())
        .input(SweepVariable::float("y", 0.0, 1.0).unwrap())
        .result(ResultVariable::scalar("z"))
        .level(level)
        .build()
        .unwrap()
}

fn worker() -> Arc<dyn Worker> {
    Arc::new(|input: &Record| -> Result<Record, WorkerError> {
        let x = input.float("x").ok_or("missing x")?;
        let y = input.float("y").ok_or("missing y")?;
        Ok(Record::new().with("z", x.sin() * y.cos()))
    })
}

fn orchestrator(dir: &std::path::Path) -> SweepOrchestrator {
    let config = CacheConfig {
        sync_on_write: false,
        ..CacheConfig::default()
    };
    SweepOrchestrator::new(CacheHandle::open(dir, config).unwrap())
}

fn bench_record_hash(c: &mut Criterion) {
    let record = Record::new()
        .with("x", 0.125)
        .with("y", 0.875)
        .with("mode", "exact")
        .with("n", 42_i64);
    c.bench_function("hash/record_4_fields", |b| b.iter(|| hash(&record)));
}

fn bench_cold_sweep(c: &mut Criterion) {
    let mut group = c.benchmark_group("sweep_cold");
    // Level 5: 17 x 17 cells.
    group.throughput(Throughput::Elements(289));

    for (name, executor) in [
        ("serial", ExecutorConfig::Serial),
        ("parallel_4", ExecutorConfig::parallel(4)),
    ] {
        group.bench_function(name, |b| {
            // Fresh cache root per sample so every cell is a miss.
            b.iter_custom(|iters| {
                let mut total = std::time::Duration::ZERO;
                for _ in 0..iters {
                    let dir = tempfile::tempdir().unwrap();
                    let orch = orchestrator(dir.path());
                    let options = RunOptions::new().executor(executor);
                    let start = Instant::now();
                    orch.run_sweep(&spec(5), worker(), &options).unwrap();
                    total += start.elapsed();
                }
                total
            });
        });
    }
    group.finish();
}

fn bench_warm_sweep(c: &mut Criterion) {
    let mut group = c.benchmark_group("sweep_warm");
    group.throughput(Throughput::Elements(289));

    group.bench_function("sample_cache_hits", |b| {
        b.iter_custom(|iters| {
            let dir = tempfile::tempdir().unwrap();
            let orch = orchestrator(dir.path());
            orch.run_sweep(&spec(5), worker(), &RunOptions::default())
                .unwrap();

            let start = Instant::now();
            for _ in 0..iters {
                orch.run_sweep(&spec(5), worker(), &RunOptions::default())
                    .unwrap();
            }
            start.elapsed()
        });
    });

    group.bench_function("sweep_cache_hit", |b| {
        b.iter_custom(|iters| {
            let dir = tempfile::tempdir().unwrap();
            let orch = orchestrator(dir.path());
            let options = RunOptions::new().use_cache(true);
            orch.run_sweep(&spec(5), worker(), &options).unwrap();

            let start = Instant::now();
            for _ in 0..iters {
                orch.run_sweep(&spec(5), worker(), &options).unwrap();
            }
            start.elapsed()
        });
    });

    group.finish();
}

criterion_group!(sweep, bench_record_hash, bench_cold_sweep, bench_warm_sweep);
criterion_main!(sweep);
