//! Effect system benchmarks using criterion.
//!
//! Benchmarks for interpreting long `flat_map` chains, fork/join
//! throughput, concurrent gathering and stream consumption.
//!
//! Run with: cargo bench --bench effects_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use marrow_runtime::{Concurrency, Effect, Runtime, RuntimeConfig, Stream};

fn runtime() -> Runtime {
    Runtime::new(
        RuntimeConfig::builder()
            .thread_name_prefix("bench")
            .build()
            .expect("valid config"),
    )
    .expect("runtime starts")
}

fn chain(depth: usize) -> Effect<u64> {
    (0..depth).fold(Effect::succeed(0u64), |effect, _| {
        effect.flat_map(|n| Effect::succeed(n + 1))
    })
}

/// Benchmark interpreting deep flat_map chains
fn bench_deep_chain(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("deep_chain");

    for depth in [100usize, 1_000, 10_000] {
        let effect = chain(depth);
        group.throughput(Throughput::Elements(depth as u64));
        group.bench_with_input(BenchmarkId::new("run_sync", depth), &effect, |b, effect| {
            b.iter(|| black_box(rt.run_sync(effect.clone())))
        });
    }

    group.bench_function("map_chain_1000", |b| {
        let effect = (0..1_000).fold(Effect::<u64>::succeed(1), |e, _| e.map(|n| n ^ 1));
        b.iter(|| black_box(rt.run_sync(effect.clone())))
    });

    group.finish();
}

/// Benchmark forking fibers and joining them
fn bench_fork_join(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("fork_join");

    group.bench_function("single", |b| {
        let effect = Effect::<u64>::succeed(1)
            .fork::<std::convert::Infallible>()
            .flat_map(|fiber| fiber.join());
        b.iter(|| black_box(rt.run_blocking(effect.clone())))
    });

    for fibers in [10usize, 100, 1_000] {
        group.throughput(Throughput::Elements(fibers as u64));
        group.bench_with_input(BenchmarkId::new("all_unbounded", fibers), &fibers, |b, &n| {
            let effect = Effect::all(
                (0..n as u64).map(|i| Effect::<u64>::sync(move || i * 2)),
                Concurrency::Unbounded,
            );
            b.iter(|| black_box(rt.run_blocking(effect.clone())))
        });
        group.bench_with_input(BenchmarkId::new("all_bounded_8", fibers), &fibers, |b, &n| {
            let effect = Effect::all(
                (0..n as u64).map(|i| Effect::<u64>::sync(move || i * 2)),
                Concurrency::Bounded(8),
            );
            b.iter(|| black_box(rt.run_blocking(effect.clone())))
        });
    }

    group.finish();
}

/// Benchmark pulling streams through transformations
fn bench_stream(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("stream");

    for len in [1_000i64, 100_000] {
        group.throughput(Throughput::Elements(len as u64));
        group.bench_with_input(BenchmarkId::new("range_map_fold", len), &len, |b, &len| {
            let effect = Stream::<i64>::range(1, len)
                .map(|n| n * 2)
                .filter(|n| n % 3 != 0)
                .run_fold(0i64, |acc, n| acc.wrapping_add(n));
            b.iter(|| black_box(rt.run_sync(effect.clone())))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_deep_chain, bench_fork_join, bench_stream);
criterion_main!(benches);
