//! Normalizer benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use streamhub_bench::{generate_changes, raw_insert, raw_update};
use streamhub_core::normalize;

/// Benchmark single changes by operation kind.
fn bench_single(c: &mut Criterion) {
    let mut group = c.benchmark_group("normalize");

    group.bench_function("insert", |b| {
        let raw = raw_insert("messages", 1, 8);
        b.iter(|| {
            let event = normalize(black_box("messages"), black_box(&raw)).unwrap();
            black_box(event);
        });
    });

    group.bench_function("update", |b| {
        let raw = raw_update("messages", 1, 8, 2);
        b.iter(|| {
            let event = normalize(black_box("messages"), black_box(&raw)).unwrap();
            black_box(event);
        });
    });

    group.finish();
}

/// Benchmark normalization cost against document width.
fn bench_document_width(c: &mut Criterion) {
    let mut group = c.benchmark_group("normalize_width");

    for fields in [4, 32, 256] {
        let batch = generate_changes("rooms", 100, fields);
        group.throughput(Throughput::Elements(batch.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(fields), &batch, |b, batch| {
            b.iter(|| {
                for raw in batch {
                    black_box(normalize("rooms", raw).unwrap());
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_single, bench_document_width);
criterion_main!(benches);
