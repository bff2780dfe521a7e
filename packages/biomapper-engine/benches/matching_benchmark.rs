//! Benchmark for the join primitives and checkpoint encoding
//!
//! Measures:
//! - Hash vs merge vs partitioned join over identifier datasets
//! - Composite identifier resolution
//! - Checkpoint write + decode of a populated context

use std::sync::Arc;

use biomapper_engine::matching::{build_index, hash_partitioned_join, match_with_index, merge_join};
use biomapper_engine::{CheckpointStore, CompositeKeyResolver, ExecutionContext, Record};
use biomapper_storage::{CheckpointKind, InMemoryJobStore};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use uuid::Uuid;

/// `n` accession-like identifiers; `overlap` of 100 share a key with the other side
fn generate_ids(n: usize, offset: usize, overlap: usize) -> Vec<String> {
    (0..n)
        .map(|i| {
            if i % 100 < overlap {
                format!("P{:06}", i)
            } else {
                format!("P{:06}", i + offset)
            }
        })
        .collect()
}

fn key(id: &String) -> Option<String> {
    Some(id.clone())
}

/// Benchmark the three join strategies on the same inputs
fn bench_joins(c: &mut Criterion) {
    let mut group = c.benchmark_group("join");

    for size in [1_000usize, 10_000, 100_000].iter() {
        let source = generate_ids(*size, 1_000_000, 30);
        let target = generate_ids(*size, 2_000_000, 30);

        group.bench_with_input(BenchmarkId::new("hash", size), size, |b, _| {
            b.iter(|| {
                let index = build_index(&target, key);
                black_box(match_with_index(&source, &index, key).len())
            });
        });
        group.bench_with_input(BenchmarkId::new("merge", size), size, |b, _| {
            b.iter(|| black_box(merge_join(&source, &target, key, key).len()));
        });
        group.bench_with_input(BenchmarkId::new("partitioned", size), size, |b, _| {
            b.iter(|| {
                black_box(hash_partitioned_join(&source, &target, key, key, num_cpus::get()).len())
            });
        });
    }

    group.finish();
}

/// Benchmark composite identifier resolution
fn bench_composite(c: &mut Criterion) {
    let mut group = c.benchmark_group("composite");
    let resolver = CompositeKeyResolver::new("_");

    for size in [1_000usize, 10_000].iter() {
        let sources: Vec<String> = (0..*size)
            .map(|i| {
                if i % 4 == 0 {
                    format!("Q{}_Q{}", i, i + 1)
                } else {
                    format!("Q{}", i)
                }
            })
            .collect();
        let targets: Vec<String> = (0..*size).map(|i| format!("Q{}", i)).collect();

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| black_box(resolver.resolve(&sources, &targets).matches.len()));
        });
    }

    group.finish();
}

/// Benchmark checkpoint write + verified decode
fn bench_checkpoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("checkpoint");
    let rt = tokio::runtime::Runtime::new().expect("runtime");

    for rows in [1_000usize, 50_000].iter() {
        let mut context = ExecutionContext::new();
        let dataset: Vec<Record> = generate_ids(*rows, 0, 100)
            .into_iter()
            .map(|id| {
                let mut row = Record::new();
                row.insert("id".into(), json!(id));
                row.insert("confidence".into(), json!(0.95));
                row
            })
            .collect();
        context.insert_dataset("proteins", dataset);
        context.set_statistic("proteins_rows", json!(rows));

        group.bench_with_input(BenchmarkId::from_parameter(rows), rows, |b, _| {
            let store = CheckpointStore::new(Arc::new(InMemoryJobStore::new()));
            let job_id = Uuid::new_v4();
            b.iter(|| {
                rt.block_on(async {
                    let id = store
                        .create(job_id, 0, "load", &context, CheckpointKind::Automatic)
                        .await
                        .expect("checkpoint write failed");
                    let (restored, _) = store.restore(id).await.expect("restore failed");
                    black_box(restored);
                });
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_joins, bench_composite, bench_checkpoint);
criterion_main!(benches);
