//! Benchmarks for reconciling a job log against the in-memory backend.
//!
//! Measures status-only reconciliation of 500 records at several
//! concurrency levels.

#![allow(missing_docs)]

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::path::PathBuf;
use tokio::runtime::Runtime;
use windtunnel::*;
use windtunnel_testkit::{InMemoryBackend, TaskScript};

const RECORDS: usize = 500;

fn create_runtime() -> Runtime {
    Runtime::new().expect("Failed to create tokio runtime")
}

/// Submit `RECORDS` tasks and finish a third of them each way.
fn populate(rt: &Runtime) -> (InMemoryBackend, Vec<JobLogRecord>) {
    let backend = InMemoryBackend::new().with_script(TaskScript::Stall);
    let pipeline = CommandPipeline::steady_state();
    let records = rt.block_on(async {
        let mut records = Vec::with_capacity(RECORDS);
        for i in 0..RECORDS {
            let case_root = PathBuf::from(format!("/cases/bench-{i}"));
            let handle = submit(backend.shared(), &case_root, &pipeline, None)
                .await
                .expect("submit should succeed");
            match i % 3 {
                0 => backend.finish(handle.id(), true),
                1 => backend.finish(handle.id(), false),
                _ => {}
            }
            records.push(JobLogRecord::new(handle.id().clone(), case_root));
        }
        records
    });
    (backend, records)
}

fn bench_reconcile(c: &mut Criterion) {
    let rt = create_runtime();
    let (backend, records) = populate(&rt);

    let mut group = c.benchmark_group("reconcile");
    group.throughput(Throughput::Elements(RECORDS as u64));
    for concurrency in [1usize, 8, 32] {
        let options = ReconcileOptions::default()
            .with_download(false)
            .with_concurrency(concurrency);
        let reconciler = Reconciler::new(backend.shared(), options);
        group.bench_with_input(
            BenchmarkId::new("status_only", concurrency),
            &records,
            |b, records| {
                b.to_async(&rt).iter(|| async {
                    let report = reconciler.reconcile(records).await;
                    assert_eq!(report.total(), RECORDS);
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_reconcile);
criterion_main!(benches);
