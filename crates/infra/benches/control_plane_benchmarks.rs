use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chrono::Utc;
use jobctl_core::{
    ExecutionMode, JobContext, JobId, JobRecord, JobStatus, LaunchConfig,
};
use jobctl_infra::engine::{BudgetUsage, EngineError, EngineSnapshot, ExecutionEngine};
use jobctl_infra::registry::UnitWork;
use jobctl_infra::store::{modify, InMemoryJobStore, JobStore};
use jobctl_infra::{ControlConfig, ControlPlane, TracingNotifier};
use std::sync::Arc;

/// Engine that reports every job as running at half progress, so a tick
/// exercises the polling path without any state changes.
struct SteadyEngine;

impl ExecutionEngine for SteadyEngine {
    fn name(&self) -> &str {
        "steady"
    }

    fn launch(
        &self,
        _work: UnitWork,
        _mode: ExecutionMode,
        _config: &LaunchConfig,
        _context: JobContext,
    ) -> Result<JobId, EngineError> {
        Err(EngineError::Rejected("benchmark engine does not launch".to_string()))
    }

    fn cancel(&self, _job_id: JobId) -> bool {
        false
    }

    fn status(&self, job_id: JobId) -> Option<EngineSnapshot> {
        let mut snap = EngineSnapshot::new(job_id, JobContext::new(), Utc::now());
        snap.status = JobStatus::Running;
        snap.items_total = Some(1000);
        snap.items_processed = 500;
        Some(snap)
    }

    fn release(&self, _job_id: JobId) {}

    fn usage(&self) -> BudgetUsage {
        BudgetUsage {
            in_use: 0,
            ceiling: 0,
        }
    }
}

fn queued(name: &str) -> JobRecord {
    JobRecord::queued(
        JobId::new(),
        name,
        ExecutionMode::Chunked,
        LaunchConfig::chunked(200),
        Utc::now(),
    )
}

fn bench_reserve_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("guarded_launch");
    group.throughput(Throughput::Elements(1));

    group.bench_function("reserve_and_commit", |b| {
        let store = InMemoryJobStore::new();
        let mut n: u64 = 0;
        b.iter(|| {
            n += 1;
            let name = format!("job-{n}");
            let reservation = store.reserve(&name, None, Utc::now()).unwrap();
            black_box(store.commit(&reservation, queued(&name)).unwrap());
        });
    });

    group.bench_function("denied_duplicate", |b| {
        let store = InMemoryJobStore::new();
        let reservation = store.reserve("nightly-sync", None, Utc::now()).unwrap();
        store.commit(&reservation, queued("nightly-sync")).unwrap();
        b.iter(|| {
            black_box(store.reserve(black_box("nightly-sync"), None, Utc::now()).is_err());
        });
    });

    group.finish();
}

fn bench_progress_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("progress_update");
    group.throughput(Throughput::Elements(1));

    group.bench_function("modify_versioned", |b| {
        let store = InMemoryJobStore::new();
        let mut record = queued("nightly-sync");
        record.items_total = Some(u64::MAX);
        let record = store.insert(record).unwrap();
        let mut processed = 0u64;
        b.iter(|| {
            processed += 1;
            modify(&store, record.id, |r| {
                Ok(r.record_progress(None, black_box(processed), 0)?)
            })
            .unwrap();
        });
    });

    group.finish();
}

fn bench_reconcile_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconcile_tick");

    for active in [10usize, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*active as u64));
        group.bench_with_input(BenchmarkId::new("steady_active_jobs", active), active, |b, &size| {
            let store = InMemoryJobStore::arc();
            let plane = ControlPlane::new(
                ControlConfig::default(),
                store.clone(),
                Arc::new(SteadyEngine),
                Arc::new(TracingNotifier),
            );
            for i in 0..size {
                let mut record = queued(&format!("job-{i}"));
                record.advance_to(JobStatus::Running, Utc::now(), None).unwrap();
                record.record_progress(Some(1000), 500, 0).unwrap();
                store.insert(record).unwrap();
            }

            b.iter(|| {
                let report = plane.tick(Utc::now()).unwrap();
                black_box(report);
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_reserve_commit,
    bench_progress_update,
    bench_reconcile_tick
);
criterion_main!(benches);
