use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};

use catalogops_core::{EntityId, FamilyId, JobId, WorkerId};
use catalogops_infra::apply::{
    ApplyEngine, ApplyMode, ChangePlan, IdempotencyKey, InMemoryJournal, RuleValidator,
};
use catalogops_infra::catalog::{CatalogEntity, InMemoryCatalogStore};
use catalogops_infra::jobs::{
    AuditPayload, InMemoryJobQueue, JobPayload, JobQueue, JobType, NewJob, QueueConfig,
    RetryPolicy, RunReport,
};
use catalogops_infra::locks::{InMemoryLockManager, LockGuard, LockManager};

fn queue() -> InMemoryJobQueue {
    InMemoryJobQueue::new(QueueConfig {
        lease_ttl: Duration::from_secs(60),
        retry: RetryPolicy::immediate(3),
    })
}

fn audit_job(family: &str) -> NewJob {
    let payload = JobPayload::Audit(AuditPayload {
        family_id: FamilyId::from(family),
        required_fields: vec!["color".to_string()],
    });
    NewJob::new(JobType::Audit, payload.to_value())
}

fn attrs(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn bench_job_lifecycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("job_lifecycle");
    group.throughput(Throughput::Elements(1));

    // enqueue → claim → running → succeeded on an empty queue
    group.bench_function("enqueue_claim_complete", |b| {
        let queue = queue();
        let worker = WorkerId::from("bench");
        b.iter(|| {
            let job_id = queue.enqueue(black_box(audit_job("sofas"))).unwrap();
            queue.claim(&worker).unwrap().unwrap();
            queue.mark_running(job_id, &worker).unwrap();
            queue.complete(job_id, &worker, RunReport::default()).unwrap();
        });
    });

    group.finish();
}

fn bench_claim_with_backlog(c: &mut Criterion) {
    let mut group = c.benchmark_group("claim_with_backlog");

    for backlog in [10usize, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("claim_complete", backlog), backlog, |b, &size| {
            let queue = queue();
            let worker = WorkerId::from("bench");
            for i in 0..size {
                queue
                    .enqueue(audit_job("sofas").with_priority((i % 5) as i32))
                    .unwrap();
            }

            // Keep the backlog steady: every completed job is replaced.
            b.iter(|| {
                let job = queue.claim(&worker).unwrap().unwrap();
                queue.mark_running(job.id, &worker).unwrap();
                queue.complete(job.id, &worker, RunReport::default()).unwrap();
                queue.enqueue(audit_job("sofas")).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_locks(c: &mut Criterion) {
    let mut group = c.benchmark_group("resource_locks");

    group.bench_function("acquire_release_single", |b| {
        let locks = InMemoryLockManager::new();
        b.iter(|| {
            locks
                .acquire(black_box("family:sofas"), "job", Duration::from_secs(60))
                .unwrap();
            locks.release("family:sofas", "job").unwrap();
        });
    });

    for width in [2usize, 8, 32].iter() {
        group.throughput(Throughput::Elements(*width as u64));
        group.bench_with_input(BenchmarkId::new("guard_acquire_all", width), width, |b, &n| {
            let locks: Arc<dyn LockManager> = Arc::new(InMemoryLockManager::new());
            let keys: Vec<String> = (0..n).rev().map(|i| format!("family:f{i:03}")).collect();
            b.iter(|| {
                let guard =
                    LockGuard::acquire_all(locks.clone(), &keys, "job", Duration::from_secs(60))
                        .unwrap();
                guard.release().unwrap();
            });
        });
    }

    group.finish();
}

fn bench_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply_engine");

    for width in [1usize, 10, 100].iter() {
        group.throughput(Throughput::Elements(*width as u64));
        group.bench_with_input(BenchmarkId::new("apply_fresh_plan", width), width, |b, &n| {
            let catalog = Arc::new(InMemoryCatalogStore::new());
            let engine = ApplyEngine::new(
                Arc::new(InMemoryJournal::new()),
                catalog,
                Arc::new(RuleValidator::new()),
            );
            let entities: Vec<CatalogEntity> = (0..n)
                .map(|i| {
                    CatalogEntity::new(
                        EntityId::from(format!("e{i}").as_str()),
                        FamilyId::from("sofas"),
                        attrs(json!({"color": "red", "rank": i})),
                    )
                })
                .collect();

            // A new job id per iteration so every plan claims a fresh key.
            b.iter(|| {
                let plan = entities.iter().fold(
                    ChangePlan::new(JobId::new(), "add_entity"),
                    |plan, entity| plan.with_change(entity.id.clone(), None, Some(entity.clone())),
                );
                black_box(engine.apply(&plan, ApplyMode::Apply).unwrap());
            });
        });
    }

    group.bench_function("replay_already_applied", |b| {
        let engine = ApplyEngine::new(
            Arc::new(InMemoryJournal::new()),
            Arc::new(InMemoryCatalogStore::new()),
            Arc::new(RuleValidator::new()),
        );
        let entity = CatalogEntity::new(
            EntityId::from("e1"),
            FamilyId::from("sofas"),
            attrs(json!({"color": "red"})),
        );
        let plan = ChangePlan::new(JobId::new(), "add_entity").with_change(
            entity.id.clone(),
            None,
            Some(entity),
        );
        engine.apply(&plan, ApplyMode::Apply).unwrap();

        b.iter(|| black_box(engine.apply(&plan, ApplyMode::Apply).unwrap()));
    });

    group.finish();
}

fn bench_idempotency_key(c: &mut Criterion) {
    let mut group = c.benchmark_group("idempotency_key");

    for width in [1usize, 100].iter() {
        group.throughput(Throughput::Elements(*width as u64));
        group.bench_with_input(BenchmarkId::new("derive", width), width, |b, &n| {
            let job_id = JobId::new();
            let targets: Vec<EntityId> =
                (0..n).map(|i| EntityId::from(format!("e{i}").as_str())).collect();
            b.iter(|| black_box(IdempotencyKey::derive(job_id, "merge", &targets)));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_job_lifecycle,
    bench_claim_with_backlog,
    bench_locks,
    bench_apply,
    bench_idempotency_key
);
criterion_main!(benches);
