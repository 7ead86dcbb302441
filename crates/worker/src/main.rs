//! Catalog job orchestration worker.
//!
//! Runs `CATALOGOPS_WORKERS` executor threads and one watchdog against either
//! in-memory stores (local runs) or Postgres (`USE_PERSISTENT_STORES=true`).
//! Stops on Ctrl-C after every in-flight job has finished.

use std::sync::Arc;

use anyhow::Context;

use catalogops_core::WorkerId;
use catalogops_infra::apply::{
    ApplyEngine, InMemoryJournal, JournalStore, PostgresJournal, RuleValidator,
};
use catalogops_infra::catalog::{CatalogStore, InMemoryCatalogStore, PostgresCatalogStore};
use catalogops_infra::config::OrchestratorConfig;
use catalogops_infra::db::{self, PgBackend};
use catalogops_infra::jobs::{
    DEFAULT_PLAN_CHUNK, HandlerRegistry, InMemoryJobQueue, JobExecutor, JobQueue,
    PostgresJobQueue,
};
use catalogops_infra::locks::{InMemoryLockManager, LockManager, PostgresLockManager};
use catalogops_infra::workers::Watchdog;

struct Stores {
    queue: Arc<dyn JobQueue>,
    locks: Arc<dyn LockManager>,
    journal: Arc<dyn JournalStore>,
    catalog: Arc<dyn CatalogStore>,
}

async fn build_stores(config: &OrchestratorConfig) -> anyhow::Result<Stores> {
    if !config.use_persistent_stores {
        tracing::warn!("USE_PERSISTENT_STORES not set; state lives in memory and dies with the process");
        return Ok(Stores {
            queue: Arc::new(InMemoryJobQueue::new(config.queue_config())),
            locks: Arc::new(InMemoryLockManager::new()),
            journal: Arc::new(InMemoryJournal::new()),
            catalog: Arc::new(InMemoryCatalogStore::new()),
        });
    }

    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")?;
    // One connection per executor thread, plus the watchdog and slack.
    let max_connections = u32::try_from(config.workers).unwrap_or(u32::MAX).saturating_add(2);
    let pool = db::connect(database_url, max_connections)
        .await
        .context("failed to connect to Postgres")?;
    tracing::info!(max_connections, "connected to Postgres");

    let backend = PgBackend::new(pool);
    Ok(Stores {
        queue: Arc::new(PostgresJobQueue::new(backend.clone(), config.queue_config())),
        locks: Arc::new(PostgresLockManager::new(backend.clone())),
        journal: Arc::new(PostgresJournal::new(backend.clone())),
        catalog: Arc::new(PostgresCatalogStore::new(backend)),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    catalogops_observability::init();

    let config = OrchestratorConfig::from_env().context("invalid configuration")?;
    tracing::info!(
        workers = config.workers,
        apply_enabled = config.apply_enabled,
        persistent = config.use_persistent_stores,
        lease_ttl_secs = config.lease_ttl.as_secs(),
        lock_ttl_secs = config.lock_ttl.as_secs(),
        max_attempts = config.retry.max_attempts,
        max_plan_targets = ?config.max_plan_targets,
        "starting catalog worker"
    );
    if !config.apply_enabled {
        tracing::warn!("CATALOGOPS_APPLY_ENABLED is off; every job runs as a dry run");
    }

    let stores = build_stores(&config).await?;
    let (validator, chunk_size) = match config.max_plan_targets {
        Some(cap) => (
            RuleValidator::new().with_max_targets(cap),
            cap.min(DEFAULT_PLAN_CHUNK),
        ),
        None => (RuleValidator::new(), DEFAULT_PLAN_CHUNK),
    };
    let engine = Arc::new(ApplyEngine::new(
        stores.journal.clone(),
        stores.catalog.clone(),
        Arc::new(validator),
    ));
    let handlers = Arc::new(HandlerRegistry::catalog_with_chunk_size(chunk_size));

    let mut executors = Vec::with_capacity(config.workers);
    for i in 0..config.workers {
        let worker_id = WorkerId::parse(format!("worker-{}-{i}", std::process::id()))?;
        let executor = JobExecutor::new(
            stores.queue.clone(),
            stores.locks.clone(),
            engine.clone(),
            handlers.clone(),
            config.executor_config(),
        );
        executors.push(
            executor
                .spawn(worker_id)
                .context("failed to spawn executor thread")?,
        );
    }

    let watchdog = Watchdog::new(
        stores.queue.clone(),
        stores.locks.clone(),
        stores.journal.clone(),
    )
    .with_idempotency_retention(config.idempotency_retention)
    .spawn(config.watchdog_interval)
    .context("failed to spawn watchdog thread")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested, waiting for in-flight jobs");

    // Joining worker threads blocks; keep it off the async scheduler.
    tokio::task::spawn_blocking(move || {
        for handle in executors {
            let worker = handle.worker_id().clone();
            let stats = handle.stats();
            handle.shutdown();
            tracing::info!(
                worker = %worker,
                processed = stats.jobs_processed,
                succeeded = stats.jobs_succeeded,
                failed = stats.jobs_failed,
                dead_lettered = stats.jobs_dead_lettered,
                abandoned = stats.jobs_abandoned,
                "executor stopped"
            );
        }
        watchdog.shutdown();
    })
    .await
    .context("shutdown task panicked")?;

    tracing::info!("catalog worker stopped");
    Ok(())
}
