use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;

use convoy_infra::client::BatchClient;
use convoy_infra::config::{ConfigError, CoordinatorConfig, WorkerConfig};
use convoy_infra::dispatcher::{CallbackRegistry, LogCallback};
use convoy_infra::jobs::JobExecutor;
use convoy_infra::store::PostgresBatchStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    convoy_observability::init();

    let coordinator = CoordinatorConfig::from_env().context("loading coordinator config")?;
    let worker = WorkerConfig::from_env().context("loading worker config")?;
    let database_url =
        std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

    let pool = PgPool::connect(&database_url)
        .await
        .context("connecting to Postgres")?;
    let store = PostgresBatchStore::connect(pool, coordinator.lock_timeout)
        .await
        .context("inspecting batch schema")?;

    let mut registry = CallbackRegistry::new();
    registry.register(LogCallback::NAME, LogCallback);

    tracing::info!(
        worker = %worker.name,
        lock_mode = %coordinator.lock_mode,
        concurrency = worker.concurrency,
        queues = ?worker.queues,
        "starting worker"
    );

    let client = Arc::new(BatchClient::new(Arc::new(store), registry, coordinator));
    let handle = JobExecutor::new(client).spawn(worker);

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!(stats = ?handle.stats(), "shutting down");
    handle.shutdown().await;

    Ok(())
}
