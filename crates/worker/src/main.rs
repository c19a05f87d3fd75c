use std::sync::Arc;

use anyhow::Context;
use chrono::Duration;

use herald_infra::jobs::{InMemoryJobRunLog, JobModule, JobsBootstrap, RecurringModule};
use herald_infra::JobsConfig;
use herald_worker::app::{build_app, WorkerState};
use herald_worker::tasks::PruneRunsTask;
use herald_worker::DEFAULT_HEALTH_ADDR;

/// Run history older than this is pruned daily.
const RUN_RETENTION_DAYS: i64 = 7;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    herald_observability::init();

    let config = JobsConfig::from_env();
    let enabled = config.enabled;

    let run_log = Arc::new(InMemoryJobRunLog::new());
    let modules: Vec<Arc<dyn JobModule>> = vec![Arc::new(RecurringModule::new(PruneRunsTask::new(
        run_log.clone(),
        Duration::days(RUN_RETENTION_DAYS),
    )))];

    let jobs = JobsBootstrap::new(config)
        .with_run_log(run_log)
        .run(&modules)
        .await;

    let addr = std::env::var("HEALTH_ADDR").unwrap_or_else(|_| DEFAULT_HEALTH_ADDR.to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    let app = build_app(WorkerState {
        enabled,
        jobs: jobs.clone(),
    });
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("status server failed")?;

    jobs.shutdown().await;
    tracing::info!("worker stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
