//! Jobs bootstrap: pick a backend from configuration, wire the heartbeat,
//! start the queue, and let each module register.
//!
//! Bootstrap never fails the process. Anything that goes wrong is logged and
//! leaves the returned [`JobsContext`] without a queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use super::broker::BrokerConnector;
use super::durable::DurableJobQueue;
use super::heartbeat::{register_heartbeat, seed_heartbeat, HeartbeatMonitor, HeartbeatPayload};
use super::memory::MemoryJobQueue;
use super::postgres::PgBrokerConnector;
use super::queue::{BackendKind, JobQueue, QueueError};
use super::runs::{InMemoryJobRunLog, JobRunRecorder};
use crate::config::JobsConfig;

/// Storage provider the durable backend runs on.
pub const DURABLE_PROVIDER: &str = "postgres";

/// A self-contained group of jobs that registers its handlers and seeds its
/// first occurrences.
#[async_trait]
pub trait JobModule: Send + Sync {
    fn name(&self) -> &str;

    async fn register(&self, ctx: &JobsContext) -> Result<(), QueueError>;
}

/// Everything a job module or status endpoint needs from the jobs subsystem.
#[derive(Clone)]
pub struct JobsContext {
    queue: Option<Arc<dyn JobQueue>>,
    pub heartbeat: Arc<HeartbeatMonitor>,
    pub runs: Arc<dyn JobRunRecorder>,
    pub started_at: DateTime<Utc>,
    heartbeat_seconds: u64,
    delivery_slack: Duration,
}

impl JobsContext {
    pub fn new(
        queue: Option<Arc<dyn JobQueue>>,
        heartbeat: Arc<HeartbeatMonitor>,
        runs: Arc<dyn JobRunRecorder>,
        heartbeat_seconds: u64,
    ) -> Self {
        Self {
            queue,
            heartbeat,
            runs,
            started_at: Utc::now(),
            heartbeat_seconds,
            delivery_slack: Duration::ZERO,
        }
    }

    /// Extra delivery latency tolerated before the heartbeat counts as stale.
    pub fn with_delivery_slack(mut self, slack: Duration) -> Self {
        self.delivery_slack = slack;
        self
    }

    /// The running queue, or `None` when jobs are disabled or unavailable.
    pub fn queue(&self) -> Option<&Arc<dyn JobQueue>> {
        self.queue.as_ref()
    }

    pub fn require_queue(&self) -> Result<Arc<dyn JobQueue>, QueueError> {
        self.queue.clone().ok_or(QueueError::NotStarted)
    }

    pub fn backend(&self) -> Option<BackendKind> {
        self.queue.as_ref().map(|q| q.backend())
    }

    pub fn heartbeat_seconds(&self) -> u64 {
        self.heartbeat_seconds
    }

    pub fn delivery_slack(&self) -> Duration {
        self.delivery_slack
    }

    pub fn is_heartbeat_stale(&self, now: DateTime<Utc>) -> bool {
        self.heartbeat.is_stale(now, self.heartbeat_seconds, self.delivery_slack)
    }

    fn without_queue(mut self) -> Self {
        self.queue = None;
        self
    }

    /// Stop the queue, if any. Running handlers finish on their own.
    pub async fn shutdown(&self) {
        if let Some(queue) = &self.queue {
            match queue.stop().await {
                Ok(()) => info!(backend = %queue.backend(), "job queue stopped"),
                Err(err) => warn!(error = %err, "job queue did not stop cleanly"),
            }
        }
    }
}

impl core::fmt::Debug for JobsContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobsContext")
            .field("backend", &self.backend())
            .field("started_at", &self.started_at)
            .field("heartbeat_seconds", &self.heartbeat_seconds)
            .field("delivery_slack", &self.delivery_slack)
            .finish_non_exhaustive()
    }
}

/// Outcome of backend selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendSelection {
    Disabled,
    Memory,
    Durable { database_url: String },
    /// Durable backend requested but not usable; jobs stay off.
    Skipped(String),
}

/// Pure backend selection from configuration.
pub fn select_backend(config: &JobsConfig) -> BackendSelection {
    if !config.enabled {
        return BackendSelection::Disabled;
    }
    if config.wants_memory() {
        return BackendSelection::Memory;
    }
    if config.db_provider.as_deref() != Some(DURABLE_PROVIDER) {
        return BackendSelection::Skipped(format!(
            "durable jobs need DB_PROVIDER={DURABLE_PROVIDER}, got {}",
            config.db_provider.as_deref().unwrap_or("<unset>")
        ));
    }
    match &config.database_url {
        Some(url) => BackendSelection::Durable {
            database_url: url.clone(),
        },
        None => BackendSelection::Skipped("durable jobs need DATABASE_URL".to_string()),
    }
}

/// Builds the [`JobsContext`] for one process.
pub struct JobsBootstrap {
    config: JobsConfig,
    connector: Option<Arc<dyn BrokerConnector>>,
    runs: Arc<dyn JobRunRecorder>,
    heartbeat: Arc<HeartbeatMonitor>,
}

impl JobsBootstrap {
    pub fn new(config: JobsConfig) -> Self {
        Self {
            config,
            connector: None,
            runs: Arc::new(InMemoryJobRunLog::new()),
            heartbeat: Arc::new(HeartbeatMonitor::default()),
        }
    }

    /// Use `connector` for the durable backend instead of a Postgres pool.
    pub fn with_connector(mut self, connector: Arc<dyn BrokerConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_run_log(mut self, runs: Arc<dyn JobRunRecorder>) -> Self {
        self.runs = runs;
        self
    }

    fn build_queue(&self, selection: &BackendSelection) -> Option<Arc<dyn JobQueue>> {
        match selection {
            BackendSelection::Disabled => {
                info!("background jobs disabled");
                None
            }
            BackendSelection::Skipped(reason) => {
                warn!(reason = %reason, "background jobs unavailable");
                None
            }
            BackendSelection::Memory => Some(Arc::new(MemoryJobQueue::new())),
            BackendSelection::Durable { database_url } => {
                let connector: Arc<dyn BrokerConnector> = match &self.connector {
                    Some(connector) => Arc::clone(connector),
                    None => Arc::new(PgBrokerConnector::new(database_url.clone(), self.config.broker.clone())),
                };
                Some(Arc::new(DurableJobQueue::new(connector)))
            }
        }
    }

    /// Heartbeat, start, seed. Modules register only after this succeeds.
    async fn bring_up(&self, ctx: &JobsContext, queue: &Arc<dyn JobQueue>) -> Result<(), QueueError> {
        register_heartbeat(
            queue,
            Arc::clone(&self.heartbeat),
            Arc::clone(&self.runs),
            self.config.heartbeat_seconds,
        )
        .await?;
        queue.start().await?;
        seed_heartbeat(
            queue.as_ref(),
            &HeartbeatPayload::new(ctx.started_at, queue.backend().as_str()),
        )
        .await?;
        Ok(())
    }

    /// Select, start, and populate the jobs subsystem.
    pub async fn run(self, modules: &[Arc<dyn JobModule>]) -> JobsContext {
        let selection = select_backend(&self.config);
        let queue = self.build_queue(&selection);
        let ctx = JobsContext::new(
            queue.clone(),
            Arc::clone(&self.heartbeat),
            Arc::clone(&self.runs),
            self.config.heartbeat_seconds,
        );
        // Durable deliveries wait up to one poll before a handler sees them.
        let ctx = match &selection {
            BackendSelection::Durable { .. } => ctx.with_delivery_slack(self.config.broker.poll_interval),
            _ => ctx,
        };

        let Some(queue) = queue else {
            return ctx;
        };

        if let Err(err) = self.bring_up(&ctx, &queue).await {
            error!(backend = %queue.backend(), error = %err, "failed to start job queue; jobs unavailable");
            // Release whatever start() managed to open.
            if let Err(stop_err) = queue.stop().await {
                warn!(error = %stop_err, "failed to stop job queue after startup error");
            }
            return ctx.without_queue();
        }

        for module in modules {
            match module.register(&ctx).await {
                Ok(()) => info!(module = module.name(), "job module registered"),
                Err(err) => error!(module = module.name(), error = %err, "job module failed to register"),
            }
        }

        info!(backend = %queue.backend(), modules = modules.len(), "background jobs running");
        ctx
    }
}
