//! Recurring tasks owned by the worker itself.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tracing::info;

use herald_infra::jobs::{Cadence, InMemoryJobRunLog, RecurringTask, RunReport};

pub const PRUNE_RUNS_JOB: &str = "runs:prune";

/// Local hour at which run history is pruned.
pub const PRUNE_HOUR: u32 = 3;

/// Daily trim of the in-process run history.
#[derive(Debug)]
pub struct PruneRunsTask {
    log: Arc<InMemoryJobRunLog>,
    retention: Duration,
}

impl PruneRunsTask {
    pub fn new(log: Arc<InMemoryJobRunLog>, retention: Duration) -> Self {
        Self { log, retention }
    }
}

#[async_trait]
impl RecurringTask for PruneRunsTask {
    fn name(&self) -> &str {
        PRUNE_RUNS_JOB
    }

    fn cadence(&self) -> Cadence {
        Cadence::Daily { hour: PRUNE_HOUR }
    }

    async fn run(&self) -> anyhow::Result<RunReport> {
        let removed = self.log.prune_older_than(Utc::now() - self.retention);
        if removed > 0 {
            info!(removed, "pruned job run history");
        }

        let report = if removed > 0 { RunReport::active() } else { RunReport::idle() };
        Ok(report.with_meta(serde_json::json!({ "removed": removed })))
    }
}
