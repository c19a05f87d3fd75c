//! Job run records for status reporting.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::sync::PoisonError;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of one handler execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl JobRun {
    pub fn succeeded(started_at: DateTime<Utc>, meta: Option<Value>) -> Self {
        Self {
            started_at,
            finished_at: Utc::now(),
            ok: true,
            error: None,
            meta,
        }
    }

    pub fn failed(started_at: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            started_at,
            finished_at: Utc::now(),
            ok: false,
            error: Some(error.into()),
            meta: None,
        }
    }
}

/// Sink for completed runs.
pub trait JobRunRecorder: Send + Sync {
    fn record(&self, name: &str, run: JobRun);

    /// Most recent run per job name.
    fn latest(&self) -> HashMap<String, JobRun>;
}

pub const DEFAULT_HISTORY: usize = 50;

/// Bounded in-process run history, newest last.
#[derive(Debug)]
pub struct InMemoryJobRunLog {
    capacity: usize,
    runs: RwLock<HashMap<String, VecDeque<JobRun>>>,
}

impl Default for InMemoryJobRunLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_HISTORY)
    }
}

impl InMemoryJobRunLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `capacity` runs per job name (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            runs: RwLock::new(HashMap::new()),
        }
    }

    /// Runs of `name`, oldest first.
    pub fn history(&self, name: &str) -> Vec<JobRun> {
        self.runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|runs| runs.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop runs that finished before `cutoff`; returns how many were removed.
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;
        for history in runs.values_mut() {
            let before = history.len();
            history.retain(|run| run.finished_at >= cutoff);
            removed += before - history.len();
        }
        runs.retain(|_, history| !history.is_empty());
        removed
    }
}

impl JobRunRecorder for InMemoryJobRunLog {
    fn record(&self, name: &str, run: JobRun) {
        let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
        let history = runs.entry(name.to_string()).or_default();
        if history.len() == self.capacity {
            history.pop_front();
        }
        history.push_back(run);
    }

    fn latest(&self) -> HashMap<String, JobRun> {
        self.runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(|(name, history)| history.back().map(|run| (name.clone(), run.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn run_at(finished_at: DateTime<Utc>, ok: bool) -> JobRun {
        JobRun {
            started_at: finished_at - Duration::seconds(1),
            finished_at,
            ok,
            error: (!ok).then(|| "boom".to_string()),
            meta: None,
        }
    }

    #[test]
    fn latest_is_the_last_recorded_run_per_name() {
        let log = InMemoryJobRunLog::new();
        let now = Utc::now();
        log.record("heartbeat", run_at(now - Duration::minutes(1), true));
        log.record("heartbeat", run_at(now, false));
        log.record("twitch:poll", run_at(now, true));

        let latest = log.latest();
        assert_eq!(latest.len(), 2);
        assert!(!latest["heartbeat"].ok);
        assert!(latest["twitch:poll"].ok);
    }

    #[test]
    fn history_is_bounded() {
        let log = InMemoryJobRunLog::with_capacity(3);
        let now = Utc::now();
        for i in 0..5 {
            log.record("heartbeat", run_at(now + Duration::seconds(i), true));
        }

        let history = log.history("heartbeat");
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].finished_at, now + Duration::seconds(2));
        assert!(log.history("unknown").is_empty());
    }

    #[test]
    fn prune_drops_old_runs_and_empty_names() {
        let log = InMemoryJobRunLog::new();
        let now = Utc::now();
        log.record("birthdays:run", run_at(now - Duration::days(10), true));
        log.record("heartbeat", run_at(now - Duration::days(10), true));
        log.record("heartbeat", run_at(now, true));

        assert_eq!(log.prune_older_than(now - Duration::days(7)), 2);
        assert!(log.history("birthdays:run").is_empty());
        assert_eq!(log.history("heartbeat").len(), 1);
        assert_eq!(log.latest().len(), 1);
    }

    #[test]
    fn constructors_set_outcome() {
        let started = Utc::now();
        let ok = JobRun::succeeded(started, Some(serde_json::json!({"sent": 2})));
        assert!(ok.ok && ok.error.is_none() && ok.finished_at >= started);

        let failed = JobRun::failed(started, "timeout");
        assert!(!failed.ok);
        assert_eq!(failed.error.as_deref(), Some("timeout"));

        let json = serde_json::to_value(&failed).unwrap();
        assert!(json.get("meta").is_none());
    }
}
