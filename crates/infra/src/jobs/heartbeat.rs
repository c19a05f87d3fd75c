//! Liveness heartbeat: a job that proves the queue delivers.
//!
//! The handler records a snapshot and reschedules itself at the next minute
//! boundary, so a stale snapshot means deliveries stopped.

use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Local, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use herald_core::schedule::compute_next_minute_boundary_delay_seconds;
use herald_core::SlotKey;

use super::queue::{handler, Job, JobQueue, JobQueueExt, QueueError, ScheduleOptions};
use super::recurring::{instant_after, schedule_singleton};
use super::runs::{JobRun, JobRunRecorder};

pub const HEARTBEAT_JOB: &str = "heartbeat";

/// Missed cadences tolerated before the heartbeat counts as stale.
pub const STALE_AFTER_CADENCES: u64 = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub started_at: Option<String>,
    pub backend: Option<String>,
}

impl HeartbeatPayload {
    pub fn new(started_at: DateTime<Utc>, backend: impl Into<String>) -> Self {
        Self {
            started_at: Some(started_at.to_rfc3339()),
            backend: Some(backend.into()),
        }
    }

    fn from_job_data(data: &Value) -> Self {
        if data.is_null() {
            return Self::default();
        }
        serde_json::from_value(data.clone()).unwrap_or_else(|err| {
            warn!(error = %err, "malformed heartbeat payload");
            Self::default()
        })
    }
}

/// Last heartbeat seen by this process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatSnapshot {
    pub started_at: Option<String>,
    pub backend: Option<String>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct HeartbeatMonitor {
    last: RwLock<Option<HeartbeatSnapshot>>,
}

impl HeartbeatMonitor {
    pub fn record(&self, payload: HeartbeatPayload, received_at: DateTime<Utc>) {
        *self.last.write().unwrap_or_else(PoisonError::into_inner) = Some(HeartbeatSnapshot {
            started_at: payload.started_at,
            backend: payload.backend,
            received_at,
        });
    }

    pub fn snapshot(&self) -> Option<HeartbeatSnapshot> {
        self.last.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// True when no heartbeat arrived within [`STALE_AFTER_CADENCES`] beat
    /// intervals plus `slack`.
    ///
    /// `slack` covers delivery latency, e.g. the durable broker's poll interval.
    pub fn is_stale(&self, now: DateTime<Utc>, cadence_seconds: u64, slack: Duration) -> bool {
        let Some(snapshot) = self.snapshot() else {
            return true;
        };
        let window = max_beat_interval_seconds(cadence_seconds).saturating_mul(STALE_AFTER_CADENCES);
        let window = TimeDelta::try_seconds(i64::try_from(window).unwrap_or(i64::MAX)).unwrap_or(TimeDelta::MAX);
        let slack = TimeDelta::from_std(slack).unwrap_or(TimeDelta::MAX);
        now - snapshot.received_at > window.checked_add(&slack).unwrap_or(TimeDelta::MAX)
    }
}

/// Longest gap between two healthy beats.
///
/// The next beat lands on a minute boundary at least `cadence_seconds` away,
/// so a cadence under a minute still waits up to a full minute.
pub fn max_beat_interval_seconds(cadence_seconds: u64) -> u64 {
    cadence_seconds.max(60)
}

/// Register the `heartbeat` handler.
///
/// Each delivery updates `monitor`, records a run, and reschedules the next
/// heartbeat at a minute boundary at least `cadence_seconds` away.
pub async fn register_heartbeat(
    queue: &Arc<dyn JobQueue>,
    monitor: Arc<HeartbeatMonitor>,
    runs: Arc<dyn JobRunRecorder>,
    cadence_seconds: u64,
) -> Result<(), QueueError> {
    let weak_queue: Weak<dyn JobQueue> = Arc::downgrade(queue);

    queue
        .on(
            HEARTBEAT_JOB,
            handler(move |mut job: Job| {
                let (monitor, runs, weak_queue) = (Arc::clone(&monitor), Arc::clone(&runs), weak_queue.clone());
                async move {
                    let received_at = Utc::now();
                    let payload = HeartbeatPayload::from_job_data(&job.data);
                    monitor.record(payload.clone(), received_at);
                    runs.record(
                        HEARTBEAT_JOB,
                        JobRun::succeeded(received_at, Some(serde_json::json!({ "backend": payload.backend }))),
                    );

                    if let Some(queue) = weak_queue.upgrade() {
                        let now = Local::now();
                        let delay = compute_next_minute_boundary_delay_seconds(&now, cadence_seconds);
                        let key = SlotKey::minute(HEARTBEAT_JOB, &instant_after(&now, delay));
                        let data = serde_json::to_value(&payload).unwrap_or(Value::Null);

                        match schedule_singleton(queue.as_ref(), HEARTBEAT_JOB, data, delay, &key).await {
                            Ok(id) => debug!(job_id = %id, key = %key, delay_secs = delay, "next heartbeat scheduled"),
                            Err(err) => warn!(key = %key, error = %err, "failed to schedule next heartbeat"),
                        }
                    }

                    job.done();
                }
            }),
        )
        .await
}

/// Enqueue an immediate heartbeat.
pub async fn seed_heartbeat(queue: &dyn JobQueue, payload: &HeartbeatPayload) -> Result<String, QueueError> {
    queue.schedule_typed(HEARTBEAT_JOB, payload, ScheduleOptions::default()).await
}
