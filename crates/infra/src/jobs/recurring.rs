//! Self-rescheduling recurring jobs.
//!
//! A recurring job is one queue name whose handler, after each run, schedules
//! the next run of the same name with an idempotency key naming the target
//! slot. Duplicate reschedules (retries, racing instances) therefore collapse
//! into one pending occurrence.
//!
//! [`RecurringModule`] implements the loop once; domain work plugs in through
//! [`RecurringTask`].

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Local, TimeDelta, TimeZone, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use herald_core::schedule::{
    compute_backoff_with_near_window, compute_exponential_backoff, compute_jittered_interval,
    compute_next_daily_run_delay_seconds, compute_next_minute_boundary_delay_seconds,
};
use herald_core::SlotKey;

use super::bootstrap::{JobModule, JobsContext};
use super::queue::{handler, Job, JobQueue, QueueError, ScheduleOptions};
use super::runs::{JobRun, JobRunRecorder};

/// Schedule `name` after `delay_seconds`, collapsing with any pending
/// occurrence that holds the same slot key.
pub async fn schedule_singleton<Q>(
    queue: &Q,
    name: &str,
    data: Value,
    delay_seconds: u64,
    key: &SlotKey,
) -> Result<String, QueueError>
where
    Q: JobQueue + ?Sized,
{
    let options = ScheduleOptions::default()
        .start_after(delay_seconds)
        .idempotency_key(key.as_str());
    queue.schedule(name, data, options).await
}

/// When a recurring job runs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Cadence {
    /// Once a day at `hour:00` local time.
    Daily { hour: u32 },
    /// At the next wall-clock minute, but no sooner than `min_seconds`.
    MinuteBoundary { min_seconds: u64 },
    /// `base` plus a uniformly random `[0, jitter)` seconds.
    Jittered { base: u64, jitter: u64 },
    /// `base` after an active run, doubling per consecutive idle or failed
    /// run up to `cap`.
    Exponential { base: u64, cap: u64 },
    /// `base` while the job has been idle for at most `base * near_multiplier`
    /// seconds, then growing with the idle time up to `cap`.
    NearWindow { base: u64, cap: u64, near_multiplier: u64 },
}

/// Running state carried from one occurrence to the next in the job payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RecurringState {
    /// Delay chosen for the occurrence that carries this state.
    pub delay_seconds: u64,
    /// Consecutive idle or failed runs.
    pub streak: u32,
    /// Start of the current idle stretch.
    pub idle_since: Option<DateTime<Utc>>,
    /// Planned fire time of the occurrence that carries this state.
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl RecurringState {
    fn from_payload(data: &Value) -> Self {
        if data.is_null() {
            return Self::default();
        }
        serde_json::from_value(data.clone()).unwrap_or_else(|err| {
            warn!(error = %err, "unreadable recurring state; starting fresh");
            Self::default()
        })
    }
}

/// The next occurrence of a recurring job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextRun {
    pub delay_seconds: u64,
    pub key: SlotKey,
    pub state: RecurringState,
}

pub(crate) fn instant_after<Tz: TimeZone>(now: &DateTime<Tz>, seconds: u64) -> DateTime<Tz> {
    let delta = TimeDelta::try_seconds(i64::try_from(seconds).unwrap_or(i64::MAX)).unwrap_or(TimeDelta::MAX);
    now.clone().checked_add_signed(delta).unwrap_or_else(|| now.clone())
}

impl Cadence {
    /// First occurrence after registration.
    ///
    /// Interval cadences start at the next minute boundary with a minute key,
    /// so instances booting within the same minute seed one occurrence.
    pub fn seed<Tz: TimeZone>(&self, job: &str, now: &DateTime<Tz>) -> NextRun {
        match *self {
            Cadence::Daily { hour } => {
                let delay_seconds = compute_next_daily_run_delay_seconds(hour, now);
                let target = instant_after(now, delay_seconds);
                NextRun {
                    delay_seconds,
                    key: SlotKey::daily(job, &target),
                    state: RecurringState {
                        delay_seconds,
                        scheduled_for: Some(target.with_timezone(&Utc)),
                        ..RecurringState::default()
                    },
                }
            }
            _ => {
                let delay_seconds = compute_next_minute_boundary_delay_seconds(now, 1);
                let target = instant_after(now, delay_seconds);
                NextRun {
                    delay_seconds,
                    key: SlotKey::minute(job, &target),
                    state: RecurringState {
                        delay_seconds,
                        scheduled_for: Some(target.with_timezone(&Utc)),
                        ..RecurringState::default()
                    },
                }
            }
        }
    }

    /// Occurrence following a run that was `active` (did useful work) or not.
    ///
    /// `sample` must lie in `[0, 1)`; it is only read by [`Cadence::Jittered`].
    ///
    /// Interval cadences key the next run on the previous occurrence's planned
    /// time, so a redelivered occurrence reschedules into the same slot even
    /// when it picks a different delay.
    pub fn plan<Tz: TimeZone>(
        &self,
        job: &str,
        previous: &RecurringState,
        active: bool,
        now: &DateTime<Tz>,
        sample: f64,
    ) -> NextRun {
        let now_utc = now.with_timezone(&Utc);
        let streak = if active { 0 } else { previous.streak.saturating_add(1) };
        let idle_since = if active { None } else { previous.idle_since.or(Some(now_utc)) };
        let interval_key = |delay: u64| match previous.scheduled_for {
            Some(planned) => SlotKey::after(job, &planned),
            None => SlotKey::next_at(job, &instant_after(now, delay)),
        };

        let (delay_seconds, key) = match *self {
            Cadence::Daily { hour } => {
                let delay = compute_next_daily_run_delay_seconds(hour, now);
                (delay, SlotKey::daily(job, &instant_after(now, delay)))
            }
            Cadence::MinuteBoundary { min_seconds } => {
                let delay = compute_next_minute_boundary_delay_seconds(now, min_seconds);
                (delay, SlotKey::minute(job, &instant_after(now, delay)))
            }
            Cadence::Jittered { base, jitter } => {
                let delay = compute_jittered_interval(base, jitter, sample);
                (delay, interval_key(delay))
            }
            Cadence::Exponential { base, cap } => {
                let delay = if active {
                    base.min(cap)
                } else {
                    compute_exponential_backoff(streak, base, cap)
                };
                (delay, interval_key(delay))
            }
            Cadence::NearWindow {
                base,
                cap,
                near_multiplier,
            } => {
                let delay = match idle_since {
                    None => base.min(cap),
                    Some(since) => {
                        let idle = u64::try_from((now_utc - since).num_seconds()).unwrap_or(0);
                        compute_backoff_with_near_window(idle, base, cap, near_multiplier)
                    }
                };
                (delay, interval_key(delay))
            }
        };

        NextRun {
            delay_seconds,
            key,
            state: RecurringState {
                delay_seconds,
                streak,
                idle_since,
                scheduled_for: Some(instant_after(&now_utc, delay_seconds)),
            },
        }
    }
}

/// Whether a run found work to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Active,
    Idle,
}

/// What a [`RecurringTask`] reports back after one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Free-form detail for the status surface.
    pub meta: Option<Value>,
}

impl RunReport {
    pub fn active() -> Self {
        Self {
            outcome: RunOutcome::Active,
            meta: None,
        }
    }

    pub fn idle() -> Self {
        Self {
            outcome: RunOutcome::Idle,
            meta: None,
        }
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// One unit of periodic domain work.
#[async_trait]
pub trait RecurringTask: Send + Sync + 'static {
    /// Queue name, `domain:action`.
    fn name(&self) -> &str;

    fn cadence(&self) -> Cadence;

    async fn run(&self) -> anyhow::Result<RunReport>;
}

/// Registers a [`RecurringTask`] and keeps it rescheduling itself.
pub struct RecurringModule<T> {
    task: Arc<T>,
}

impl<T: RecurringTask> RecurringModule<T> {
    pub fn new(task: T) -> Self {
        Self { task: Arc::new(task) }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Run the task once and turn the result into a run record.
async fn run_once<T: RecurringTask>(task: &T) -> (JobRun, bool) {
    let started_at = Utc::now();
    match AssertUnwindSafe(task.run()).catch_unwind().await {
        Ok(Ok(report)) => {
            let active = report.outcome == RunOutcome::Active;
            (JobRun::succeeded(started_at, report.meta), active)
        }
        Ok(Err(err)) => {
            warn!(job = task.name(), error = %format!("{err:#}"), "recurring task failed");
            (JobRun::failed(started_at, format!("{err:#}")), false)
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(job = task.name(), panic = %message, "recurring task panicked");
            (JobRun::failed(started_at, message), false)
        }
    }
}

async fn reschedule(queue: &Weak<dyn JobQueue>, name: &str, next: NextRun) {
    let Some(queue) = queue.upgrade() else {
        debug!(job = name, "queue dropped; not rescheduling");
        return;
    };

    let data = match serde_json::to_value(&next.state) {
        Ok(data) => data,
        Err(err) => {
            error!(job = name, error = %err, "failed to encode recurring state");
            return;
        }
    };

    match schedule_singleton(queue.as_ref(), name, data, next.delay_seconds, &next.key).await {
        Ok(id) => debug!(job = name, job_id = %id, key = %next.key, delay_secs = next.delay_seconds, "rescheduled"),
        Err(err) => warn!(job = name, key = %next.key, error = %err, "failed to reschedule"),
    }
}

#[async_trait]
impl<T: RecurringTask> JobModule for RecurringModule<T> {
    fn name(&self) -> &str {
        self.task.name()
    }

    async fn register(&self, ctx: &JobsContext) -> Result<(), QueueError> {
        let queue = ctx.require_queue()?;
        let name = self.task.name().to_string();
        let cadence = self.task.cadence();

        let task = Arc::clone(&self.task);
        let runs: Arc<dyn JobRunRecorder> = Arc::clone(&ctx.runs);
        let weak_queue: Weak<dyn JobQueue> = Arc::downgrade(&queue);
        let job_name = name.clone();

        queue
            .on(
                &name,
                handler(move |mut job: Job| {
                    let (task, runs, weak_queue, name) =
                        (Arc::clone(&task), Arc::clone(&runs), weak_queue.clone(), job_name.clone());
                    async move {
                        let previous = RecurringState::from_payload(&job.data);
                        let (run, active) = run_once(task.as_ref()).await;
                        runs.record(&name, run);

                        let next = cadence.plan(&name, &previous, active, &Local::now(), rand::random::<f64>());
                        reschedule(&weak_queue, &name, next).await;
                        job.done();
                    }
                }),
            )
            .await?;

        let seed = cadence.seed(&name, &Local::now());
        let data = serde_json::to_value(&seed.state).map_err(|e| QueueError::Serialization(e.to_string()))?;
        let id = schedule_singleton(queue.as_ref(), &name, data, seed.delay_seconds, &seed.key).await?;
        info!(job = %name, job_id = %id, key = %seed.key, delay_secs = seed.delay_seconds, "recurring job seeded");
        Ok(())
    }
}
