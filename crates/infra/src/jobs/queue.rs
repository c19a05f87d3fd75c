//! Backend-agnostic job queue contract.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// Handler bound to one job name.
///
/// Invoked once per delivered occurrence. The handler must call
/// [`Job::done`] on every control-flow path.
pub type JobHandler = Arc<dyn Fn(Job) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`JobHandler`].
pub fn handler<F, Fut>(f: F) -> JobHandler
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |job| Box::pin(f(job)))
}

/// Which execution backend a queue runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// In-process timers, no persistence.
    Memory,
    /// Postgres-backed at-least-once broker.
    Durable,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Memory => "memory",
            BackendKind::Durable => "postgres",
        }
    }
}

impl core::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue operation error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// `schedule()` called before `start()` completed.
    #[error("job queue not started")]
    NotStarted,

    /// A handler is already registered for this job name.
    #[error("handler already registered for job '{0}'")]
    DuplicateHandler(String),

    /// The underlying broker rejected or failed the operation.
    #[error("broker error: {0}")]
    Broker(String),

    /// Job payload could not be (de)serialized.
    #[error("payload serialization failed: {0}")]
    Serialization(String),
}

/// Per-job completion signal.
///
/// Each delivered job owns its own closure. Calling it more than once is a
/// no-op. Under auto-acknowledging backends the closure does nothing
/// observable, but handlers call it regardless so they stay backend-agnostic.
pub struct JobAck(Option<Box<dyn FnOnce() + Send + Sync>>);

impl JobAck {
    pub fn new(f: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    /// Acknowledgement with nothing behind it.
    pub fn noop() -> Self {
        Self(None)
    }

    fn fire(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl core::fmt::Debug for JobAck {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("JobAck").field(&self.0.is_some()).finish()
    }
}

/// One delivered occurrence of a job.
#[derive(Debug)]
pub struct Job<T = Value> {
    /// Backend-assigned identifier.
    pub id: String,
    /// Dispatch key, `domain:action`.
    pub name: String,
    pub data: T,
    /// Delivery count so far (1 on first delivery).
    pub attempts: u32,
    ack: JobAck,
}

impl<T> Job<T> {
    pub fn new(id: impl Into<String>, name: impl Into<String>, data: T, attempts: u32, ack: JobAck) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            data,
            attempts,
            ack,
        }
    }

    /// Signal completion of this occurrence.
    pub fn done(&mut self) {
        self.ack.fire();
    }

    /// Convert the payload, keeping id, attempts and acknowledgement.
    ///
    /// On failure the payload is consumed and the job comes back without it,
    /// so the caller can still acknowledge.
    pub fn try_map<U, E>(self, f: impl FnOnce(T) -> Result<U, E>) -> Result<Job<U>, (Job<()>, E)> {
        let Job {
            id,
            name,
            data,
            attempts,
            ack,
        } = self;

        match f(data) {
            Ok(data) => Ok(Job {
                id,
                name,
                data,
                attempts,
                ack,
            }),
            Err(err) => Err((
                Job {
                    id,
                    name,
                    data: (),
                    attempts,
                    ack,
                },
                err,
            )),
        }
    }
}

/// Options for one `schedule()` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleOptions {
    /// Delay before the occurrence becomes eligible; 0 means as soon as possible.
    pub start_after_seconds: u64,
    /// Pending occurrences sharing this key collapse into one.
    pub idempotency_key: Option<String>,
    /// Ordering hint; honoured by the durable backend only.
    pub priority: Option<i32>,
}

impl ScheduleOptions {
    pub fn start_after(mut self, seconds: u64) -> Self {
        self.start_after_seconds = seconds;
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Contract every backend implements and every job module programs against.
///
/// ## Registration
///
/// Exactly one handler per job name. A second `on()` for a name that already
/// has a handler is rejected with [`QueueError::DuplicateHandler`]; the first
/// registration stays in force.
///
/// ## Scheduling
///
/// `schedule()` fails with [`QueueError::NotStarted`] until `start()` has
/// completed. Registration never needs a started backend.
///
/// ## Lifecycle
///
/// `start()` and `stop()` are idempotent. `stop()` does not cancel handlers
/// that are already running.
#[async_trait]
pub trait JobQueue: Send + Sync {
    fn backend(&self) -> BackendKind;

    async fn on(&self, name: &str, handler: JobHandler) -> Result<(), QueueError>;

    /// Enqueue one occurrence and return its backend-assigned id.
    async fn schedule(&self, name: &str, data: Value, options: ScheduleOptions) -> Result<String, QueueError>;

    async fn start(&self) -> Result<(), QueueError>;

    async fn stop(&self) -> Result<(), QueueError>;
}

#[async_trait]
impl<Q> JobQueue for Arc<Q>
where
    Q: JobQueue + ?Sized,
{
    fn backend(&self) -> BackendKind {
        (**self).backend()
    }

    async fn on(&self, name: &str, handler: JobHandler) -> Result<(), QueueError> {
        (**self).on(name, handler).await
    }

    async fn schedule(&self, name: &str, data: Value, options: ScheduleOptions) -> Result<String, QueueError> {
        (**self).schedule(name, data, options).await
    }

    async fn start(&self) -> Result<(), QueueError> {
        (**self).start().await
    }

    async fn stop(&self) -> Result<(), QueueError> {
        (**self).stop().await
    }
}

/// Typed payloads on top of the JSON contract.
#[async_trait]
pub trait JobQueueExt: JobQueue {
    /// Register a handler that receives `data` deserialized as `T`.
    ///
    /// Occurrences whose payload does not decode are logged, acknowledged and
    /// dropped.
    async fn on_typed<T, F, Fut>(&self, name: &str, f: F) -> Result<(), QueueError>
    where
        T: DeserializeOwned + Send + Sync + 'static,
        F: Fn(Job<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let typed: JobHandler = Arc::new(move |job: Job| -> BoxFuture<'static, ()> {
            match job.try_map(serde_json::from_value::<T>) {
                Ok(job) => Box::pin(f(job)),
                Err((mut job, err)) => {
                    warn!(job = %job.name, job_id = %job.id, error = %err, "dropping job with undecodable payload");
                    job.done();
                    Box::pin(async {})
                }
            }
        });
        self.on(name, typed).await
    }

    async fn schedule_typed<T>(&self, name: &str, data: &T, options: ScheduleOptions) -> Result<String, QueueError>
    where
        T: Serialize + Sync,
    {
        let value = serde_json::to_value(data).map_err(|e| QueueError::Serialization(e.to_string()))?;
        self.schedule(name, value, options).await
    }
}

impl<Q: JobQueue + ?Sized> JobQueueExt for Q {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn ack_fires_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let mut job = Job::new("1", "test:run", Value::Null, 1, JobAck::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        job.done();
        job.done();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn try_map_keeps_ack_on_failure() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let job = Job::new("7", "test:run", serde_json::json!("nope"), 2, JobAck::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        let (mut failed, _err) = job.try_map(serde_json::from_value::<u32>).unwrap_err();
        assert_eq!(failed.id, "7");
        assert_eq!(failed.attempts, 2);
        failed.done();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn schedule_options_builder() {
        let opts = ScheduleOptions::default()
            .start_after(30)
            .idempotency_key("a:b:next:1")
            .priority(5);

        assert_eq!(opts.start_after_seconds, 30);
        assert_eq!(opts.idempotency_key.as_deref(), Some("a:b:next:1"));
        assert_eq!(opts.priority, Some(5));
        assert_eq!(ScheduleOptions::default().idempotency_key, None);
    }

    #[test]
    fn backend_kind_names() {
        assert_eq!(BackendKind::Memory.as_str(), "memory");
        assert_eq!(BackendKind::Durable.to_string(), "postgres");
    }

    #[derive(Default)]
    struct CapturingQueue {
        handlers: std::sync::Mutex<std::collections::HashMap<String, JobHandler>>,
    }

    impl CapturingQueue {
        fn handler(&self, name: &str) -> JobHandler {
            self.handlers.lock().unwrap()[name].clone()
        }
    }

    #[async_trait]
    impl JobQueue for CapturingQueue {
        fn backend(&self) -> BackendKind {
            BackendKind::Memory
        }

        async fn on(&self, name: &str, handler: JobHandler) -> Result<(), QueueError> {
            self.handlers.lock().unwrap().insert(name.to_string(), handler);
            Ok(())
        }

        async fn schedule(&self, _name: &str, _data: Value, _options: ScheduleOptions) -> Result<String, QueueError> {
            Err(QueueError::NotStarted)
        }

        async fn start(&self) -> Result<(), QueueError> {
            Ok(())
        }

        async fn stop(&self) -> Result<(), QueueError> {
            Ok(())
        }
    }

    #[derive(Debug, Deserialize)]
    struct Ping {
        seq: u32,
    }

    fn counted_job(data: Value, acks: &Arc<AtomicUsize>) -> Job {
        let acks = acks.clone();
        Job::new("9", "test:ping", data, 1, JobAck::new(move || {
            acks.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[tokio::test]
    async fn on_typed_decodes_payload_and_acks_undecodable_ones() {
        let queue = CapturingQueue::default();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        queue
            .on_typed("test:ping", move |mut job: Job<Ping>| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(job.data.seq);
                    job.done();
                }
            })
            .await
            .unwrap();
        let typed = queue.handler("test:ping");

        let acks = Arc::new(AtomicUsize::new(0));
        typed(counted_job(serde_json::json!({ "seq": 3 }), &acks)).await;
        assert_eq!(*seen.lock().unwrap(), vec![3]);
        assert_eq!(acks.load(Ordering::SeqCst), 1);

        let dropped = Arc::new(AtomicUsize::new(0));
        typed(counted_job(serde_json::json!("garbage"), &dropped)).await;
        assert_eq!(*seen.lock().unwrap(), vec![3]);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }
}
