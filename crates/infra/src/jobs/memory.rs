//! In-process job queue for local development and single-instance deployments.
//!
//! - Timer-based: each occurrence is a tokio task sleeping `start_after_seconds`
//! - Not durable: pending occurrences are lost on restart
//! - Idempotency keys collapse occurrences that have not fired yet
//! - `priority` is accepted and ignored

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tokio::task::AbortHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::queue::{BackendKind, Job, JobAck, JobHandler, JobQueue, QueueError, ScheduleOptions};

#[derive(Debug)]
struct PendingOccurrence {
    key: Option<String>,
    timer: AbortHandle,
}

#[derive(Debug, Default)]
struct MemoryState {
    started: bool,
    /// Armed occurrences by id.
    pending: HashMap<String, PendingOccurrence>,
    /// Idempotency key -> id of the armed occurrence holding it.
    keys: HashMap<String, String>,
}

#[derive(Default)]
struct MemoryInner {
    handlers: RwLock<HashMap<String, JobHandler>>,
    state: Mutex<MemoryState>,
}

impl MemoryInner {
    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Timer elapsed: release the occurrence and hand it to its handler.
    fn fire(&self, id: String, name: String, data: Value) {
        {
            let mut state = self.state();
            let Some(occurrence) = state.pending.remove(&id) else {
                // Cancelled by stop().
                return;
            };
            if let Some(key) = occurrence.key {
                if state.keys.get(&key) == Some(&id) {
                    state.keys.remove(&key);
                }
            }
        }

        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name)
            .cloned();

        let Some(handler) = handler else {
            warn!(job = %name, job_id = %id, "no handler registered; dropping occurrence");
            return;
        };

        // Own task per delivery: stop() aborts timers, never running handlers.
        let job = Job::new(id.clone(), name.clone(), data, 1, JobAck::noop());
        tokio::spawn(async move {
            if AssertUnwindSafe(handler(job)).catch_unwind().await.is_err() {
                error!(job = %name, job_id = %id, "job handler panicked");
            }
        });
    }
}

/// Non-durable, in-process [`JobQueue`].
#[derive(Clone, Default)]
pub struct MemoryJobQueue {
    inner: Arc<MemoryInner>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of armed occurrences that have not fired yet.
    pub fn pending(&self) -> usize {
        self.inner.state().pending.len()
    }
}

impl core::fmt::Debug for MemoryJobQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.inner.state();
        f.debug_struct("MemoryJobQueue")
            .field("started", &state.started)
            .field("pending", &state.pending.len())
            .finish()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    fn backend(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn on(&self, name: &str, handler: JobHandler) -> Result<(), QueueError> {
        let mut handlers = self.inner.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(name) {
            return Err(QueueError::DuplicateHandler(name.to_string()));
        }
        handlers.insert(name.to_string(), handler);
        Ok(())
    }

    async fn schedule(&self, name: &str, data: Value, options: ScheduleOptions) -> Result<String, QueueError> {
        let mut state = self.inner.state();
        if !state.started {
            return Err(QueueError::NotStarted);
        }

        if let Some(key) = options.idempotency_key.as_deref() {
            if let Some(existing) = state.keys.get(key) {
                debug!(job = %name, key, job_id = %existing, "occurrence already pending for key");
                return Ok(existing.clone());
            }
        }

        let id = Uuid::now_v7().to_string();
        let delay = Duration::from_secs(options.start_after_seconds);

        // The state lock is held until the occurrence is recorded, so even a
        // zero-delay timer observes it in `fire`.
        let inner = Arc::clone(&self.inner);
        let (task_id, task_name) = (id.clone(), name.to_string());
        let timer = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            inner.fire(task_id, task_name, data);
        })
        .abort_handle();

        if let Some(key) = options.idempotency_key.clone() {
            state.keys.insert(key, id.clone());
        }
        state.pending.insert(
            id.clone(),
            PendingOccurrence {
                key: options.idempotency_key,
                timer,
            },
        );

        debug!(job = %name, job_id = %id, delay_secs = delay.as_secs(), "scheduled in-memory occurrence");
        Ok(id)
    }

    async fn start(&self) -> Result<(), QueueError> {
        self.inner.state().started = true;
        Ok(())
    }

    async fn stop(&self) -> Result<(), QueueError> {
        let mut state = self.inner.state();
        if !state.started {
            return Ok(());
        }
        state.started = false;
        for (_, occurrence) in state.pending.drain() {
            occurrence.timer.abort();
        }
        state.keys.clear();
        Ok(())
    }
}
