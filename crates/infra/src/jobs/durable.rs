//! Durable job queue: adapts a [`JobBroker`] to the [`JobQueue`] contract.
//!
//! - The broker connection is created inside `start()`, not at construction.
//! - `on()` before `start()` buffers the handler; a successful `start()`
//!   registers every buffered handler with the broker exactly once and
//!   empties the buffer.
//! - `schedule()` before `start()` fails with [`QueueError::NotStarted`]; it
//!   is never buffered because the caller needs a broker-assigned id.
//! - Deliveries become a uniform [`Job`] whose `done()` is a no-op: the
//!   broker acknowledges when the handler future resolves.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::broker::{BrokerConnector, BrokerError, BrokerHandler, DeliveredJob, JobBroker, PublishOptions};
use super::queue::{BackendKind, Job, JobAck, JobHandler, JobQueue, QueueError, ScheduleOptions};

#[derive(Default)]
struct DurableState {
    broker: Option<Arc<dyn JobBroker>>,
    /// Registered before the broker was live.
    pending: HashMap<String, JobHandler>,
    /// Registered with the live broker.
    live: HashMap<String, JobHandler>,
}

impl DurableState {
    fn has_handler(&self, name: &str) -> bool {
        self.pending.contains_key(name) || self.live.contains_key(name)
    }
}

/// [`JobQueue`] backed by a durable, at-least-once broker.
pub struct DurableJobQueue {
    connector: Arc<dyn BrokerConnector>,
    state: Mutex<DurableState>,
}

impl DurableJobQueue {
    pub fn new(connector: Arc<dyn BrokerConnector>) -> Self {
        Self {
            connector,
            state: Mutex::new(DurableState::default()),
        }
    }

    /// Number of handlers waiting for the broker to come online.
    pub async fn buffered_handlers(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn is_started(&self) -> bool {
        self.state.lock().await.broker.is_some()
    }
}

impl core::fmt::Debug for DurableJobQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DurableJobQueue").finish_non_exhaustive()
    }
}

/// Translate generic schedule options into broker publish options.
///
/// Absent options stay absent.
pub fn publish_options(options: ScheduleOptions) -> PublishOptions {
    let start_after = (options.start_after_seconds > 0).then(|| {
        let secs = i64::try_from(options.start_after_seconds).unwrap_or(i64::MAX);
        let delay = TimeDelta::try_seconds(secs).unwrap_or(TimeDelta::MAX);
        Utc::now().checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    });

    PublishOptions {
        start_after,
        singleton_key: options.idempotency_key,
        priority: options.priority,
    }
}

fn wrap_handler(handler: JobHandler) -> BrokerHandler {
    Arc::new(move |delivered: DeliveredJob| {
        let job = Job::new(
            delivered.id.to_string(),
            delivered.name,
            delivered.data,
            delivered.attempts,
            JobAck::noop(),
        );
        handler(job)
    })
}

fn broker_error(err: BrokerError) -> QueueError {
    QueueError::Broker(err.to_string())
}

#[async_trait]
impl JobQueue for DurableJobQueue {
    fn backend(&self) -> BackendKind {
        BackendKind::Durable
    }

    async fn on(&self, name: &str, handler: JobHandler) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if state.has_handler(name) {
            return Err(QueueError::DuplicateHandler(name.to_string()));
        }

        match state.broker.clone() {
            Some(broker) => {
                broker
                    .work(name, wrap_handler(handler.clone()))
                    .await
                    .map_err(broker_error)?;
                state.live.insert(name.to_string(), handler);
            }
            None => {
                state.pending.insert(name.to_string(), handler);
            }
        }
        Ok(())
    }

    async fn schedule(&self, name: &str, data: Value, options: ScheduleOptions) -> Result<String, QueueError> {
        let broker = self.state.lock().await.broker.clone().ok_or(QueueError::NotStarted)?;
        let id = broker
            .send(name, data, publish_options(options))
            .await
            .map_err(broker_error)?;
        Ok(id.to_string())
    }

    async fn start(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if state.broker.is_some() {
            return Ok(());
        }

        let broker = self.connector.connect().await.map_err(broker_error)?;
        broker.start().await.map_err(broker_error)?;

        for (name, handler) in &state.pending {
            if let Err(err) = broker.work(name, wrap_handler(handler.clone())).await {
                // Buffer stays intact for the next start() attempt.
                if let Err(stop_err) = broker.stop().await {
                    warn!(error = %stop_err, "failed to stop broker after registration error");
                }
                return Err(broker_error(err));
            }
        }

        let registered: Vec<_> = state.pending.drain().collect();
        info!(handlers = registered.len(), "durable job queue started");
        state.live.extend(registered);
        state.broker = Some(broker);
        Ok(())
    }

    async fn stop(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let Some(broker) = state.broker.take() else {
            return Ok(());
        };

        // A later start() re-registers everything against the new connection.
        let live: Vec<_> = state.live.drain().collect();
        state.pending.extend(live);

        broker.stop().await.map_err(broker_error)
    }
}
