//! In-process broker fakes for exercising the durable adapter without Postgres.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use super::broker::{BrokerConnector, BrokerError, BrokerHandler, DeliveredJob, JobBroker, PublishOptions};

struct QueuedJob {
    id: Uuid,
    name: String,
    data: Value,
    singleton_key: Option<String>,
}

/// Records every broker call and holds published jobs until
/// [`FakeBroker::deliver_pending`] runs them.
#[derive(Default)]
pub(crate) struct FakeBroker {
    pub started: AtomicBool,
    pub stopped: AtomicBool,
    works: Mutex<Vec<String>>,
    handlers: Mutex<HashMap<String, BrokerHandler>>,
    sent: Mutex<Vec<(String, Value, PublishOptions)>>,
    sent_ids: Mutex<Vec<Uuid>>,
    queued: Mutex<Vec<QueuedJob>>,
}

impl FakeBroker {
    pub fn works(&self) -> Vec<String> {
        self.works.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<(String, Value, PublishOptions)> {
        self.sent.lock().unwrap().clone()
    }

    /// Ids returned by `send`, one per call.
    pub fn sent_ids(&self) -> Vec<Uuid> {
        self.sent_ids.lock().unwrap().clone()
    }

    /// Deliver every queued job to its handler; returns how many ran.
    pub async fn deliver_pending(&self) -> usize {
        let queued: Vec<QueuedJob> = self.queued.lock().unwrap().drain(..).collect();
        let mut delivered = 0;
        for job in queued {
            let handler = self.handlers.lock().unwrap().get(&job.name).cloned();
            if let Some(handler) = handler {
                handler(DeliveredJob {
                    id: job.id,
                    name: job.name,
                    data: job.data,
                    attempts: 1,
                })
                .await;
                delivered += 1;
            }
        }
        delivered
    }
}

#[async_trait]
impl JobBroker for FakeBroker {
    async fn start(&self) -> Result<(), BrokerError> {
        self.started.store(true, Ordering::SeqCst);
        self.stopped.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), BrokerError> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn work(&self, name: &str, handler: BrokerHandler) -> Result<(), BrokerError> {
        self.works.lock().unwrap().push(name.to_string());
        self.handlers.lock().unwrap().insert(name.to_string(), handler);
        Ok(())
    }

    async fn send(&self, name: &str, data: Value, options: PublishOptions) -> Result<Uuid, BrokerError> {
        self.sent
            .lock()
            .unwrap()
            .push((name.to_string(), data.clone(), options.clone()));

        let mut queued = self.queued.lock().unwrap();
        let existing = options.singleton_key.as_ref().and_then(|key| {
            queued
                .iter()
                .find(|job| job.name == name && job.singleton_key.as_ref() == Some(key))
                .map(|job| job.id)
        });

        let id = match existing {
            Some(id) => id,
            None => {
                let id = Uuid::now_v7();
                queued.push(QueuedJob {
                    id,
                    name: name.to_string(),
                    data,
                    singleton_key: options.singleton_key,
                });
                id
            }
        };
        self.sent_ids.lock().unwrap().push(id);
        Ok(id)
    }
}

/// Hands out one shared [`FakeBroker`] and counts connection attempts.
pub(crate) struct FakeConnector {
    pub broker: Arc<FakeBroker>,
    pub connects: AtomicUsize,
    fail: bool,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            broker: Arc::new(FakeBroker::default()),
            connects: AtomicUsize::new(0),
            fail: false,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            broker: Arc::new(FakeBroker::default()),
            connects: AtomicUsize::new(0),
            fail: true,
        })
    }
}

#[async_trait]
impl BrokerConnector for FakeConnector {
    async fn connect(&self) -> Result<Arc<dyn JobBroker>, BrokerError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(BrokerError::Connect("connection refused".to_string()));
        }
        Ok(self.broker.clone())
    }
}
