//! Durable broker boundary.
//!
//! A broker is an external at-least-once job store (see `postgres` for the
//! concrete one). The durable queue adapter talks to it only through these
//! traits, so the queue contract carries no compile-time dependency on any
//! broker library.
//!
//! ## Acknowledgement
//!
//! Brokers acknowledge a delivery when the handler future resolves. A handler
//! that panics leaves the delivery retryable.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// A delivery as the broker hands it out.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveredJob {
    pub id: Uuid,
    pub name: String,
    pub data: Value,
    pub attempts: u32,
}

/// Broker-side handler; resolves when the delivery may be acknowledged.
pub type BrokerHandler = Arc<dyn Fn(DeliveredJob) -> BoxFuture<'static, ()> + Send + Sync>;

/// Broker-native publish options. Only options the caller supplied are set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Absolute "not before" instant.
    pub start_after: Option<DateTime<Utc>>,
    /// Singleton/dedup key: at most one pending job per `(name, key)`.
    pub singleton_key: Option<String>,
    pub priority: Option<i32>,
}

/// Broker operation error.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connect(String),

    #[error("broker storage error: {0}")]
    Storage(String),

    #[error("singleton conflict: {0}")]
    Conflict(String),

    #[error("broker is stopped")]
    Stopped,
}

/// A live connection to a durable broker.
#[async_trait]
pub trait JobBroker: Send + Sync {
    /// Prepare storage and background maintenance.
    async fn start(&self) -> Result<(), BrokerError>;

    /// Stop polling and reject further `work`/`send` calls.
    ///
    /// In-flight handlers keep running and still settle their jobs, so the
    /// connection is released only once the last of them finishes.
    async fn stop(&self) -> Result<(), BrokerError>;

    /// Start delivering jobs named `name` to `handler`.
    async fn work(&self, name: &str, handler: BrokerHandler) -> Result<(), BrokerError>;

    /// Publish one job and return its id. With a singleton key that already
    /// has a pending job, returns that job's id instead of creating another.
    async fn send(&self, name: &str, data: Value, options: PublishOptions) -> Result<Uuid, BrokerError>;
}

/// Creates broker connections on demand.
///
/// Resolved inside `start()`, never at construction, so building a durable
/// queue needs neither credentials nor connectivity.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn JobBroker>, BrokerError>;
}
