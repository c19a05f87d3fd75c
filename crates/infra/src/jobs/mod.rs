//! Background job scheduling.
//!
//! ## Design
//!
//! - One backend-agnostic contract (`JobQueue`) with two backends: in-process
//!   timers (`MemoryJobQueue`) and a durable broker (`DurableJobQueue`)
//! - Recurring work reschedules itself with idempotent slot keys
//! - A heartbeat job proves the active backend delivers
//! - Backend selection is driven by environment configuration
//!
//! ## Components
//!
//! - `queue`: the contract, `Job`, `ScheduleOptions`, errors
//! - `memory`: non-durable timer backend
//! - `broker` / `durable`: durable broker boundary and its queue adapter
//! - `postgres`: the Postgres broker
//! - `recurring`: slot-keyed self-rescheduling and `RecurringModule`
//! - `heartbeat`, `runs`: liveness and run history for status endpoints
//! - `bootstrap`: backend selection and the `JobsContext`

pub mod bootstrap;
pub mod broker;
pub mod durable;
pub mod heartbeat;
pub mod memory;
pub mod postgres;
pub mod queue;
pub mod recurring;
pub mod runs;

#[cfg(test)]
mod testing;

pub use bootstrap::{select_backend, BackendSelection, JobModule, JobsBootstrap, JobsContext};
pub use broker::{BrokerConnector, BrokerError, BrokerHandler, DeliveredJob, JobBroker, PublishOptions};
pub use durable::DurableJobQueue;
pub use heartbeat::{HeartbeatMonitor, HeartbeatPayload, HeartbeatSnapshot, HEARTBEAT_JOB};
pub use memory::MemoryJobQueue;
pub use postgres::{PgBrokerConnector, PgJobBroker};
pub use queue::{handler, BackendKind, Job, JobAck, JobHandler, JobQueue, JobQueueExt, QueueError, ScheduleOptions};
pub use recurring::{schedule_singleton, Cadence, RecurringModule, RecurringState, RecurringTask, RunOutcome, RunReport};
pub use runs::{InMemoryJobRunLog, JobRun, JobRunRecorder};
