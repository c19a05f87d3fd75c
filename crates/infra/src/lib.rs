//! Infrastructure layer: job queue backends, Postgres broker, configuration.

pub mod config;
pub mod jobs;

pub use config::{BrokerConfig, JobsConfig};
