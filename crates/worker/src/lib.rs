//! Jobs worker: runs the background job subsystem and exposes its status.

pub mod app;
pub mod tasks;

/// Default bind address for the liveness/status listener.
pub const DEFAULT_HEALTH_ADDR: &str = "0.0.0.0:8081";
