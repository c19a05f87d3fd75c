//! Process-wide logging setup shared by herald binaries.

/// Subscriber construction and log format selection.
pub mod tracing;

pub use crate::tracing::{LogFormat, LogSettings};

/// Initialize process-wide tracing from the environment.
///
/// Safe to call multiple times; only the first call installs a subscriber.
pub fn init() {
    crate::tracing::init(&LogSettings::from_env());
}
