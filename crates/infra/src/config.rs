//! Environment configuration for the jobs subsystem.
//!
//! Nothing here is fatal: a value that fails to parse is logged and replaced
//! by its default, and an incomplete durable setup is reported by the
//! bootstrap as "jobs unavailable" rather than as an error.

use std::time::Duration;

use tracing::warn;

pub const DEFAULT_BACKEND: &str = "postgres";
pub const DEFAULT_HEARTBEAT_SECONDS: u64 = 60;

/// Tuning for the Postgres broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Delay between fetches per job name.
    pub poll_interval: Duration,
    /// Jobs claimed per fetch.
    pub batch_size: u32,
    pub max_connections: u32,
    /// Redeliveries after the first attempt before a job is marked failed.
    pub retry_limit: u32,
    pub retry_base_seconds: u64,
    pub retry_cap_seconds: u64,
    /// An `active` job older than this is treated as abandoned and redelivered.
    pub expire_after: Duration,
    /// Finished jobs older than this are purged.
    pub retention: Duration,
    pub maintenance_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1_000),
            batch_size: 4,
            max_connections: 5,
            retry_limit: 3,
            retry_base_seconds: 30,
            retry_cap_seconds: 3_600,
            expire_after: Duration::from_secs(15 * 60),
            retention: Duration::from_secs(7 * 24 * 3_600),
            maintenance_interval: Duration::from_secs(60),
        }
    }
}

/// Jobs subsystem configuration as read from the process environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobsConfig {
    /// `JOBS_ENABLED`
    pub enabled: bool,
    /// `JOBS_BACKEND`, lowercased. `memory` selects the in-process queue;
    /// anything else selects the durable one.
    pub backend: String,
    /// `DB_PROVIDER`
    pub db_provider: Option<String>,
    /// `DATABASE_URL`
    pub database_url: Option<String>,
    /// `JOBS_HEARTBEAT_SECONDS`
    pub heartbeat_seconds: u64,
    pub broker: BrokerConfig,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: DEFAULT_BACKEND.to_string(),
            db_provider: None,
            database_url: None,
            heartbeat_seconds: DEFAULT_HEARTBEAT_SECONDS,
            broker: BrokerConfig::default(),
        }
    }
}

impl JobsConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`, which returns `None` for unset keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut broker = defaults.broker;
        if let Some(ms) = parse_or_warn::<u64>("JOBS_POLL_INTERVAL_MS", var("JOBS_POLL_INTERVAL_MS")) {
            broker.poll_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(size) = parse_or_warn::<u32>("JOBS_BATCH_SIZE", var("JOBS_BATCH_SIZE")) {
            broker.batch_size = size.max(1);
        }

        Self {
            enabled: var("JOBS_ENABLED").is_some_and(|v| parse_flag(&v)),
            backend: var("JOBS_BACKEND")
                .map(|v| v.to_ascii_lowercase())
                .unwrap_or(defaults.backend),
            db_provider: var("DB_PROVIDER").map(|v| v.to_ascii_lowercase()),
            database_url: var("DATABASE_URL"),
            heartbeat_seconds: parse_or_warn("JOBS_HEARTBEAT_SECONDS", var("JOBS_HEARTBEAT_SECONDS"))
                .unwrap_or(defaults.heartbeat_seconds)
                .max(1),
            broker,
        }
    }

    pub fn wants_memory(&self) -> bool {
        self.backend == "memory"
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

fn parse_or_warn<T: std::str::FromStr>(key: &str, value: Option<String>) -> Option<T> {
    let raw = value?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable value; using default");
            None
        }
    }
}
