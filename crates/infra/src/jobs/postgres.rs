//! Postgres-backed at-least-once job broker.
//!
//! Jobs live in a single `herald_jobs` table and move through
//! `created | retry -> active -> completed | retry | failed`.
//!
//! ## Delivery
//!
//! One poll loop per registered job name claims up to `batch_size` eligible
//! rows with `FOR UPDATE SKIP LOCKED`, so any number of workers can share the
//! table. Each claimed row is handed to the handler on its own task:
//!
//! - the handler future resolves: row is `completed`
//! - the handler panics: row goes back to `retry` with exponential backoff,
//!   or to `failed` once `retry_limit` redeliveries are used up
//! - the worker dies mid-handler: the maintenance loop returns the `active`
//!   row to `retry` after `expire_after`
//!
//! ## Singleton keys
//!
//! A partial unique index allows at most one `created | retry | active` row
//! per `(name, singleton_key)`. Publishing into an occupied slot returns the
//! occupying row's id.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | BrokerError |
//! |------------|----------------------|-------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed | N/A | `Stopped` |
//! | Other | N/A | `Storage` |

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Row};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use herald_core::schedule::compute_exponential_backoff;

use super::broker::{BrokerConnector, BrokerError, BrokerHandler, DeliveredJob, JobBroker, PublishOptions};
use crate::config::BrokerConfig;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS herald_jobs (
        id            UUID PRIMARY KEY,
        name          TEXT NOT NULL,
        data          JSONB NOT NULL DEFAULT 'null'::jsonb,
        state         TEXT NOT NULL DEFAULT 'created',
        priority      INTEGER NOT NULL DEFAULT 0,
        singleton_key TEXT,
        attempts      INTEGER NOT NULL DEFAULT 0,
        start_after   TIMESTAMPTZ NOT NULL DEFAULT now(),
        started_at    TIMESTAMPTZ,
        completed_at  TIMESTAMPTZ,
        created_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
        CONSTRAINT herald_jobs_state_check
            CHECK (state IN ('created', 'retry', 'active', 'completed', 'failed'))
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS herald_jobs_singleton_idx
        ON herald_jobs (name, singleton_key)
        WHERE singleton_key IS NOT NULL AND state IN ('created', 'retry', 'active')
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS herald_jobs_fetch_idx
        ON herald_jobs (name, state, start_after)
    "#,
];

/// Opens a [`PgJobBroker`] when the durable queue starts.
#[derive(Debug, Clone)]
pub struct PgBrokerConnector {
    database_url: String,
    config: BrokerConfig,
}

impl PgBrokerConnector {
    pub fn new(database_url: impl Into<String>, config: BrokerConfig) -> Self {
        Self {
            database_url: database_url.into(),
            config,
        }
    }
}

#[async_trait]
impl BrokerConnector for PgBrokerConnector {
    async fn connect(&self) -> Result<Arc<dyn JobBroker>, BrokerError> {
        let pool = PgPoolOptions::new()
            .max_connections(self.config.max_connections)
            .connect(&self.database_url)
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;

        Ok(Arc::new(PgJobBroker::new(pool, self.config.clone())))
    }
}

/// Row-level operations on `herald_jobs`. Cheap to clone into poll tasks.
#[derive(Debug, Clone)]
struct PgJobStore {
    pool: PgPool,
    config: BrokerConfig,
}

struct ClaimedJobRow {
    id: Uuid,
    name: String,
    data: Value,
    attempts: i32,
}

impl<'r> FromRow<'r, PgRow> for ClaimedJobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ClaimedJobRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            data: row.try_get("data")?,
            attempts: row.try_get("attempts")?,
        })
    }
}

impl From<ClaimedJobRow> for DeliveredJob {
    fn from(row: ClaimedJobRow) -> Self {
        DeliveredJob {
            id: row.id,
            name: row.name,
            data: row.data,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
        }
    }
}

impl PgJobStore {
    #[instrument(skip(self), err)]
    async fn ensure_schema(&self) -> Result<(), BrokerError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    #[instrument(skip(self, data), fields(singleton_key = ?options.singleton_key), err)]
    async fn insert(&self, name: &str, data: &Value, options: &PublishOptions) -> Result<Uuid, BrokerError> {
        // Two rounds: the occupying row may finish between our insert and select.
        for _ in 0..2 {
            let inserted: Option<Uuid> = sqlx::query(
                r#"
                INSERT INTO herald_jobs (id, name, data, priority, singleton_key, start_after)
                VALUES ($1, $2, $3, $4, $5, COALESCE($6, now()))
                ON CONFLICT (name, singleton_key)
                    WHERE singleton_key IS NOT NULL AND state IN ('created', 'retry', 'active')
                    DO NOTHING
                RETURNING id
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(name)
            .bind(data)
            .bind(options.priority.unwrap_or(0))
            .bind(options.singleton_key.as_deref())
            .bind(options.start_after)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert", e))?
            .map(|row| row.try_get::<Uuid, _>("id"))
            .transpose()
            .map_err(|e| map_sqlx_error("insert", e))?;

            if let Some(id) = inserted {
                return Ok(id);
            }

            let Some(key) = options.singleton_key.as_deref() else {
                break;
            };

            let existing: Option<Uuid> = sqlx::query(
                r#"
                SELECT id FROM herald_jobs
                WHERE name = $1 AND singleton_key = $2 AND state IN ('created', 'retry', 'active')
                LIMIT 1
                "#,
            )
            .bind(name)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert", e))?
            .map(|row| row.try_get::<Uuid, _>("id"))
            .transpose()
            .map_err(|e| map_sqlx_error("insert", e))?;

            if let Some(id) = existing {
                debug!(job = %name, key, job_id = %id, "singleton slot already occupied");
                return Ok(id);
            }
        }

        Err(BrokerError::Conflict(format!(
            "could not publish '{name}' into singleton slot {:?}",
            options.singleton_key
        )))
    }

    #[instrument(skip(self), err)]
    async fn claim(&self, name: &str) -> Result<Vec<DeliveredJob>, BrokerError> {
        let rows = sqlx::query(
            r#"
            UPDATE herald_jobs
            SET state = 'active', attempts = attempts + 1, started_at = now()
            WHERE id IN (
                SELECT id FROM herald_jobs
                WHERE name = $1 AND state IN ('created', 'retry') AND start_after <= now()
                ORDER BY priority DESC, start_after ASC, created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, name, data, attempts
            "#,
        )
        .bind(name)
        .bind(i64::from(self.config.batch_size))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        rows.iter()
            .map(|row| {
                ClaimedJobRow::from_row(row)
                    .map(DeliveredJob::from)
                    .map_err(|e| BrokerError::Storage(format!("failed to decode job row: {e}")))
            })
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn complete(&self, id: Uuid) -> Result<(), BrokerError> {
        sqlx::query("UPDATE herald_jobs SET state = 'completed', completed_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("complete", e))?;
        Ok(())
    }

    /// Schedule a redelivery, or give up once the retry budget is spent.
    #[instrument(skip(self), err)]
    async fn fail(&self, id: Uuid, attempts: u32) -> Result<(), BrokerError> {
        if attempts > self.config.retry_limit {
            sqlx::query("UPDATE herald_jobs SET state = 'failed', completed_at = now() WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("fail", e))?;
            return Ok(());
        }

        let delay = compute_exponential_backoff(
            attempts,
            self.config.retry_base_seconds,
            self.config.retry_cap_seconds,
        );
        sqlx::query(
            r#"
            UPDATE herald_jobs
            SET state = 'retry', start_after = now() + make_interval(secs => $2)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(delay as f64)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail", e))?;
        Ok(())
    }

    /// Return abandoned `active` rows to the queue and drop old finished rows.
    #[instrument(skip(self), err)]
    async fn maintain(&self) -> Result<(u64, u64), BrokerError> {
        let expired = sqlx::query(
            r#"
            UPDATE herald_jobs
            SET state = CASE WHEN attempts > $2 THEN 'failed' ELSE 'retry' END,
                completed_at = CASE WHEN attempts > $2 THEN now() ELSE NULL END,
                start_after = now()
            WHERE state = 'active' AND started_at < now() - make_interval(secs => $1)
            "#,
        )
        .bind(self.config.expire_after.as_secs_f64())
        .bind(i64::from(self.config.retry_limit))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("expire", e))?
        .rows_affected();

        let purged = sqlx::query(
            r#"
            DELETE FROM herald_jobs
            WHERE state IN ('completed', 'failed')
              AND completed_at < now() - make_interval(secs => $1)
            "#,
        )
        .bind(self.config.retention.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("purge", e))?
        .rows_affected();

        Ok((expired, purged))
    }

    /// Run one claimed job to completion and settle its row.
    async fn deliver(self, handler: BrokerHandler, job: DeliveredJob) {
        let (id, name, attempts) = (job.id, job.name.clone(), job.attempts);
        let settled = match AssertUnwindSafe(handler(job)).catch_unwind().await {
            Ok(()) => self.complete(id).await,
            Err(_) => {
                error!(job = %name, job_id = %id, attempts, "job handler panicked; scheduling retry");
                self.fail(id, attempts).await
            }
        };
        if let Err(err) = settled {
            // The expiry sweep redelivers rows we failed to settle.
            warn!(job = %name, job_id = %id, error = %err, "failed to settle job");
        }
    }
}

/// Durable broker on a Postgres pool.
#[derive(Debug)]
pub struct PgJobBroker {
    store: PgJobStore,
    shutdown: CancellationToken,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl PgJobBroker {
    pub fn new(pool: PgPool, config: BrokerConfig) -> Self {
        Self {
            store: PgJobStore { pool, config },
            shutdown: CancellationToken::new(),
            loops: Mutex::new(Vec::new()),
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    fn ensure_running(&self) -> Result<(), BrokerError> {
        if self.shutdown.is_cancelled() {
            return Err(BrokerError::Stopped);
        }
        Ok(())
    }
}

#[async_trait]
impl JobBroker for PgJobBroker {
    async fn start(&self) -> Result<(), BrokerError> {
        self.ensure_running()?;
        self.store.ensure_schema().await?;

        let store = self.store.clone();
        let shutdown = self.shutdown.clone();
        self.track(tokio::spawn(async move {
            let mut tick = tokio::time::interval(store.config.maintenance_interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {}
                }
                match store.maintain().await {
                    Ok((expired, purged)) if expired + purged > 0 => {
                        info!(expired, purged, "job table maintenance");
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "job table maintenance failed"),
                }
            }
        }));

        info!("postgres job broker started");
        Ok(())
    }

    /// The pool stays open: delivery tasks hold store clones and settle
    /// through it after the loops are gone.
    async fn stop(&self) -> Result<(), BrokerError> {
        self.shutdown.cancel();
        let loops: Vec<_> = self
            .loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in loops {
            // Loops exit at their next select; delivery tasks are separate.
            if let Err(err) = handle.await {
                warn!(error = %err, "job poll loop ended abnormally");
            }
        }
        info!("postgres job broker stopped");
        Ok(())
    }

    async fn work(&self, name: &str, handler: BrokerHandler) -> Result<(), BrokerError> {
        self.ensure_running()?;

        let store = self.store.clone();
        let shutdown = self.shutdown.clone();
        let name = name.to_string();
        self.track(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(store.config.poll_interval) => {}
                }
                match store.claim(&name).await {
                    Ok(jobs) => {
                        for job in jobs {
                            tokio::spawn(store.clone().deliver(handler.clone(), job));
                        }
                    }
                    Err(err) => warn!(job = %name, error = %err, "failed to claim jobs"),
                }
            }
        }));
        Ok(())
    }

    async fn send(&self, name: &str, data: Value, options: PublishOptions) -> Result<Uuid, BrokerError> {
        self.ensure_running()?;
        self.store.insert(name, &data, &options).await
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> BrokerError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => BrokerError::Conflict(msg),
                _ => BrokerError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => BrokerError::Stopped,
        _ => BrokerError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
