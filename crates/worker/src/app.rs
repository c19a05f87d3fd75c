use std::collections::HashMap;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use herald_infra::jobs::{HeartbeatSnapshot, JobRun, JobsContext};

/// Shared state behind the status routes.
#[derive(Debug, Clone)]
pub struct WorkerState {
    /// Value of the `JOBS_ENABLED` gate.
    pub enabled: bool,
    pub jobs: JobsContext,
}

#[derive(Debug, Serialize)]
struct JobsHealth {
    enabled: bool,
    backend: Option<&'static str>,
    heartbeat: Option<HeartbeatSnapshot>,
    stale: bool,
}

#[derive(Debug, Serialize)]
struct JobsStatus {
    jobs: HashMap<String, JobRun>,
}

pub fn build_app(state: WorkerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/jobs", get(jobs_health))
        .route("/status/jobs", get(jobs_status))
        .layer(Extension(state))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn jobs_health(Extension(state): Extension<WorkerState>) -> impl IntoResponse {
    let jobs = &state.jobs;
    Json(JobsHealth {
        enabled: state.enabled,
        backend: jobs.backend().map(|b| b.as_str()),
        heartbeat: jobs.heartbeat.snapshot(),
        stale: jobs.is_heartbeat_stale(Utc::now()),
    })
}

async fn jobs_status(Extension(state): Extension<WorkerState>) -> impl IntoResponse {
    Json(JobsStatus {
        jobs: state.jobs.runs.latest(),
    })
}
