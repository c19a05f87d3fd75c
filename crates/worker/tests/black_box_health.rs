use std::sync::Arc;

use herald_infra::jobs::{JobModule, JobsBootstrap, HEARTBEAT_JOB};
use herald_infra::JobsConfig;
use herald_worker::app::{build_app, WorkerState};
use reqwest::StatusCode;
use serde_json::Value;

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn(config: JobsConfig) -> Self {
        let enabled = config.enabled;
        let modules: Vec<Arc<dyn JobModule>> = Vec::new();
        let jobs = JobsBootstrap::new(config).run(&modules).await;

        // Same router as prod, bound to an ephemeral port.
        let app = build_app(WorkerState { enabled, jobs });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, handle }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn memory_config() -> JobsConfig {
    JobsConfig {
        enabled: true,
        backend: "memory".to_string(),
        ..JobsConfig::default()
    }
}

async fn get_json(client: &reqwest::Client, url: String) -> Value {
    let res = client.get(url).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    res.json().await.unwrap()
}

#[tokio::test]
async fn health_is_always_ok() {
    let server = TestServer::spawn(JobsConfig::default()).await;
    let res = reqwest::get(format!("{}/health", server.base_url)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn disabled_jobs_report_no_backend() {
    let server = TestServer::spawn(JobsConfig::default()).await;
    let client = reqwest::Client::new();

    let body = get_json(&client, format!("{}/health/jobs", server.base_url)).await;
    assert_eq!(body["enabled"], false);
    assert_eq!(body["backend"], Value::Null);
    assert_eq!(body["heartbeat"], Value::Null);
    assert_eq!(body["stale"], true);

    let status = get_json(&client, format!("{}/status/jobs", server.base_url)).await;
    assert_eq!(status["jobs"], serde_json::json!({}));
}

#[tokio::test]
async fn memory_backend_reports_fresh_heartbeat() {
    let server = TestServer::spawn(memory_config()).await;
    let client = reqwest::Client::new();

    // The seeded heartbeat is delivered asynchronously; poll briefly.
    let mut body = Value::Null;
    for _ in 0..50 {
        body = get_json(&client, format!("{}/health/jobs", server.base_url)).await;
        if !body["heartbeat"].is_null() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    assert_eq!(body["enabled"], true);
    assert_eq!(body["backend"], "memory");
    assert_eq!(body["heartbeat"]["backend"], "memory");
    assert!(body["heartbeat"]["startedAt"].is_string());
    assert_eq!(body["stale"], false);

    let status = get_json(&client, format!("{}/status/jobs", server.base_url)).await;
    assert_eq!(status["jobs"][HEARTBEAT_JOB]["ok"], true);
}
