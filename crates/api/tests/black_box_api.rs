use std::sync::{Mutex, mpsc};

use chrono::{Duration as ChronoDuration, Utc};
use jobctl_core::{ExecutionMode, JobContext, LaunchConfig, Record, UnitError, UnitOutcome};
use jobctl_infra::{ControlConfig, ControlPlane, UnitWork};
use reqwest::StatusCode;

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn(plane: ControlPlane) -> Self {
        // Same router as prod, bound to an ephemeral port.
        let app = jobctl_api::app::build_app(plane);
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

fn plane() -> ControlPlane {
    ControlPlane::in_memory(ControlConfig::default())
}

/// A unit that parks until the returned sender fires or is dropped.
fn parked() -> (UnitWork, mpsc::Sender<()>) {
    let (tx, rx) = mpsc::channel::<()>();
    let rx = Mutex::new(rx);
    let work = UnitWork::standalone(
        move |_: &[Record], _: &JobContext| -> Result<UnitOutcome, UnitError> {
            if let Ok(rx) = rx.lock() {
                let _ = rx.recv();
            }
            Ok(UnitOutcome::processed(0))
        },
    );
    (work, tx)
}

#[tokio::test(flavor = "multi_thread")]
async fn health_is_public_and_ok() {
    let srv = TestServer::spawn(plane()).await;

    let res = reqwest::get(format!("{}/health", srv.base_url)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_plane_reports_no_active_jobs() {
    let srv = TestServer::spawn(plane()).await;
    let client = reqwest::Client::new();

    let res = client.get(format!("{}/jobs", srv.base_url)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let jobs: serde_json::Value = res.json().await.unwrap();
    assert_eq!(jobs, serde_json::json!([]));

    let res = client.get(format!("{}/stats", srv.base_url)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let stats: serde_json::Value = res.json().await.unwrap();
    assert_eq!(stats["jobs"]["total"], 0);
    assert_eq!(stats["budget"]["ceiling"], 5);
    assert_eq!(stats["budget"]["in_use"], 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_and_malformed_job_ids_are_rejected() {
    let srv = TestServer::spawn(plane()).await;
    let client = reqwest::Client::new();
    let missing = jobctl_core::JobId::new();

    let res = client
        .post(format!("{}/jobs/{}/cancel", srv.base_url, missing))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "not_found");

    let res = client
        .get(format!("{}/jobs/{}/progress", srv.base_url, missing))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client
        .get(format!("{}/jobs/not-a-uuid", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_job_id");
}

#[tokio::test(flavor = "multi_thread")]
async fn running_job_is_listed_then_cancelled_once() {
    let plane = plane();
    let (work, release) = parked();
    let record = plane
        .dispatch("reports.nightly", work, ExecutionMode::SingleShot, LaunchConfig::default())
        .expect("dispatch");
    let srv = TestServer::spawn(plane).await;
    let client = reqwest::Client::new();

    let jobs: serde_json::Value = client
        .get(format!("{}/jobs", srv.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let jobs = jobs.as_array().expect("array");
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["id"], record.id.to_string());
    assert_eq!(jobs[0]["logical_name"], "reports.nightly");
    assert_eq!(jobs[0]["mode"], "single_shot");

    let progress: serde_json::Value = client
        .get(format!("{}/jobs/{}/progress", srv.base_url, record.id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(progress["progress"], 0.0);

    let res = client
        .post(format!("{}/jobs/{}/cancel", srv.base_url, record.id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["cancelled"], true);

    // Second request is a no-op.
    let body: serde_json::Value = client
        .post(format!("{}/jobs/{}/cancel", srv.base_url, record.id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["cancelled"], false);

    let job: serde_json::Value = client
        .get(format!("{}/jobs/{}", srv.base_url, record.id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(job["status"], "aborted");
    assert_eq!(job["reason"], "cancelled by operator");

    let active: serde_json::Value = client
        .get(format!("{}/jobs", srv.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(active, serde_json::json!([]));

    let _ = release.send(());
}

#[tokio::test(flavor = "multi_thread")]
async fn history_lists_runs_and_honours_since() {
    let plane = plane();
    let (work, release) = parked();
    let record = plane
        .dispatch("exports.daily", work, ExecutionMode::SingleShot, LaunchConfig::default())
        .expect("dispatch");
    let srv = TestServer::spawn(plane).await;
    let client = reqwest::Client::new();

    let runs: serde_json::Value = client
        .get(format!("{}/history/exports.daily", srv.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let runs = runs.as_array().expect("array");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0]["id"], record.id.to_string());

    let future = (Utc::now() + ChronoDuration::hours(1)).to_rfc3339();
    let res = client
        .get(format!("{}/history/exports.daily", srv.base_url))
        .query(&[("since", future)])
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let runs: serde_json::Value = res.json().await.unwrap();
    assert_eq!(runs, serde_json::json!([]));

    let runs: serde_json::Value = client
        .get(format!("{}/history/unknown.job", srv.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(runs, serde_json::json!([]));

    let _ = release.send(());
}

#[tokio::test(flavor = "multi_thread")]
async fn stream_emits_active_job_snapshots() {
    let srv = TestServer::spawn(plane()).await;
    let client = reqwest::Client::new();

    let mut res = client
        .get(format!("{}/jobs/stream", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(
        res.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );

    let first = tokio::time::timeout(std::time::Duration::from_secs(5), res.chunk())
        .await
        .expect("first event in time")
        .unwrap()
        .expect("stream open");
    let text = String::from_utf8_lossy(&first);
    assert!(text.contains("event: active_jobs"), "got {text}");
}
