//! HTTP surface tests against an in-memory worker runtime.

#![allow(clippy::float_cmp)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use chrono::Utc;
use relayctl_core::Controller;
use relayctl_core::config::Settings;
use relayctl_core::process::{LaunchSpec, ProcessError, ProcessHandle, WorkerRuntime};
use relayctl_core::restart::RestartListener;
use relayctl_daemon::http::router;
use relayctl_daemon::metrics::{SharedMetricsRegistry, new_shared_registry};
use relayctl_daemon::state::{DaemonStateHandle, SharedState};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

#[derive(Default)]
struct MemoryRuntime {
    starts: AtomicUsize,
}

#[async_trait]
impl WorkerRuntime for MemoryRuntime {
    async fn start(&self, launch: LaunchSpec) -> Result<ProcessHandle, ProcessError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(ProcessHandle::detached(launch.name, launch.port))
    }

    async fn stop(&self, _handle: ProcessHandle) -> Result<(), ProcessError> {
        Ok(())
    }

    async fn is_port_free(&self, _port: u16) -> bool {
        true
    }
}

struct App {
    _dir: TempDir,
    state: SharedState,
    metrics: SharedMetricsRegistry,
    router: Router,
}

async fn app() -> App {
    let dir = TempDir::new().unwrap();
    let template = dir.path().join("srt.base.conf");
    std::fs::write(&template, "peerlatency RTT_HERE;\n").unwrap();

    let settings = Settings::from_toml(&format!(
        r#"
[controller]
template_path = {template:?}
config_dir = {out:?}
variance_threshold = 0.5

[[workers]]
identity = "relay-a"
port = 10080
client_key = "key-a"

[[workers]]
identity = "relay-b"
port = 10081
client_key = "key-b"
"#,
        out = dir.path().join("out"),
    ))
    .unwrap();

    let metrics = new_shared_registry().unwrap();
    let listener: Arc<dyn RestartListener> = Arc::new(metrics.metrics().clone());
    let controller = Controller::from_settings(
        &settings,
        Arc::new(MemoryRuntime::default()),
        listener,
    )
    .unwrap();
    controller.boot().await.unwrap();

    let state: SharedState = Arc::new(DaemonStateHandle::new(
        controller,
        Some(Arc::clone(&metrics)),
    ));
    App {
        _dir: dir,
        router: router(Arc::clone(&state)),
        state,
        metrics,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, String) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

fn ping(key: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/ping")
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header("x-client-id", key);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn ping_now(key: &str, latency_ms: i64) -> Request<Body> {
    let time = Utc::now().timestamp_millis() - latency_ms;
    ping(Some(key), &format!(r#"{{"time": {time}}}"#))
}

#[tokio::test]
async fn test_ping_always_answers_ok() {
    let app = app().await;

    for request in [
        ping_now("key-a", 20),
        ping(None, r#"{"time": 0}"#),
        ping(Some("nobody"), r#"{"time": 0}"#),
        ping(Some("key-a"), "not json"),
        ping(Some("key-a"), r#"{"time": "yesterday"}"#),
        ping(Some("key-a"), r#"{"time": 99999999999999}"#),
    ] {
        let (status, body) = send(&app.router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
    }

    let metrics = app.metrics.metrics();
    assert_eq!(metrics.ping_count("missing_client_key"), 1.0);
    assert_eq!(metrics.ping_count("unknown_client"), 1.0);
    assert_eq!(metrics.ping_count("malformed_body"), 2.0);
    assert_eq!(metrics.ping_count("invalid_sample"), 1.0);

    let snapshot = app.state.controller().snapshot().await;
    assert_eq!(snapshot[0].samples, 1);
    assert_eq!(snapshot[1].samples, 0);
}

#[tokio::test]
async fn test_status_lists_workers() {
    let app = app().await;
    let request = Request::builder()
        .uri("/status")
        .body(Body::empty())
        .unwrap();

    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);

    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["shutting_down"], false);
    let workers = json["workers"].as_array().unwrap();
    assert_eq!(workers.len(), 2);
    assert_eq!(workers[0]["identity"], "relay-a");
    assert_eq!(workers[0]["state"], "running");
    assert_eq!(workers[0]["active_rtt_ms"], 120);
    assert!(!body.contains("key-a"));
}

#[tokio::test]
async fn test_operator_restart() {
    let app = app().await;
    let restart = |identity: &str| {
        Request::builder()
            .method("POST")
            .uri(format!("/workers/{identity}/restart"))
            .body(Body::empty())
            .unwrap()
    };

    let (status, body) = send(&app.router, restart("relay-x")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body.contains("relay-x"));

    let (status, _) = send(&app.router, restart("relay-b")).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    app.state.request_shutdown();
    let (status, _) = send(&app.router, restart("relay-b")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let app = app().await;
    send(&app.router, ping_now("key-b", 30)).await;

    let request = Request::builder()
        .uri("/metrics")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("relayctl_ping_samples_total"));
    assert!(body.contains("relayctl_worker_active_rtt_ms{worker=\"relay-a\"} 120"));
    assert!(body.contains("relayctl_worker_average_ping_ms{worker=\"relay-b\"}"));
}

#[tokio::test]
async fn test_metrics_route_absent_when_disabled() {
    let app = app().await;
    let state: SharedState = Arc::new(DaemonStateHandle::new(
        Controller::new(
            relayctl_core::WorkerRegistry::new(3),
            app.state.controller().orchestrator().clone(),
        ),
        None,
    ));

    let request = Request::builder()
        .uri("/metrics")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&router(state), request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
