//! HTTP surface.
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `POST /ping` | Client heartbeat: header `x-client-id`, body `{"time": <epoch ms>}` |
//! | `GET /status` | Worker snapshots |
//! | `POST /workers/{identity}/restart` | Operator-initiated restart |
//! | `GET /metrics` | Prometheus text format (unless disabled) |
//!
//! `/ping` always answers `200 OK`, whatever happened to the sample, and
//! never waits for a restart it triggers.

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chrono::Utc;
use relayctl_core::controller::ControllerError;
use relayctl_core::restart::LifecycleError;
use relayctl_core::worker::WorkerSnapshot;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info};

use crate::state::SharedState;

/// Header carrying the client key.
pub const CLIENT_ID_HEADER: &str = "x-client-id";

/// Outcome label for bodies that are not `{"time": <i64>}`.
pub const MALFORMED_BODY: &str = "malformed_body";

#[derive(Debug, Deserialize)]
struct PingBody {
    time: i64,
}

#[derive(Debug, Serialize)]
struct StatusBody {
    uptime_secs: u64,
    shutting_down: bool,
    workers: Vec<WorkerSnapshot>,
}

/// Builds the router.
pub fn router(state: SharedState) -> Router {
    let mut router = Router::new()
        .route(
            "/",
            get(|| async {
                "relayctl-daemon\n\n\
                 POST /ping                        - client heartbeat\n\
                 GET  /status                      - worker status\n\
                 POST /workers/{identity}/restart  - restart a worker\n\
                 GET  /metrics                     - Prometheus metrics\n"
            }),
        )
        .route("/ping", post(ping))
        .route("/status", get(status))
        .route("/workers/{identity}/restart", post(restart_worker));
    if state.metrics().is_some() {
        router = router.route("/metrics", get(metrics));
    }
    router.with_state(state)
}

async fn ping(State(state): State<SharedState>, headers: HeaderMap, body: Bytes) -> &'static str {
    let server_now_ms = Utc::now().timestamp_millis();
    let client_key = headers
        .get(CLIENT_ID_HEADER)
        .and_then(|value| value.to_str().ok());

    let label = match serde_json::from_slice::<PingBody>(&body) {
        Ok(ping) => {
            state
                .controller()
                .handle_ping(client_key, ping.time, server_now_ms)
                .await
                .label()
        },
        Err(e) => {
            debug!(error = %e, "malformed ping body");
            MALFORMED_BODY
        },
    };

    if let Some(metrics) = state.metrics() {
        metrics.metrics().ping_received(label);
    }
    "OK"
}

async fn status(State(state): State<SharedState>) -> Response {
    let body = StatusBody {
        uptime_secs: state.uptime_secs(),
        shutting_down: state.is_shutdown_requested(),
        workers: state.controller().snapshot().await,
    };
    axum::Json(body).into_response()
}

async fn restart_worker(
    State(state): State<SharedState>,
    Path(identity): Path<String>,
) -> Response {
    if state.is_shutdown_requested() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "shutting down");
    }

    match state.controller().restart_worker(&identity).await {
        Ok(_task) => {
            info!(worker = %identity, "restart accepted");
            (
                StatusCode::ACCEPTED,
                axum::Json(json!({ "identity": identity, "state": "restarting" })),
            )
                .into_response()
        },
        Err(e @ ControllerError::UnknownWorker(_)) => {
            error_response(StatusCode::NOT_FOUND, &e.to_string())
        },
        Err(e @ ControllerError::Lifecycle(LifecycleError::AlreadyRestarting(_))) => {
            error_response(StatusCode::CONFLICT, &e.to_string())
        },
        Err(ControllerError::Lifecycle(LifecycleError::ShuttingDown)) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "shutting down")
        },
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn metrics(State(state): State<SharedState>) -> Response {
    let Some(registry) = state.metrics() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    registry
        .metrics()
        .observe_workers(&state.controller().snapshot().await);

    match registry.encode_text() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {e}"),
            )
                .into_response()
        },
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, axum::Json(json!({ "error": message }))).into_response()
}
