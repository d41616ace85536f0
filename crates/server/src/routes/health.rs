use crate::state::ServerState;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::Json;
use queue::BrokerStatus;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Upper bound on the broker readiness probe.
pub const BROKER_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Global server start time for uptime calculation
static SERVER_START_TIME: once_cell::sync::Lazy<SystemTime> =
    once_cell::sync::Lazy::new(SystemTime::now);

#[derive(Debug, Serialize, Deserialize)]
pub struct BrokerHealthResponse {
    pub status: BrokerStatus,
    pub message: String,
    pub workers: usize,
}

/// Health check endpoint (liveness)
pub async fn health_check() -> impl IntoResponse {
    let uptime = SERVER_START_TIME
        .elapsed()
        .map(|d| d.as_secs())
        .unwrap_or(0);

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": uptime,
    }))
}

/// Worker pool readiness. Answers within [`BROKER_PING_TIMEOUT`], reporting
/// `degraded` instead of blocking when the pool does not respond.
pub async fn broker_health(State(state): State<Arc<ServerState>>) -> Json<BrokerHealthResponse> {
    let health = state.gateway().queue().ping(BROKER_PING_TIMEOUT).await;
    if health.status != BrokerStatus::Healthy {
        tracing::warn!(status = ?health.status, message = %health.message, "broker_not_healthy");
    }

    Json(BrokerHealthResponse {
        status: health.status,
        message: health.message,
        workers: health.workers,
    })
}

/// Prometheus metrics endpoint: task counters, then everything recorded
/// through the `metrics` facade when a recorder is installed.
pub async fn metrics(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let mut body = state.orchestrator.metrics().render_prometheus();
    if let Some(handle) = &state.prometheus {
        body.push_str(&handle.render());
    }

    ([(CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn health_check_is_ok() {
        let response = tokio_test::block_on(health_check()).into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn broker_response_serializes_lowercase_status() {
        let body = serde_json::to_value(BrokerHealthResponse {
            status: BrokerStatus::Degraded,
            message: "probe timed out".into(),
            workers: 0,
        })
        .unwrap();
        assert_eq!(body["status"], "degraded");
    }
}
