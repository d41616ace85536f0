//! API route handlers
//!
//! - `extract`: single and batch extraction submission
//! - `tasks`: task status and revocation
//! - `health`: liveness, broker readiness and metrics

pub mod extract;
pub mod health;
pub mod tasks;

use crate::error::ServerError;
use crate::state::ServerState;
use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;

/// API version and base info
///
/// # Response
///
/// ```json
/// {
///   "name": "docflow",
///   "version": "0.1.0",
///   "endpoints": ["..."]
/// }
/// ```
pub async fn api_info(State(state): State<Arc<ServerState>>) -> Json<Value> {
    let prefix = state.config.api_prefix.trim_end_matches('/');
    let endpoints: Vec<String> = [
        ("POST", "/extract"),
        ("POST", "/extract/batch"),
        ("GET", "/tasks/{task_id}"),
        ("DELETE", "/tasks/{task_id}"),
        ("GET", "/health"),
        ("GET", "/health/broker"),
        ("GET", "/metrics"),
    ]
    .iter()
    .map(|(method, path)| format!("{method} {prefix}{path}"))
    .collect();

    Json(json!({
        "name": "docflow",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": endpoints,
    }))
}

/// 404 Not Found handler
pub async fn not_found() -> ServerError {
    ServerError::NotFound
}
