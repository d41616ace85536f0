use crate::error::ServerResult;
use crate::state::ServerState;
use axum::extract::{Path, Query, State};
use axum::Json;
use docflow::TaskView;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Default, Deserialize)]
pub struct RevokeParams {
    #[serde(default)]
    pub terminate: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RevokeResponse {
    pub task_id: String,
    pub status: String,
    pub message: String,
}

/// Current state of a task. Ids the queue has never seen read as pending.
pub async fn get_task(
    State(state): State<Arc<ServerState>>,
    Path(task_id): Path<String>,
) -> ServerResult<Json<TaskView>> {
    let view = state.gateway().task_status(&task_id).await?;
    Ok(Json(view))
}

/// Revoke a pending or running task. `terminate=true` also cancels a task
/// that is already executing.
pub async fn revoke_task(
    State(state): State<Arc<ServerState>>,
    Path(task_id): Path<String>,
    Query(params): Query<RevokeParams>,
) -> ServerResult<Json<RevokeResponse>> {
    state.gateway().revoke(&task_id, params.terminate).await?;
    tracing::info!(task_id = %task_id, terminate = params.terminate, "task_revoked");

    Ok(Json(RevokeResponse {
        task_id,
        status: "revoked".to_string(),
        message: format!(
            "Task revocation signal sent (terminate={})",
            params.terminate
        ),
    }))
}
