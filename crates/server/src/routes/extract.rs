use crate::error::ServerResult;
use crate::state::ServerState;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use docflow::{BatchReceipt, BatchRequest, ExtractRequest, SubmitReceipt};
use std::sync::Arc;

/// Submit a single document for extraction.
///
/// Accepts a `document_url`, `raw_text`, or both (the URL wins). Both the
/// document URL and `callback_url` are screened before anything is queued.
/// Resubmitting with the same `idempotency_key` returns the original task.
pub async fn submit_extraction(
    State(state): State<Arc<ServerState>>,
    body: Result<Json<ExtractRequest>, JsonRejection>,
) -> ServerResult<Json<SubmitReceipt>> {
    let Json(request) = body?;
    let receipt = state.gateway().submit(request).await?;
    Ok(Json(receipt))
}

/// Fan a batch of documents out to individual tasks plus one finalizer that
/// aggregates them and calls the batch callback.
pub async fn submit_batch(
    State(state): State<Arc<ServerState>>,
    body: Result<Json<BatchRequest>, JsonRejection>,
) -> ServerResult<Json<BatchReceipt>> {
    let Json(request) = body?;
    let receipt = state.gateway().submit_batch(request).await?;
    Ok(Json(receipt))
}
