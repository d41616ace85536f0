//! Request intake: validation, SSRF checks, idempotency and dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use guard::{mask_url, GuardError, UrlGuard};
use queue::{QueueError, TaskId, TaskQueue, TaskRequest, TaskState};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use store::{IdempotencyStore, ResultStore, StoreError};
use thiserror::Error;
use tracing::{info, warn};

use crate::batch::{BatchArgs, FINALIZE_BATCH_TASK};
use crate::config::OrchestratorConfig;
use crate::jobs::{ExtractionArgs, EXTRACT_TASK};
use crate::metrics::TaskMetrics;

pub const STATUS_SUBMITTED: &str = "submitted";
pub const DUPLICATE_MESSAGE: &str = "Duplicate request — returning existing task";
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 256;
pub const DEFAULT_MODEL: &str = "gpt-4o";
/// Progress reported for ids nobody has picked up yet.
pub const WAITING_MESSAGE: &str = "Task is waiting to be processed";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("{field} rejected: {source}")]
    Blocked {
        field: String,
        #[source]
        source: GuardError,
    },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl GatewayError {
    fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Field the client got wrong, for validation and SSRF failures.
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::Validation { field, .. } | Self::Blocked { field, .. } => Some(field),
            _ => None,
        }
    }
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_passes() -> u32 {
    1
}

/// Body of `POST /extract`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractRequest {
    #[serde(default)]
    pub document_url: Option<String>,
    #[serde(default)]
    pub raw_text: Option<String>,
    #[serde(default = "default_model", alias = "provider")]
    pub model_id: String,
    #[serde(default = "default_passes")]
    pub passes: u32,
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub callback_headers: HashMap<String, String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub extraction_config: Value,
}

impl ExtractRequest {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            document_url: None,
            raw_text: Some(text.into()),
            model_id: default_model(),
            passes: 1,
            callback_url: None,
            callback_headers: HashMap::new(),
            idempotency_key: None,
            extraction_config: Value::Null,
        }
    }

    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            document_url: Some(url.into()),
            raw_text: None,
            ..Self::from_text("")
        }
    }

    fn into_args(self, keep_callback: bool) -> ExtractionArgs {
        ExtractionArgs {
            document_url: self.document_url,
            raw_text: self.raw_text,
            model_id: self.model_id,
            passes: self.passes,
            callback_url: self.callback_url.filter(|_| keep_callback),
            callback_headers: if keep_callback {
                self.callback_headers
            } else {
                HashMap::new()
            },
            extraction_config: self.extraction_config,
        }
    }
}

/// Body of `POST /extract/batch`. Per-document callbacks are dropped in
/// favor of the batch callback; per-document idempotency keys are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub batch_id: String,
    pub documents: Vec<ExtractRequest>,
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub callback_headers: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub task_id: String,
    pub status: String,
    pub message: String,
    /// True when an idempotency hit returned an existing task.
    #[serde(skip)]
    pub duplicate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReceipt {
    pub batch_task_id: String,
    pub document_task_ids: Vec<String>,
    pub status: String,
    pub message: String,
}

/// Task status as shown to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub task_id: String,
    pub state: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Entry point for submissions, status reads and revocation.
#[derive(Clone)]
pub struct Gateway {
    queue: Arc<dyn TaskQueue>,
    guard: UrlGuard,
    idempotency: IdempotencyStore,
    results: ResultStore,
    metrics: Arc<TaskMetrics>,
    config: OrchestratorConfig,
}

impl Gateway {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        guard: UrlGuard,
        idempotency: IdempotencyStore,
        results: ResultStore,
        metrics: Arc<TaskMetrics>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            queue,
            guard,
            idempotency,
            results,
            metrics,
            config,
        }
    }

    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }

    pub fn metrics(&self) -> &Arc<TaskMetrics> {
        &self.metrics
    }

    /// Validate and dispatch one extraction, honoring the idempotency key.
    pub async fn submit(&self, request: ExtractRequest) -> Result<SubmitReceipt, GatewayError> {
        self.validate_document(&request, "").await?;
        if let Some(url) = &request.callback_url {
            self.check_url(url, "callback_url").await?;
        }

        let key = request.idempotency_key.clone();
        if let Some(key) = &key {
            if key.is_empty() || key.chars().count() > MAX_IDEMPOTENCY_KEY_LEN {
                return Err(GatewayError::validation(
                    "idempotency_key",
                    format!("must be 1 to {MAX_IDEMPOTENCY_KEY_LEN} characters"),
                ));
            }
            if let Some(existing) = self.idempotency.lookup(key)? {
                info!(idempotency_key = %key, task_id = %existing, "idempotent_hit");
                return Ok(SubmitReceipt {
                    task_id: existing,
                    status: STATUS_SUBMITTED.into(),
                    message: DUPLICATE_MESSAGE.into(),
                    duplicate: true,
                });
            }
        }

        let args = request.into_args(true);
        let source = args.source().to_string();
        let task_id = self
            .queue
            .enqueue(TaskRequest::new(EXTRACT_TASK, to_args(&args)?))
            .await?;

        if let Some(key) = &key {
            // Losing a concurrent race leaves one harmless extra task.
            match self.idempotency.register(key, task_id.as_str()) {
                Ok(true) => {}
                Ok(false) => {
                    info!(idempotency_key = %key, task_id = %task_id, "idempotency_race_lost")
                }
                Err(err) => {
                    warn!(idempotency_key = %key, task_id = %task_id, error = %err, "idempotency_register_failed")
                }
            }
        }

        self.metrics.record_submitted();
        info!(task_id = %task_id, source = %mask_url(&source), "extraction_submitted");
        Ok(SubmitReceipt {
            task_id: task_id.to_string(),
            status: STATUS_SUBMITTED.into(),
            message: format!("Extraction submitted for {source}"),
            duplicate: false,
        })
    }

    /// Validate every document, fan out one task per document, then schedule
    /// the finalizer. Nothing is dispatched if any document is rejected.
    pub async fn submit_batch(&self, request: BatchRequest) -> Result<BatchReceipt, GatewayError> {
        if request.batch_id.trim().is_empty() {
            return Err(GatewayError::validation("batch_id", "must not be empty"));
        }
        if request.documents.is_empty() {
            return Err(GatewayError::validation(
                "documents",
                "at least one document is required",
            ));
        }
        for (index, document) in request.documents.iter().enumerate() {
            // Only a single submission is deduplicated.
            if document.idempotency_key.is_some() {
                return Err(GatewayError::validation(
                    format!("documents[{index}].idempotency_key"),
                    "not supported for batch documents",
                ));
            }
            self.validate_document(document, &format!("documents[{index}].")).await?;
        }
        if let Some(url) = &request.callback_url {
            self.check_url(url, "callback_url").await?;
        }

        let mut args = Vec::with_capacity(request.documents.len());
        for document in request.documents {
            let doc = document.into_args(false);
            let value = to_args(&doc)?;
            args.push((doc.source().to_string(), value));
        }

        let mut document_task_ids = Vec::with_capacity(args.len());
        let mut sources = Vec::with_capacity(args.len());
        for (source, value) in args {
            match self.queue.enqueue(TaskRequest::new(EXTRACT_TASK, value)).await {
                Ok(task_id) => {
                    document_task_ids.push(task_id.to_string());
                    sources.push(source);
                }
                Err(err) => {
                    self.revoke_orphans(&request.batch_id, &document_task_ids, &err).await;
                    return Err(err.into());
                }
            }
        }

        let count = document_task_ids.len();
        let finalize = BatchArgs {
            batch_id: request.batch_id.clone(),
            document_task_ids: document_task_ids.clone(),
            sources,
            callback_url: request.callback_url,
            callback_headers: request.callback_headers,
        };
        let finalize_request = TaskRequest::new(FINALIZE_BATCH_TASK, to_args(&finalize)?)
            .with_countdown(self.config.batch_initial_delay());
        let batch_task_id = match self.queue.enqueue(finalize_request).await {
            Ok(task_id) => task_id,
            Err(err) => {
                self.revoke_orphans(&request.batch_id, &document_task_ids, &err).await;
                return Err(err.into());
            }
        };

        self.metrics.record_submitted();
        info!(
            batch_id = %request.batch_id,
            batch_task_id = %batch_task_id,
            documents = count,
            "batch_submitted"
        );
        Ok(BatchReceipt {
            batch_task_id: batch_task_id.to_string(),
            document_task_ids,
            status: STATUS_SUBMITTED.into(),
            message: format!(
                "Batch '{}' submitted with {count} document(s)",
                request.batch_id
            ),
        })
    }

    /// Revoke children of a batch whose fan-out failed, so none of them run
    /// without a finalizer.
    async fn revoke_orphans(&self, batch_id: &str, task_ids: &[String], cause: &QueueError) {
        if task_ids.is_empty() {
            return;
        }
        warn!(batch_id, orphaned = ?task_ids, error = %cause, "batch_dispatch_failed");
        for task_id in task_ids {
            if let Err(err) = self.queue.revoke(&TaskId::from(task_id.as_str()), true).await {
                warn!(batch_id, task_id = %task_id, error = %err, "batch_orphan_revoke_failed");
            }
        }
    }

    /// Queue status, then the result store, then a waiting placeholder.
    pub async fn task_status(&self, task_id: &str) -> Result<TaskView, GatewayError> {
        if let Some(status) = self.queue.status(&TaskId::from(task_id)).await? {
            return Ok(TaskView {
                task_id: status.task_id.to_string(),
                state: status.state,
                progress: status.progress,
                result: status.result,
                error: status.error,
            });
        }
        if let Some(result) = self.results.fetch_result(task_id)? {
            return Ok(TaskView {
                task_id: task_id.to_string(),
                state: TaskState::Succeeded,
                progress: None,
                result: Some(result),
                error: None,
            });
        }
        Ok(TaskView {
            task_id: task_id.to_string(),
            state: TaskState::Pending,
            progress: Some(json!({ "status": WAITING_MESSAGE })),
            result: None,
            error: None,
        })
    }

    pub async fn revoke(&self, task_id: &str, terminate: bool) -> Result<(), GatewayError> {
        self.queue.revoke(&TaskId::from(task_id), terminate).await?;
        Ok(())
    }

    async fn validate_document(
        &self,
        request: &ExtractRequest,
        prefix: &str,
    ) -> Result<(), GatewayError> {
        if request.document_url.is_none() && request.raw_text.is_none() {
            return Err(GatewayError::validation(
                format!("{prefix}document_url"),
                "either document_url or raw_text is required",
            ));
        }
        if request.model_id.trim().is_empty() {
            return Err(GatewayError::validation(
                format!("{prefix}model_id"),
                "must not be empty",
            ));
        }
        if !(1..=crate::jobs::MAX_PASSES).contains(&request.passes) {
            return Err(GatewayError::validation(
                format!("{prefix}passes"),
                format!("must be between 1 and {}", crate::jobs::MAX_PASSES),
            ));
        }
        if let Some(url) = &request.document_url {
            self.check_url(url, &format!("{prefix}document_url")).await?;
        }
        Ok(())
    }

    async fn check_url(&self, url: &str, field: &str) -> Result<(), GatewayError> {
        self.guard
            .validate(url, field)
            .await
            .map(|_| ())
            .map_err(|source| {
                warn!(field, url = %mask_url(url), error = %source, "url_rejected");
                GatewayError::Blocked {
                    field: field.to_string(),
                    source,
                }
            })
    }
}

fn to_args<T: Serialize>(args: &T) -> Result<Value, GatewayError> {
    serde_json::to_value(args).map_err(|e| GatewayError::validation("body", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_is_accepted_as_model_alias() {
        let request: ExtractRequest =
            serde_json::from_value(json!({"raw_text": "x", "provider": "claude"})).unwrap();
        assert_eq!(request.model_id, "claude");
        assert_eq!(request.passes, 1);
    }

    #[test]
    fn batch_documents_drop_their_callbacks() {
        let mut request = ExtractRequest::from_url("https://docs.example/a.md");
        request.callback_url = Some("https://hooks.example/doc".into());
        request.callback_headers.insert("Authorization".into(), "x".into());
        let args = request.into_args(false);
        assert!(args.callback_url.is_none());
        assert!(args.callback_headers.is_empty());
        assert_eq!(args.source(), "https://docs.example/a.md");
    }

    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use guard::GuardConfig;
    use queue::{BrokerHealth, BrokerStatus, TaskStatus};

    /// Accepts `capacity` tasks, then reports shutdown.
    struct FailingQueue {
        capacity: usize,
        enqueued: Mutex<Vec<TaskId>>,
        revoked: Mutex<Vec<(TaskId, bool)>>,
    }

    impl FailingQueue {
        fn new(capacity: usize) -> Arc<Self> {
            Arc::new(Self {
                capacity,
                enqueued: Mutex::new(Vec::new()),
                revoked: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl TaskQueue for FailingQueue {
        async fn enqueue(&self, _request: TaskRequest) -> Result<TaskId, QueueError> {
            let mut enqueued = self.enqueued.lock().unwrap();
            if enqueued.len() >= self.capacity {
                return Err(QueueError::ShuttingDown);
            }
            let id = TaskId::new();
            enqueued.push(id.clone());
            Ok(id)
        }

        async fn status(&self, _task_id: &TaskId) -> Result<Option<TaskStatus>, QueueError> {
            Ok(None)
        }

        async fn revoke(&self, task_id: &TaskId, terminate: bool) -> Result<(), QueueError> {
            self.revoked.lock().unwrap().push((task_id.clone(), terminate));
            Ok(())
        }

        async fn set_progress(&self, _task_id: &TaskId, _progress: Value) {}

        async fn ping(&self, _timeout: Duration) -> BrokerHealth {
            BrokerHealth {
                status: BrokerStatus::Healthy,
                message: "ok".into(),
                workers: 1,
                active_tasks: 0,
            }
        }
    }

    fn gateway(queue: Arc<FailingQueue>) -> Gateway {
        let ttl = Duration::from_secs(60);
        Gateway::new(
            queue,
            UrlGuard::new(&GuardConfig::default()),
            IdempotencyStore::in_memory(ttl),
            ResultStore::in_memory(ttl),
            Arc::new(TaskMetrics::new()),
            OrchestratorConfig::default(),
        )
    }

    fn batch(documents: usize) -> BatchRequest {
        BatchRequest {
            batch_id: "b-1".into(),
            documents: (0..documents)
                .map(|i| ExtractRequest::from_text(format!("document {i}")))
                .collect(),
            callback_url: None,
            callback_headers: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn failed_fan_out_revokes_dispatched_children() {
        let queue = FailingQueue::new(2);
        let err = gateway(queue.clone()).submit_batch(batch(3)).await.unwrap_err();
        assert!(matches!(err, GatewayError::Queue(QueueError::ShuttingDown)));

        let enqueued = queue.enqueued.lock().unwrap().clone();
        let revoked = queue.revoked.lock().unwrap().clone();
        assert_eq!(enqueued.len(), 2);
        assert_eq!(
            revoked,
            enqueued.into_iter().map(|id| (id, true)).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn failed_finalizer_revokes_every_child() {
        let queue = FailingQueue::new(2);
        let err = gateway(queue.clone()).submit_batch(batch(2)).await.unwrap_err();
        assert!(matches!(err, GatewayError::Queue(_)));
        assert_eq!(queue.revoked.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn batch_document_idempotency_key_is_rejected() {
        let queue = FailingQueue::new(10);
        let mut request = batch(2);
        request.documents[1].idempotency_key = Some("doc-key".into());

        let err = gateway(queue.clone()).submit_batch(request).await.unwrap_err();
        assert_eq!(err.field(), Some("documents[1].idempotency_key"));
        assert!(queue.enqueued.lock().unwrap().is_empty());
    }

    #[test]
    fn error_field() {
        let err = GatewayError::validation("passes", "too many");
        assert_eq!(err.field(), Some("passes"));
        assert_eq!(err.to_string(), "invalid passes: too many");
    }
}
