//! Asynchronous document-extraction job orchestration.
//!
//! This crate stitches the pipeline crates together behind one entry point:
//!
//! - [`Gateway`] validates submissions, screens every outbound URL through
//!   the SSRF guard, deduplicates by idempotency key and dispatches tasks.
//! - [`ExtractDocument`] is the worker side of a single extraction: safe
//!   download, one extractor call per pass, result persistence and a signed
//!   callback.
//! - [`FinalizeBatch`] aggregates a fanned-out batch by polling its children
//!   without holding a worker between polls.
//! - [`TaskMetrics`] keeps the process-wide task counters.
//!
//! [`Orchestrator`] wires all of it onto an in-process worker pool.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use docflow::{ExtractRequest, NullExtractor, Orchestrator, OrchestratorConfig, Services, TaskMetrics};
//! use fetch::{DownloadPolicy, SafeFetcher};
//! use guard::{GuardConfig, UrlGuard};
//! use queue::QueueConfig;
//! use store::{IdempotencyStore, ResultStore};
//! use webhook::{WebhookConfig, WebhookDispatcher};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = OrchestratorConfig::default();
//! let guard = UrlGuard::new(&GuardConfig::default());
//! let results = ResultStore::in_memory(config.result_ttl());
//! let services = Services {
//!     fetcher: Arc::new(SafeFetcher::new(guard.clone(), DownloadPolicy::default())?),
//!     extractor: Arc::new(NullExtractor),
//!     results: results.clone(),
//!     webhooks: Arc::new(WebhookDispatcher::new(guard.clone(), WebhookConfig::default())?),
//!     metrics: TaskMetrics::global(),
//! };
//! let idempotency = IdempotencyStore::new(results.backend(), config.result_ttl());
//! let orchestrator = Orchestrator::start(config, QueueConfig::default(), guard, services, idempotency)?;
//!
//! let receipt = orchestrator.gateway().submit(ExtractRequest::from_text("Acme Corp")).await?;
//! tokio::time::sleep(Duration::from_millis(50)).await;
//! let view = orchestrator.gateway().task_status(&receipt.task_id).await?;
//! println!("{:?}", view.state);
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod config;
pub mod extractor;
pub mod gateway;
pub mod jobs;
pub mod metrics;
pub mod orchestrator;
pub mod pipeline;

pub use crate::batch::{
    aggregate, BatchArgs, BatchResult, BatchStatus, ChildOutcome, DocumentError, FinalizeBatch,
    FINALIZE_BATCH_TASK,
};
pub use crate::config::{ConfigError, OrchestratorConfig};
pub use crate::extractor::{
    Entity, ExtractError, Extraction, ExtractionCall, Extractor, NullExtractor,
};
pub use crate::gateway::{
    BatchReceipt, BatchRequest, ExtractRequest, Gateway, GatewayError, SubmitReceipt, TaskView,
};
pub use crate::jobs::{ExtractDocument, ExtractionArgs, JobError, EXTRACT_TASK, RAW_TEXT_SOURCE};
pub use crate::metrics::{MetricsSnapshot, TaskMetrics};
pub use crate::orchestrator::{task_registry, Orchestrator, Services};
pub use crate::pipeline::{compose, LayerSpec, ModelCall, ModelResponse, PipelineExtractor};
