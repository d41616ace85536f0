//! Single-document extraction task.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fetch::FetchError;
use queue::{TaskContext, TaskHandler, TaskOutcome};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::OrchestratorConfig;
use crate::extractor::{ExtractError, ExtractionCall};
use crate::orchestrator::Services;

pub const EXTRACT_TASK: &str = "extract_document";

/// Label used for documents submitted as raw text.
pub const RAW_TEXT_SOURCE: &str = "<raw_text>";

pub const MAX_PASSES: u32 = 5;

/// Arguments of an [`EXTRACT_TASK`] task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_text: Option<String>,
    pub model_id: String,
    #[serde(default = "default_passes")]
    pub passes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub callback_headers: HashMap<String, String>,
    #[serde(default)]
    pub extraction_config: Value,
}

fn default_passes() -> u32 {
    1
}

impl ExtractionArgs {
    /// Document URL, or [`RAW_TEXT_SOURCE`] for inline text.
    pub fn source(&self) -> &str {
        self.document_url.as_deref().unwrap_or(RAW_TEXT_SOURCE)
    }

    /// Returns the offending field and a message.
    pub fn validate(&self) -> Result<(), (&'static str, String)> {
        if self.document_url.is_none() && self.raw_text.is_none() {
            return Err((
                "document_url",
                "either document_url or raw_text is required".into(),
            ));
        }
        if self.model_id.trim().is_empty() {
            return Err(("model_id", "model_id must not be empty".into()));
        }
        if !(1..=MAX_PASSES).contains(&self.passes) {
            return Err((
                "passes",
                format!("passes must be between 1 and {MAX_PASSES}"),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid task arguments: {0}")]
    InvalidArgs(String),

    #[error("download failed: {0}")]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Extract(#[from] ExtractError),
}

impl JobError {
    /// Worth another attempt after the retry delay.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::InvalidArgs(_) => false,
            Self::Extract(err) => err.is_transient(),
            Self::Fetch(err) => match err {
                FetchError::Timeout | FetchError::Transport(_) => true,
                FetchError::HttpStatus(status) => *status == 429 || *status >= 500,
                _ => false,
            },
        }
    }
}

/// `result` with `task_id` added, as sent to callbacks.
pub fn callback_payload(task_id: &str, result: &Value) -> Value {
    let mut payload = serde_json::Map::new();
    payload.insert("task_id".into(), Value::String(task_id.to_string()));
    if let Value::Object(fields) = result {
        for (key, value) in fields {
            payload.insert(key.clone(), value.clone());
        }
    }
    Value::Object(payload)
}

/// Downloads or takes the document text, runs the extractor once per pass,
/// stores the result and notifies the callback.
pub struct ExtractDocument {
    services: Services,
    max_retries: u32,
    retry_delay: Duration,
}

impl ExtractDocument {
    pub fn new(services: Services, config: &OrchestratorConfig) -> Self {
        Self {
            services,
            max_retries: config.task_max_retries,
            retry_delay: config.task_retry_delay(),
        }
    }

    async fn run(&self, ctx: &TaskContext, args: &ExtractionArgs) -> Result<Value, JobError> {
        let start = Instant::now();
        ctx.report_progress(json!({ "step": "downloading", "progress": 10 }))
            .await;

        let text = match (&args.document_url, &args.raw_text) {
            (Some(url), _) => self.services.fetcher.fetch(url).await?,
            (None, Some(text)) => text.clone(),
            (None, None) => {
                return Err(JobError::InvalidArgs(
                    "either document_url or raw_text is required".into(),
                ))
            }
        };

        let mut entities = Vec::new();
        let mut seen = HashSet::new();
        let mut tokens_used = 0u64;
        let mut provider = args.model_id.clone();
        for pass in 0..args.passes {
            let progress = 10 + 70 * pass / args.passes;
            ctx.report_progress(json!({
                "step": "extracting",
                "progress": progress,
                "pass": pass + 1,
                "passes": args.passes,
            }))
            .await;

            let extraction = self
                .services
                .extractor
                .extract(ExtractionCall {
                    model_id: args.model_id.clone(),
                    text: text.clone(),
                    config: args.extraction_config.clone(),
                })
                .await?;
            tokens_used += extraction.tokens_used;
            provider = extraction.provider;
            for entity in extraction.entities {
                let (class, text) = entity.key();
                if seen.insert((class.to_string(), text.to_string())) {
                    entities.push(entity);
                }
            }
        }

        ctx.report_progress(json!({ "step": "post_processing", "progress": 90 }))
            .await;

        Ok(json!({
            "status": "completed",
            "source": args.source(),
            "data": {
                "entities": entities,
                "metadata": {
                    "provider": provider,
                    "tokens_used": tokens_used,
                    "processing_time_ms": start.elapsed().as_millis() as u64,
                    "passes": args.passes,
                },
            },
        }))
    }
}

#[async_trait]
impl TaskHandler for ExtractDocument {
    fn name(&self) -> &'static str {
        EXTRACT_TASK
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }

    async fn execute(&self, ctx: TaskContext, args: Value) -> TaskOutcome {
        let args: ExtractionArgs = match serde_json::from_value(args) {
            Ok(args) => args,
            Err(err) => return TaskOutcome::Failed(format!("invalid task arguments: {err}")),
        };
        if let Err((field, message)) = args.validate() {
            return TaskOutcome::Failed(format!("invalid task arguments: {field}: {message}"));
        }

        let start = Instant::now();
        let source = fetch_label(&args);
        match self.run(&ctx, &args).await {
            Ok(result) => {
                let task_id = ctx.task_id.as_str();
                if let Err(err) = self.services.results.store_result(task_id, &result) {
                    warn!(task_id, error = %err, "result_persist_failed");
                }
                if let Some(url) = &args.callback_url {
                    self.services
                        .webhooks
                        .deliver(url, &callback_payload(task_id, &result), &args.callback_headers)
                        .await;
                }
                self.services.metrics.record_completed(true, start.elapsed());
                info!(
                    task_id,
                    source = %source,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "extraction_completed"
                );
                TaskOutcome::Completed(result)
            }
            Err(err) if err.is_transient() && !ctx.is_final_attempt() => {
                warn!(
                    task_id = %ctx.task_id,
                    source = %source,
                    attempt = ctx.attempt + 1,
                    max_attempts = ctx.max_retries + 1,
                    error = %err,
                    "extraction_retry"
                );
                TaskOutcome::RetryRequested {
                    delay: self.retry_delay,
                    reason: err.to_string(),
                }
            }
            Err(err) => {
                self.services.metrics.record_completed(false, start.elapsed());
                error!(
                    task_id = %ctx.task_id,
                    source = %source,
                    attempt = ctx.attempt + 1,
                    error = %err,
                    "extraction_failed"
                );
                TaskOutcome::Failed(err.to_string())
            }
        }
    }
}

fn fetch_label(args: &ExtractionArgs) -> String {
    args.document_url
        .as_deref()
        .map(guard::mask_url)
        .unwrap_or_else(|| RAW_TEXT_SOURCE.to_string())
}
