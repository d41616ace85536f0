//! Batch finalization.
//!
//! A batch is fanned out as one extraction task per document. The
//! [`FinalizeBatch`] task then checks the children. While any child is still
//! pending or running it publishes a progress snapshot and asks the queue to
//! run it again after the poll interval, releasing its worker in between.
//! Once every child is terminal, or the poll budget runs out, it aggregates
//! the children's outcomes in document order, stores the batch result and
//! notifies the batch callback once.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use queue::{TaskContext, TaskHandler, TaskId, TaskOutcome, TaskQueue, TaskState};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::jobs::callback_payload;
use crate::orchestrator::Services;

pub const FINALIZE_BATCH_TASK: &str = "finalize_batch";

/// Error recorded for children that never finished.
pub const TIMED_OUT_ERROR: &str = "still running when batch timed out";
pub const UNKNOWN_ERROR: &str = "Unknown error";
pub const REVOKED_ERROR: &str = "task was revoked";

/// Arguments of a [`FINALIZE_BATCH_TASK`] task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchArgs {
    pub batch_id: String,
    /// Child task ids, index-aligned with `sources`.
    pub document_task_ids: Vec<String>,
    pub sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub callback_headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Completed,
    /// The poll budget ran out with children still running.
    TimedOutPartial,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentError {
    pub index: usize,
    pub source: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub status: BatchStatus,
    pub batch_id: String,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<Value>,
    pub errors: Vec<DocumentError>,
    pub document_task_ids: Vec<String>,
}

/// What a child task reported.
#[derive(Debug, Clone, PartialEq)]
pub enum ChildOutcome {
    Succeeded(Value),
    Failed(Option<String>),
    Revoked,
    /// Pending or running.
    Unfinished,
}

impl ChildOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Unfinished)
    }
}

/// Fold child outcomes into a batch result. `outcomes` and `sources` are
/// index-aligned with `document_task_ids`.
pub fn aggregate(
    batch_id: &str,
    document_task_ids: &[String],
    sources: &[String],
    outcomes: Vec<ChildOutcome>,
) -> BatchResult {
    let mut results = Vec::new();
    let mut errors = Vec::new();
    let mut timed_out = false;

    for (index, (outcome, source)) in outcomes.into_iter().zip(sources).enumerate() {
        let error = match outcome {
            ChildOutcome::Succeeded(result) => {
                results.push(result);
                continue;
            }
            ChildOutcome::Failed(error) => error.unwrap_or_else(|| UNKNOWN_ERROR.to_string()),
            ChildOutcome::Revoked => REVOKED_ERROR.to_string(),
            ChildOutcome::Unfinished => {
                timed_out = true;
                TIMED_OUT_ERROR.to_string()
            }
        };
        errors.push(DocumentError {
            index,
            source: source.clone(),
            error,
        });
    }

    BatchResult {
        status: if timed_out {
            BatchStatus::TimedOutPartial
        } else {
            BatchStatus::Completed
        },
        batch_id: batch_id.to_string(),
        total: document_task_ids.len(),
        successful: results.len(),
        failed: errors.len(),
        results,
        errors,
        document_task_ids: document_task_ids.to_vec(),
    }
}

pub struct FinalizeBatch {
    services: Services,
    poll_interval: Duration,
    poll_budget: u32,
}

impl FinalizeBatch {
    pub fn new(services: Services, config: &OrchestratorConfig) -> Self {
        Self {
            services,
            poll_interval: config.batch_poll_interval(),
            poll_budget: config.batch_poll_budget,
        }
    }

    async fn child_outcome(&self, queue: &dyn TaskQueue, task_id: &str) -> ChildOutcome {
        match queue.status(&TaskId::from(task_id)).await {
            Ok(Some(status)) => match status.state {
                TaskState::Succeeded => ChildOutcome::Succeeded(status.result.unwrap_or(Value::Null)),
                TaskState::Failed => ChildOutcome::Failed(status.error),
                TaskState::Revoked => ChildOutcome::Revoked,
                TaskState::Pending | TaskState::Running => ChildOutcome::Unfinished,
            },
            // Queue bookkeeping expired; the stored result is authoritative.
            Ok(None) => match self.services.results.fetch_result(task_id) {
                Ok(Some(result)) => ChildOutcome::Succeeded(result),
                _ => ChildOutcome::Unfinished,
            },
            Err(err) => {
                warn!(task_id, error = %err, "batch_child_status_failed");
                ChildOutcome::Unfinished
            }
        }
    }
}

#[async_trait]
impl TaskHandler for FinalizeBatch {
    fn name(&self) -> &'static str {
        FINALIZE_BATCH_TASK
    }

    fn max_retries(&self) -> u32 {
        self.poll_budget
    }

    async fn execute(&self, ctx: TaskContext, args: Value) -> TaskOutcome {
        let args: BatchArgs = match serde_json::from_value(args) {
            Ok(args) => args,
            Err(err) => return TaskOutcome::Failed(format!("invalid batch arguments: {err}")),
        };
        if args.sources.len() != args.document_task_ids.len() {
            return TaskOutcome::Failed(format!(
                "batch {} has {} task ids but {} sources",
                args.batch_id,
                args.document_task_ids.len(),
                args.sources.len()
            ));
        }

        let mut outcomes = Vec::with_capacity(args.document_task_ids.len());
        for task_id in &args.document_task_ids {
            outcomes.push(self.child_outcome(ctx.queue().as_ref(), task_id).await);
        }

        let total = outcomes.len();
        let completed = outcomes.iter().filter(|o| o.is_terminal()).count();
        if completed < total {
            metrics::counter!("docflow_batch_polls_total").increment(1);
            ctx.report_progress(json!({
                "batch_id": args.batch_id,
                "document_task_ids": args.document_task_ids,
                "total": total,
                "completed": completed,
            }))
            .await;

            if !ctx.is_final_attempt() {
                return TaskOutcome::RetryRequested {
                    delay: self.poll_interval,
                    reason: format!("{completed} of {total} documents finished"),
                };
            }
            warn!(
                batch_id = %args.batch_id,
                polls = ctx.attempt + 1,
                completed,
                total,
                "batch_timed_out_partial"
            );
        }

        let batch = aggregate(
            &args.batch_id,
            &args.document_task_ids,
            &args.sources,
            outcomes,
        );
        let result = match serde_json::to_value(&batch) {
            Ok(result) => result,
            Err(err) => return TaskOutcome::Failed(format!("could not encode batch result: {err}")),
        };

        let task_id = ctx.task_id.as_str();
        if let Err(err) = self.services.results.store_result(task_id, &result) {
            warn!(task_id, batch_id = %args.batch_id, error = %err, "result_persist_failed");
        }
        if let Some(url) = &args.callback_url {
            self.services
                .webhooks
                .deliver(url, &callback_payload(task_id, &result), &args.callback_headers)
                .await;
        }

        info!(
            task_id,
            batch_id = %batch.batch_id,
            total = batch.total,
            successful = batch.successful,
            failed = batch.failed,
            polls = ctx.attempt + 1,
            "batch_finalized"
        );
        TaskOutcome::Completed(result)
    }
}
