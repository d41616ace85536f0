//! Docflow Task Queue
//!
//! The broker abstraction the orchestration layer runs on. Producers hand a
//! [`TaskRequest`] to a [`TaskQueue`]; workers run the matching
//! [`TaskHandler`] and record a [`TaskStatus`] per task id.
//!
//! Handlers never raise to signal a retry. They return a [`TaskOutcome`]:
//!
//! - `Completed(value)` finishes the task with a result.
//! - `Failed(error)` finishes it with an error.
//! - `RetryRequested { delay, .. }` puts it back on the queue after `delay`
//!   with the attempt counter incremented, without holding a worker while
//!   waiting. When the handler's retry budget is spent the task fails.
//!
//! [`InMemoryQueue`] is the in-process implementation: a pool of tokio
//! workers draining one channel, timers for delayed work, and a
//! cancellation token per running task for revocation.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

mod error;
mod memory;
mod state;
mod task;

pub use crate::error::QueueError;
pub use crate::memory::{InMemoryQueue, QueueConfig};
pub use crate::state::{TaskState, TaskStatus};
pub use crate::task::{TaskContext, TaskHandler, TaskId, TaskOutcome, TaskRegistry, TaskRequest};

/// Broker readiness as seen by a bounded probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerStatus {
    Healthy,
    /// The probe did not answer within its timeout.
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerHealth {
    pub status: BrokerStatus,
    pub message: String,
    pub workers: usize,
    pub active_tasks: usize,
}

/// Task submission, status and control.
#[async_trait]
pub trait TaskQueue: Send + Sync + 'static {
    /// Register the task as pending and schedule it. Returns its id.
    async fn enqueue(&self, request: TaskRequest) -> Result<TaskId, QueueError>;

    /// Current status, or `None` if the queue has no record of the id.
    async fn status(&self, task_id: &TaskId) -> Result<Option<TaskStatus>, QueueError>;

    /// Stop a pending task from running. With `terminate`, also cancel it
    /// if it is already running. Terminal tasks are left untouched.
    async fn revoke(&self, task_id: &TaskId, terminate: bool) -> Result<(), QueueError>;

    /// Replace the progress payload of a non-terminal task.
    async fn set_progress(&self, task_id: &TaskId, progress: Value);

    /// Readiness probe that answers within `timeout`.
    async fn ping(&self, timeout: Duration) -> BrokerHealth;
}
