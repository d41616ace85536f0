//! Core task traits and types

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::TaskQueue;

/// Opaque task identifier. New ids are UUID v4 strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A task descriptor handed to [`TaskQueue::enqueue`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_name: String,
    pub args: Value,
    /// Delay before the task becomes eligible to run.
    pub countdown: Option<Duration>,
    /// Use this id instead of generating one.
    pub task_id: Option<TaskId>,
}

impl TaskRequest {
    pub fn new(task_name: impl Into<String>, args: Value) -> Self {
        Self {
            task_name: task_name.into(),
            args,
            countdown: None,
            task_id: None,
        }
    }

    pub fn with_countdown(mut self, countdown: Duration) -> Self {
        self.countdown = Some(countdown);
        self
    }

    pub fn with_id(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }
}

/// Result returned by a handler. The queue runtime decides what happens next.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Done; `Value` becomes the task result.
    Completed(Value),
    /// Terminal failure with a stringified cause.
    Failed(String),
    /// Run again after `delay` with the attempt counter incremented. Once the
    /// handler's `max_retries` is used up the task fails with `reason`.
    RetryRequested { delay: Duration, reason: String },
}

/// Execution context for one attempt.
#[derive(Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub task_name: String,
    /// Zero on the first run, incremented on every retry.
    pub attempt: u32,
    pub max_retries: u32,
    cancel: CancellationToken,
    queue: Arc<dyn TaskQueue>,
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.task_id)
            .field("task_name", &self.task_name)
            .field("attempt", &self.attempt)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl TaskContext {
    pub fn new(
        task_id: TaskId,
        task_name: impl Into<String>,
        attempt: u32,
        max_retries: u32,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        Self {
            task_id,
            task_name: task_name.into(),
            attempt,
            max_retries,
            cancel: CancellationToken::new(),
            queue,
        }
    }

    pub(crate) fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// True when a `RetryRequested` from this attempt would fail the task.
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_retries
    }

    /// Publish a progress snapshot for status readers.
    pub async fn report_progress(&self, progress: Value) {
        self.queue.set_progress(&self.task_id, progress).await;
    }

    /// Queue this task runs on, for reading other tasks' status.
    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }

    /// Cancelled when the task is revoked with `terminate`.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Core task trait, implemented by task handlers.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// Task name (must be unique, used for routing).
    fn name(&self) -> &'static str;

    /// Retries granted to `RetryRequested` outcomes.
    fn max_retries(&self) -> u32 {
        0
    }

    async fn execute(&self, ctx: TaskContext, args: Value) -> TaskOutcome;
}

/// Handlers by name.
#[derive(Default, Clone)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: TaskHandler>(&mut self, handler: H) {
        self.handlers
            .insert(handler.name().to_string(), Arc::new(handler));
    }

    pub fn register_arc(&mut self, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}
