use thiserror::Error;

/// Queue-level failures. Task failures are not errors; they are recorded in
/// the task's status.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum QueueError {
    /// No handler is registered under this name.
    #[error("unknown task: {0}")]
    UnknownTask(String),
    /// The queue has been shut down and accepts no more work.
    #[error("task queue is shutting down")]
    ShuttingDown,
    /// A caller-chosen id is already in use.
    #[error("task id already exists: {0}")]
    DuplicateId(String),
    #[error("task queue unavailable: {0}")]
    Unavailable(String),
}
