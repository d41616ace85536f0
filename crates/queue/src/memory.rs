//! In-process broker and worker pool.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    BrokerHealth, BrokerStatus, QueueError, TaskContext, TaskId, TaskOutcome, TaskQueue,
    TaskRegistry, TaskRequest, TaskState, TaskStatus,
};

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Concurrent workers.
    pub workers: usize,
    /// How long terminal statuses are kept.
    pub status_ttl: Duration,
    /// How often expired statuses are swept.
    pub janitor_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            status_ttl: Duration::from_secs(24 * 3600),
            janitor_interval: Duration::from_secs(60),
        }
    }
}

impl QueueConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_status_ttl(mut self, ttl: Duration) -> Self {
        self.status_ttl = ttl;
        self
    }
}

#[derive(Debug)]
struct Envelope {
    task_id: TaskId,
    task_name: String,
    args: Value,
    attempt: u32,
}

struct Inner {
    config: QueueConfig,
    registry: TaskRegistry,
    statuses: DashMap<TaskId, TaskStatus>,
    running: DashMap<TaskId, CancellationToken>,
    /// Running tasks revoked without `terminate`: let them finish, never retry.
    soft_revoked: DashMap<TaskId, ()>,
    sender: mpsc::UnboundedSender<Envelope>,
    receiver: Mutex<mpsc::UnboundedReceiver<Envelope>>,
    shutdown: CancellationToken,
    live_workers: AtomicUsize,
    active: AtomicUsize,
}

/// In-process [`TaskQueue`] backed by a pool of tokio workers.
#[derive(Clone)]
pub struct InMemoryQueue {
    inner: Arc<Inner>,
}

impl InMemoryQueue {
    /// Create the queue and spawn its workers. Must be called inside a tokio
    /// runtime.
    pub fn start(registry: TaskRegistry, config: QueueConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let workers = config.workers.max(1);
        let queue = Self {
            inner: Arc::new(Inner {
                config,
                registry,
                statuses: DashMap::new(),
                running: DashMap::new(),
                soft_revoked: DashMap::new(),
                sender,
                receiver: Mutex::new(receiver),
                shutdown: CancellationToken::new(),
                live_workers: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
            }),
        };

        for worker_id in 0..workers {
            // Counted before spawning so `ping` sees the pool immediately.
            queue.inner.live_workers.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(queue.clone().worker_loop(worker_id));
        }
        tokio::spawn(queue.clone().janitor_loop());

        info!(
            workers,
            tasks = ?queue.inner.registry.names(),
            "task_queue_started"
        );
        queue
    }

    /// Stop accepting work and let workers exit after their current task.
    pub fn shutdown(&self) {
        info!("task_queue_shutdown_requested");
        self.inner.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn live_workers(&self) -> usize {
        self.inner.live_workers.load(Ordering::SeqCst)
    }

    fn schedule(&self, envelope: Envelope, delay: Option<Duration>) {
        match delay {
            Some(delay) if !delay.is_zero() => {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    tokio::select! {
                        _ = inner.shutdown.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {
                            let _ = inner.sender.send(envelope);
                        }
                    }
                });
            }
            _ => {
                let _ = self.inner.sender.send(envelope);
            }
        }
    }

    /// Apply `f` unless the task already reached a terminal state.
    fn update(&self, task_id: &TaskId, f: impl FnOnce(&mut TaskStatus)) {
        if let Some(mut status) = self.inner.statuses.get_mut(task_id) {
            if !status.is_terminal() {
                f(&mut *status);
            }
        }
    }

    async fn worker_loop(self, worker_id: usize) {
        debug!(worker_id, "worker_started");
        loop {
            let next = tokio::select! {
                _ = self.inner.shutdown.cancelled() => None,
                envelope = async { self.inner.receiver.lock().await.recv().await } => envelope,
            };
            let Some(envelope) = next else { break };
            self.process(envelope).await;
        }
        self.inner.live_workers.fetch_sub(1, Ordering::SeqCst);
        debug!(worker_id, "worker_stopped");
    }

    async fn janitor_loop(self) {
        let mut interval = tokio::time::interval(self.inner.config.janitor_interval);
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let ttl = chrono::Duration::from_std(self.inner.config.status_ttl)
                        .unwrap_or_else(|_| chrono::Duration::days(365));
                    let now = Utc::now();
                    let before = self.inner.statuses.len();
                    self.inner.statuses.retain(|_, status| {
                        !status.is_terminal()
                            || status.completed_at.map_or(true, |done| now - done < ttl)
                    });
                    let removed = before.saturating_sub(self.inner.statuses.len());
                    if removed > 0 {
                        debug!(removed, "task_statuses_expired");
                    }
                }
            }
        }
    }

    async fn process(&self, envelope: Envelope) {
        let Envelope {
            task_id,
            task_name,
            args,
            attempt,
        } = envelope;

        {
            let Some(mut status) = self.inner.statuses.get_mut(&task_id) else {
                return;
            };
            if status.is_terminal() {
                debug!(task_id = %task_id, state = %status.state, "task_skipped");
                return;
            }
            status.state = TaskState::Running;
            status.retries = attempt;
            if status.started_at.is_none() {
                status.started_at = Some(Utc::now());
            }
        }

        let Some(handler) = self.inner.registry.get(&task_name) else {
            error!(task_id = %task_id, task_name = %task_name, "task_handler_missing");
            self.update(&task_id, |s| s.fail(format!("unknown task: {task_name}")));
            return;
        };

        let cancel = CancellationToken::new();
        self.inner.running.insert(task_id.clone(), cancel.clone());
        self.inner.active.fetch_add(1, Ordering::SeqCst);

        let max_retries = handler.max_retries();
        let queue: Arc<dyn TaskQueue> = Arc::new(self.clone());
        let ctx = TaskContext::new(task_id.clone(), task_name.clone(), attempt, max_retries, queue)
            .with_cancel(cancel.clone());

        info!(task_id = %task_id, task_name = %task_name, attempt, "task_started");
        let start = Instant::now();
        let run = AssertUnwindSafe(handler.execute(ctx, args.clone())).catch_unwind();
        let result = tokio::select! {
            _ = cancel.cancelled() => None,
            outcome = run => Some(outcome),
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;

        self.inner.running.remove(&task_id);
        self.inner.active.fetch_sub(1, Ordering::SeqCst);
        let soft_revoked = self.inner.soft_revoked.remove(&task_id).is_some();

        match result {
            None => {
                info!(task_id = %task_id, task_name = %task_name, elapsed_ms, "task_terminated");
                self.update(&task_id, TaskStatus::revoke);
            }
            Some(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                error!(task_id = %task_id, task_name = %task_name, error = %message, "task_panicked");
                self.update(&task_id, |s| s.fail(format!("task panicked: {message}")));
            }
            Some(Ok(TaskOutcome::Completed(value))) => {
                info!(task_id = %task_id, task_name = %task_name, elapsed_ms, "task_succeeded");
                self.update(&task_id, |s| s.succeed(value));
            }
            Some(Ok(TaskOutcome::Failed(err))) => {
                warn!(task_id = %task_id, task_name = %task_name, error = %err, elapsed_ms, "task_failed");
                self.update(&task_id, |s| s.fail(err));
            }
            Some(Ok(TaskOutcome::RetryRequested { delay, reason })) => {
                if soft_revoked {
                    self.update(&task_id, TaskStatus::revoke);
                } else if attempt < max_retries {
                    debug!(
                        task_id = %task_id,
                        task_name = %task_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "task_retry_scheduled"
                    );
                    self.update(&task_id, |s| {
                        s.state = TaskState::Pending;
                        s.retries = attempt + 1;
                    });
                    self.schedule(
                        Envelope {
                            task_id,
                            task_name,
                            args,
                            attempt: attempt + 1,
                        },
                        Some(delay),
                    );
                } else {
                    warn!(task_id = %task_id, task_name = %task_name, attempt, reason = %reason, "task_retries_exhausted");
                    self.update(&task_id, |s| s.fail(reason));
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[async_trait]
impl TaskQueue for InMemoryQueue {
    async fn enqueue(&self, request: TaskRequest) -> Result<TaskId, QueueError> {
        if self.is_shutting_down() {
            return Err(QueueError::ShuttingDown);
        }
        if !self.inner.registry.contains(&request.task_name) {
            return Err(QueueError::UnknownTask(request.task_name));
        }

        let task_id = request.task_id.unwrap_or_default();
        match self.inner.statuses.entry(task_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(QueueError::DuplicateId(task_id.to_string()));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(TaskStatus::pending(task_id.clone(), request.task_name.clone()));
            }
        }

        debug!(
            task_id = %task_id,
            task_name = %request.task_name,
            countdown_ms = request.countdown.map(|d| d.as_millis() as u64),
            "task_enqueued"
        );
        self.schedule(
            Envelope {
                task_id: task_id.clone(),
                task_name: request.task_name,
                args: request.args,
                attempt: 0,
            },
            request.countdown,
        );
        Ok(task_id)
    }

    async fn status(&self, task_id: &TaskId) -> Result<Option<TaskStatus>, QueueError> {
        Ok(self.inner.statuses.get(task_id).map(|s| s.clone()))
    }

    async fn revoke(&self, task_id: &TaskId, terminate: bool) -> Result<(), QueueError> {
        let state = self.inner.statuses.get(task_id).map(|s| s.state);
        match state {
            None => {
                // Remember the id so a late enqueue with it cannot run.
                let mut status = TaskStatus::pending(task_id.clone(), "");
                status.revoke();
                self.inner.statuses.insert(task_id.clone(), status);
            }
            Some(state) if state.is_terminal() => {}
            Some(TaskState::Running) => {
                if terminate {
                    if let Some(token) = self.inner.running.get(task_id) {
                        token.cancel();
                    }
                } else {
                    self.inner.soft_revoked.insert(task_id.clone(), ());
                }
            }
            Some(_) => self.update(task_id, TaskStatus::revoke),
        }
        info!(task_id = %task_id, terminate, "task_revoke_requested");
        Ok(())
    }

    async fn set_progress(&self, task_id: &TaskId, progress: Value) {
        self.update(task_id, |s| s.progress = Some(progress));
    }

    async fn ping(&self, timeout: Duration) -> BrokerHealth {
        let probe = async {
            tokio::task::yield_now().await;
            (
                self.inner.live_workers.load(Ordering::SeqCst),
                self.inner.active.load(Ordering::SeqCst),
            )
        };
        match tokio::time::timeout(timeout, probe).await {
            Ok((workers, active_tasks)) if workers > 0 && !self.is_shutting_down() => {
                BrokerHealth {
                    status: BrokerStatus::Healthy,
                    message: format!("{workers} worker(s) online"),
                    workers,
                    active_tasks,
                }
            }
            Ok((workers, active_tasks)) => BrokerHealth {
                status: BrokerStatus::Unhealthy,
                message: "no workers online".to_string(),
                workers,
                active_tasks,
            },
            Err(_) => BrokerHealth {
                status: BrokerStatus::Degraded,
                message: format!("broker probe timed out after {}ms", timeout.as_millis()),
                workers: 0,
                active_tasks: 0,
            },
        }
    }
}
