use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use queue::{
    BrokerStatus, InMemoryQueue, QueueConfig, QueueError, TaskContext, TaskHandler, TaskId,
    TaskOutcome, TaskQueue, TaskRegistry, TaskRequest, TaskState, TaskStatus,
};
use serde_json::{json, Value};

struct Echo;

#[async_trait]
impl TaskHandler for Echo {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn execute(&self, _ctx: TaskContext, args: Value) -> TaskOutcome {
        TaskOutcome::Completed(args)
    }
}

/// Asks for a retry until `succeed_on` attempts have been made.
struct Flaky {
    succeed_on: u32,
    budget: u32,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl TaskHandler for Flaky {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn max_retries(&self) -> u32 {
        self.budget
    }

    async fn execute(&self, ctx: TaskContext, _args: Value) -> TaskOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if ctx.attempt + 1 >= self.succeed_on {
            TaskOutcome::Completed(json!({ "attempt": ctx.attempt }))
        } else {
            TaskOutcome::RetryRequested {
                delay: Duration::from_millis(10),
                reason: format!("transient failure on attempt {}", ctx.attempt),
            }
        }
    }
}

struct Sleeper;

#[async_trait]
impl TaskHandler for Sleeper {
    fn name(&self) -> &'static str {
        "sleeper"
    }

    async fn execute(&self, _ctx: TaskContext, args: Value) -> TaskOutcome {
        let ms = args["ms"].as_u64().unwrap_or(50);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        TaskOutcome::Completed(json!("slept"))
    }
}

struct Panicker;

#[async_trait]
impl TaskHandler for Panicker {
    fn name(&self) -> &'static str {
        "panicker"
    }

    async fn execute(&self, _ctx: TaskContext, _args: Value) -> TaskOutcome {
        panic!("handler exploded");
    }
}

struct Reporter;

#[async_trait]
impl TaskHandler for Reporter {
    fn name(&self) -> &'static str {
        "reporter"
    }

    async fn execute(&self, ctx: TaskContext, _args: Value) -> TaskOutcome {
        ctx.report_progress(json!({ "step": "halfway", "progress": 50 }))
            .await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        TaskOutcome::Completed(json!("reported"))
    }
}

/// Re-enqueues itself until the task named in `args.watch` is terminal.
struct Poller;

#[async_trait]
impl TaskHandler for Poller {
    fn name(&self) -> &'static str {
        "poller"
    }

    fn max_retries(&self) -> u32 {
        1000
    }

    async fn execute(&self, ctx: TaskContext, args: Value) -> TaskOutcome {
        let watched = TaskId::from(args["watch"].as_str().unwrap_or_default());
        match ctx.queue().status(&watched).await {
            Ok(Some(status)) if status.is_terminal() => {
                TaskOutcome::Completed(json!({ "polls": ctx.attempt + 1 }))
            }
            _ => TaskOutcome::RetryRequested {
                delay: Duration::from_millis(10),
                reason: "watched task still running".into(),
            },
        }
    }
}

fn registry(flaky: Flaky) -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register(Echo);
    registry.register(flaky);
    registry.register(Sleeper);
    registry.register(Panicker);
    registry.register(Reporter);
    registry.register(Poller);
    registry
}

fn start(workers: usize, flaky: Flaky) -> InMemoryQueue {
    InMemoryQueue::start(registry(flaky), QueueConfig::default().with_workers(workers))
}

fn flaky(succeed_on: u32, budget: u32) -> (Flaky, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    (
        Flaky {
            succeed_on,
            budget,
            calls: Arc::clone(&calls),
        },
        calls,
    )
}

async fn wait_terminal(queue: &InMemoryQueue, id: &TaskId) -> TaskStatus {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let status = queue.status(id).await.unwrap().expect("task is known");
        if status.is_terminal() {
            return status;
        }
        assert!(Instant::now() < deadline, "task {id} never finished: {status:?}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_state(queue: &InMemoryQueue, id: &TaskId, state: TaskState) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while queue.status(id).await.unwrap().map(|s| s.state) != Some(state) {
        assert!(Instant::now() < deadline, "task {id} never reached {state}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn completes_with_handler_result() {
    let queue = start(2, flaky(1, 0).0);
    let id = queue
        .enqueue(TaskRequest::new("echo", json!({ "hello": "world" })))
        .await
        .unwrap();

    let status = wait_terminal(&queue, &id).await;
    assert_eq!(status.state, TaskState::Succeeded);
    assert_eq!(status.result, Some(json!({ "hello": "world" })));
    assert!(status.error.is_none());
    assert!(status.started_at.is_some());
}

#[tokio::test]
async fn retry_then_success() {
    let (handler, calls) = flaky(3, 5);
    let queue = start(1, handler);
    let id = queue.enqueue(TaskRequest::new("flaky", Value::Null)).await.unwrap();

    let status = wait_terminal(&queue, &id).await;
    assert_eq!(status.state, TaskState::Succeeded);
    assert_eq!(status.result, Some(json!({ "attempt": 2 })));
    assert_eq!(status.retries, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn exhausted_retry_budget_fails_with_reason() {
    let (handler, calls) = flaky(100, 2);
    let queue = start(1, handler);
    let id = queue.enqueue(TaskRequest::new("flaky", Value::Null)).await.unwrap();

    let status = wait_terminal(&queue, &id).await;
    assert_eq!(status.state, TaskState::Failed);
    assert_eq!(
        status.error.as_deref(),
        Some("transient failure on attempt 2")
    );
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn countdown_delays_execution() {
    let queue = start(1, flaky(1, 0).0);
    let started = Instant::now();
    let id = queue
        .enqueue(TaskRequest::new("echo", json!(1)).with_countdown(Duration::from_millis(150)))
        .await
        .unwrap();

    assert_eq!(
        queue.status(&id).await.unwrap().unwrap().state,
        TaskState::Pending
    );
    let status = wait_terminal(&queue, &id).await;
    assert_eq!(status.state, TaskState::Succeeded);
    assert!(started.elapsed() >= Duration::from_millis(150));
}

#[tokio::test]
async fn unknown_task_name_is_rejected() {
    let queue = start(1, flaky(1, 0).0);
    let err = queue
        .enqueue(TaskRequest::new("nope", Value::Null))
        .await
        .unwrap_err();
    assert_eq!(err, QueueError::UnknownTask("nope".into()));
}

#[tokio::test]
async fn duplicate_explicit_id_is_rejected() {
    let queue = start(1, flaky(1, 0).0);
    let id = TaskId::from("fixed-id");
    queue
        .enqueue(TaskRequest::new("echo", Value::Null).with_id(id.clone()))
        .await
        .unwrap();
    let err = queue
        .enqueue(TaskRequest::new("echo", Value::Null).with_id(id))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::DuplicateId(_)));
}

#[tokio::test]
async fn unknown_id_has_no_status() {
    let queue = start(1, flaky(1, 0).0);
    assert!(queue.status(&TaskId::from("ghost")).await.unwrap().is_none());
}

#[tokio::test]
async fn revoking_pending_task_prevents_execution() {
    let queue = start(1, flaky(1, 0).0);
    let id = queue
        .enqueue(TaskRequest::new("echo", json!(1)).with_countdown(Duration::from_millis(100)))
        .await
        .unwrap();

    queue.revoke(&id, false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let status = queue.status(&id).await.unwrap().unwrap();
    assert_eq!(status.state, TaskState::Revoked);
    assert!(status.result.is_none());
}

#[tokio::test]
async fn terminate_cancels_running_task() {
    let queue = start(1, flaky(1, 0).0);
    let id = queue
        .enqueue(TaskRequest::new("sleeper", json!({ "ms": 10_000 })))
        .await
        .unwrap();
    wait_state(&queue, &id, TaskState::Running).await;

    queue.revoke(&id, true).await.unwrap();
    let status = wait_terminal(&queue, &id).await;
    assert_eq!(status.state, TaskState::Revoked);

    // The worker is free again.
    let next = queue.enqueue(TaskRequest::new("echo", json!(2))).await.unwrap();
    assert_eq!(wait_terminal(&queue, &next).await.state, TaskState::Succeeded);
}

#[tokio::test]
async fn soft_revoke_lets_running_task_finish() {
    let queue = start(1, flaky(1, 0).0);
    let id = queue
        .enqueue(TaskRequest::new("sleeper", json!({ "ms": 100 })))
        .await
        .unwrap();
    wait_state(&queue, &id, TaskState::Running).await;

    queue.revoke(&id, false).await.unwrap();
    let status = wait_terminal(&queue, &id).await;
    assert_eq!(status.state, TaskState::Succeeded);
}

#[tokio::test]
async fn revoking_terminal_task_is_a_no_op() {
    let queue = start(1, flaky(1, 0).0);
    let id = queue.enqueue(TaskRequest::new("echo", json!(1))).await.unwrap();
    wait_terminal(&queue, &id).await;

    queue.revoke(&id, true).await.unwrap();
    let status = queue.status(&id).await.unwrap().unwrap();
    assert_eq!(status.state, TaskState::Succeeded);
    assert_eq!(status.result, Some(json!(1)));
}

#[tokio::test]
async fn panic_fails_task_and_worker_survives() {
    let queue = start(1, flaky(1, 0).0);
    let id = queue.enqueue(TaskRequest::new("panicker", Value::Null)).await.unwrap();

    let status = wait_terminal(&queue, &id).await;
    assert_eq!(status.state, TaskState::Failed);
    assert!(status.error.unwrap().contains("handler exploded"));

    let next = queue.enqueue(TaskRequest::new("echo", json!("after"))).await.unwrap();
    assert_eq!(wait_terminal(&queue, &next).await.state, TaskState::Succeeded);
    assert_eq!(queue.live_workers(), 1);
}

#[tokio::test]
async fn progress_is_visible_while_running() {
    let queue = start(1, flaky(1, 0).0);
    let id = queue.enqueue(TaskRequest::new("reporter", Value::Null)).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let status = queue.status(&id).await.unwrap().unwrap();
        if let Some(progress) = status.progress {
            assert_eq!(progress["step"], "halfway");
            assert_eq!(status.state, TaskState::Running);
            break;
        }
        assert!(Instant::now() < deadline, "progress never reported");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(wait_terminal(&queue, &id).await.state, TaskState::Succeeded);
}

#[tokio::test]
async fn rescheduling_poller_does_not_starve_single_worker() {
    let queue = start(1, flaky(1, 0).0);
    let watched = TaskId::from("watched");

    // The poller is enqueued first and keeps re-enqueueing itself. With one
    // worker, the watched task can only finish if polling never blocks.
    let poller = queue
        .enqueue(TaskRequest::new("poller", json!({ "watch": watched.as_str() })))
        .await
        .unwrap();
    queue
        .enqueue(
            TaskRequest::new("sleeper", json!({ "ms": 30 }))
                .with_id(watched.clone())
                .with_countdown(Duration::from_millis(20)),
        )
        .await
        .unwrap();

    assert_eq!(wait_terminal(&queue, &watched).await.state, TaskState::Succeeded);
    let status = wait_terminal(&queue, &poller).await;
    assert_eq!(status.state, TaskState::Succeeded);
    assert!(status.result.unwrap()["polls"].as_u64().unwrap() > 1);
}

#[tokio::test]
async fn ping_reports_workers() {
    let queue = start(3, flaky(1, 0).0);
    let health = queue.ping(Duration::from_secs(1)).await;
    assert_eq!(health.status, BrokerStatus::Healthy);
    assert_eq!(health.workers, 3);

    queue.shutdown();
    let health = queue.ping(Duration::from_secs(1)).await;
    assert_eq!(health.status, BrokerStatus::Unhealthy);
}

#[tokio::test]
async fn shutdown_rejects_new_work() {
    let queue = start(1, flaky(1, 0).0);
    queue.shutdown();
    let err = queue
        .enqueue(TaskRequest::new("echo", Value::Null))
        .await
        .unwrap_err();
    assert_eq!(err, QueueError::ShuttingDown);
}
