//! Process-wide task counters.
//!
//! Each counter is an independent atomic, so recording never blocks a reader
//! and [`TaskMetrics::snapshot`] never blocks a writer. The duration sum is
//! kept in microseconds and converted on read.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct TaskMetrics {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    duration_micros: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub tasks_submitted_total: u64,
    pub tasks_succeeded_total: u64,
    pub tasks_failed_total: u64,
    pub task_duration_seconds_sum: f64,
}

impl TaskMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters shared by everything in this process.
    pub fn global() -> Arc<TaskMetrics> {
        static GLOBAL: OnceLock<Arc<TaskMetrics>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(TaskMetrics::new())))
    }

    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self, success: bool, duration: Duration) {
        if success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.duration_micros.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_submitted_total: self.submitted.load(Ordering::Relaxed),
            tasks_succeeded_total: self.succeeded.load(Ordering::Relaxed),
            tasks_failed_total: self.failed.load(Ordering::Relaxed),
            task_duration_seconds_sum: self.duration_micros.load(Ordering::Relaxed) as f64
                / 1_000_000.0,
        }
    }

    /// Prometheus text exposition of the counters.
    pub fn render_prometheus(&self) -> String {
        let snap = self.snapshot();
        let mut out = String::with_capacity(512);
        let rows: [(&str, &str, String); 4] = [
            (
                "tasks_submitted_total",
                "Total extraction tasks submitted.",
                snap.tasks_submitted_total.to_string(),
            ),
            (
                "tasks_succeeded_total",
                "Total extraction tasks that succeeded.",
                snap.tasks_succeeded_total.to_string(),
            ),
            (
                "tasks_failed_total",
                "Total extraction tasks that failed.",
                snap.tasks_failed_total.to_string(),
            ),
            (
                "task_duration_seconds_sum",
                "Cumulative task processing time.",
                format!("{:.6}", snap.task_duration_seconds_sum),
            ),
        ];
        for (name, help, value) in rows {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {value}");
        }
        out
    }
}
