//! Observability metrics for task orchestration.
//!
//! Metrics are recorded through the `metrics` crate facade, so any recorder
//! (Prometheus, statsd, a test recorder) can be installed by the host process.
//! Without a recorder every call is a no-op.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `datafed_tasks_transitions_total` | Counter | `from_state`, `to_state` | Task status transitions |
//! | `datafed_tasks_commands_total` | Counter | `command` | Commands handed to the worker |
//! | `datafed_tasks_retries_total` | Counter | `attempt` | Transactions retried after a write conflict |
//! | `datafed_tasks_admissions_total` | Counter | `result` | Admission outcomes (ready, blocked) |
//! | `datafed_tasks_step_duration_seconds` | Histogram | `task_type` | Time spent in one run call |
//! | `datafed_tasks_transfer_chunks` | Histogram | `task_type` | Transfer chunks planned per task |

use std::time::{Duration, Instant};

use metrics::{counter, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Task status transitions.
    pub const TRANSITIONS_TOTAL: &str = "datafed_tasks_transitions_total";
    /// Counter: Commands emitted to the worker.
    pub const COMMANDS_TOTAL: &str = "datafed_tasks_commands_total";
    /// Counter: Transaction retries after write conflicts.
    pub const RETRIES_TOTAL: &str = "datafed_tasks_retries_total";
    /// Counter: Admission outcomes.
    pub const ADMISSIONS_TOTAL: &str = "datafed_tasks_admissions_total";
    /// Histogram: Duration of one run call in seconds.
    pub const STEP_DURATION_SECONDS: &str = "datafed_tasks_step_duration_seconds";
    /// Histogram: Planned transfer chunks per task.
    pub const TRANSFER_CHUNKS: &str = "datafed_tasks_transfer_chunks";
}

/// Label keys used across metrics.
pub mod labels {
    /// Previous task status.
    pub const FROM_STATE: &str = "from_state";
    /// Target task status.
    pub const TO_STATE: &str = "to_state";
    /// Worker command label.
    pub const COMMAND: &str = "command";
    /// Retry attempt number.
    pub const ATTEMPT: &str = "attempt";
    /// Outcome (ready, blocked).
    pub const RESULT: &str = "result";
    /// Task type label.
    pub const TASK_TYPE: &str = "task_type";
}

/// Records task orchestration metrics with consistent labels.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskMetrics;

impl TaskMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Records a task status transition.
    pub fn record_transition(&self, from_state: &str, to_state: &str) {
        counter!(
            names::TRANSITIONS_TOTAL,
            labels::FROM_STATE => from_state.to_string(),
            labels::TO_STATE => to_state.to_string(),
        )
        .increment(1);
    }

    /// Records a command handed to the worker.
    pub fn record_command(&self, command: &str) {
        counter!(names::COMMANDS_TOTAL, labels::COMMAND => command.to_string()).increment(1);
    }

    /// Records a transaction retry.
    pub fn record_retry(&self, attempt: u32) {
        counter!(names::RETRIES_TOTAL, labels::ATTEMPT => attempt.to_string()).increment(1);
    }

    /// Records whether a new task was admitted ready or blocked.
    pub fn record_admission(&self, blocked: bool) {
        let result = if blocked { "blocked" } else { "ready" };
        counter!(names::ADMISSIONS_TOTAL, labels::RESULT => result).increment(1);
    }

    /// Records how long one run call took.
    pub fn observe_step_duration(&self, task_type: &str, duration: Duration) {
        histogram!(
            names::STEP_DURATION_SECONDS,
            labels::TASK_TYPE => task_type.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    /// Records the number of transfer chunks planned for a task.
    #[allow(clippy::cast_precision_loss)] // chunk counts are small
    pub fn observe_transfer_chunks(&self, task_type: &str, chunks: usize) {
        histogram!(
            names::TRANSFER_CHUNKS,
            labels::TASK_TYPE => task_type.to_string(),
        )
        .record(chunks as f64);
    }
}

/// RAII guard that reports the elapsed time when dropped.
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Starts timing; `on_drop` receives the elapsed duration.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

/// Times one run call of a task of the given type.
#[must_use]
pub fn time_step(task_type: &'static str) -> TimingGuard<impl FnOnce(Duration)> {
    TimingGuard::new(move |duration| TaskMetrics::new().observe_step_duration(task_type, duration))
}
