//! TaskExecution: one run attempt of a task, with its liveness record.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::ids::{TaskDefinitionId, TaskExecutionId};

/// How liveness of an execution is judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeathMode {
    /// The execution heartbeats; missing heartbeats beyond the keep-alive
    /// threshold means dead.
    KeepAlive,

    /// No heartbeats; the execution is presumed dead once a fixed duration
    /// has elapsed since it started.
    Override,
}

/// One attempt to run a task.
///
/// Design:
/// - Created at `try_start`, closed at `complete`/`error`.
/// - This row is the liveness record: token reclamation and critical-section
///   purging both read it through the expiry predicate.
/// - State transitions happen via methods, not direct field writes.
#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub id: TaskExecutionId,
    pub task_definition_id: TaskDefinitionId,

    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_keep_alive: Option<DateTime<Utc>>,

    pub death_mode: DeathMode,
    pub keep_alive_death_threshold: Option<Duration>,
    pub override_threshold: Option<Duration>,

    /// Concurrency limit requested for this run (<= 0 means unlimited).
    pub concurrency_limit: i32,

    /// Correlation id grouping the blocks of one reprocessing run.
    pub reference_value: Option<String>,

    /// Opaque caller payload attached at start, readable back later.
    pub header: Option<serde_json::Value>,

    /// Set by `error(_, true)`: the run is excluded from "last execution"
    /// queries until explicitly reprocessed.
    pub failed: bool,

    /// Set when the task was refused at start (e.g. disabled in config).
    pub blocked: bool,
}

impl TaskExecution {
    pub fn new(
        id: TaskExecutionId,
        task_definition_id: TaskDefinitionId,
        started_at: DateTime<Utc>,
        death_mode: DeathMode,
    ) -> Self {
        Self {
            id,
            task_definition_id,
            started_at,
            completed_at: None,
            last_keep_alive: None,
            death_mode,
            keep_alive_death_threshold: None,
            override_threshold: None,
            concurrency_limit: 1,
            reference_value: None,
            header: None,
            failed: false,
            blocked: false,
        }
    }

    pub fn with_keep_alive_threshold(mut self, threshold: Duration) -> Self {
        self.keep_alive_death_threshold = Some(threshold);
        self
    }

    pub fn with_override_threshold(mut self, threshold: Duration) -> Self {
        self.override_threshold = Some(threshold);
        self
    }

    pub fn with_concurrency_limit(mut self, limit: i32) -> Self {
        self.concurrency_limit = limit;
        self
    }

    pub fn with_reference_value(mut self, reference_value: Option<String>) -> Self {
        self.reference_value = reference_value;
        self
    }

    pub fn with_header(mut self, header: Option<serde_json::Value>) -> Self {
        self.header = header;
        self
    }

    /// Record a heartbeat.
    pub fn keep_alive(&mut self, at: DateTime<Utc>) {
        self.last_keep_alive = Some(at);
    }

    /// Close this execution.
    pub fn close(&mut self, at: DateTime<Utc>, failed: bool) {
        self.completed_at = Some(at);
        self.failed = failed;
    }

    pub fn is_open(&self) -> bool {
        self.completed_at.is_none()
    }
}
