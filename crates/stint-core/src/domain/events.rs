//! Append-only execution-event log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskExecutionId;

/// Kind of a logged event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Start,
    Checkpoint,
    Error,
    End,
    Blocked,
}

/// One event in an execution's history. Events are only ever appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub task_execution_id: TaskExecutionId,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

impl ExecutionEvent {
    pub fn new(
        task_execution_id: TaskExecutionId,
        kind: EventKind,
        message: Option<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_execution_id,
            kind,
            message,
            at,
        }
    }
}
