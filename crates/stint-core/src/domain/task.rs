//! Task identity: lookup key and durable definition.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskDefinitionId;

/// Lookup identity of a task: (application name, task name).
///
/// This is what callers know. The store resolves it to a durable
/// `TaskDefinitionId` once, idempotently, the first time the task runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    pub application_name: String,
    pub task_name: String,
}

impl TaskKey {
    pub fn new(application_name: impl Into<String>, task_name: impl Into<String>) -> Self {
        Self {
            application_name: application_name.into(),
            task_name: task_name.into(),
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.application_name, self.task_name)
    }
}

/// Durable record for one named task.
///
/// Owns (via the store) the serialized execution-token pool and the two
/// critical-section records. Those live behind the definition lock and are
/// never read or written outside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: TaskDefinitionId,
    pub key: TaskKey,
    pub created_at: DateTime<Utc>,
}

impl TaskDefinition {
    pub fn new(id: TaskDefinitionId, key: TaskKey, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            key,
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_display_is_app_slash_task() {
        let key = TaskKey::new("billing", "nightly-settlement");
        assert_eq!(key.to_string(), "billing/nightly-settlement");
    }

    #[test]
    fn keys_are_value_equal() {
        let a = TaskKey::new("app", "task");
        let b = TaskKey::new("app", "task");
        assert_eq!(a, b);
    }
}
