//! Critical-section state: FIFO-fair mutual exclusion per task definition.
//!
//! Two independent instances of the same record exist per definition (`User`
//! for application code, `Client` for the library's own sensitive logic).
//! Like the token pool, the state is a versioned value mutated only under the
//! definition lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskExecutionId;

/// Which of the two per-definition critical sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriticalSectionType {
    /// Application-level section exposed to callers.
    User,

    /// Library-internal section.
    Client,
}

/// One waiter in the queue. Entries are ordered by enqueue; `enqueued_at` is
/// recorded for audit and diagnostics, position in the vector is the order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub execution_id: TaskExecutionId,
    pub enqueued_at: DateTime<Utc>,
}

/// Persisted state of one critical section.
///
/// Invariants:
/// - At most one grantee.
/// - Queue order is enqueue order; purging expired waiters preserves the
///   relative order of the rest.
/// - When the section is free and the queue is non-empty, only the head may
///   be granted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriticalSectionState {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granted_to: Option<TaskExecutionId>,
    #[serde(default)]
    pub queue: Vec<QueueEntry>,
}

impl CriticalSectionState {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn empty() -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            granted_to: None,
            queue: Vec::new(),
        }
    }

    pub fn is_granted(&self) -> bool {
        self.granted_to.is_some()
    }

    pub fn is_queued(&self, execution_id: TaskExecutionId) -> bool {
        self.queue.iter().any(|e| e.execution_id == execution_id)
    }

    /// Append to the tail unless already present. Returns true if appended.
    pub fn enqueue(&mut self, execution_id: TaskExecutionId, at: DateTime<Utc>) -> bool {
        if self.is_queued(execution_id) {
            return false;
        }
        self.queue.push(QueueEntry {
            execution_id,
            enqueued_at: at,
        });
        true
    }

    pub fn head(&self) -> Option<TaskExecutionId> {
        self.queue.first().map(|e| e.execution_id)
    }

    /// Remove the head entry.
    pub fn dequeue_head(&mut self) -> Option<QueueEntry> {
        if self.queue.is_empty() {
            None
        } else {
            Some(self.queue.remove(0))
        }
    }

    /// Drop queue entries whose execution is in the expired set, keeping the
    /// relative order of survivors. Returns how many were removed.
    pub fn purge_expired(
        &mut self,
        expired: impl Fn(TaskExecutionId) -> bool,
    ) -> usize {
        let before = self.queue.len();
        self.queue.retain(|e| !expired(e.execution_id));
        before - self.queue.len()
    }
}

impl Default for CriticalSectionState {
    fn default() -> Self {
        Self::empty()
    }
}
