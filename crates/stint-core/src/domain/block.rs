//! Blocks: immutable work partitions, and the attempts made to process them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{BlockExecutionId, BlockId, TaskDefinitionId, TaskExecutionId};

/// Variant-specific partition data.
///
/// A block is created once per partition and never mutated; retries reference
/// the same block through new `BlockExecution` rows. Items of a `List` block
/// live in their own store rows keyed by the block id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockPayload {
    /// Half-open UTC interval `[from, to)`.
    DateRange {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },

    /// Inclusive numeric interval `[from, to]`.
    NumericRange { from: i64, to: i64 },

    /// A batch of discrete items (stored separately as ListBlockItems).
    List,

    /// A single opaque object.
    Object { payload: serde_json::Value },
}

/// Immutable partition descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub task_definition_id: TaskDefinitionId,
    pub payload: BlockPayload,
    pub created_at: DateTime<Utc>,
}

impl Block {
    pub fn new(
        id: BlockId,
        task_definition_id: TaskDefinitionId,
        payload: BlockPayload,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            task_definition_id,
            payload,
            created_at,
        }
    }
}

/// Status of one processing attempt.
///
/// Transitions: NotStarted -> Started -> {Completed | Failed}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockExecutionStatus {
    NotStarted,
    Started,
    Completed,
    Failed,
}

impl BlockExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One attempt to process a block under a specific task execution.
///
/// Attempts are appended, never overwritten: the full history of a block's
/// processing survives for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockExecution {
    pub id: BlockExecutionId,
    pub block_id: BlockId,
    pub task_execution_id: TaskExecutionId,

    /// 1-based attempt number across all executions of this block.
    pub attempt: u32,

    pub status: BlockExecutionStatus,
    pub items_processed: Option<u64>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BlockExecution {
    pub fn new(
        id: BlockExecutionId,
        block_id: BlockId,
        task_execution_id: TaskExecutionId,
        attempt: u32,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            block_id,
            task_execution_id,
            attempt,
            status: BlockExecutionStatus::NotStarted,
            items_processed: None,
            created_at,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn start(&mut self, at: DateTime<Utc>) {
        self.status = BlockExecutionStatus::Started;
        self.started_at = Some(at);
    }

    pub fn complete(&mut self, at: DateTime<Utc>, items_processed: u64) {
        self.status = BlockExecutionStatus::Completed;
        self.items_processed = Some(items_processed);
        self.completed_at = Some(at);
    }

    pub fn fail(&mut self, at: DateTime<Utc>) {
        self.status = BlockExecutionStatus::Failed;
        self.completed_at = Some(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use ulid::Ulid;

    fn block_execution() -> BlockExecution {
        BlockExecution::new(
            BlockExecutionId::from_ulid(Ulid::new()),
            BlockId::from_ulid(Ulid::new()),
            TaskExecutionId::from_ulid(Ulid::new()),
            1,
            Utc::now(),
        )
    }

    #[test]
    fn lifecycle_not_started_to_completed() {
        let mut be = block_execution();
        assert_eq!(be.status, BlockExecutionStatus::NotStarted);

        be.start(Utc::now());
        assert_eq!(be.status, BlockExecutionStatus::Started);
        assert!(be.started_at.is_some());

        be.complete(Utc::now(), 42);
        assert_eq!(be.status, BlockExecutionStatus::Completed);
        assert_eq!(be.items_processed, Some(42));
        assert!(be.completed_at.is_some());
    }

    #[test]
    fn fail_records_completion_time_without_items() {
        let mut be = block_execution();
        be.start(Utc::now());
        be.fail(Utc::now());
        assert_eq!(be.status, BlockExecutionStatus::Failed);
        assert!(be.items_processed.is_none());
    }

    #[rstest]
    #[case::completed(BlockExecutionStatus::Completed, true)]
    #[case::failed(BlockExecutionStatus::Failed, true)]
    #[case::started(BlockExecutionStatus::Started, false)]
    #[case::not_started(BlockExecutionStatus::NotStarted, false)]
    fn terminal_statuses(#[case] status: BlockExecutionStatus, #[case] terminal: bool) {
        assert_eq!(status.is_terminal(), terminal);
    }

    #[test]
    fn payload_serializes_with_kind_tag() {
        let p = BlockPayload::NumericRange { from: 1, to: 100 };
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["kind"], "numeric_range");
        assert_eq!(v["from"], 1);
    }
}
