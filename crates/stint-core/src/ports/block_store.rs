//! BlockStore port: blocks, block executions, list items, and the
//! forced-block queue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    Block, BlockExecution, BlockId, ItemStatus, ListBlockItem, TaskDefinitionId,
};
use crate::error::StintError;

#[async_trait]
pub trait BlockStore: Send + Sync {
    async fn insert_block(&self, block: Block) -> Result<(), StintError>;

    async fn get_block(&self, id: BlockId) -> Result<Option<Block>, StintError>;

    /// Append one attempt row. Attempts are never overwritten.
    async fn insert_block_execution(&self, execution: BlockExecution) -> Result<(), StintError>;

    /// Persist a status change of an existing attempt row.
    async fn update_block_execution(&self, execution: BlockExecution) -> Result<(), StintError>;

    /// Full attempt history of one block, oldest first.
    async fn attempts_for_block(&self, block_id: BlockId)
    -> Result<Vec<BlockExecution>, StintError>;

    /// All attempt rows for a definition created at or after `since`,
    /// oldest first. This is the reprocess detection window query.
    async fn block_executions_since(
        &self,
        task_definition_id: TaskDefinitionId,
        since: DateTime<Utc>,
    ) -> Result<Vec<BlockExecution>, StintError>;

    /// Operator-injected priority reprocessing, outside the detection
    /// window. Entries are consumed by `take_forced_blocks`.
    async fn push_forced_block(
        &self,
        task_definition_id: TaskDefinitionId,
        block_id: BlockId,
    ) -> Result<(), StintError>;

    /// Drain the forced queue for a definition, in push order.
    async fn take_forced_blocks(
        &self,
        task_definition_id: TaskDefinitionId,
    ) -> Result<Vec<BlockId>, StintError>;

    async fn insert_list_items(&self, items: Vec<ListBlockItem>) -> Result<(), StintError>;

    async fn update_list_items(&self, items: Vec<ListBlockItem>) -> Result<(), StintError>;

    /// Items of a block matching any of the requested statuses, in insert
    /// order. An empty status slice matches everything.
    async fn list_items(
        &self,
        block_id: BlockId,
        statuses: &[ItemStatus],
    ) -> Result<Vec<ListBlockItem>, StintError>;
}
