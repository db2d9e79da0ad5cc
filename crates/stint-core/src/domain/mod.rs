//! Domain model: ids, task identity, executions, tokens, critical sections,
//! blocks and list items, event-log entries.

pub mod block;
pub mod critical_section;
pub mod events;
pub mod execution;
pub mod ids;
pub mod list_item;
pub mod task;
pub mod token;

pub use block::{Block, BlockExecution, BlockExecutionStatus, BlockPayload};
pub use critical_section::{CriticalSectionState, CriticalSectionType, QueueEntry};
pub use events::{EventKind, ExecutionEvent};
pub use execution::{DeathMode, TaskExecution};
pub use ids::{
    BlockExecutionId, BlockId, ListItemId, TaskDefinitionId, TaskExecutionId, TokenId,
};
pub use list_item::{ItemStatus, ItemValue, ListBlockItem};
pub use task::{TaskDefinition, TaskKey};
pub use token::{ExecutionToken, TokenPool, TokenStatus};
