//! TaskStore port: task definitions, executions, the event log, and the
//! per-definition exclusive lock.
//!
//! The lock is the single mandatory serialization point of the whole system:
//! one atomic read-modify-write per token or critical-section decision.
//! `lock_definition` returns a guard scoping one such transaction; the guard
//! exposes the opaque token-pool and critical-section values, and `commit`
//! persists whatever was set and releases the lock. A guard dropped without
//! commit discards its mutations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    CriticalSectionState, CriticalSectionType, ExecutionEvent, TaskDefinition, TaskDefinitionId,
    TaskExecution, TaskExecutionId, TaskKey, TokenPool,
};
use crate::error::StintError;

/// Exclusive transaction over one task definition's coordination state.
///
/// Decoding the stored values may fail with `Execution` when the persisted
/// encoding is corrupt; that is terminal, not transient.
#[async_trait]
pub trait DefinitionLock: Send {
    fn token_pool(&self) -> Result<TokenPool, StintError>;

    fn set_token_pool(&mut self, pool: TokenPool);

    fn critical_section(
        &self,
        section: CriticalSectionType,
    ) -> Result<CriticalSectionState, StintError>;

    fn set_critical_section(&mut self, section: CriticalSectionType, state: CriticalSectionState);

    /// Persist mutated values atomically and release the lock.
    async fn commit(self: Box<Self>) -> Result<(), StintError>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create-if-absent, tolerant of concurrent first use: all racers get
    /// the same definition back.
    async fn ensure_task_definition(&self, key: &TaskKey) -> Result<TaskDefinition, StintError>;

    async fn get_task_definition(
        &self,
        id: TaskDefinitionId,
    ) -> Result<Option<TaskDefinition>, StintError>;

    async fn lock_definition(
        &self,
        id: TaskDefinitionId,
    ) -> Result<Box<dyn DefinitionLock>, StintError>;

    async fn insert_execution(&self, execution: TaskExecution) -> Result<(), StintError>;

    async fn get_execution(
        &self,
        id: TaskExecutionId,
    ) -> Result<Option<TaskExecution>, StintError>;

    /// Liveness reads for death detection; unknown ids are simply absent
    /// from the result.
    async fn get_executions(
        &self,
        ids: &[TaskExecutionId],
    ) -> Result<Vec<TaskExecution>, StintError>;

    async fn record_keep_alive(
        &self,
        id: TaskExecutionId,
        at: DateTime<Utc>,
    ) -> Result<(), StintError>;

    async fn close_execution(
        &self,
        id: TaskExecutionId,
        at: DateTime<Utc>,
        failed: bool,
    ) -> Result<(), StintError>;

    async fn append_event(&self, event: ExecutionEvent) -> Result<(), StintError>;

    async fn events_for(
        &self,
        id: TaskExecutionId,
    ) -> Result<Vec<ExecutionEvent>, StintError>;
}
