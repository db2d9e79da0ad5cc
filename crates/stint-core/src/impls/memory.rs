//! In-memory store implementation for development and tests.
//!
//! Implements both `TaskStore` and `BlockStore`. Coordination state (token
//! pool, critical sections) is held in its serialized form and decoded only
//! under the definition lock, so the versioned wire encoding is exercised on
//! every acquire/commit exactly as it would be against a real store.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::domain::{
    Block, BlockExecution, BlockId, CriticalSectionState, CriticalSectionType, ExecutionEvent,
    ItemStatus, ListBlockItem, TaskDefinition, TaskDefinitionId, TaskExecution, TaskExecutionId,
    TaskKey, TokenPool,
};
use crate::error::StintError;
use crate::ports::{BlockStore, Clock, DefinitionLock, TaskStore};

/// Per-definition coordination state, stored encoded.
struct DefinitionState {
    definition: TaskDefinition,

    /// The cross-process exclusive lock stands in for a row lock here.
    lock: Arc<Mutex<()>>,

    token_pool: Vec<u8>,
    user_section: Vec<u8>,
    client_section: Vec<u8>,
}

impl DefinitionState {
    fn new(definition: TaskDefinition) -> Result<Self, StintError> {
        Ok(Self {
            definition,
            lock: Arc::new(Mutex::new(())),
            token_pool: encode(&TokenPool::empty())?,
            user_section: encode(&CriticalSectionState::empty())?,
            client_section: encode(&CriticalSectionState::empty())?,
        })
    }
}

#[derive(Default)]
struct MemoryState {
    by_key: HashMap<TaskKey, TaskDefinitionId>,
    definitions: HashMap<TaskDefinitionId, DefinitionState>,

    executions: HashMap<TaskExecutionId, TaskExecution>,
    events: Vec<ExecutionEvent>,

    blocks: HashMap<BlockId, Block>,
    /// Append-only, in creation order.
    block_executions: Vec<BlockExecution>,
    forced: HashMap<TaskDefinitionId, VecDeque<BlockId>>,
    /// In insert order.
    list_items: Vec<ListBlockItem>,
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, StintError> {
    serde_json::to_vec(value).map_err(|e| StintError::Execution(format!("encoding state: {e}")))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StintError> {
    serde_json::from_slice(bytes)
        .map_err(|e| StintError::Execution(format!("corrupt stored state: {e}")))
}

/// In-memory `TaskStore` + `BlockStore`.
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            clock,
        }
    }

    /// Every logged event, in append order.
    #[cfg(test)]
    pub async fn all_events(&self) -> Vec<ExecutionEvent> {
        self.state.lock().await.events.clone()
    }

    /// Corrupt a definition's stored token pool (for tests of the corrupt
    /// encoding path).
    #[cfg(test)]
    pub async fn corrupt_token_pool(&self, id: TaskDefinitionId) {
        let mut state = self.state.lock().await;
        if let Some(def) = state.definitions.get_mut(&id) {
            def.token_pool = b"not json".to_vec();
        }
    }
}

#[async_trait]
impl TaskStore for InMemoryStore {
    async fn ensure_task_definition(&self, key: &TaskKey) -> Result<TaskDefinition, StintError> {
        let mut state = self.state.lock().await;
        if let Some(id) = state.by_key.get(key)
            && let Some(def) = state.definitions.get(id)
        {
            return Ok(def.definition.clone());
        }

        let now = self.clock.now();
        let id = TaskDefinitionId::generate(now.timestamp_millis() as u64);
        let definition = TaskDefinition::new(id, key.clone(), now);
        state.by_key.insert(key.clone(), id);
        state
            .definitions
            .insert(id, DefinitionState::new(definition.clone())?);
        Ok(definition)
    }

    async fn get_task_definition(
        &self,
        id: TaskDefinitionId,
    ) -> Result<Option<TaskDefinition>, StintError> {
        let state = self.state.lock().await;
        Ok(state.definitions.get(&id).map(|d| d.definition.clone()))
    }

    async fn lock_definition(
        &self,
        id: TaskDefinitionId,
    ) -> Result<Box<dyn DefinitionLock>, StintError> {
        let lock = {
            let state = self.state.lock().await;
            let def = state
                .definitions
                .get(&id)
                .ok_or_else(|| StintError::CriticalSection(format!("unknown definition {id}")))?;
            Arc::clone(&def.lock)
        };

        // Take the definition lock outside the state mutex, then snapshot
        // the encoded values. Writes to these values only happen while the
        // definition lock is held, so the snapshot is current.
        let guard = lock.lock_owned().await;
        let state = self.state.lock().await;
        let def = state
            .definitions
            .get(&id)
            .ok_or_else(|| StintError::CriticalSection(format!("unknown definition {id}")))?;

        Ok(Box::new(InMemoryDefinitionLock {
            definition_id: id,
            state: Arc::clone(&self.state),
            _guard: guard,
            token_pool: def.token_pool.clone(),
            user_section: def.user_section.clone(),
            client_section: def.client_section.clone(),
            pending_pool: None,
            pending_sections: [None, None],
        }))
    }

    async fn insert_execution(&self, execution: TaskExecution) -> Result<(), StintError> {
        let mut state = self.state.lock().await;
        state.executions.insert(execution.id, execution);
        Ok(())
    }

    async fn get_execution(
        &self,
        id: TaskExecutionId,
    ) -> Result<Option<TaskExecution>, StintError> {
        let state = self.state.lock().await;
        Ok(state.executions.get(&id).cloned())
    }

    async fn get_executions(
        &self,
        ids: &[TaskExecutionId],
    ) -> Result<Vec<TaskExecution>, StintError> {
        let state = self.state.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.executions.get(id).cloned())
            .collect())
    }

    async fn record_keep_alive(
        &self,
        id: TaskExecutionId,
        at: DateTime<Utc>,
    ) -> Result<(), StintError> {
        let mut state = self.state.lock().await;
        if let Some(execution) = state.executions.get_mut(&id) {
            execution.keep_alive(at);
        }
        Ok(())
    }

    async fn close_execution(
        &self,
        id: TaskExecutionId,
        at: DateTime<Utc>,
        failed: bool,
    ) -> Result<(), StintError> {
        let mut state = self.state.lock().await;
        if let Some(execution) = state.executions.get_mut(&id) {
            execution.close(at, failed);
        }
        Ok(())
    }

    async fn append_event(&self, event: ExecutionEvent) -> Result<(), StintError> {
        let mut state = self.state.lock().await;
        state.events.push(event);
        Ok(())
    }

    async fn events_for(&self, id: TaskExecutionId) -> Result<Vec<ExecutionEvent>, StintError> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .filter(|e| e.task_execution_id == id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl BlockStore for InMemoryStore {
    async fn insert_block(&self, block: Block) -> Result<(), StintError> {
        let mut state = self.state.lock().await;
        state.blocks.insert(block.id, block);
        Ok(())
    }

    async fn get_block(&self, id: BlockId) -> Result<Option<Block>, StintError> {
        let state = self.state.lock().await;
        Ok(state.blocks.get(&id).cloned())
    }

    async fn insert_block_execution(&self, execution: BlockExecution) -> Result<(), StintError> {
        let mut state = self.state.lock().await;
        state.block_executions.push(execution);
        Ok(())
    }

    async fn update_block_execution(&self, execution: BlockExecution) -> Result<(), StintError> {
        let mut state = self.state.lock().await;
        match state
            .block_executions
            .iter_mut()
            .find(|be| be.id == execution.id)
        {
            Some(row) => {
                *row = execution;
                Ok(())
            }
            None => Err(StintError::Execution(format!(
                "unknown block execution {}",
                execution.id
            ))),
        }
    }

    async fn attempts_for_block(
        &self,
        block_id: BlockId,
    ) -> Result<Vec<BlockExecution>, StintError> {
        let state = self.state.lock().await;
        Ok(state
            .block_executions
            .iter()
            .filter(|be| be.block_id == block_id)
            .cloned()
            .collect())
    }

    async fn block_executions_since(
        &self,
        task_definition_id: TaskDefinitionId,
        since: DateTime<Utc>,
    ) -> Result<Vec<BlockExecution>, StintError> {
        let state = self.state.lock().await;
        let mut rows: Vec<BlockExecution> = state
            .block_executions
            .iter()
            .filter(|be| be.created_at >= since)
            .filter(|be| {
                state
                    .blocks
                    .get(&be.block_id)
                    .is_some_and(|b| b.task_definition_id == task_definition_id)
            })
            .cloned()
            .collect();
        rows.sort_by_key(|be| be.created_at);
        Ok(rows)
    }

    async fn push_forced_block(
        &self,
        task_definition_id: TaskDefinitionId,
        block_id: BlockId,
    ) -> Result<(), StintError> {
        let mut state = self.state.lock().await;
        state
            .forced
            .entry(task_definition_id)
            .or_default()
            .push_back(block_id);
        Ok(())
    }

    async fn take_forced_blocks(
        &self,
        task_definition_id: TaskDefinitionId,
    ) -> Result<Vec<BlockId>, StintError> {
        let mut state = self.state.lock().await;
        Ok(state
            .forced
            .remove(&task_definition_id)
            .map(Vec::from)
            .unwrap_or_default())
    }

    async fn insert_list_items(&self, items: Vec<ListBlockItem>) -> Result<(), StintError> {
        let mut state = self.state.lock().await;
        state.list_items.extend(items);
        Ok(())
    }

    async fn update_list_items(&self, items: Vec<ListBlockItem>) -> Result<(), StintError> {
        let mut state = self.state.lock().await;
        for item in items {
            match state.list_items.iter_mut().find(|i| i.id == item.id) {
                Some(row) => *row = item,
                None => {
                    return Err(StintError::Execution(format!(
                        "unknown list item {}",
                        item.id
                    )));
                }
            }
        }
        Ok(())
    }

    async fn list_items(
        &self,
        block_id: BlockId,
        statuses: &[ItemStatus],
    ) -> Result<Vec<ListBlockItem>, StintError> {
        let state = self.state.lock().await;
        Ok(state
            .list_items
            .iter()
            .filter(|i| i.block_id == block_id)
            .filter(|i| statuses.is_empty() || statuses.contains(&i.status))
            .cloned()
            .collect())
    }
}

/// Guard over one definition's coordination state.
struct InMemoryDefinitionLock {
    definition_id: TaskDefinitionId,
    state: Arc<Mutex<MemoryState>>,
    _guard: OwnedMutexGuard<()>,

    token_pool: Vec<u8>,
    user_section: Vec<u8>,
    client_section: Vec<u8>,

    pending_pool: Option<TokenPool>,
    pending_sections: [Option<CriticalSectionState>; 2],
}

fn section_index(section: CriticalSectionType) -> usize {
    match section {
        CriticalSectionType::User => 0,
        CriticalSectionType::Client => 1,
    }
}

#[async_trait]
impl DefinitionLock for InMemoryDefinitionLock {
    fn token_pool(&self) -> Result<TokenPool, StintError> {
        match &self.pending_pool {
            Some(pool) => Ok(pool.clone()),
            None => decode(&self.token_pool),
        }
    }

    fn set_token_pool(&mut self, pool: TokenPool) {
        self.pending_pool = Some(pool);
    }

    fn critical_section(
        &self,
        section: CriticalSectionType,
    ) -> Result<CriticalSectionState, StintError> {
        if let Some(pending) = &self.pending_sections[section_index(section)] {
            return Ok(pending.clone());
        }
        match section {
            CriticalSectionType::User => decode(&self.user_section),
            CriticalSectionType::Client => decode(&self.client_section),
        }
    }

    fn set_critical_section(&mut self, section: CriticalSectionType, state: CriticalSectionState) {
        self.pending_sections[section_index(section)] = Some(state);
    }

    async fn commit(self: Box<Self>) -> Result<(), StintError> {
        let mut state = self.state.lock().await;
        let def = state
            .definitions
            .get_mut(&self.definition_id)
            .ok_or_else(|| {
                StintError::CriticalSection(format!("unknown definition {}", self.definition_id))
            })?;

        if let Some(pool) = &self.pending_pool {
            def.token_pool = encode(pool)?;
        }
        if let Some(section) = &self.pending_sections[0] {
            def.user_section = encode(section)?;
        }
        if let Some(section) = &self.pending_sections[1] {
            def.client_section = encode(section)?;
        }
        Ok(())
        // _guard drops here, releasing the definition lock.
    }
}
