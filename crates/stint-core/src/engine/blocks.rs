//! Block allocation and lifecycle.
//!
//! One allocation call serves three sources, in priority order:
//! 1. the forced-block queue (operator-injected, bypasses windows and retry
//!    caps),
//! 2. reprocess candidates (failed or dead prior attempts within the
//!    detection window, bounded by the retry limit),
//! 3. fresh partitions of the requested scope, bounded by
//!    `max_blocks_to_generate`.
//!
//! Every allocated block gets a new `BlockExecution` row; attempt history is
//! append-only.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::domain::{
    Block, BlockExecution, BlockExecutionId, BlockExecutionStatus, BlockId, BlockPayload,
    EventKind, ExecutionEvent, TaskDefinitionId, TaskExecutionId,
};
use crate::engine::death::has_expired;
use crate::engine::list_tracker::{CommitPolicy, ListBlockTracker, encode_values};
use crate::engine::partitioner::{split_date_range, split_list, split_numeric_range};
use crate::error::StintError;
use crate::ports::{BlockStore, Clock, TaskConfig, TaskStore};

/// What workload a caller wants partitioned.
#[derive(Debug, Clone)]
pub enum BlockScope {
    DateRange {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        max_block_range: Duration,
    },
    NumericRange {
        from: i64,
        to: i64,
        max_block_size: u64,
    },
    List {
        values: Vec<String>,
        max_batch_size: usize,
    },
    Object {
        payload: serde_json::Value,
    },
}

/// Which prior attempts are eligible for reprocessing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReprocessMode {
    /// Every block in the window, regardless of status.
    Everything,

    /// Failed attempts, plus attempts whose owner died mid-flight.
    PendingOrFailed,

    /// Blocks belonging to the run identified by this reference value.
    ByReferenceValue(String),
}

/// Detection windows and retry limits. Defaults come from `TaskConfig`;
/// callers may override per request.
#[derive(Debug, Clone)]
pub struct ReprocessSettings {
    pub mode: ReprocessMode,
    pub failed_window: Duration,
    pub failed_retry_limit: u32,
    pub dead_window: Duration,
    pub dead_retry_limit: u32,
}

impl ReprocessSettings {
    pub fn from_config(config: &TaskConfig) -> Self {
        Self {
            mode: ReprocessMode::PendingOrFailed,
            failed_window: config.failed_detection_window,
            failed_retry_limit: config.failed_retry_limit,
            dead_window: config.dead_detection_window,
            dead_retry_limit: config.dead_retry_limit,
        }
    }

    pub fn with_mode(mut self, mode: ReprocessMode) -> Self {
        self.mode = mode;
        self
    }
}

pub struct BlockAllocator {
    task_store: Arc<dyn TaskStore>,
    block_store: Arc<dyn BlockStore>,
    clock: Arc<dyn Clock>,
}

impl BlockAllocator {
    pub fn new(
        task_store: Arc<dyn TaskStore>,
        block_store: Arc<dyn BlockStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            task_store,
            block_store,
            clock,
        }
    }

    /// Allocate the blocks for one execution: forced, then reprocess
    /// candidates, then fresh partitions of `scope`.
    pub async fn allocate(
        &self,
        definition_id: TaskDefinitionId,
        execution_id: TaskExecutionId,
        scope: BlockScope,
        settings: &ReprocessSettings,
        config: &TaskConfig,
    ) -> Result<Vec<BlockHandle>, StintError> {
        let mut handles = Vec::new();

        for block_id in self.block_store.take_forced_blocks(definition_id).await? {
            let Some(block) = self.block_store.get_block(block_id).await? else {
                tracing::warn!(%block_id, "forced block not found, skipping");
                continue;
            };
            tracing::info!(%block_id, "dispatching forced block");
            handles.push(self.new_attempt(block, execution_id).await?);
        }

        for block in self
            .find_reprocess_candidates(definition_id, settings)
            .await?
        {
            handles.push(self.new_attempt(block, execution_id).await?);
        }

        for block in self.generate(definition_id, scope, config).await? {
            handles.push(self.new_attempt(block, execution_id).await?);
        }

        Ok(handles)
    }

    /// Prior blocks eligible for a new attempt, oldest first.
    ///
    /// A block whose latest attempt is still in flight under a live owner is
    /// never handed out. Eligibility otherwise follows the mode; the attempt
    /// total (all-time, not windowed) must stay below `retry_limit + 1`.
    pub async fn find_reprocess_candidates(
        &self,
        definition_id: TaskDefinitionId,
        settings: &ReprocessSettings,
    ) -> Result<Vec<Block>, StintError> {
        let now = self.clock.now();
        let horizon = sub_window(now, settings.failed_window.max(settings.dead_window));
        let rows = self
            .block_store
            .block_executions_since(definition_id, horizon)
            .await?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        // Rows come oldest first: remember first-seen order, keep the latest
        // row per block.
        let mut order: Vec<BlockId> = Vec::new();
        let mut latest: HashMap<BlockId, BlockExecution> = HashMap::new();
        for row in rows {
            if !latest.contains_key(&row.block_id) {
                order.push(row.block_id);
            }
            latest.insert(row.block_id, row);
        }

        let owner_ids: Vec<TaskExecutionId> =
            latest.values().map(|r| r.task_execution_id).collect();
        let owners: HashMap<TaskExecutionId, _> = self
            .task_store
            .get_executions(&owner_ids)
            .await?
            .into_iter()
            .map(|e| (e.id, e))
            .collect();

        let mut candidates = Vec::new();
        for block_id in order {
            let last = &latest[&block_id];
            let owner = owners.get(&last.task_execution_id);
            // An owner whose row vanished counts as dead.
            let owner_expired = owner.is_none_or(|e| has_expired(e, now));

            if !last.status.is_terminal() && !owner_expired {
                // Still in flight under a live owner.
                continue;
            }

            let (eligible, window, retry_limit) = match &settings.mode {
                ReprocessMode::Everything => {
                    (true, settings.failed_window, settings.failed_retry_limit)
                }
                ReprocessMode::PendingOrFailed => match last.status {
                    BlockExecutionStatus::Failed => {
                        (true, settings.failed_window, settings.failed_retry_limit)
                    }
                    BlockExecutionStatus::NotStarted | BlockExecutionStatus::Started => {
                        (owner_expired, settings.dead_window, settings.dead_retry_limit)
                    }
                    BlockExecutionStatus::Completed => (false, settings.failed_window, 0),
                },
                ReprocessMode::ByReferenceValue(reference) => {
                    let matches = owner
                        .and_then(|e| e.reference_value.as_deref())
                        .is_some_and(|r| r == reference);
                    (matches, settings.failed_window, settings.failed_retry_limit)
                }
            };
            if !eligible || last.created_at < sub_window(now, window) {
                continue;
            }

            let attempts = self.block_store.attempts_for_block(block_id).await?.len() as u32;
            if attempts >= retry_limit + 1 {
                tracing::debug!(%block_id, attempts, retry_limit, "retry limit reached");
                continue;
            }

            let block = self.block_store.get_block(block_id).await?.ok_or_else(|| {
                StintError::Execution(format!("block {block_id} has attempts but no descriptor"))
            })?;
            candidates.push(block);
        }
        Ok(candidates)
    }

    /// Create and persist fresh blocks for the scope, capped by
    /// `max_blocks_to_generate`. List blocks get their item rows inserted
    /// here as well.
    async fn generate(
        &self,
        definition_id: TaskDefinitionId,
        scope: BlockScope,
        config: &TaskConfig,
    ) -> Result<Vec<Block>, StintError> {
        let cap = config.max_blocks_to_generate;
        let payloads: Vec<BlockPayload> = match scope {
            BlockScope::DateRange {
                from,
                to,
                max_block_range,
            } => split_date_range(from, to, max_block_range, cap)
                .into_iter()
                .map(|(from, to)| BlockPayload::DateRange { from, to })
                .collect(),
            BlockScope::NumericRange {
                from,
                to,
                max_block_size,
            } => split_numeric_range(from, to, max_block_size, cap)
                .into_iter()
                .map(|(from, to)| BlockPayload::NumericRange { from, to })
                .collect(),
            BlockScope::List {
                values,
                max_batch_size,
            } => {
                let mut blocks = Vec::new();
                for batch in split_list(values, max_batch_size, cap) {
                    let block = self.insert_block(definition_id, BlockPayload::List).await?;
                    let items =
                        encode_values(block.id, batch, config.compression_threshold, || {
                            self.clock.now().timestamp_millis() as u64
                        })?;
                    self.block_store.insert_list_items(items).await?;
                    blocks.push(block);
                }
                return Ok(blocks);
            }
            BlockScope::Object { payload } => {
                if cap == 0 {
                    Vec::new()
                } else {
                    vec![BlockPayload::Object { payload }]
                }
            }
        };

        let mut blocks = Vec::with_capacity(payloads.len());
        for payload in payloads {
            blocks.push(self.insert_block(definition_id, payload).await?);
        }
        Ok(blocks)
    }

    async fn insert_block(
        &self,
        definition_id: TaskDefinitionId,
        payload: BlockPayload,
    ) -> Result<Block, StintError> {
        let now = self.clock.now();
        let block = Block::new(
            BlockId::generate(now.timestamp_millis() as u64),
            definition_id,
            payload,
            now,
        );
        self.block_store.insert_block(block.clone()).await?;
        Ok(block)
    }

    /// Append a new attempt row for this block.
    async fn new_attempt(
        &self,
        block: Block,
        execution_id: TaskExecutionId,
    ) -> Result<BlockHandle, StintError> {
        let attempt = self.block_store.attempts_for_block(block.id).await?.len() as u32 + 1;
        let now = self.clock.now();
        let execution = BlockExecution::new(
            BlockExecutionId::generate(now.timestamp_millis() as u64),
            block.id,
            execution_id,
            attempt,
            now,
        );
        self.block_store
            .insert_block_execution(execution.clone())
            .await?;
        Ok(BlockHandle {
            block,
            execution,
            task_store: Arc::clone(&self.task_store),
            block_store: Arc::clone(&self.block_store),
            clock: Arc::clone(&self.clock),
        })
    }
}

fn sub_window(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    let window = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::MAX);
    now.checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// One allocated block plus its current attempt row.
///
/// The caller drives the lifecycle: `start`, then `complete` or `failed`.
/// Failing a block is non-fatal for the run: it records an error event and
/// leaves sibling blocks and the overall task untouched.
pub struct BlockHandle {
    block: Block,
    execution: BlockExecution,
    task_store: Arc<dyn TaskStore>,
    block_store: Arc<dyn BlockStore>,
    clock: Arc<dyn Clock>,
}

impl BlockHandle {
    pub fn block(&self) -> &Block {
        &self.block
    }

    pub fn payload(&self) -> &BlockPayload {
        &self.block.payload
    }

    pub fn attempt(&self) -> u32 {
        self.execution.attempt
    }

    pub fn status(&self) -> BlockExecutionStatus {
        self.execution.status
    }

    pub async fn start(&mut self) -> Result<(), StintError> {
        if self.execution.status != BlockExecutionStatus::NotStarted {
            return Err(StintError::InvalidArgument(format!(
                "block {} attempt already {:?}",
                self.block.id, self.execution.status
            )));
        }
        self.execution.start(self.clock.now());
        self.block_store
            .update_block_execution(self.execution.clone())
            .await
    }

    pub async fn complete(&mut self, items_processed: u64) -> Result<(), StintError> {
        if self.execution.status != BlockExecutionStatus::Started {
            return Err(StintError::InvalidArgument(format!(
                "block {} attempt is {:?}, not started",
                self.block.id, self.execution.status
            )));
        }
        self.execution.complete(self.clock.now(), items_processed);
        self.block_store
            .update_block_execution(self.execution.clone())
            .await
    }

    pub async fn failed(&mut self, message: &str) -> Result<(), StintError> {
        if self.execution.status != BlockExecutionStatus::Started {
            return Err(StintError::InvalidArgument(format!(
                "block {} attempt is {:?}, not started",
                self.block.id, self.execution.status
            )));
        }
        let now = self.clock.now();
        self.execution.fail(now);
        self.block_store
            .update_block_execution(self.execution.clone())
            .await?;
        tracing::warn!(
            block = %self.block.id,
            attempt = self.execution.attempt,
            message,
            "block failed"
        );
        self.task_store
            .append_event(ExecutionEvent::new(
                self.execution.task_execution_id,
                EventKind::Error,
                Some(format!("block {} failed: {message}", self.block.id)),
                now,
            ))
            .await
    }

    /// Item tracker for a List block.
    pub fn list_tracker(&self, policy: CommitPolicy) -> Result<ListBlockTracker, StintError> {
        if !matches!(self.block.payload, BlockPayload::List) {
            return Err(StintError::InvalidArgument(format!(
                "block {} is not a list block",
                self.block.id
            )));
        }
        Ok(ListBlockTracker::new(
            self.block.id,
            Arc::clone(&self.block_store),
            policy,
        ))
    }
}
