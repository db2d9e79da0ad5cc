//! The coordinator and the execution context: the crate's front door.
//!
//! `TaskCoordinator` resolves configuration and task definitions;
//! `TaskExecutionContext` is one run of a task, from `try_start` through
//! block processing to `complete` or `error`. While a context is open it
//! heartbeats in the background so other processes can tell it is alive.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::domain::{
    CriticalSectionType, DeathMode, EventKind, ExecutionEvent, TaskDefinition, TaskExecution,
    TaskExecutionId, TaskKey, TokenId,
};
use crate::engine::blocks::{BlockAllocator, BlockHandle, BlockScope, ReprocessSettings};
use crate::engine::cache::DefinitionCache;
use crate::engine::critical_section::{CriticalSectionArbiter, SectionGrant};
use crate::engine::retry::{AcquisitionRetry, StorageRetryPolicy, retry_transient};
use crate::engine::tokens::{ExecutionTokenManager, TokenGrant};
use crate::error::StintError;
use crate::ports::{BlockStore, Clock, ConfigSource, TaskStore};

const DEFINITION_CACHE_TTL: Duration = Duration::from_secs(300);

/// Entry point: resolves a task key to a startable execution context.
pub struct TaskCoordinator {
    task_store: Arc<dyn TaskStore>,
    block_store: Arc<dyn BlockStore>,
    config_source: Arc<dyn ConfigSource>,
    clock: Arc<dyn Clock>,
    cache: DefinitionCache,
    acquisition: AcquisitionRetry,
    storage_retry: StorageRetryPolicy,
}

impl TaskCoordinator {
    pub fn new(
        task_store: Arc<dyn TaskStore>,
        block_store: Arc<dyn BlockStore>,
        config_source: Arc<dyn ConfigSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            task_store,
            block_store,
            config_source,
            clock,
            cache: DefinitionCache::new(DEFINITION_CACHE_TTL),
            acquisition: AcquisitionRetry::default(),
            storage_retry: StorageRetryPolicy::default(),
        }
    }

    pub fn with_acquisition_retry(mut self, acquisition: AcquisitionRetry) -> Self {
        self.acquisition = acquisition;
        self
    }

    pub fn with_storage_retry(mut self, storage_retry: StorageRetryPolicy) -> Self {
        self.storage_retry = storage_retry;
        self
    }

    /// Resolve configuration and the task definition for `key` and hand back
    /// an unstarted context. Missing configuration and invalid death-mode
    /// settings fail here, before anything touches coordination state.
    pub async fn create_context(
        &self,
        key: TaskKey,
    ) -> Result<TaskExecutionContext, StintError> {
        let config = self.config_source.config_for(&key).await?;
        config.validate()?;

        let definition = match self.cache.get(&key) {
            Some(definition) => definition,
            None => {
                let store = Arc::clone(&self.task_store);
                let definition = retry_transient(&self.storage_retry, || {
                    let store = Arc::clone(&store);
                    let key = key.clone();
                    async move { store.ensure_task_definition(&key).await }
                })
                .await?;
                self.cache.insert(definition.clone());
                definition
            }
        };

        Ok(TaskExecutionContext {
            definition,
            config,
            tokens: ExecutionTokenManager::new(
                Arc::clone(&self.task_store),
                Arc::clone(&self.clock),
            ),
            user_sections: CriticalSectionArbiter::new(
                Arc::clone(&self.task_store),
                Arc::clone(&self.clock),
                CriticalSectionType::User,
            ),
            client_sections: CriticalSectionArbiter::new(
                Arc::clone(&self.task_store),
                Arc::clone(&self.clock),
                CriticalSectionType::Client,
            ),
            allocator: BlockAllocator::new(
                Arc::clone(&self.task_store),
                Arc::clone(&self.block_store),
                Arc::clone(&self.clock),
            ),
            task_store: Arc::clone(&self.task_store),
            clock: Arc::clone(&self.clock),
            acquisition: self.acquisition.clone(),
            storage_retry: self.storage_retry.clone(),
            active: None,
        })
    }
}

struct Heartbeat {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct ActiveExecution {
    execution_id: TaskExecutionId,
    token_id: TokenId,
    heartbeat: Option<Heartbeat>,
}

/// One run of a task.
///
/// Lifecycle: `try_start` (may be refused), then any number of checkpoints,
/// critical sections and block requests, then exactly one of `complete` or
/// `error(_, true)`. Dropping an open context stops the heartbeat but leaves
/// the execution row open; death detection reclaims its token later.
pub struct TaskExecutionContext {
    definition: TaskDefinition,
    config: crate::ports::TaskConfig,

    tokens: ExecutionTokenManager,
    user_sections: CriticalSectionArbiter,
    client_sections: CriticalSectionArbiter,
    allocator: BlockAllocator,

    task_store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    acquisition: AcquisitionRetry,
    storage_retry: StorageRetryPolicy,

    active: Option<ActiveExecution>,
}

impl fmt::Debug for TaskExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskExecutionContext")
            .field("task", &self.definition.key)
            .field("execution_id", &self.execution_id())
            .finish_non_exhaustive()
    }
}

impl TaskExecutionContext {
    pub fn task_key(&self) -> &TaskKey {
        &self.definition.key
    }

    pub fn execution_id(&self) -> Option<TaskExecutionId> {
        self.active.as_ref().map(|a| a.execution_id)
    }

    pub async fn try_start(&mut self) -> Result<bool, StintError> {
        self.try_start_with(None, None).await
    }

    /// Attempt to start this run.
    ///
    /// Returns `Ok(false)` when refused: the task is disabled, or no
    /// execution token could be acquired within the retry budget. A refused
    /// run is recorded (blocked or closed) and the context stays unstarted.
    pub async fn try_start_with(
        &mut self,
        reference_value: Option<String>,
        header: Option<serde_json::Value>,
    ) -> Result<bool, StintError> {
        if self.active.is_some() {
            return Err(StintError::InvalidArgument(
                "context is already started".into(),
            ));
        }

        let now = self.clock.now();
        let mut execution = TaskExecution::new(
            TaskExecutionId::generate(now.timestamp_millis() as u64),
            self.definition.id,
            now,
            self.config.death_mode,
        )
        .with_concurrency_limit(self.config.concurrency_limit)
        .with_reference_value(reference_value)
        .with_header(header);
        if let Some(threshold) = self.config.keep_alive_death_threshold {
            execution = execution.with_keep_alive_threshold(threshold);
        }
        if let Some(threshold) = self.config.override_threshold {
            execution = execution.with_override_threshold(threshold);
        }
        if self.config.death_mode == DeathMode::KeepAlive {
            execution.keep_alive(now);
        }

        if !self.config.enabled {
            execution.blocked = true;
            execution.close(now, false);
            let execution_id = execution.id;
            self.insert_execution(execution).await?;
            self.append_event(execution_id, EventKind::Blocked, Some("task is disabled".into()))
                .await?;
            tracing::info!(task = %self.definition.key, "start refused: task is disabled");
            return Ok(false);
        }

        let execution_id = execution.id;
        self.insert_execution(execution).await?;

        let mut grant = TokenGrant::Denied;
        for attempt in 1..=self.acquisition.attempts.max(1) {
            grant = retry_transient(&self.storage_retry, || {
                self.tokens.try_acquire(
                    self.definition.id,
                    execution_id,
                    self.config.concurrency_limit,
                )
            })
            .await?;
            if matches!(grant, TokenGrant::Granted(_)) {
                break;
            }
            if attempt < self.acquisition.attempts {
                tracing::debug!(task = %self.definition.key, attempt, "token denied, backing off");
                tokio::time::sleep(self.acquisition.delay).await;
            }
        }

        let token_id = match grant {
            TokenGrant::Granted(token_id) => token_id,
            TokenGrant::Denied => {
                self.append_event(
                    execution_id,
                    EventKind::Blocked,
                    Some("no execution token available".into()),
                )
                .await?;
                self.close_execution(execution_id, false).await?;
                tracing::info!(task = %self.definition.key, "start refused: no token");
                return Ok(false);
            }
        };

        let heartbeat = (self.config.death_mode == DeathMode::KeepAlive)
            .then(|| self.spawn_heartbeat(execution_id));
        self.append_event(execution_id, EventKind::Start, None).await?;
        tracing::info!(task = %self.definition.key, %execution_id, "execution started");

        self.active = Some(ActiveExecution {
            execution_id,
            token_id,
            heartbeat,
        });
        Ok(true)
    }

    /// Record a progress checkpoint in the event log.
    pub async fn checkpoint(&self, message: &str) -> Result<(), StintError> {
        let execution_id = self.require_active()?;
        self.append_event(execution_id, EventKind::Checkpoint, Some(message.into()))
            .await
    }

    /// Record a non-fatal or fatal error. With `treat_as_failed` the run is
    /// closed as failed and its token released; otherwise only the event is
    /// recorded and the run continues.
    pub async fn error(&mut self, message: &str, treat_as_failed: bool) -> Result<(), StintError> {
        let execution_id = self.require_active()?;
        self.append_event(execution_id, EventKind::Error, Some(message.into()))
            .await?;
        if !treat_as_failed {
            return Ok(());
        }
        tracing::warn!(task = %self.definition.key, %execution_id, message, "execution failed");
        self.finish(true).await
    }

    /// Close the run successfully and release its token.
    pub async fn complete(&mut self) -> Result<(), StintError> {
        let execution_id = self.require_active()?;
        self.append_event(execution_id, EventKind::End, None).await?;
        tracing::info!(task = %self.definition.key, %execution_id, "execution completed");
        self.finish(false).await
    }

    async fn finish(&mut self, failed: bool) -> Result<(), StintError> {
        let Some(active) = self.active.take() else {
            return Ok(());
        };
        if let Some(heartbeat) = active.heartbeat {
            let _ = heartbeat.shutdown.send(true);
            let _ = heartbeat.task.await;
        }
        self.close_execution(active.execution_id, failed).await?;
        retry_transient(&self.storage_retry, || {
            self.tokens
                .release(self.definition.id, active.execution_id, active.token_id)
        })
        .await
    }

    /// Request exclusive access to a critical section, retrying denials
    /// within the acquisition budget.
    pub async fn try_enter_critical_section(
        &self,
        section: CriticalSectionType,
    ) -> Result<SectionGrant, StintError> {
        let execution_id = self.require_active()?;
        let arbiter = self.arbiter(section);

        let mut grant = SectionGrant::Denied;
        for attempt in 1..=self.acquisition.attempts.max(1) {
            grant = retry_transient(&self.storage_retry, || {
                arbiter.start(self.definition.id, execution_id)
            })
            .await?;
            if grant == SectionGrant::Granted {
                break;
            }
            if attempt < self.acquisition.attempts {
                tokio::time::sleep(self.acquisition.delay).await;
            }
        }
        Ok(grant)
    }

    pub async fn exit_critical_section(
        &self,
        section: CriticalSectionType,
    ) -> Result<(), StintError> {
        let execution_id = self.require_active()?;
        retry_transient(&self.storage_retry, || {
            self.arbiter(section).complete(self.definition.id, execution_id)
        })
        .await
    }

    /// Allocate blocks for this run with the configured reprocess settings.
    pub async fn request_blocks(&self, scope: BlockScope) -> Result<Vec<BlockHandle>, StintError> {
        self.request_blocks_with(scope, &ReprocessSettings::from_config(&self.config))
            .await
    }

    /// Allocate blocks with explicit reprocess settings (mode, windows and
    /// retry limits overriding the task configuration).
    pub async fn request_blocks_with(
        &self,
        scope: BlockScope,
        settings: &ReprocessSettings,
    ) -> Result<Vec<BlockHandle>, StintError> {
        let execution_id = self.require_active()?;
        self.allocator
            .allocate(self.definition.id, execution_id, scope, settings, &self.config)
            .await
    }

    fn arbiter(&self, section: CriticalSectionType) -> &CriticalSectionArbiter {
        match section {
            CriticalSectionType::User => &self.user_sections,
            CriticalSectionType::Client => &self.client_sections,
        }
    }

    fn require_active(&self) -> Result<TaskExecutionId, StintError> {
        self.active
            .as_ref()
            .map(|a| a.execution_id)
            .ok_or_else(|| StintError::InvalidArgument("context is not started".into()))
    }

    fn spawn_heartbeat(&self, execution_id: TaskExecutionId) -> Heartbeat {
        let (shutdown, mut rx) = watch::channel(false);
        let store = Arc::clone(&self.task_store);
        let clock = Arc::clone(&self.clock);
        let interval = self.config.keep_alive_interval;
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = rx.changed() => break,
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = store.record_keep_alive(execution_id, clock.now()).await {
                            tracing::warn!(%execution_id, error = %e, "keep-alive write failed");
                        }
                    }
                }
            }
        });
        Heartbeat { shutdown, task }
    }

    async fn insert_execution(&self, execution: TaskExecution) -> Result<(), StintError> {
        retry_transient(&self.storage_retry, || {
            let execution = execution.clone();
            async move { self.task_store.insert_execution(execution).await }
        })
        .await
    }

    async fn close_execution(
        &self,
        execution_id: TaskExecutionId,
        failed: bool,
    ) -> Result<(), StintError> {
        retry_transient(&self.storage_retry, || {
            self.task_store
                .close_execution(execution_id, self.clock.now(), failed)
        })
        .await
    }

    async fn append_event(
        &self,
        execution_id: TaskExecutionId,
        kind: EventKind,
        message: Option<String>,
    ) -> Result<(), StintError> {
        retry_transient(&self.storage_retry, || {
            let event =
                ExecutionEvent::new(execution_id, kind, message.clone(), self.clock.now());
            async move { self.task_store.append_event(event).await }
        })
        .await
    }
}

impl Drop for TaskExecutionContext {
    fn drop(&mut self) {
        if let Some(active) = &self.active {
            if let Some(heartbeat) = &active.heartbeat {
                let _ = heartbeat.shutdown.send(true);
            }
            tracing::warn!(
                execution = %active.execution_id,
                "context dropped while open; execution left for death detection"
            );
        }
    }
}
