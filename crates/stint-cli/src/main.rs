//! Demo walkthrough of the coordination engine against the in-memory store:
//! two contenders for one concurrency slot, a partitioned date range, a
//! failing block, and the reprocess pass that picks it back up.

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use stint_core::domain::CriticalSectionType;
use stint_core::engine::{AcquisitionRetry, BlockScope, SectionGrant, TaskCoordinator};
use stint_core::impls::InMemoryStore;
use stint_core::ports::{
    BlockStore, Clock, ConfigSource, StaticConfigSource, SystemClock, TaskConfig, TaskStore,
};
use stint_core::{StintError, TaskKey};

#[tokio::main]
async fn main() -> Result<(), StintError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // (A) Wire up the coordinator: in-memory store, static configuration.
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(InMemoryStore::new(Arc::clone(&clock)));
    let configs = Arc::new(StaticConfigSource::new());
    let key = TaskKey::new("demo", "hourly-import");
    configs.insert(
        key.clone(),
        TaskConfig::default()
            .with_concurrency_limit(1)
            .with_keep_alive(Duration::from_millis(200), Duration::from_secs(60))
            .with_retry_limits(2, 2),
    );
    let coordinator = TaskCoordinator::new(
        Arc::clone(&store) as Arc<dyn TaskStore>,
        Arc::clone(&store) as Arc<dyn BlockStore>,
        configs as Arc<dyn ConfigSource>,
        clock,
    )
    .with_acquisition_retry(AcquisitionRetry::none());

    // (B) One slot, two contenders: the second start is refused.
    let mut first = coordinator.create_context(key.clone()).await?;
    let mut rival = coordinator.create_context(key.clone()).await?;
    let header = serde_json::json!({ "triggered_by": "scheduler", "shard": 0 });
    assert!(first.try_start_with(None, Some(header)).await?);
    tracing::info!(execution = ?first.execution_id(), "first runner started");
    assert!(!rival.try_start().await?);
    tracing::info!("rival refused while the slot is taken");

    // (C) Critical section around shared setup work.
    let grant = first
        .try_enter_critical_section(CriticalSectionType::User)
        .await?;
    assert_eq!(grant, SectionGrant::Granted);
    tracing::info!("critical section granted");
    first
        .exit_critical_section(CriticalSectionType::User)
        .await?;

    // (D) Partition the last three hours into one-hour blocks; fail one.
    let to = chrono::Utc::now();
    let mut handles = first
        .request_blocks(BlockScope::DateRange {
            from: to - chrono::Duration::hours(3),
            to,
            max_block_range: Duration::from_secs(3600),
        })
        .await?;
    tracing::info!(count = handles.len(), "allocated blocks");
    for (index, handle) in handles.iter_mut().enumerate() {
        handle.start().await?;
        if index == 1 {
            handle.failed("upstream returned a truncated file").await?;
            tracing::warn!(index, attempt = handle.attempt(), "block failed");
        } else {
            handle.complete(1_000).await?;
            tracing::info!(index, attempt = handle.attempt(), "block completed");
        }
    }
    first.checkpoint("first pass done").await?;
    first.complete().await?;
    tracing::info!("first runner completed");

    // (E) A later run picks the failed block back up before new work.
    let mut second = coordinator.create_context(key).await?;
    assert!(second.try_start().await?);
    let mut retries = second
        .request_blocks(BlockScope::NumericRange {
            from: 1,
            to: 0,
            max_block_size: 1,
        })
        .await?;
    tracing::info!(count = retries.len(), "reprocess pass returned blocks");
    for handle in &mut retries {
        handle.start().await?;
        handle.complete(1_000).await?;
        tracing::info!(
            block = %handle.block().id,
            attempt = handle.attempt(),
            "reprocessed block"
        );
    }
    second.complete().await?;
    tracing::info!("second runner completed");

    Ok(())
}
