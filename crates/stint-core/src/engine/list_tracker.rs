//! Per-item tracking for List blocks.
//!
//! The tracker buffers item-status changes and writes them to the store
//! according to a commit policy. `finish` must be called when the caller is
//! done with the block; with `BatchAtEnd` it is where everything lands.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::domain::{BlockId, ItemStatus, ItemValue, ListBlockItem, ListItemId};
use crate::error::StintError;
use crate::ports::BlockStore;

/// When buffered item-status changes are written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPolicy {
    /// Every change is written immediately.
    SingleItem,

    /// Changes are written once the buffer reaches this size.
    PeriodicBatch(usize),

    /// Everything is written in one batch at `finish`.
    BatchAtEnd,
}

/// An item as seen by the caller: value already decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedItem {
    pub id: ListItemId,
    pub value: String,
    pub status: ItemStatus,
    pub status_reason: Option<String>,
}

/// Build the stored item rows for one List block, compressing oversized
/// values. `next_id_ms` supplies the id timestamp component.
pub fn encode_values(
    block_id: BlockId,
    values: Vec<String>,
    compression_threshold: usize,
    mut next_id_ms: impl FnMut() -> u64,
) -> Result<Vec<ListBlockItem>, StintError> {
    values
        .into_iter()
        .map(|value| {
            let encoded = ItemValue::encode(value, compression_threshold)?;
            Ok(ListBlockItem::pending(
                ListItemId::generate(next_id_ms()),
                block_id,
                encoded,
            ))
        })
        .collect()
}

pub struct ListBlockTracker {
    block_id: BlockId,
    block_store: Arc<dyn BlockStore>,
    policy: CommitPolicy,
    loaded: HashMap<ListItemId, ListBlockItem>,
    buffer: Vec<ListBlockItem>,
    flushes: u32,
}

impl fmt::Debug for ListBlockTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListBlockTracker")
            .field("block_id", &self.block_id)
            .field("policy", &self.policy)
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

impl ListBlockTracker {
    pub(crate) fn new(
        block_id: BlockId,
        block_store: Arc<dyn BlockStore>,
        policy: CommitPolicy,
    ) -> Self {
        Self {
            block_id,
            block_store,
            policy,
            loaded: HashMap::new(),
            buffer: Vec::new(),
            flushes: 0,
        }
    }

    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    /// Load the block's items matching any of `statuses` (empty slice means
    /// all), decoding values. On a retry attempt, passing
    /// `&[Pending, Failed]` skips items that already completed.
    pub async fn get_items(
        &mut self,
        statuses: &[ItemStatus],
    ) -> Result<Vec<TrackedItem>, StintError> {
        let rows = self.block_store.list_items(self.block_id, statuses).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(TrackedItem {
                id: row.id,
                value: row.value.decode()?,
                status: row.status,
                status_reason: row.status_reason.clone(),
            });
            self.loaded.insert(row.id, row);
        }
        Ok(out)
    }

    pub async fn complete_item(&mut self, id: ListItemId) -> Result<(), StintError> {
        self.set_status(id, ItemStatus::Completed, None).await
    }

    pub async fn fail_item(&mut self, id: ListItemId, reason: &str) -> Result<(), StintError> {
        self.set_status(id, ItemStatus::Failed, Some(reason.to_string()))
            .await
    }

    pub async fn discard_item(&mut self, id: ListItemId, reason: &str) -> Result<(), StintError> {
        self.set_status(id, ItemStatus::Discarded, Some(reason.to_string()))
            .await
    }

    async fn set_status(
        &mut self,
        id: ListItemId,
        status: ItemStatus,
        reason: Option<String>,
    ) -> Result<(), StintError> {
        let item = self.loaded.get_mut(&id).ok_or_else(|| {
            StintError::InvalidArgument(format!("item {id} was not loaded from this block"))
        })?;
        // Completed and Discarded are terminal; only Pending and Failed move.
        if matches!(item.status, ItemStatus::Completed | ItemStatus::Discarded) {
            return Err(StintError::InvalidArgument(format!(
                "item {id} already has terminal status {:?}",
                item.status
            )));
        }
        item.status = status;
        item.status_reason = reason;
        self.buffer.push(item.clone());

        match self.policy {
            CommitPolicy::SingleItem => self.flush().await,
            CommitPolicy::PeriodicBatch(size) if self.buffer.len() >= size.max(1) => {
                self.flush().await
            }
            _ => Ok(()),
        }
    }

    /// Write buffered changes now. A no-op with an empty buffer.
    pub async fn flush(&mut self) -> Result<(), StintError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.buffer);
        tracing::debug!(block = %self.block_id, items = batch.len(), "flushing item statuses");
        self.block_store.update_list_items(batch).await?;
        self.flushes += 1;
        Ok(())
    }

    /// Final flush. Call once processing of the block is done.
    pub async fn finish(&mut self) -> Result<(), StintError> {
        self.flush().await
    }

    /// Number of store writes performed so far.
    pub fn flush_count(&self) -> u32 {
        self.flushes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Block;
    use crate::domain::BlockPayload;
    use crate::impls::InMemoryStore;
    use crate::ports::{SystemClock, TaskStore};
    use chrono::Utc;

    fn store() -> Arc<InMemoryStore> {
        Arc::new(InMemoryStore::new(Arc::new(SystemClock)))
    }

    async fn list_block(store: &Arc<InMemoryStore>, values: Vec<String>) -> BlockId {
        let definition = store
            .ensure_task_definition(&crate::domain::TaskKey::new("app", "list"))
            .await
            .unwrap();
        let block = Block::new(
            BlockId::generate(0),
            definition.id,
            BlockPayload::List,
            Utc::now(),
        );
        let id = block.id;
        store.insert_block(block).await.unwrap();
        let mut ms = 0u64;
        let items = encode_values(id, values, 1024, || {
            ms += 1;
            ms
        })
        .unwrap();
        store.insert_list_items(items).await.unwrap();
        id
    }

    fn tracker(store: &Arc<InMemoryStore>, block_id: BlockId, policy: CommitPolicy) -> ListBlockTracker {
        ListBlockTracker::new(block_id, Arc::clone(store) as Arc<dyn BlockStore>, policy)
    }

    #[tokio::test]
    async fn periodic_batch_flushes_once_per_threshold_plus_final() {
        let store = store();
        let values: Vec<String> = (0..120).map(|i| format!("item-{i}")).collect();
        let block_id = list_block(&store, values).await;

        let mut tracker = tracker(&store, block_id, CommitPolicy::PeriodicBatch(50));
        let items = tracker.get_items(&[]).await.unwrap();
        assert_eq!(items.len(), 120);

        for item in &items {
            tracker.complete_item(item.id).await.unwrap();
        }
        assert_eq!(tracker.flush_count(), 2);

        tracker.finish().await.unwrap();
        assert_eq!(tracker.flush_count(), 3);

        let pending = store
            .list_items(block_id, &[ItemStatus::Pending])
            .await
            .unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn single_item_policy_writes_immediately() {
        let store = store();
        let block_id = list_block(&store, vec!["a".into(), "b".into()]).await;

        let mut tracker = tracker(&store, block_id, CommitPolicy::SingleItem);
        let items = tracker.get_items(&[]).await.unwrap();
        tracker.fail_item(items[0].id, "boom").await.unwrap();

        let failed = store
            .list_items(block_id, &[ItemStatus::Failed])
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].status_reason.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn batch_at_end_defers_everything_to_finish() {
        let store = store();
        let block_id = list_block(&store, vec!["a".into(), "b".into(), "c".into()]).await;

        let mut tracker = tracker(&store, block_id, CommitPolicy::BatchAtEnd);
        let items = tracker.get_items(&[]).await.unwrap();
        for item in &items {
            tracker.complete_item(item.id).await.unwrap();
        }
        assert_eq!(tracker.flush_count(), 0);
        let still_pending = store
            .list_items(block_id, &[ItemStatus::Pending])
            .await
            .unwrap();
        assert_eq!(still_pending.len(), 3);

        tracker.finish().await.unwrap();
        assert_eq!(tracker.flush_count(), 1);
        let completed = store
            .list_items(block_id, &[ItemStatus::Completed])
            .await
            .unwrap();
        assert_eq!(completed.len(), 3);
    }

    #[tokio::test]
    async fn retry_selects_pending_and_failed_only() {
        let store = store();
        let block_id = list_block(
            &store,
            vec!["done".into(), "flaky".into(), "untouched".into()],
        )
        .await;

        let mut first = tracker(&store, block_id, CommitPolicy::SingleItem);
        let items = first.get_items(&[]).await.unwrap();
        first.complete_item(items[0].id).await.unwrap();
        first.fail_item(items[1].id, "transient").await.unwrap();
        first.finish().await.unwrap();

        let mut second = tracker(&store, block_id, CommitPolicy::SingleItem);
        let retryable = second
            .get_items(&[ItemStatus::Pending, ItemStatus::Failed])
            .await
            .unwrap();
        let values: Vec<&str> = retryable.iter().map(|i| i.value.as_str()).collect();
        assert_eq!(values, vec!["flaky", "untouched"]);
    }

    #[tokio::test]
    async fn oversized_values_round_trip_through_compression() {
        let store = store();
        let big = "v".repeat(5_000);
        let definition = store
            .ensure_task_definition(&crate::domain::TaskKey::new("app", "list"))
            .await
            .unwrap();
        let block = Block::new(
            BlockId::generate(0),
            definition.id,
            BlockPayload::List,
            Utc::now(),
        );
        let block_id = block.id;
        store.insert_block(block).await.unwrap();
        let items = encode_values(block_id, vec![big.clone()], 1024, || 1).unwrap();
        assert!(matches!(items[0].value, ItemValue::Compressed(_)));
        store.insert_list_items(items).await.unwrap();

        let mut tracker = tracker(&store, block_id, CommitPolicy::BatchAtEnd);
        let loaded = tracker.get_items(&[]).await.unwrap();
        assert_eq!(loaded[0].value, big);
    }

    #[tokio::test]
    async fn terminal_items_cannot_change_status() {
        let store = store();
        let block_id = list_block(&store, vec!["a".into(), "b".into()]).await;

        let mut tracker = tracker(&store, block_id, CommitPolicy::SingleItem);
        let items = tracker.get_items(&[]).await.unwrap();
        tracker.discard_item(items[0].id, "duplicate").await.unwrap();
        tracker.complete_item(items[1].id).await.unwrap();

        let err = tracker.complete_item(items[0].id).await.unwrap_err();
        assert!(matches!(err, StintError::InvalidArgument(_)));
        let err = tracker.fail_item(items[1].id, "late").await.unwrap_err();
        assert!(matches!(err, StintError::InvalidArgument(_)));

        // The stored rows kept their terminal statuses.
        let discarded = store
            .list_items(block_id, &[ItemStatus::Discarded])
            .await
            .unwrap();
        assert_eq!(discarded.len(), 1);
        let completed = store
            .list_items(block_id, &[ItemStatus::Completed])
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
    }

    #[tokio::test]
    async fn unloaded_item_is_rejected() {
        let store = store();
        let block_id = list_block(&store, vec!["a".into()]).await;

        let mut tracker = tracker(&store, block_id, CommitPolicy::SingleItem);
        let err = tracker
            .complete_item(ListItemId::generate(99))
            .await
            .unwrap_err();
        assert!(matches!(err, StintError::InvalidArgument(_)));
    }
}
