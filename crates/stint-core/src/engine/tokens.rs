//! Execution-token management: sizing and assignment of the per-definition
//! pool of concurrency slots.
//!
//! Every operation runs inside one definition lock: read the pool, resize it
//! to the configured limit, pick a token, write back only if something
//! changed.

use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::{
    ExecutionToken, TaskDefinitionId, TaskExecutionId, TokenId, TokenPool, TokenStatus,
};
use crate::engine::death::has_expired;
use crate::error::StintError;
use crate::ports::{Clock, TaskStore};

/// Result of a token acquisition. Denied is a value, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenGrant {
    Granted(TokenId),
    Denied,
}

pub struct ExecutionTokenManager {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
}

impl ExecutionTokenManager {
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Try to acquire a concurrency slot for `execution_id`.
    ///
    /// The pool is first converged to `concurrency_limit` (<= 0 means one
    /// Unlimited token). Assignment prefers free tokens; failing that, the
    /// first token whose current owner has expired is reclaimed.
    pub async fn try_acquire(
        &self,
        definition_id: TaskDefinitionId,
        execution_id: TaskExecutionId,
        concurrency_limit: i32,
    ) -> Result<TokenGrant, StintError> {
        let now = self.clock.now();
        let mut lock = self.store.lock_definition(definition_id).await?;
        let mut pool = lock.token_pool()?;

        let resized = resize_pool(&mut pool.tokens, concurrency_limit, now.timestamp_millis() as u64);

        let assignable = match pool.tokens.iter().position(ExecutionToken::is_assignable) {
            Some(index) => Some(index),
            None => self.find_reclaimable(&pool.tokens).await?,
        };

        let grant = match assignable {
            Some(index) => {
                let token = &mut pool.tokens[index];
                token.granted_to = Some(execution_id);
                if token.status != TokenStatus::Unlimited {
                    token.status = TokenStatus::Unavailable;
                }
                tracing::debug!(%definition_id, %execution_id, token = %token.token_id, "token granted");
                TokenGrant::Granted(token.token_id)
            }
            None => {
                tracing::debug!(%definition_id, %execution_id, "token denied");
                TokenGrant::Denied
            }
        };

        // Persist only when the pool actually changed.
        if resized || matches!(grant, TokenGrant::Granted(_)) {
            lock.set_token_pool(pool);
        }
        lock.commit().await?;
        Ok(grant)
    }

    /// Hand a slot back. The grant is left on the token for audit; flipping
    /// the status back to Available is what makes it assignable again.
    pub async fn release(
        &self,
        definition_id: TaskDefinitionId,
        execution_id: TaskExecutionId,
        token_id: TokenId,
    ) -> Result<(), StintError> {
        let mut lock = self.store.lock_definition(definition_id).await?;
        let mut pool = lock.token_pool()?;

        let released = pool
            .tokens
            .iter_mut()
            .find(|t| t.token_id == token_id && t.status == TokenStatus::Unavailable)
            .map(|t| t.status = TokenStatus::Available)
            .is_some();

        if released {
            tracing::debug!(%definition_id, %execution_id, token = %token_id, "token released");
            lock.set_token_pool(pool);
        }
        lock.commit().await
    }

    /// Index of the first granted token whose owner has expired. A grant to
    /// an execution the store no longer knows is treated as expired.
    async fn find_reclaimable(
        &self,
        tokens: &[ExecutionToken],
    ) -> Result<Option<usize>, StintError> {
        let granted: Vec<(usize, TaskExecutionId)> = tokens
            .iter()
            .enumerate()
            .filter(|(_, t)| t.status != TokenStatus::Disabled)
            .filter_map(|(i, t)| t.granted_to.map(|owner| (i, owner)))
            .collect();
        if granted.is_empty() {
            return Ok(None);
        }

        let ids: Vec<TaskExecutionId> = granted.iter().map(|(_, owner)| *owner).collect();
        let executions = self.store.get_executions(&ids).await?;
        let by_id: HashMap<TaskExecutionId, _> =
            executions.into_iter().map(|e| (e.id, e)).collect();

        let now = self.clock.now();
        for (index, owner) in granted {
            let dead = match by_id.get(&owner) {
                Some(execution) => has_expired(execution, now),
                None => true,
            };
            if dead {
                tracing::info!(%owner, "reclaiming token from expired execution");
                return Ok(Some(index));
            }
        }
        Ok(None)
    }
}

/// Converge the pool to the requested limit. Returns true when the pool was
/// mutated.
fn resize_pool(tokens: &mut Vec<ExecutionToken>, limit: i32, now_ms: u64) -> bool {
    if limit <= 0 {
        // Unlimited: exactly one Unlimited token.
        if tokens.len() == 1 && tokens[0].status == TokenStatus::Unlimited {
            return false;
        }
        *tokens = vec![ExecutionToken::unlimited(TokenId::generate(now_ms))];
        return true;
    }

    let target = limit as usize;
    let mut changed = false;

    let before = tokens.len();
    tokens.retain(|t| t.status != TokenStatus::Unlimited);
    changed |= tokens.len() != before;

    while tokens.len() < target {
        tokens.push(ExecutionToken::available(TokenId::generate(now_ms)));
        changed = true;
    }

    // Shrink: sacrifice Available tokens first so in-flight grants survive
    // when possible, then fall back to the oldest token.
    while tokens.len() > target {
        match tokens.iter().position(|t| t.status == TokenStatus::Available) {
            Some(index) => tokens.remove(index),
            None => tokens.remove(0),
        };
        changed = true;
    }

    changed
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use rstest::rstest;
    use ulid::Ulid;

    use super::*;
    use crate::domain::{DeathMode, TaskExecution, TaskKey};
    use crate::impls::InMemoryStore;
    use crate::ports::FixedClock;

    struct Fixture {
        store: Arc<InMemoryStore>,
        clock: Arc<FixedClock>,
        manager: ExecutionTokenManager,
        definition_id: TaskDefinitionId,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
        ));
        let store = Arc::new(InMemoryStore::new(clock.clone()));
        let definition = store
            .ensure_task_definition(&TaskKey::new("app", "task"))
            .await
            .unwrap();
        let manager = ExecutionTokenManager::new(store.clone(), clock.clone());
        Fixture {
            store,
            clock,
            manager,
            definition_id: definition.id,
        }
    }

    /// A live keep-alive execution registered in the store.
    async fn live_execution(f: &Fixture) -> TaskExecutionId {
        let id = TaskExecutionId::from_ulid(Ulid::new());
        let mut execution = TaskExecution::new(
            id,
            f.definition_id,
            f.clock.now(),
            DeathMode::KeepAlive,
        )
        .with_keep_alive_threshold(Duration::from_secs(600));
        execution.keep_alive(f.clock.now());
        f.store.insert_execution(execution).await.unwrap();
        id
    }

    async fn pool(f: &Fixture) -> TokenPool {
        let lock = f.store.lock_definition(f.definition_id).await.unwrap();
        lock.token_pool().unwrap()
    }

    #[tokio::test]
    async fn scenario_limit_one_grant_deny_release_grant() {
        let f = fixture().await;
        let (a, b, c) = (
            live_execution(&f).await,
            live_execution(&f).await,
            live_execution(&f).await,
        );

        let first = f.manager.try_acquire(f.definition_id, a, 1).await.unwrap();
        let TokenGrant::Granted(token) = first else {
            panic!("expected grant");
        };
        let p = pool(&f).await;
        assert_eq!(p.tokens.len(), 1);
        assert_eq!(p.tokens[0].status, TokenStatus::Unavailable);

        let second = f.manager.try_acquire(f.definition_id, b, 1).await.unwrap();
        assert_eq!(second, TokenGrant::Denied);

        f.manager.release(f.definition_id, a, token).await.unwrap();
        let third = f.manager.try_acquire(f.definition_id, c, 1).await.unwrap();
        assert!(matches!(third, TokenGrant::Granted(_)));
    }

    #[tokio::test]
    async fn concurrent_acquires_grant_exactly_one() {
        let f = fixture().await;
        let a = live_execution(&f).await;
        let b = live_execution(&f).await;

        let (ra, rb) = tokio::join!(
            f.manager.try_acquire(f.definition_id, a, 1),
            f.manager.try_acquire(f.definition_id, b, 1),
        );
        let granted = [ra.unwrap(), rb.unwrap()]
            .iter()
            .filter(|g| matches!(g, TokenGrant::Granted(_)))
            .count();
        assert_eq!(granted, 1);
    }

    #[rstest]
    #[case::grow(1, 4)]
    #[case::shrink(5, 2)]
    #[case::same(3, 3)]
    #[tokio::test]
    async fn pool_converges_to_limit(#[case] first: i32, #[case] second: i32) {
        let f = fixture().await;
        let a = live_execution(&f).await;
        let b = live_execution(&f).await;

        f.manager
            .try_acquire(f.definition_id, a, first)
            .await
            .unwrap();
        f.manager
            .try_acquire(f.definition_id, b, second)
            .await
            .unwrap();

        assert_eq!(pool(&f).await.tokens.len(), second as usize);
    }

    #[tokio::test]
    async fn unlimited_collapses_to_single_token_and_always_grants() {
        let f = fixture().await;
        let a = live_execution(&f).await;
        let b = live_execution(&f).await;

        f.manager.try_acquire(f.definition_id, a, 3).await.unwrap();

        let ga = f.manager.try_acquire(f.definition_id, a, 0).await.unwrap();
        let gb = f.manager.try_acquire(f.definition_id, b, -1).await.unwrap();
        assert!(matches!(ga, TokenGrant::Granted(_)));
        assert!(matches!(gb, TokenGrant::Granted(_)));

        let p = pool(&f).await;
        assert_eq!(p.tokens.len(), 1);
        assert_eq!(p.tokens[0].status, TokenStatus::Unlimited);
    }

    #[tokio::test]
    async fn shrink_removes_available_tokens_before_granted_ones() {
        let f = fixture().await;
        let a = live_execution(&f).await;

        let grant = f.manager.try_acquire(f.definition_id, a, 3).await.unwrap();
        let TokenGrant::Granted(granted_token) = grant else {
            panic!("expected grant");
        };

        // Shrinking to 1 must keep the granted (Unavailable) token.
        let b = live_execution(&f).await;
        let denied = f.manager.try_acquire(f.definition_id, b, 1).await.unwrap();
        assert_eq!(denied, TokenGrant::Denied);

        let p = pool(&f).await;
        assert_eq!(p.tokens.len(), 1);
        assert_eq!(p.tokens[0].token_id, granted_token);
        assert_eq!(p.tokens[0].granted_to, Some(a));
    }

    #[tokio::test]
    async fn expired_owner_token_is_reclaimed() {
        let f = fixture().await;
        let a = live_execution(&f).await;
        let b = live_execution(&f).await;

        let ga = f.manager.try_acquire(f.definition_id, a, 1).await.unwrap();
        assert!(matches!(ga, TokenGrant::Granted(_)));

        // A stops heartbeating; past the threshold its token is up for grabs.
        f.clock.advance(Duration::from_secs(601));
        // Keep B alive under the advanced clock.
        f.store
            .record_keep_alive(b, f.clock.now())
            .await
            .unwrap();

        let gb = f.manager.try_acquire(f.definition_id, b, 1).await.unwrap();
        let TokenGrant::Granted(token) = gb else {
            panic!("expected reclaimed grant");
        };

        let p = pool(&f).await;
        assert_eq!(p.tokens[0].token_id, token);
        assert_eq!(p.tokens[0].granted_to, Some(b));
    }

    #[tokio::test]
    async fn live_owner_token_is_not_reclaimed() {
        let f = fixture().await;
        let a = live_execution(&f).await;
        let b = live_execution(&f).await;

        f.manager.try_acquire(f.definition_id, a, 1).await.unwrap();
        let gb = f.manager.try_acquire(f.definition_id, b, 1).await.unwrap();
        assert_eq!(gb, TokenGrant::Denied);
    }

    #[tokio::test]
    async fn release_of_unknown_token_is_a_noop() {
        let f = fixture().await;
        let a = live_execution(&f).await;
        f.manager.try_acquire(f.definition_id, a, 2).await.unwrap();

        f.manager
            .release(f.definition_id, a, TokenId::from_ulid(Ulid::new()))
            .await
            .unwrap();
        assert_eq!(pool(&f).await.tokens.len(), 2);
    }
}
