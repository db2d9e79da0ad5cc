//! Critical-section arbitration: exclusive, FIFO-ordered access to a named
//! section of a task definition.
//!
//! Same locking discipline as token management: one definition lock per
//! decision, persist only on mutation. Fairness rule: when the section is
//! free but the queue is not empty, only the queue head may be granted —
//! a newcomer cannot jump ahead, it is enqueued and denied.

use std::collections::HashSet;
use std::sync::Arc;

use crate::domain::{
    CriticalSectionType, DeathMode, TaskDefinitionId, TaskExecution, TaskExecutionId,
};
use crate::engine::death::has_expired;
use crate::error::StintError;
use crate::ports::{Clock, TaskStore};

/// Result of a section acquisition. Denied is a value, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionGrant {
    Granted,
    Denied,
}

pub struct CriticalSectionArbiter {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    section: CriticalSectionType,
}

impl CriticalSectionArbiter {
    pub fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        section: CriticalSectionType,
    ) -> Self {
        Self {
            store,
            clock,
            section,
        }
    }

    /// Request the section for `execution_id`.
    ///
    /// Expired holders and waiters are purged first, so a crashed grantee
    /// never wedges the section.
    pub async fn start(
        &self,
        definition_id: TaskDefinitionId,
        execution_id: TaskExecutionId,
    ) -> Result<SectionGrant, StintError> {
        let requester = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| {
                StintError::CriticalSection(format!("unknown execution {execution_id}"))
            })?;
        validate_death_mode(&requester)?;

        let mut lock = self.store.lock_definition(definition_id).await?;
        let mut cs = lock.critical_section(self.section)?;
        let mut dirty = false;

        // Purge expiry: the grantee and every waiter get a liveness check.
        let mut ids: Vec<TaskExecutionId> = cs.queue.iter().map(|e| e.execution_id).collect();
        if let Some(holder) = cs.granted_to {
            ids.push(holder);
        }
        if !ids.is_empty() {
            let now = self.clock.now();
            let alive: HashSet<TaskExecutionId> = self
                .store
                .get_executions(&ids)
                .await?
                .into_iter()
                .filter(|e| !has_expired(e, now))
                .map(|e| e.id)
                .collect();

            if let Some(holder) = cs.granted_to
                && !alive.contains(&holder)
            {
                tracing::info!(%holder, section = ?self.section, "clearing grant of expired holder");
                cs.granted_to = None;
                dirty = true;
            }
            dirty |= cs.purge_expired(|id| !alive.contains(&id)) > 0;
        }

        let now = self.clock.now();
        let grant = if cs.granted_to.is_some() {
            dirty |= cs.enqueue(execution_id, now);
            SectionGrant::Denied
        } else if !cs.queue.is_empty() {
            if cs.head() == Some(execution_id) {
                cs.dequeue_head();
                cs.granted_to = Some(execution_id);
                dirty = true;
                SectionGrant::Granted
            } else {
                // Free, but the requester is not the head: fairness denies.
                dirty |= cs.enqueue(execution_id, now);
                SectionGrant::Denied
            }
        } else {
            cs.granted_to = Some(execution_id);
            dirty = true;
            SectionGrant::Granted
        };

        if dirty {
            lock.set_critical_section(self.section, cs);
        }
        lock.commit().await?;

        tracing::debug!(%definition_id, %execution_id, section = ?self.section, ?grant, "section decision");
        Ok(grant)
    }

    /// Leave the section. Only the current grantee clears the grant; the
    /// queue is left untouched and the next `start` call resolves who is
    /// next.
    pub async fn complete(
        &self,
        definition_id: TaskDefinitionId,
        execution_id: TaskExecutionId,
    ) -> Result<(), StintError> {
        let mut lock = self.store.lock_definition(definition_id).await?;
        let mut cs = lock.critical_section(self.section)?;

        if cs.granted_to == Some(execution_id) {
            cs.granted_to = None;
            lock.set_critical_section(self.section, cs);
        }
        lock.commit().await
    }
}

fn validate_death_mode(execution: &TaskExecution) -> Result<(), StintError> {
    match execution.death_mode {
        DeathMode::KeepAlive if execution.keep_alive_death_threshold.is_none() => {
            Err(StintError::InvalidArgument(
                "keep-alive death mode requires a keep-alive death threshold".into(),
            ))
        }
        DeathMode::Override if execution.override_threshold.is_none() => {
            Err(StintError::InvalidArgument(
                "override death mode requires an override threshold".into(),
            ))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use ulid::Ulid;

    use super::*;
    use crate::domain::TaskKey;
    use crate::impls::InMemoryStore;
    use crate::ports::FixedClock;

    struct Fixture {
        store: Arc<InMemoryStore>,
        clock: Arc<FixedClock>,
        arbiter: CriticalSectionArbiter,
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
        let arbiter = CriticalSectionArbiter::new(
            store.clone(),
            clock.clone(),
            CriticalSectionType::User,
        );
        Fixture {
            store,
            clock,
            arbiter,
            definition_id: definition.id,
        }
    }

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

    async fn override_execution(f: &Fixture, threshold: Duration) -> TaskExecutionId {
        let id = TaskExecutionId::from_ulid(Ulid::new());
        let execution = TaskExecution::new(
            id,
            f.definition_id,
            f.clock.now(),
            DeathMode::Override,
        )
        .with_override_threshold(threshold);
        f.store.insert_execution(execution).await.unwrap();
        id
    }

    #[tokio::test]
    async fn scenario_queue_handoff() {
        let f = fixture().await;
        let a = live_execution(&f).await;
        let b = live_execution(&f).await;

        assert_eq!(
            f.arbiter.start(f.definition_id, a).await.unwrap(),
            SectionGrant::Granted
        );
        // B is enqueued while A holds the section.
        assert_eq!(
            f.arbiter.start(f.definition_id, b).await.unwrap(),
            SectionGrant::Denied
        );

        f.arbiter.complete(f.definition_id, a).await.unwrap();

        assert_eq!(
            f.arbiter.start(f.definition_id, b).await.unwrap(),
            SectionGrant::Granted
        );

        // Queue must be empty now.
        let lock = f.store.lock_definition(f.definition_id).await.unwrap();
        let cs = lock.critical_section(CriticalSectionType::User).unwrap();
        assert!(cs.queue.is_empty());
        assert_eq!(cs.granted_to, Some(b));
    }

    #[tokio::test]
    async fn concurrent_starts_grant_exactly_one() {
        let f = fixture().await;
        let a = live_execution(&f).await;
        let b = live_execution(&f).await;

        let (ra, rb) = tokio::join!(
            f.arbiter.start(f.definition_id, a),
            f.arbiter.start(f.definition_id, b),
        );
        let granted = [ra.unwrap(), rb.unwrap()]
            .iter()
            .filter(|g| **g == SectionGrant::Granted)
            .count();
        assert_eq!(granted, 1);
    }

    #[tokio::test]
    async fn grants_follow_enqueue_order() {
        let f = fixture().await;
        let a = live_execution(&f).await;
        let b = live_execution(&f).await;
        let c = live_execution(&f).await;

        assert_eq!(
            f.arbiter.start(f.definition_id, a).await.unwrap(),
            SectionGrant::Granted
        );
        f.arbiter.start(f.definition_id, b).await.unwrap();
        f.arbiter.start(f.definition_id, c).await.unwrap();
        f.arbiter.complete(f.definition_id, a).await.unwrap();

        // The section is free, but C is not the head: denied.
        assert_eq!(
            f.arbiter.start(f.definition_id, c).await.unwrap(),
            SectionGrant::Denied
        );
        assert_eq!(
            f.arbiter.start(f.definition_id, b).await.unwrap(),
            SectionGrant::Granted
        );
        f.arbiter.complete(f.definition_id, b).await.unwrap();
        assert_eq!(
            f.arbiter.start(f.definition_id, c).await.unwrap(),
            SectionGrant::Granted
        );
    }

    #[tokio::test]
    async fn expired_holder_is_purged_and_section_reclaimed() {
        let f = fixture().await;
        let a = override_execution(&f, Duration::from_secs(60)).await;

        assert_eq!(
            f.arbiter.start(f.definition_id, a).await.unwrap(),
            SectionGrant::Granted
        );

        f.clock.advance(Duration::from_secs(61));
        let b = live_execution(&f).await;
        assert_eq!(
            f.arbiter.start(f.definition_id, b).await.unwrap(),
            SectionGrant::Granted
        );
    }

    #[tokio::test]
    async fn expired_waiters_are_purged_without_reordering_survivors() {
        let f = fixture().await;
        let a = live_execution(&f).await;
        let dead = override_execution(&f, Duration::from_secs(30)).await;
        let c = live_execution(&f).await;

        f.arbiter.start(f.definition_id, a).await.unwrap();
        f.arbiter.start(f.definition_id, dead).await.unwrap();
        f.arbiter.start(f.definition_id, c).await.unwrap();

        f.clock.advance(Duration::from_secs(31));
        f.store.record_keep_alive(a, f.clock.now()).await.unwrap();
        f.store.record_keep_alive(c, f.clock.now()).await.unwrap();
        f.arbiter.complete(f.definition_id, a).await.unwrap();

        // The dead waiter was ahead of C; once purged, C is the head.
        assert_eq!(
            f.arbiter.start(f.definition_id, c).await.unwrap(),
            SectionGrant::Granted
        );
    }

    #[tokio::test]
    async fn missing_threshold_is_an_argument_error() {
        let f = fixture().await;
        let id = TaskExecutionId::from_ulid(Ulid::new());
        let execution = TaskExecution::new(
            id,
            f.definition_id,
            f.clock.now(),
            DeathMode::Override,
        );
        f.store.insert_execution(execution).await.unwrap();

        let err = f.arbiter.start(f.definition_id, id).await.unwrap_err();
        assert!(matches!(err, StintError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn unknown_execution_is_a_critical_section_error() {
        let f = fixture().await;
        let err = f
            .arbiter
            .start(f.definition_id, TaskExecutionId::from_ulid(Ulid::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, StintError::CriticalSection(_)));
    }

    #[tokio::test]
    async fn complete_by_non_holder_is_a_noop() {
        let f = fixture().await;
        let a = live_execution(&f).await;
        let b = live_execution(&f).await;

        f.arbiter.start(f.definition_id, a).await.unwrap();
        f.arbiter.complete(f.definition_id, b).await.unwrap();

        let lock = f.store.lock_definition(f.definition_id).await.unwrap();
        let cs = lock.critical_section(CriticalSectionType::User).unwrap();
        assert_eq!(cs.granted_to, Some(a));
    }

    #[tokio::test]
    async fn user_and_client_sections_are_independent() {
        let f = fixture().await;
        let a = live_execution(&f).await;
        let b = live_execution(&f).await;

        let client = CriticalSectionArbiter::new(
            f.store.clone(),
            f.clock.clone(),
            CriticalSectionType::Client,
        );

        assert_eq!(
            f.arbiter.start(f.definition_id, a).await.unwrap(),
            SectionGrant::Granted
        );
        // Holding User does not block Client.
        assert_eq!(
            client.start(f.definition_id, b).await.unwrap(),
            SectionGrant::Granted
        );
    }
}
