//! Death detection: the pure expiry predicate over an execution's liveness
//! record.
//!
//! Token reclamation and critical-section purging both go through this one
//! function, so a crashed process's resources become reclaimable without any
//! explicit release.

use chrono::{DateTime, Utc};

use crate::domain::{DeathMode, TaskExecution};

/// Is this execution's liveness record expired at `now`?
///
/// - Completed executions are always expired.
/// - KeepAlive: expired when no heartbeat was ever recorded, or when the
///   last heartbeat is older than the keep-alive death threshold.
/// - Override: expired once the fixed duration since start has elapsed.
///
/// A missing threshold (which validation rejects at context start) is
/// treated as "cannot expire".
pub fn has_expired(execution: &TaskExecution, now: DateTime<Utc>) -> bool {
    if execution.completed_at.is_some() {
        return true;
    }

    match execution.death_mode {
        DeathMode::KeepAlive => {
            let Some(last) = execution.last_keep_alive else {
                return true;
            };
            let Some(threshold) = execution.keep_alive_death_threshold else {
                return false;
            };
            now.signed_duration_since(last)
                .to_std()
                .is_ok_and(|elapsed| elapsed > threshold)
        }
        DeathMode::Override => {
            let Some(threshold) = execution.override_threshold else {
                return false;
            };
            now.signed_duration_since(execution.started_at)
                .to_std()
                .is_ok_and(|elapsed| elapsed > threshold)
        }
    }
}
