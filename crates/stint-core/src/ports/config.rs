//! Configuration port: per-task settings supplied by the host application.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{DeathMode, TaskKey};
use crate::error::StintError;

/// Per-task settings.
///
/// `validate` enforces the death-mode/threshold pairing up front so a bad
/// configuration fails at context start rather than mid-run.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    /// Disabled tasks refuse `try_start` (the execution is recorded as
    /// blocked).
    pub enabled: bool,

    /// Maximum concurrent executions; `<= 0` means unlimited.
    pub concurrency_limit: i32,

    pub death_mode: DeathMode,
    pub keep_alive_death_threshold: Option<Duration>,
    pub override_threshold: Option<Duration>,

    /// Heartbeat period while a context is open (KeepAlive mode).
    pub keep_alive_interval: Duration,

    /// Retry limit and detection window for blocks whose last attempt
    /// failed.
    pub failed_retry_limit: u32,
    pub failed_detection_window: Duration,

    /// Retry limit and detection window for blocks whose owner died.
    pub dead_retry_limit: u32,
    pub dead_detection_window: Duration,

    /// Cap on fresh blocks generated per request (guards first runs and
    /// long gaps).
    pub max_blocks_to_generate: u32,

    /// List-item values above this many bytes are compressed.
    pub compression_threshold: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            concurrency_limit: 1,
            death_mode: DeathMode::KeepAlive,
            keep_alive_death_threshold: Some(Duration::from_secs(600)),
            override_threshold: None,
            keep_alive_interval: Duration::from_secs(30),
            failed_retry_limit: 3,
            failed_detection_window: Duration::from_secs(12 * 3600),
            dead_retry_limit: 3,
            dead_detection_window: Duration::from_secs(12 * 3600),
            max_blocks_to_generate: 2_000,
            compression_threshold: 2_048,
        }
    }
}

impl TaskConfig {
    pub fn with_concurrency_limit(mut self, limit: i32) -> Self {
        self.concurrency_limit = limit;
        self
    }

    pub fn with_keep_alive(mut self, interval: Duration, death_threshold: Duration) -> Self {
        self.death_mode = DeathMode::KeepAlive;
        self.keep_alive_interval = interval;
        self.keep_alive_death_threshold = Some(death_threshold);
        self
    }

    pub fn with_override_death_mode(mut self, threshold: Duration) -> Self {
        self.death_mode = DeathMode::Override;
        self.override_threshold = Some(threshold);
        self
    }

    pub fn with_retry_limits(mut self, failed: u32, dead: u32) -> Self {
        self.failed_retry_limit = failed;
        self.dead_retry_limit = dead;
        self
    }

    pub fn with_max_blocks_to_generate(mut self, max: u32) -> Self {
        self.max_blocks_to_generate = max;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn validate(&self) -> Result<(), StintError> {
        match self.death_mode {
            DeathMode::KeepAlive if self.keep_alive_death_threshold.is_none() => {
                Err(StintError::InvalidArgument(
                    "keep-alive death mode requires a keep-alive death threshold".into(),
                ))
            }
            DeathMode::Override if self.override_threshold.is_none() => {
                Err(StintError::InvalidArgument(
                    "override death mode requires an override threshold".into(),
                ))
            }
            _ => Ok(()),
        }
    }
}

/// Source of per-task configuration.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Missing configuration is a `Configuration` error, not a default.
    async fn config_for(&self, key: &TaskKey) -> Result<TaskConfig, StintError>;
}

/// In-memory configuration for development and tests.
#[derive(Default)]
pub struct StaticConfigSource {
    configs: Mutex<HashMap<TaskKey, TaskConfig>>,
}

impl StaticConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: TaskKey, config: TaskConfig) {
        self.configs
            .lock()
            .expect("config map poisoned")
            .insert(key, config);
    }
}

#[async_trait]
impl ConfigSource for StaticConfigSource {
    async fn config_for(&self, key: &TaskKey) -> Result<TaskConfig, StintError> {
        self.configs
            .lock()
            .expect("config map poisoned")
            .get(key)
            .cloned()
            .ok_or_else(|| StintError::Configuration(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_alive_mode_requires_threshold() {
        let mut config = TaskConfig::default();
        config.keep_alive_death_threshold = None;
        assert!(matches!(
            config.validate(),
            Err(StintError::InvalidArgument(_))
        ));
    }

    #[test]
    fn override_mode_requires_threshold() {
        let mut config = TaskConfig::default().with_override_death_mode(Duration::from_secs(60));
        assert!(config.validate().is_ok());

        config.override_threshold = None;
        assert!(matches!(
            config.validate(),
            Err(StintError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn static_source_misses_are_configuration_errors() {
        let source = StaticConfigSource::new();
        let key = TaskKey::new("app", "absent");
        let err = source.config_for(&key).await.unwrap_err();
        assert!(matches!(err, StintError::Configuration(_)));
        assert!(err.to_string().contains("app/absent"));
    }

    #[tokio::test]
    async fn static_source_returns_inserted_config() {
        let source = StaticConfigSource::new();
        let key = TaskKey::new("app", "task");
        source.insert(key.clone(), TaskConfig::default().with_concurrency_limit(4));

        let config = source.config_for(&key).await.unwrap();
        assert_eq!(config.concurrency_limit, 4);
    }
}
