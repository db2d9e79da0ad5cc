//! TTL-bounded cache of task-definition lookups.
//!
//! Definition ids never change once created, so staleness is tolerated: a
//! miss or an expired hit just re-resolves through the store. The cache is an
//! explicit dependency of the coordinator, never process-wide static state.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::domain::{TaskDefinition, TaskKey};

#[derive(Debug)]
pub struct DefinitionCache {
    ttl: Duration,
    entries: Mutex<HashMap<TaskKey, (TaskDefinition, Instant)>>,
}

impl DefinitionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &TaskKey) -> Option<TaskDefinition> {
        let mut entries = self.entries.lock().expect("cache poisoned");
        match entries.get(key) {
            Some((definition, cached_at)) if cached_at.elapsed() <= self.ttl => {
                Some(definition.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, definition: TaskDefinition) {
        let mut entries = self.entries.lock().expect("cache poisoned");
        entries.insert(definition.key.clone(), (definition, Instant::now()));
    }

    pub fn invalidate(&self, key: &TaskKey) {
        self.entries.lock().expect("cache poisoned").remove(key);
    }
}
