//! In-process key/value and hash store for device status and shadows.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use thingbridge_core::{Error as CoreError, Result as CoreResult, StateStore};

#[derive(Debug, Clone)]
enum Value {
    Scalar(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

fn wrong_type(key: &str) -> CoreError {
    CoreError::Storage(format!("WRONGTYPE operation against key {key}"))
}

/// [`StateStore`] backed by a sharded concurrent map.
///
/// Expired keys are dropped lazily on access, or eagerly by
/// [`MemoryStateStore::purge_expired`].
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: DashMap<String, Entry>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired key. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    fn evict_if_expired(&self, key: &str) {
        let now = Instant::now();
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> CoreResult<Option<String>> {
        self.evict_if_expired(key);
        match self.entries.get(key) {
            Some(entry) => match &entry.value {
                Value::Scalar(s) => Ok(Some(s.clone())),
                Value::Hash(_) => Err(wrong_type(key)),
            },
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CoreResult<()> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Scalar(value.to_string()),
                expires_at,
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> CoreResult<bool> {
        self.evict_if_expired(key);
        Ok(self.entries.remove(key).is_some())
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> CoreResult<()> {
        self.evict_if_expired(key);
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Hash(map) => {
                for (field, value) in fields {
                    map.insert(field.clone(), value.clone());
                }
                Ok(())
            }
            Value::Scalar(_) => Err(wrong_type(key)),
        }
    }

    async fn hgetall(&self, key: &str) -> CoreResult<HashMap<String, String>> {
        self.evict_if_expired(key);
        match self.entries.get(key) {
            Some(entry) => match &entry.value {
                Value::Hash(map) => Ok(map.clone()),
                Value::Scalar(_) => Err(wrong_type(key)),
            },
            None => Ok(HashMap::new()),
        }
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> CoreResult<usize> {
        self.evict_if_expired(key);
        let (removed, now_empty) = match self.entries.get_mut(key) {
            Some(mut entry) => match &mut entry.value {
                Value::Hash(map) => {
                    let removed = fields.iter().filter(|f| map.remove(*f).is_some()).count();
                    (removed, map.is_empty())
                }
                Value::Scalar(_) => return Err(wrong_type(key)),
            },
            None => return Ok(0),
        };
        // An emptied hash disappears, like the key it stands in for
        if now_empty {
            self.entries
                .remove_if(key, |_, e| matches!(&e.value, Value::Hash(m) if m.is_empty()));
        }
        Ok(removed)
    }
}
