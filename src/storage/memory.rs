use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

use super::traits::{KeyValueStore, StorageError};

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: value.to_string(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-process store with Redis-like expiry.
///
/// Expiry is measured on the tokio clock, so tests running with paused time
/// can step past TTLs deterministically.
pub struct InMemoryStore {
    values: DashMap<String, StoredValue>,
    lists: DashMap<String, VecDeque<String>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            values: DashMap::new(),
            lists: DashMap::new(),
        }
    }

    /// Number of live string keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.iter().filter(|e| !e.value().is_expired()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live string keys starting with `prefix`.
    #[must_use]
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.values
            .iter()
            .filter(|e| e.key().starts_with(prefix) && !e.value().is_expired())
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn clear(&self) {
        self.values.clear();
        self.lists.clear();
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let value = match self.values.get(key) {
            Some(entry) if !entry.is_expired() => return Ok(Some(entry.value.clone())),
            Some(_) => None,
            None => return Ok(None),
        };
        self.values.remove_if(key, |_, v| v.is_expired());
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError> {
        self.values.insert(key.to_string(), StoredValue::new(value, ttl));
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StorageError> {
        match self.values.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(StoredValue::new(value, Some(ttl)));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::new(value, Some(ttl)));
                Ok(true)
            }
        }
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, StorageError> {
        let mut removed = 0;
        for key in keys {
            if let Some((_, v)) = self.values.remove(key) {
                if !v.is_expired() {
                    removed += 1;
                }
            } else if self.lists.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key).await?.is_some() || self.lists.contains_key(key))
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
        Ok(())
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>, StorageError> {
        let popped = match self.lists.get_mut(key) {
            Some(mut list) => list.pop_back(),
            None => return Ok(None),
        };
        // Redis drops empty lists
        self.lists.remove_if(key, |_, list| list.is_empty());
        Ok(popped)
    }

    async fn llen(&self, key: &str) -> Result<u64, StorageError> {
        Ok(self.lists.get(key).map_or(0, |list| list.len() as u64))
    }
}
