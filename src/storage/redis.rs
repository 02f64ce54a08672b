//! Redis backend for the shared key-value store.
//!
//! Every command goes through [`retry`] with the query preset so a brief
//! connection blip does not fail a job outright. Keys can be namespaced with
//! a prefix when the Redis instance is shared with other applications.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, Client};

use super::traits::{KeyValueStore, StorageError};
use crate::resilience::retry::{retry, RetryConfig};

pub struct RedisStore {
    connection: ConnectionManager,
    /// Optional key prefix for namespacing (e.g., "sync:" → "sync:lock: doi:...")
    prefix: String,
}

impl RedisStore {
    /// Create a new Redis store without a key prefix.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_prefix(connection_string, None).await
    }

    /// Create a new Redis store with an optional key prefix.
    ///
    /// ```rust,no_run
    /// # use dataset_sync::storage::RedisStore;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let store = RedisStore::with_prefix("redis://localhost", Some("sync:")).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_prefix(connection_string: &str, prefix: Option<&str>) -> Result<Self, StorageError> {
        let client = Client::open(connection_string)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        // Startup preset: fail fast on a bad URL instead of hanging
        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;

        Ok(Self {
            connection,
            prefix: prefix.unwrap_or("").to_string(),
        })
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    // PX 0 is rejected by Redis
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn ping(&self) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        retry("redis_ping", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            async move {
                let _: String = cmd("PING").query_async(&mut conn).await?;
                Ok(())
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry("redis_get", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let value: Option<String> = cmd("GET").arg(&key).query_async(&mut conn).await?;
                Ok(value)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);
        let value = value.to_string();

        retry("redis_set", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            let value = value.clone();
            async move {
                let mut command = cmd("SET");
                command.arg(&key).arg(&value);
                if let Some(ttl) = ttl {
                    command.arg("PX").arg(ttl_millis(ttl));
                }
                let _: () = command.query_async(&mut conn).await?;
                Ok(())
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);
        let value = value.to_string();

        let attempts = AtomicU32::new(0);

        retry("redis_set_nx", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            let value = value.clone();
            let retried = attempts.fetch_add(1, Ordering::Relaxed) > 0;
            async move {
                let reply: Option<String> = cmd("SET")
                    .arg(&key)
                    .arg(&value)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_millis(ttl))
                    .query_async(&mut conn)
                    .await?;
                if reply.is_some() {
                    return Ok(true);
                }
                if !retried {
                    return Ok(false);
                }
                // An earlier attempt may have claimed the key before its reply was lost.
                let holder: Option<String> = cmd("GET").arg(&key).query_async(&mut conn).await?;
                Ok(holder.as_deref() == Some(value.as_str()))
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, StorageError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let conn = self.connection.clone();
        let keys: Vec<String> = keys.iter().map(|k| self.prefixed_key(k)).collect();

        retry("redis_delete", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let keys = keys.clone();
            async move {
                let removed: u64 = cmd("DEL").arg(&keys).query_async(&mut conn).await?;
                Ok(removed)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry("redis_exists", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let exists: bool = cmd("EXISTS").arg(&key).query_async(&mut conn).await?;
                Ok(exists)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);
        let value = value.to_string();

        // Not idempotent: a retried LPUSH after a lost reply may enqueue twice,
        // which the queue tolerates (a duplicate job finds its work done).
        retry("redis_lpush", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            let value = value.clone();
            async move {
                let _: u64 = cmd("LPUSH").arg(&key).arg(&value).query_async(&mut conn).await?;
                Ok(())
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut conn = self.connection.clone();
        let key = self.prefixed_key(key);

        // Single attempt: retrying a pop whose reply was lost would drop a job.
        cmd("RPOP")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn llen(&self, key: &str) -> Result<u64, StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry("redis_llen", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let len: u64 = cmd("LLEN").arg(&key).query_async(&mut conn).await?;
                Ok(len)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_millis_never_zero() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2000);
    }
}
