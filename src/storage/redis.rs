//! Redis backend for the live balance cache.
//!
//! Key layout (with the default prefixes):
//! ```text
//! balance:{user_id}          → decimal balance string, e.g. "500.00"
//! balance_sync:last_sync     → RFC 3339 timestamp of the last completed run
//! balance_sync:last_stats    → JSON summary of the last completed run
//! ```
//!
//! Balance keys are enumerated with cursored `SCAN` (never `KEYS`) and read
//! back in `MGET` chunks, so a large cache never blocks the server.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, Client};

use super::traits::{CacheStore, StorageError};
use crate::resilience::retry::{retry, RetryConfig};

/// Prefix for per-user balance keys.
pub const DEFAULT_KEY_PREFIX: &str = "balance:";
/// Prefix for the diagnostic status entries.
pub const DEFAULT_STATUS_PREFIX: &str = "balance_sync:";

/// Keys per MGET round-trip.
const MGET_CHUNK_SIZE: usize = 500;
/// COUNT hint per SCAN round-trip.
const SCAN_COUNT: usize = 500;

pub struct RedisCache {
    connection: ConnectionManager,
    /// Prefix on balance keys (e.g., "balance:" → "balance:42").
    key_prefix: String,
    /// Prefix on diagnostic status keys.
    status_prefix: String,
}

impl RedisCache {
    /// Create a cache handle with the default key layout.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_prefixes(connection_string, DEFAULT_KEY_PREFIX, DEFAULT_STATUS_PREFIX).await
    }

    /// Create a cache handle with custom prefixes, for deployments that
    /// share a Redis instance across applications.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use balance_reconciler::storage::redis::RedisCache;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let cache = RedisCache::with_prefixes(
    ///     "redis://localhost",
    ///     "acct:balance:",
    ///     "acct:balance_sync:",
    /// )
    /// .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_prefixes(
        connection_string: &str,
        key_prefix: &str,
        status_prefix: &str,
    ) -> Result<Self, StorageError> {
        let client = Client::open(connection_string)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        // Use startup config: fast-fail after a few seconds, don't hang forever
        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;

        Ok(Self {
            connection,
            key_prefix: key_prefix.to_string(),
            status_prefix: status_prefix.to_string(),
        })
    }

    /// Apply the balance prefix to a key suffix.
    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// Apply the status prefix to a status entry name.
    #[inline]
    fn status_key(&self, name: &str) -> String {
        format!("{}{}", self.status_prefix, name)
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn scan_balance_keys(&self) -> Result<Vec<String>, StorageError> {
        let conn = self.connection.clone();
        let pattern = format!("{}*", self.key_prefix);
        let key_prefix = self.key_prefix.clone();
        let status_prefix = self.status_prefix.clone();

        retry("redis_scan", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let pattern = pattern.clone();
            let key_prefix = key_prefix.clone();
            let status_prefix = status_prefix.clone();
            async move {
                let mut keys = Vec::new();
                let mut cursor: u64 = 0;
                loop {
                    let (next, chunk): (u64, Vec<String>) = cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(SCAN_COUNT)
                        .query_async(&mut conn)
                        .await?;

                    for key in chunk {
                        // Status entries live beside balances; keep them out
                        // of the balance scan even under exotic prefixes.
                        if key.starts_with(&status_prefix) {
                            continue;
                        }
                        keys.push(key.strip_prefix(&key_prefix).unwrap_or(&key).to_string());
                    }

                    cursor = next;
                    if cursor == 0 {
                        break;
                    }
                }
                Ok(keys)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn fetch_raw(&self, keys: &[String]) -> Result<Vec<Option<String>>, StorageError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        // One retry-wrapped MGET per chunk, chunks fetched concurrently.
        let chunk_futures: Vec<_> = keys
            .chunks(MGET_CHUNK_SIZE)
            .map(|chunk| {
                let conn = self.connection.clone();
                let prefixed: Vec<String> = chunk.iter().map(|k| self.prefixed_key(k)).collect();
                async move {
                    retry("redis_mget", &RetryConfig::query(), || {
                        let mut conn = conn.clone();
                        let keys = prefixed.clone();
                        async move {
                            let mut mget = cmd("MGET");
                            for key in &keys {
                                mget.arg(key);
                            }
                            let values: Vec<Option<String>> = mget.query_async(&mut conn).await?;
                            Ok(values)
                        }
                    })
                    .await
                    .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
                }
            })
            .collect();

        let chunks = futures::future::try_join_all(chunk_futures).await?;
        Ok(chunks.into_iter().flatten().collect())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        // Single attempt: probes want the truth, not a masked retry.
        let mut conn = self.connection.clone();
        let _: String = cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn put_status(&self, name: &str, value: &str, ttl_secs: u64) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let key = self.status_key(name);
        let value = value.to_string();

        retry("redis_status_set", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            let value = value.clone();
            async move {
                // SETEX key seconds value
                let _: () = cmd("SETEX")
                    .arg(&key)
                    .arg(ttl_secs)
                    .arg(&value)
                    .query_async(&mut conn)
                    .await?;
                Ok(())
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn delete_status(&self, names: &[&str]) -> Result<u64, StorageError> {
        if names.is_empty() {
            return Ok(0);
        }

        let conn = self.connection.clone();
        let keys: Vec<String> = names.iter().map(|n| self.status_key(n)).collect();

        retry("redis_status_del", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let keys = keys.clone();
            async move {
                let mut del = cmd("DEL");
                for key in &keys {
                    del.arg(key);
                }
                let removed: u64 = del.query_async(&mut conn).await?;
                Ok(removed)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }
}
