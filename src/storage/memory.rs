//! In-memory store implementations.
//!
//! Used by the test suites and handy for embedding the reconciler without
//! real backends. Both stores carry fault-injection switches: flip
//! [`InMemoryCache::set_down`] or [`InMemoryStore::set_down`] and every
//! affected operation fails with a backend error, which is how the
//! failure-path tests simulate an outage without Docker.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use super::traits::{CacheStore, DurableStore, StorageError, UpsertOutcome};
use crate::types::BalanceRecord;

/// Volatile cache double: raw balance strings keyed by id suffix, plus the
/// diagnostic status namespace.
pub struct InMemoryCache {
    entries: DashMap<String, String>,
    statuses: DashMap<String, String>,
    down: AtomicBool,
    /// Injected delay before every operation, for overlap tests.
    latency: RwLock<Duration>,
}

impl InMemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            statuses: DashMap::new(),
            down: AtomicBool::new(false),
            latency: RwLock::new(Duration::ZERO),
        }
    }

    /// Seed a raw balance value, e.g. `set_balance("42", "500.00")`.
    pub fn set_balance(&self, key: &str, raw: &str) {
        self.entries.insert(key.to_string(), raw.to_string());
    }

    pub fn remove_balance(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Simulate the cache going away (or coming back).
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Delay every operation, to hold a run open while another caller races it.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = latency;
    }

    /// Read back a diagnostic status entry.
    #[must_use]
    pub fn status(&self, name: &str) -> Option<String> {
        self.statuses.get(name).map(|v| v.value().clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.statuses.clear();
    }

    async fn gate(&self) -> Result<(), StorageError> {
        let delay = *self.latency.read();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("cache is down (injected)".to_string()));
        }
        Ok(())
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for InMemoryCache {
    async fn scan_balance_keys(&self) -> Result<Vec<String>, StorageError> {
        self.gate().await?;
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        // Stable order keeps previews and assertions deterministic.
        keys.sort();
        Ok(keys)
    }

    async fn fetch_raw(&self, keys: &[String]) -> Result<Vec<Option<String>>, StorageError> {
        self.gate().await?;
        Ok(keys
            .iter()
            .map(|k| self.entries.get(k).map(|v| v.value().clone()))
            .collect())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.gate().await
    }

    async fn put_status(&self, name: &str, value: &str, _ttl_secs: u64) -> Result<(), StorageError> {
        self.gate().await?;
        self.statuses.insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_status(&self, names: &[&str]) -> Result<u64, StorageError> {
        self.gate().await?;
        let mut removed = 0;
        for name in names {
            if self.statuses.remove(*name).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Durable store double with write counters for asserting exactly which
/// writes a run attempted.
pub struct InMemoryStore {
    rows: DashMap<i64, BalanceRecord>,
    down: AtomicBool,
    fail_writes: AtomicBool,
    upsert_calls: AtomicU64,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
            down: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            upsert_calls: AtomicU64::new(0),
        }
    }

    /// Seed a persisted balance.
    pub fn insert_balance(&self, user_id: i64, balance: f64) {
        self.rows.insert(user_id, BalanceRecord::new(user_id, balance));
    }

    /// Current persisted balance, if any.
    #[must_use]
    pub fn balance_of(&self, user_id: i64) -> Option<f64> {
        self.rows.get(&user_id).map(|r| r.value().balance)
    }

    /// Simulate the store going away (or coming back).
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Fail writes while reads keep working.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// How many upsert calls reached this store.
    #[must_use]
    pub fn upsert_calls(&self) -> u64 {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn check_up(&self) -> Result<(), StorageError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("store is down (injected)".to_string()));
        }
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn fetch_balances(&self, user_ids: &[i64]) -> Result<Vec<BalanceRecord>, StorageError> {
        self.check_up()?;
        Ok(user_ids
            .iter()
            .filter_map(|id| self.rows.get(id).map(|r| r.value().clone()))
            .collect())
    }

    async fn upsert_balances(&self, records: &[BalanceRecord]) -> Result<UpsertOutcome, StorageError> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        self.check_up()?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("writes are failing (injected)".to_string()));
        }
        for record in records {
            self.rows.insert(record.user_id, record.clone());
        }
        Ok(UpsertOutcome {
            written: records.len(),
            failed: 0,
        })
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.check_up()
    }
}
