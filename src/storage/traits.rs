use async_trait::async_trait;
use crate::types::BalanceRecord;
use thiserror::Error;

/// Cache key suffix for the last-sync timestamp diagnostic entry.
pub const STATUS_LAST_SYNC: &str = "last_sync";
/// Cache key suffix for the last-run summary diagnostic entry.
pub const STATUS_LAST_STATS: &str = "last_stats";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("operation '{op}' timed out after {ms} ms")]
    Timeout { op: &'static str, ms: u64 },
}

/// Outcome of a bulk upsert. A chunk that fails as a statement falls back to
/// per-row writes, so some rows can succeed while others fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// Rows inserted or updated.
    pub written: usize,
    /// Rows that failed even after the per-row fallback.
    pub failed: usize,
}

/// Volatile store holding live balances keyed by user id, plus a small
/// namespace of diagnostic status entries.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// List the id portion of every balance key currently present.
    /// Implementations strip their own key prefix before returning.
    async fn scan_balance_keys(&self) -> Result<Vec<String>, StorageError>;

    /// Fetch raw values for the given id suffixes, in order.
    /// A key that vanished between scan and fetch yields `None`.
    async fn fetch_raw(&self, keys: &[String]) -> Result<Vec<Option<String>>, StorageError>;

    /// Liveness probe.
    async fn ping(&self) -> Result<(), StorageError>;

    /// Store a diagnostic status entry under the status namespace with a TTL.
    async fn put_status(&self, name: &str, value: &str, ttl_secs: u64) -> Result<(), StorageError>;

    /// Remove diagnostic status entries. Returns how many existed.
    /// Never touches balance keys.
    async fn delete_status(&self, names: &[&str]) -> Result<u64, StorageError>;
}

/// Durable relational store holding persisted balances.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Fetch persisted balances for the given user ids. Ids with no row are
    /// simply absent from the result.
    async fn fetch_balances(&self, user_ids: &[i64]) -> Result<Vec<BalanceRecord>, StorageError>;

    /// Insert-or-update balances by user id.
    async fn upsert_balances(&self, records: &[BalanceRecord]) -> Result<UpsertOutcome, StorageError>;

    /// Liveness probe.
    async fn ping(&self) -> Result<(), StorageError>;
}
