// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL backend for the durable balance store.
//!
//! Schema (SQLite dialect shown):
//! ```sql
//! CREATE TABLE balances (
//!   user_id INTEGER PRIMARY KEY,
//!   balance REAL NOT NULL,
//!   updated_at INTEGER NOT NULL  -- unix epoch milliseconds
//! )
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! The `Any` driver cannot bind chrono types, so `updated_at` travels as
//! epoch milliseconds (i64) and is converted at this boundary. Timestamps
//! therefore round-trip at millisecond precision.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{any::AnyPoolOptions, AnyPool, Row};
use std::sync::Once;
use std::time::Duration;

use super::traits::{DurableStore, StorageError, UpsertOutcome};
use crate::resilience::retry::{retry, RetryConfig};
use crate::types::BalanceRecord;

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

// MySQL max_allowed_packet is typically 16MB, so chunk both the multi-row
// upserts and the IN-clause reads.
const CHUNK_SIZE: usize = 500;

fn to_epoch_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_epoch_ms(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

pub struct SqlStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlStore {
    /// Create a new SQL store with startup-mode retry (fails fast if config is wrong).
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(20)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let store = Self { pool, is_sqlite };

        // Enable WAL mode for SQLite (better concurrency, faster writes)
        if is_sqlite {
            store.enable_wal_mode().await?;
        }

        store.init_schema().await?;
        Ok(store)
    }

    /// Enable WAL (Write-Ahead Logging) mode for SQLite.
    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        // WAL mode is safe with NORMAL, and faster than the FULL default
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let sql = if self.is_sqlite {
            r#"
            CREATE TABLE IF NOT EXISTS balances (
                user_id INTEGER PRIMARY KEY,
                balance REAL NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#
        } else {
            r#"
            CREATE TABLE IF NOT EXISTS balances (
                user_id BIGINT PRIMARY KEY,
                balance DOUBLE NOT NULL,
                updated_at BIGINT NOT NULL,
                INDEX idx_updated_at (updated_at)
            )
            "#
        };

        retry("sql_init_schema", &RetryConfig::startup(), || async {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        Ok(())
    }

    /// Upsert one chunk as a single multi-row statement. No retry here: the
    /// caller falls back to per-row writes, and whole-run retries belong to
    /// the scheduler.
    async fn upsert_chunk(&self, chunk: &[BalanceRecord]) -> Result<usize, StorageError> {
        let placeholders: Vec<&str> = (0..chunk.len()).map(|_| "(?, ?, ?)").collect();

        let sql = if self.is_sqlite {
            format!(
                "INSERT INTO balances (user_id, balance, updated_at) VALUES {} \
                 ON CONFLICT(user_id) DO UPDATE SET \
                    balance = excluded.balance, \
                    updated_at = excluded.updated_at",
                placeholders.join(", ")
            )
        } else {
            format!(
                "INSERT INTO balances (user_id, balance, updated_at) VALUES {} \
                 ON DUPLICATE KEY UPDATE \
                    balance = VALUES(balance), \
                    updated_at = VALUES(updated_at)",
                placeholders.join(", ")
            )
        };

        let mut query = sqlx::query(&sql);
        for record in chunk {
            query = query
                .bind(record.user_id)
                .bind(record.balance)
                .bind(to_epoch_ms(record.updated_at));
        }

        query
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(chunk.len())
    }

    /// Upsert a single row, used as the fallback when a chunk statement fails.
    async fn upsert_row(&self, record: &BalanceRecord) -> Result<(), StorageError> {
        let sql = if self.is_sqlite {
            "INSERT INTO balances (user_id, balance, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(user_id) DO UPDATE SET \
                balance = excluded.balance, \
                updated_at = excluded.updated_at"
        } else {
            "INSERT INTO balances (user_id, balance, updated_at) VALUES (?, ?, ?) \
             ON DUPLICATE KEY UPDATE \
                balance = VALUES(balance), \
                updated_at = VALUES(updated_at)"
        };

        sqlx::query(sql)
            .bind(record.user_id)
            .bind(record.balance)
            .bind(to_epoch_ms(record.updated_at))
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl DurableStore for SqlStore {
    async fn fetch_balances(&self, user_ids: &[i64]) -> Result<Vec<BalanceRecord>, StorageError> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut records = Vec::with_capacity(user_ids.len());

        for chunk in user_ids.chunks(CHUNK_SIZE) {
            let placeholders: Vec<&str> = (0..chunk.len()).map(|_| "?").collect();
            let sql = format!(
                "SELECT user_id, balance, updated_at FROM balances WHERE user_id IN ({})",
                placeholders.join(", ")
            );

            let rows = retry("sql_fetch_balances", &RetryConfig::query(), || {
                let sql = sql.clone();
                let ids = chunk.to_vec();
                async move {
                    let mut query = sqlx::query(&sql);
                    for id in &ids {
                        query = query.bind(*id);
                    }
                    query
                        .fetch_all(&self.pool)
                        .await
                        .map_err(|e| StorageError::Backend(e.to_string()))
                }
            })
            .await?;

            for row in rows {
                let user_id: i64 = row
                    .try_get("user_id")
                    .map_err(|e| StorageError::Backend(e.to_string()))?;
                let balance: f64 = row
                    .try_get("balance")
                    .map_err(|e| StorageError::Backend(e.to_string()))?;
                let updated_at: i64 = row.try_get("updated_at").unwrap_or(0);

                records.push(BalanceRecord {
                    user_id,
                    balance,
                    updated_at: from_epoch_ms(updated_at),
                });
            }
        }

        Ok(records)
    }

    async fn upsert_balances(&self, records: &[BalanceRecord]) -> Result<UpsertOutcome, StorageError> {
        if records.is_empty() {
            return Ok(UpsertOutcome { written: 0, failed: 0 });
        }

        let mut written = 0usize;
        let mut failed = 0usize;
        let mut last_error: Option<String> = None;

        for chunk in records.chunks(CHUNK_SIZE) {
            match self.upsert_chunk(chunk).await {
                Ok(count) => written += count,
                Err(chunk_err) => {
                    // Statement failed as a whole; salvage what we can row by row.
                    tracing::warn!(
                        rows = chunk.len(),
                        error = %chunk_err,
                        "Bulk upsert chunk failed, falling back to per-row writes"
                    );
                    for record in chunk {
                        match self.upsert_row(record).await {
                            Ok(()) => written += 1,
                            Err(e) => {
                                failed += 1;
                                last_error = Some(e.to_string());
                            }
                        }
                    }
                }
            }
        }

        // Nothing landed at all: treat the store as unavailable rather than
        // reporting an empty-but-successful write.
        if written == 0 && failed > 0 {
            return Err(StorageError::Backend(
                last_error.unwrap_or_else(|| "all upserts failed".to_string()),
            ));
        }

        Ok(UpsertOutcome { written, failed })
    }

    async fn ping(&self) -> Result<(), StorageError> {
        // Single attempt: probes want the truth, not a masked retry.
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }
}
