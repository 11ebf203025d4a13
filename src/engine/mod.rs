// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The reconciliation core.
//!
//! [`SyncEngine::run_sync`] performs one pass: scan the cache for balance
//! keys, parse each into a `(user_id, balance)` pair, diff against the
//! durable store, and bulk-upsert whatever changed. The engine never retries
//! a failed run itself and never serializes runs; both are the scheduler's
//! job. Per-record problems are contained (skipped and counted), per-store
//! problems end the run with a [`RunFailure`] kind.
//!
//! # Run outcome
//!
//! | Condition                                   | Status    |
//! |---------------------------------------------|-----------|
//! | every record landed cleanly                 | `success` |
//! | some records skipped or failed, rest landed | `partial` |
//! | cache or store unreachable                  | `failed`  |

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::storage::traits::{
    CacheStore, DurableStore, StorageError, STATUS_LAST_STATS, STATUS_LAST_SYNC,
};
use crate::types::{
    BalanceRecord, DryRunReport, RunFailure, RunStatus, RunTrigger, SyncError, SyncRun,
};

/// Parse the user id portion of a balance key (the suffix after the key
/// prefix, already stripped by the cache backend).
///
/// The whole string must be an integer; trailing garbage is rejected.
pub fn parse_user_id(key: &str) -> Result<i64, String> {
    key.trim()
        .parse::<i64>()
        .map_err(|_| format!("malformed user id '{key}'"))
}

/// Parse a raw cached balance value.
///
/// Accepts decimal strings like `"500.00"`. Empty, non-numeric, negative,
/// and non-finite values are all malformed.
pub fn parse_balance(raw: &str) -> Result<f64, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("empty balance value".to_string());
    }
    let value: f64 = trimmed
        .parse()
        .map_err(|_| format!("non-numeric balance '{trimmed}'"))?;
    if !value.is_finite() {
        return Err(format!("non-finite balance '{trimmed}'"));
    }
    if value < 0.0 {
        return Err(format!("negative balance '{trimmed}'"));
    }
    Ok(value)
}

/// One reconciliation pass over injected cache and durable stores.
pub struct SyncEngine {
    cache: Arc<dyn CacheStore>,
    store: Arc<dyn DurableStore>,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        store: Arc<dyn DurableStore>,
        config: SyncConfig,
    ) -> Self {
        Self {
            cache,
            store,
            config,
        }
    }

    /// Execute one reconciliation run and return its completed record.
    ///
    /// Always returns a finished [`SyncRun`]; failures are reported through
    /// [`SyncRun::status`] and [`SyncRun::failure`], never as an `Err`.
    #[tracing::instrument(skip(self), fields(run_id, status))]
    pub async fn run_sync(&self, trigger: RunTrigger) -> SyncRun {
        let mut run = SyncRun::begin(trigger, false);
        tracing::Span::current().record("run_id", run.id.to_string());
        info!(trigger = %trigger, "Starting reconciliation run");

        match self.reconcile(&mut run, false).await {
            Ok(pending) => {
                debug_assert!(pending.is_empty(), "wet run must drain its writes");
                let status = if run.error_count > 0 {
                    RunStatus::Partial
                } else {
                    RunStatus::Success
                };
                run.finish(status);
            }
            Err(failure) => {
                // `reconcile` already stamped the error message.
                crate::metrics::record_run_failure(failure.as_str());
            }
        }

        self.record_run_metrics(&run);
        self.write_status_keys(&run).await;

        tracing::Span::current().record("status", run.status.to_string());
        info!(
            status = %run.status,
            processed = run.processed_count,
            updated = run.updated_count,
            errors = run.error_count,
            duration_ms = run.duration_ms,
            "Reconciliation run finished"
        );
        run
    }

    /// Same read-and-diff as a real run, but nothing is written anywhere:
    /// no upserts, no status keys. Reports the counts a real run would have
    /// produced plus a preview of the first few pending writes.
    #[tracing::instrument(skip(self))]
    pub async fn dry_run(&self) -> DryRunReport {
        let mut run = SyncRun::begin(RunTrigger::Manual, true);
        info!("Starting dry run");

        let pending = match self.reconcile(&mut run, true).await {
            Ok(pending) => pending,
            Err(_) => Vec::new(),
        };

        if !run.is_finished() {
            let status = if run.error_count > 0 {
                RunStatus::Partial
            } else {
                RunStatus::Success
            };
            run.finish(status);
        }

        let would_write = pending.len() as u64;
        let preview: Vec<BalanceRecord> = pending
            .into_iter()
            .take(self.config.dry_run_preview)
            .collect();

        info!(
            status = %run.status,
            would_write,
            errors = run.error_count,
            "Dry run finished"
        );
        DryRunReport {
            run,
            preview,
            would_write,
        }
    }

    /// Read one balance, preferring the cache and degrading to the durable
    /// store when the cache is unreachable or has no entry for the user.
    ///
    /// Read-path consumers keep working off last-synced values during a
    /// cache outage; nothing is written on this path. Failures come back
    /// typed: [`SyncError::CacheUnavailable`] when both stores were down,
    /// [`SyncError::StoreUnavailable`] when only the fallback read died,
    /// and [`SyncError::MalformedRecord`] when the sole copy of the balance
    /// is garbage.
    pub async fn read_balance(&self, user_id: i64) -> Result<Option<BalanceRecord>, SyncError> {
        let key = vec![user_id.to_string()];
        let mut cache_outage: Option<String> = None;
        let mut malformed: Option<String> = None;

        match self
            .store_op("cache", "fetch", self.config.timeouts.read(), self.cache.fetch_raw(&key))
            .await
        {
            Ok(values) => {
                if let Some(Some(raw)) = values.first() {
                    match parse_balance(raw) {
                        Ok(balance) => return Ok(Some(BalanceRecord::new(user_id, balance))),
                        Err(reason) => {
                            warn!(user_id, reason, "Cached balance is malformed, reading store");
                            malformed = Some(reason);
                        }
                    }
                }
            }
            Err(e) => {
                warn!(user_id, error = %e, "Cache unreachable, degrading to store read");
                cache_outage = Some(e.to_string());
            }
        }

        let fallback = self
            .store_op(
                "sql",
                "fetch",
                self.config.timeouts.read(),
                self.store.fetch_balances(&[user_id]),
            )
            .await;

        match fallback {
            Ok(records) => match records.into_iter().next() {
                Some(record) => Ok(Some(record)),
                // The only copy of this balance exists and is garbage.
                None => match malformed {
                    Some(reason) => Err(SyncError::MalformedRecord {
                        key: user_id.to_string(),
                        reason,
                    }),
                    None => Ok(None),
                },
            },
            Err(store_err) => match cache_outage {
                Some(cache_err) => Err(SyncError::CacheUnavailable(format!(
                    "{cache_err}; store fallback also failed: {store_err}"
                ))),
                None => Err(SyncError::StoreUnavailable(store_err.to_string())),
            },
        }
    }

    /// Shared body of wet and dry runs. Returns the writes that remain
    /// pending: empty after a wet run (they were applied), the full diff
    /// after a dry one.
    async fn reconcile(
        &self,
        run: &mut SyncRun,
        dry: bool,
    ) -> Result<Vec<BalanceRecord>, RunFailure> {
        let timeouts = &self.config.timeouts;

        // Phase 1: enumerate live balance keys.
        let keys = self
            .store_op("cache", "scan", timeouts.read(), self.cache.scan_balance_keys())
            .await
            .map_err(|e| {
                warn!(error = %e, "Cache scan failed, no balances will be written");
                run.fail(RunFailure::CacheUnavailable, e.to_string());
                RunFailure::CacheUnavailable
            })?;

        run.keys_found = keys.len() as u64;
        crate::metrics::record_scan_keys(keys.len());

        if keys.is_empty() {
            debug!("Cache holds no balance keys, nothing to reconcile");
            return Ok(Vec::new());
        }

        // Phase 2: fetch the raw values.
        let values = self
            .store_op("cache", "fetch", timeouts.read(), self.cache.fetch_raw(&keys))
            .await
            .map_err(|e| {
                warn!(error = %e, "Cache read failed, no balances will be written");
                run.fail(RunFailure::CacheUnavailable, e.to_string());
                RunFailure::CacheUnavailable
            })?;

        // Phase 3: parse. Malformed entries are skipped and counted, never fatal.
        let mut parsed: Vec<BalanceRecord> = Vec::with_capacity(keys.len());
        for (key, raw) in keys.iter().zip(values.iter()) {
            run.processed_count += 1;
            let Some(raw) = raw else {
                // Key vanished between scan and fetch; the next run picks it up.
                debug!(key, "Balance key vanished mid-run, skipping");
                continue;
            };
            match parse_user_id(key).and_then(|user_id| {
                parse_balance(raw).map(|balance| BalanceRecord::new(user_id, balance))
            }) {
                Ok(record) => parsed.push(record),
                Err(reason) => {
                    run.error_count += 1;
                    warn!(key, reason, "Skipping malformed balance record");
                }
            }
        }

        // Phase 4: diff against the durable store.
        let user_ids: Vec<i64> = parsed.iter().map(|r| r.user_id).collect();
        let existing = self
            .store_op("sql", "fetch", timeouts.read(), self.store.fetch_balances(&user_ids))
            .await
            .map_err(|e| {
                warn!(error = %e, "Durable store read failed");
                run.fail(RunFailure::StoreUnavailable, e.to_string());
                RunFailure::StoreUnavailable
            })?;

        let stored: std::collections::HashMap<i64, f64> =
            existing.iter().map(|r| (r.user_id, r.balance)).collect();

        // Both sides originate from the same decimal-string parse, so exact
        // comparison is the unchanged-check, not an epsilon.
        let pending: Vec<BalanceRecord> = parsed
            .into_iter()
            .filter(|r| stored.get(&r.user_id) != Some(&r.balance))
            .collect();

        debug!(
            keys = run.keys_found,
            pending = pending.len(),
            "Diff complete"
        );

        if dry || pending.is_empty() {
            return Ok(pending);
        }

        // Phase 5: chunk-atomic bulk upsert with per-row salvage inside the
        // store. A dead write phase fails the whole run.
        crate::metrics::record_upsert_batch(pending.len());
        let outcome = self
            .store_op("sql", "upsert", timeouts.write(), self.store.upsert_balances(&pending))
            .await
            .map_err(|e| {
                warn!(error = %e, rows = pending.len(), "Durable store write failed");
                run.fail(RunFailure::StoreUnavailable, e.to_string());
                RunFailure::StoreUnavailable
            })?;

        run.updated_count = outcome.written as u64;
        run.error_count += outcome.failed as u64;

        Ok(Vec::new())
    }

    /// Best-effort diagnostic write-back: the last-sync timestamp and a JSON
    /// summary of the run, stored beside the balances with a TTL. A failure
    /// here is logged and counted, never surfaced to the run.
    async fn write_status_keys(&self, run: &SyncRun) {
        let ttl = self.config.status_ttl_secs;
        let finished = run
            .finished_at
            .unwrap_or_else(Utc::now)
            .to_rfc3339_opts(SecondsFormat::Secs, true);

        let summary = match serde_json::to_string(run) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Failed to serialize run summary");
                return;
            }
        };

        let wrote_ts = self.cache.put_status(STATUS_LAST_SYNC, &finished, ttl).await;
        let wrote_stats = self.cache.put_status(STATUS_LAST_STATS, &summary, ttl).await;

        for result in [&wrote_ts, &wrote_stats] {
            crate::metrics::record_status_write(result.is_ok());
        }
        if let Err(e) = wrote_ts.and(wrote_stats) {
            warn!(error = %e, "Failed to write diagnostic status keys");
        }
    }

    fn record_run_metrics(&self, run: &SyncRun) {
        crate::metrics::record_run(&run.trigger.to_string(), &run.status.to_string());
        crate::metrics::record_run_duration(Duration::from_millis(run.duration_ms));
        crate::metrics::record_records("processed", run.processed_count);
        crate::metrics::record_records("updated", run.updated_count);
        crate::metrics::record_records("error", run.error_count);
        if let Some(finished) = run.finished_at {
            crate::metrics::set_last_run_timestamp(finished.timestamp());
        }
    }

    /// Run one store operation under its configured timeout, recording
    /// latency and outcome. A timeout aborts that operation only.
    async fn store_op<T, F>(
        &self,
        store: &'static str,
        op: &'static str,
        limit: Duration,
        fut: F,
    ) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, StorageError>>,
    {
        let _timer = crate::metrics::LatencyTimer::new(store, op);
        match tokio::time::timeout(limit, fut).await {
            Ok(Ok(value)) => {
                crate::metrics::record_store_operation(store, op, "success");
                Ok(value)
            }
            Ok(Err(e)) => {
                crate::metrics::record_store_operation(store, op, "error");
                Err(e)
            }
            Err(_) => {
                crate::metrics::record_timeout(store, op);
                crate::metrics::record_store_operation(store, op, "timeout");
                Err(StorageError::Timeout {
                    op,
                    ms: limit.as_millis() as u64,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{InMemoryCache, InMemoryStore};

    fn engine_with(
        cache: Arc<InMemoryCache>,
        store: Arc<InMemoryStore>,
        config: SyncConfig,
    ) -> SyncEngine {
        SyncEngine::new(cache, store, config)
    }

    fn fixture() -> (Arc<InMemoryCache>, Arc<InMemoryStore>, SyncEngine) {
        let cache = Arc::new(InMemoryCache::new());
        let store = Arc::new(InMemoryStore::new());
        let engine = engine_with(cache.clone(), store.clone(), SyncConfig::default());
        (cache, store, engine)
    }

    #[test]
    fn parse_user_id_accepts_integers_only() {
        assert_eq!(parse_user_id("42").unwrap(), 42);
        assert_eq!(parse_user_id(" 7 ").unwrap(), 7);
        assert!(parse_user_id("42abc").is_err());
        assert!(parse_user_id("").is_err());
        assert!(parse_user_id("4.2").is_err());
    }

    #[test]
    fn parse_balance_accepts_non_negative_decimals() {
        assert_eq!(parse_balance("500.00").unwrap(), 500.0);
        assert_eq!(parse_balance("0").unwrap(), 0.0);
        assert_eq!(parse_balance(" 12.5 ").unwrap(), 12.5);
    }

    #[test]
    fn parse_balance_rejects_garbage() {
        assert!(parse_balance("bad").is_err());
        assert!(parse_balance("").is_err());
        assert!(parse_balance("-1.00").is_err());
        assert!(parse_balance("NaN").is_err());
        assert!(parse_balance("inf").is_err());
    }

    #[tokio::test]
    async fn empty_cache_is_a_clean_success() {
        let (_cache, store, engine) = fixture();
        let run = engine.run_sync(RunTrigger::Manual).await;

        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.processed_count, 0);
        assert_eq!(run.updated_count, 0);
        assert_eq!(store.upsert_calls(), 0);
    }

    #[tokio::test]
    async fn inserts_new_and_updates_changed_balances() {
        let (cache, store, engine) = fixture();
        cache.set_balance("1", "100.00");
        cache.set_balance("2", "50.00");
        store.insert_balance(2, 25.0);

        let run = engine.run_sync(RunTrigger::Scheduled).await;

        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.processed_count, 2);
        assert_eq!(run.updated_count, 2);
        assert_eq!(store.balance_of(1), Some(100.0));
        assert_eq!(store.balance_of(2), Some(50.0));
    }

    #[tokio::test]
    async fn unchanged_balances_are_processed_but_not_written() {
        let (cache, store, engine) = fixture();
        cache.set_balance("1", "100.00");
        store.insert_balance(1, 100.0);

        let run = engine.run_sync(RunTrigger::Manual).await;

        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.processed_count, 1);
        assert_eq!(run.updated_count, 0);
        // Nothing pending means no write round-trip at all.
        assert_eq!(store.upsert_calls(), 0);
    }

    #[tokio::test]
    async fn malformed_records_are_skipped_and_counted() {
        let (cache, store, engine) = fixture();
        cache.set_balance("1", "100");
        cache.set_balance("2", "not-a-number");
        cache.set_balance("bad-id", "3.00");

        let run = engine.run_sync(RunTrigger::Manual).await;

        assert_eq!(run.status, RunStatus::Partial);
        assert_eq!(run.processed_count, 3);
        assert_eq!(run.error_count, 2);
        assert_eq!(run.updated_count, 1);
        assert_eq!(store.balance_of(1), Some(100.0));
    }

    #[tokio::test]
    async fn mixed_good_and_bad_records_make_a_partial_run() {
        // Cache {42: 500.00, 7: "bad"}, store {42: 300.00}.
        let (cache, store, engine) = fixture();
        cache.set_balance("42", "500.00");
        cache.set_balance("7", "bad");
        store.insert_balance(42, 300.0);

        let run = engine.run_sync(RunTrigger::Forced).await;

        assert_eq!(run.status, RunStatus::Partial);
        assert_eq!(run.processed_count, 2);
        assert_eq!(run.updated_count, 1);
        assert_eq!(run.error_count, 1);
        assert_eq!(store.balance_of(42), Some(500.0));
        assert_eq!(store.balance_of(7), None);
    }

    #[tokio::test]
    async fn cache_outage_fails_the_run_without_writes() {
        let (cache, store, engine) = fixture();
        cache.set_balance("1", "100.00");
        store.insert_balance(1, 40.0);
        cache.set_down(true);

        let run = engine.run_sync(RunTrigger::Scheduled).await;

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.failure, Some(RunFailure::CacheUnavailable));
        assert_eq!(run.updated_count, 0);
        assert_eq!(store.upsert_calls(), 0);
        // Last-synced value survives untouched.
        assert_eq!(store.balance_of(1), Some(40.0));
    }

    #[tokio::test]
    async fn store_write_outage_fails_the_run() {
        let (cache, store, engine) = fixture();
        cache.set_balance("1", "100.00");
        store.set_fail_writes(true);

        let run = engine.run_sync(RunTrigger::Scheduled).await;

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.failure, Some(RunFailure::StoreUnavailable));
        assert!(run.failure.unwrap().is_retryable());
    }

    #[tokio::test]
    async fn second_run_with_no_mutation_is_idempotent() {
        let (cache, _store, engine) = fixture();
        cache.set_balance("1", "100.00");
        cache.set_balance("2", "200.00");

        let first = engine.run_sync(RunTrigger::Manual).await;
        let second = engine.run_sync(RunTrigger::Manual).await;

        assert_eq!(first.updated_count, 2);
        assert_eq!(second.updated_count, 0);
        assert_eq!(second.status, RunStatus::Success);
    }

    #[tokio::test]
    async fn wet_run_writes_status_keys_with_run_summary() {
        let (cache, _store, engine) = fixture();
        cache.set_balance("1", "100.00");

        let run = engine.run_sync(RunTrigger::Scheduled).await;

        assert!(cache.status(STATUS_LAST_SYNC).is_some());
        let stats_json = cache.status(STATUS_LAST_STATS).unwrap();
        let summary: serde_json::Value = serde_json::from_str(&stats_json).unwrap();
        assert_eq!(summary["id"], run.id.to_string());
        assert_eq!(summary["status"], "success");
    }

    #[tokio::test]
    async fn dry_run_diffs_without_writing() {
        let (cache, store, engine) = fixture();
        cache.set_balance("42", "500.00");
        cache.set_balance("7", "bad");
        store.insert_balance(42, 300.0);

        let report = engine.dry_run().await;

        assert!(report.run.dry_run);
        assert_eq!(report.run.status, RunStatus::Partial);
        assert_eq!(report.run.processed_count, 2);
        assert_eq!(report.run.error_count, 1);
        assert_eq!(report.would_write, 1);
        assert_eq!(report.preview.len(), 1);
        assert_eq!(report.preview[0].user_id, 42);

        // The store is untouched and so are the status keys.
        assert_eq!(store.balance_of(42), Some(300.0));
        assert_eq!(store.upsert_calls(), 0);
        assert!(cache.status(STATUS_LAST_SYNC).is_none());
    }

    #[tokio::test]
    async fn dry_run_preview_is_capped() {
        let (cache, _store, engine) = fixture();
        for i in 0..25 {
            cache.set_balance(&i.to_string(), "1.00");
        }

        let report = engine.dry_run().await;
        assert_eq!(report.would_write, 25);
        assert_eq!(report.preview.len(), SyncConfig::default().dry_run_preview);
    }

    #[tokio::test]
    async fn read_balance_prefers_cache() {
        let (cache, store, engine) = fixture();
        cache.set_balance("42", "500.00");
        store.insert_balance(42, 300.0);

        let record = engine.read_balance(42).await.unwrap().unwrap();
        assert_eq!(record.balance, 500.0);
    }

    #[tokio::test]
    async fn read_balance_degrades_to_store_on_cache_outage() {
        let (cache, store, engine) = fixture();
        cache.set_balance("42", "500.00");
        store.insert_balance(42, 300.0);
        cache.set_down(true);

        let record = engine.read_balance(42).await.unwrap().unwrap();
        assert_eq!(record.balance, 300.0);
    }

    #[tokio::test]
    async fn read_balance_falls_back_on_cache_miss() {
        let (_cache, store, engine) = fixture();
        store.insert_balance(7, 12.5);

        let record = engine.read_balance(7).await.unwrap().unwrap();
        assert_eq!(record.balance, 12.5);
        assert!(engine.read_balance(999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_balance_errors_name_the_failing_store() {
        let (cache, store, engine) = fixture();
        store.set_down(true);

        // Cache reachable but empty: the fallback read is what failed.
        let err = engine.read_balance(1).await.unwrap_err();
        assert!(matches!(err, SyncError::StoreUnavailable(_)));

        // Both down: the cache outage is the root cause.
        cache.set_down(true);
        let err = engine.read_balance(1).await.unwrap_err();
        assert!(matches!(err, SyncError::CacheUnavailable(_)));
    }

    #[tokio::test]
    async fn read_balance_flags_a_malformed_only_copy() {
        let (cache, store, engine) = fixture();
        cache.set_balance("7", "garbage");

        let err = engine.read_balance(7).await.unwrap_err();
        assert!(matches!(err, SyncError::MalformedRecord { .. }));

        // With a durable copy the malformed cache entry degrades instead.
        store.insert_balance(7, 12.5);
        let record = engine.read_balance(7).await.unwrap().unwrap();
        assert_eq!(record.balance, 12.5);
    }

    #[tokio::test]
    async fn slow_cache_times_out_instead_of_hanging() {
        let cache = Arc::new(InMemoryCache::new());
        let store = Arc::new(InMemoryStore::new());
        cache.set_balance("1", "100.00");
        cache.set_latency(Duration::from_millis(200));

        let config: SyncConfig =
            serde_json::from_str(r#"{"timeouts": {"read_timeout_ms": 20}}"#).unwrap();
        let engine = engine_with(cache, store, config);

        let run = engine.run_sync(RunTrigger::Manual).await;
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.failure, Some(RunFailure::CacheUnavailable));
        assert!(run.error.unwrap().contains("timed out"));
    }
}
