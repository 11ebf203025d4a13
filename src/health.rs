//! Liveness probes and run statistics.
//!
//! Probes report, they never fail: a dead backend shows up as
//! `reachable: false` in the snapshot instead of an error crossing the
//! health-check boundary. Stats aggregate the retained run history and are
//! zeroed when no runs have happened yet.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::history::RunHistory;
use crate::storage::traits::{
    CacheStore, DurableStore, STATUS_LAST_STATS, STATUS_LAST_SYNC,
};
use crate::types::{HealthSnapshot, SyncStats};

pub struct HealthReporter {
    cache: Arc<dyn CacheStore>,
    store: Arc<dyn DurableStore>,
    history: Arc<RunHistory>,
    probe_timeout: Duration,
    read_timeout: Duration,
}

impl HealthReporter {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        store: Arc<dyn DurableStore>,
        history: Arc<RunHistory>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            cache,
            store,
            history,
            probe_timeout: config.timeouts.probe(),
            read_timeout: config.timeouts.read(),
        }
    }

    /// Probe both stores in parallel and return a snapshot.
    ///
    /// Each probe is an independent ping with a short timeout; a timeout
    /// counts as unreachable. This method always returns.
    pub async fn check_health(&self) -> HealthSnapshot {
        let (cache_probe, store_probe) = tokio::join!(
            Self::probe("cache", self.probe_timeout, self.cache.ping()),
            Self::probe("sql", self.probe_timeout, self.store.ping()),
        );

        let (cache_reachable, cache_latency_ms) = cache_probe;
        let (store_reachable, store_latency_ms) = store_probe;

        crate::metrics::set_store_healthy("cache", cache_reachable);
        crate::metrics::set_store_healthy("sql", store_reachable);

        HealthSnapshot {
            cache_reachable,
            store_reachable,
            cache_latency_ms,
            store_latency_ms,
            last_run: self.history.last(),
            checked_at: Utc::now(),
        }
    }

    /// Aggregate metrics over the retained run history.
    #[must_use]
    pub fn get_stats(&self) -> SyncStats {
        self.history.stats()
    }

    /// Operational reset of locally cached diagnostic state: drops the
    /// in-memory run history and deletes the two diagnostic status keys from
    /// the cache. Balance data in both stores is never touched.
    ///
    /// Returns how many status keys existed. A cache outage degrades to
    /// removing nothing rather than failing the reset.
    pub async fn clear_cache_view(&self) -> u64 {
        self.history.clear();

        let deleted = tokio::time::timeout(
            self.read_timeout,
            self.cache.delete_status(&[STATUS_LAST_SYNC, STATUS_LAST_STATS]),
        )
        .await;

        match deleted {
            Ok(Ok(removed)) => {
                debug!(removed, "Cleared diagnostic status keys");
                removed
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to clear diagnostic status keys");
                0
            }
            Err(_) => {
                warn!("Timed out clearing diagnostic status keys");
                0
            }
        }
    }

    async fn probe<F>(name: &'static str, limit: Duration, ping: F) -> (bool, Option<u64>)
    where
        F: std::future::Future<Output = Result<(), crate::storage::traits::StorageError>>,
    {
        let start = Instant::now();
        match tokio::time::timeout(limit, ping).await {
            Ok(Ok(())) => (true, Some(start.elapsed().as_millis() as u64)),
            Ok(Err(e)) => {
                debug!(store = name, error = %e, "Health probe failed");
                (false, None)
            }
            Err(_) => {
                debug!(store = name, "Health probe timed out");
                (false, None)
            }
        }
    }
}
