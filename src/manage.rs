//! Management surface: the boundary contract consumed by whatever thin
//! wrapper (CLI, RPC handler) fronts the reconciler.
//!
//! Every operation returns a structured outcome; callers never see a bare
//! connection error. Busy and cooldown rejections travel as
//! [`SyncError`](crate::types::SyncError) variants, not failures.

use std::sync::Arc;

use serde::Serialize;

use crate::config::SyncConfig;
use crate::engine::SyncEngine;
use crate::health::HealthReporter;
use crate::history::RunHistory;
use crate::scheduler::{ScheduleEntry, Scheduler, SchedulerStatus};
use crate::storage::traits::{CacheStore, DurableStore};
use crate::types::{BalanceRecord, DryRunReport, HealthSnapshot, SyncError, SyncRun, SyncStats};

/// Last/current run summary plus whether a run is in flight.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub in_flight: bool,
    pub scheduler: SchedulerStatus,
    pub last_run: Option<SyncRun>,
}

/// The assembled reconciler: engine, scheduler, health reporter and run
/// history wired together with an explicit lifecycle.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use balance_reconciler::{Manager, SyncConfig};
/// use balance_reconciler::storage::{InMemoryCache, InMemoryStore};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let cache = Arc::new(InMemoryCache::new());
/// cache.set_balance("42", "500.00");
///
/// let manager = Manager::build(cache, Arc::new(InMemoryStore::new()), SyncConfig::default());
/// manager.start().await;
///
/// let run = manager.force_sync(true).await.unwrap();
/// assert_eq!(run.updated_count, 1);
///
/// manager.shutdown().await;
/// # }
/// ```
pub struct Manager {
    engine: Arc<SyncEngine>,
    scheduler: Arc<Scheduler>,
    health: HealthReporter,
    history: Arc<RunHistory>,
}

impl Manager {
    /// Wire up the reconciler against the given stores. The scheduler's
    /// clock loop is not running yet; call [`start`](Self::start).
    pub fn build(
        cache: Arc<dyn CacheStore>,
        store: Arc<dyn DurableStore>,
        config: SyncConfig,
    ) -> Self {
        let history = Arc::new(RunHistory::new(config.history_capacity));
        let engine = Arc::new(SyncEngine::new(
            cache.clone(),
            store.clone(),
            config.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(engine.clone(), history.clone(), config.clone()));
        let health = HealthReporter::new(cache, store, history.clone(), &config);

        Self {
            engine,
            scheduler,
            health,
            history,
        }
    }

    /// Start the recurring schedule.
    pub async fn start(&self) {
        self.scheduler.start().await;
    }

    /// Stop the schedule gracefully. An in-flight run completes first.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }

    /// `GET status`
    #[must_use]
    pub fn status(&self) -> StatusReport {
        let scheduler = self.scheduler.status();
        StatusReport {
            in_flight: scheduler.in_flight,
            last_run: scheduler.last_run.clone(),
            scheduler,
        }
    }

    /// `POST force-sync {force}` — trigger a run now. See
    /// [`Scheduler::force_sync`] for the busy/cooldown contract.
    pub async fn force_sync(&self, force: bool) -> Result<SyncRun, SyncError> {
        self.scheduler.force_sync(force).await
    }

    /// Read-and-diff without writing anything, with a preview of the
    /// pending writes a real run would make.
    pub async fn dry_run(&self) -> DryRunReport {
        self.engine.dry_run().await
    }

    /// `GET schedule` — the configured trigger rules and their next fire
    /// times.
    #[must_use]
    pub fn schedule(&self) -> Vec<ScheduleEntry> {
        self.scheduler.schedule()
    }

    /// `GET health`
    pub async fn health(&self) -> HealthSnapshot {
        self.health.check_health().await
    }

    /// `GET stats`
    #[must_use]
    pub fn stats(&self) -> SyncStats {
        self.health.get_stats()
    }

    /// `DELETE clear-cache` — reset diagnostic state only; balance data in
    /// both stores is never touched. Returns how many status keys existed.
    pub async fn clear_cache_view(&self) -> u64 {
        self.health.clear_cache_view().await
    }

    /// Read one balance with cache-first, store-fallback semantics. Failures
    /// come back as typed [`SyncError`] variants, never a bare backend error.
    pub async fn read_balance(&self, user_id: i64) -> Result<Option<BalanceRecord>, SyncError> {
        self.engine.read_balance(user_id).await
    }

    /// All retained runs, newest first.
    #[must_use]
    pub fn recent_runs(&self, n: usize) -> Vec<SyncRun> {
        self.history.recent(n)
    }
}
