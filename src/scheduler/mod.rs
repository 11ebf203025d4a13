// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Trigger and retry coordination.
//!
//! The [`Scheduler`] owns everything around a run without touching balance
//! data itself:
//! - a clock loop evaluating the recurring [`TriggerRule`]s,
//! - the mutual-exclusion guard (at most one run executes at a time),
//! - the cooldown guard on unforced on-demand triggers,
//! - the retry state machine for runs that fail transiently.
//!
//! # Lifecycle
//!
//! ```text
//! Created → Running → ShuttingDown → Stopped
//! ```
//!
//! # Retry state machine
//!
//! ```text
//! Pending → Running → Succeeded
//!                   ↘ Retrying(attempt, next_delay) → Running → …
//!                   ↘ FailedTerminal
//! ```
//!
//! Exhausted retries are terminal for that trigger occurrence only; the
//! next scheduled rule fires normally.

pub mod triggers;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::engine::SyncEngine;
use crate::history::RunHistory;
use crate::types::{RunStatus, RunTrigger, SyncError, SyncRun};

pub use triggers::{ScheduleEntry, TriggerRule};

/// Scheduler lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    /// Constructed, clock loop not yet spawned.
    Created,
    /// Clock loop evaluating trigger rules.
    Running,
    /// Shutdown requested, loop draining.
    ShuttingDown,
    /// Loop exited.
    Stopped,
}

impl std::fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::ShuttingDown => write!(f, "shutting_down"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Where the current trigger occurrence sits in its retry cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunRetryState {
    /// Trigger accepted, run not yet started.
    Pending,
    /// A run is executing.
    Running,
    /// Last attempt failed transiently; the next one is timed.
    Retrying {
        /// Attempts completed so far.
        attempt: u32,
        next_delay: Duration,
    },
    /// The occurrence ended with a completed run.
    Succeeded,
    /// All attempts exhausted, or the failure was not retryable.
    FailedTerminal,
}

/// Snapshot of the scheduler for the management surface.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub in_flight: bool,
    pub retry: RunRetryState,
    pub last_run: Option<SyncRun>,
}

pub struct Scheduler {
    engine: Arc<SyncEngine>,
    history: Arc<RunHistory>,
    config: SyncConfig,
    rules: Vec<TriggerRule>,

    /// At-most-one-run guard. Held for the duration of a run body, never
    /// across retry delays.
    run_guard: Mutex<()>,
    in_flight: AtomicBool,
    /// Finish time of the most recent completed (non-failed) run; feeds the
    /// cooldown guard.
    last_completed: RwLock<Option<DateTime<Utc>>>,
    retry_state: RwLock<RunRetryState>,

    state_tx: watch::Sender<SchedulerState>,
    state_rx: watch::Receiver<SchedulerState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(engine: Arc<SyncEngine>, history: Arc<RunHistory>, config: SyncConfig) -> Self {
        let rules = TriggerRule::from_schedule(&config.schedule);
        let (state_tx, state_rx) = watch::channel(SchedulerState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            engine,
            history,
            config,
            rules,
            run_guard: Mutex::new(()),
            in_flight: AtomicBool::new(false),
            last_completed: RwLock::new(None),
            retry_state: RwLock::new(RunRetryState::Pending),
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            loop_handle: Mutex::new(None),
        }
    }

    /// Spawn the clock loop. A second call is a no-op with a warning.
    pub async fn start(self: &Arc<Self>) {
        if self.state() != SchedulerState::Created {
            warn!(state = %self.state(), "Scheduler already started, ignoring");
            return;
        }
        let _ = self.state_tx.send(SchedulerState::Running);
        crate::metrics::set_scheduler_state("running");

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.clock_loop().await });
        *self.loop_handle.lock().await = handle.into();
        info!(rules = self.rules.len(), "Scheduler started");
    }

    /// Stop the clock loop and wait for it to exit. An in-flight run is not
    /// preempted; only the loop and pending retry timers stop.
    pub async fn shutdown(&self) {
        info!("Scheduler shutting down");
        let _ = self.state_tx.send(SchedulerState::ShuttingDown);
        crate::metrics::set_scheduler_state("shutting_down");
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.loop_handle.lock().await.take() {
            let _ = handle.await;
        }
        let _ = self.state_tx.send(SchedulerState::Stopped);
        crate::metrics::set_scheduler_state("stopped");
        info!("Scheduler stopped");
    }

    #[must_use]
    pub fn state(&self) -> SchedulerState {
        *self.state_rx.borrow()
    }

    /// Watch lifecycle transitions, e.g. to block until `Stopped`.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<SchedulerState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_run_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            state: self.state(),
            in_flight: self.is_run_in_flight(),
            retry: *self.retry_state.read(),
            last_run: self.history.last(),
        }
    }

    /// The configured trigger rules with their next fire times.
    #[must_use]
    pub fn schedule(&self) -> Vec<ScheduleEntry> {
        let now = Utc::now();
        self.rules
            .iter()
            .map(|rule| ScheduleEntry::from_rule(rule, now))
            .collect()
    }

    /// On-demand trigger.
    ///
    /// With `force=false` the call is rejected while a run is in flight
    /// ([`SyncError::RunAlreadyInFlight`]) or inside the cooldown window
    /// after a completed run ([`SyncError::CooldownActive`]). `force=true`
    /// bypasses the cooldown and waits for any in-flight run to finish; the
    /// mutual-exclusion guard itself is never bypassed.
    ///
    /// Returns the first attempt's completed run. A transient failure is
    /// handed to the retry machine in the background, like a scheduled run.
    pub async fn force_sync(self: &Arc<Self>, force: bool) -> Result<SyncRun, SyncError> {
        let guard = if force {
            self.run_guard.lock().await
        } else {
            match self.run_guard.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    crate::metrics::record_trigger_skipped("busy");
                    debug!("Run already in flight, rejecting unforced trigger");
                    return Err(SyncError::RunAlreadyInFlight);
                }
            }
        };

        if !force {
            if let Some((since_secs, remaining_secs)) = self.cooldown_remaining() {
                crate::metrics::record_trigger_skipped("cooldown");
                debug!(since_secs, remaining_secs, "Cooldown active, rejecting unforced trigger");
                return Err(SyncError::CooldownActive {
                    since_secs,
                    remaining_secs,
                });
            }
        }

        self.set_retry_state(RunRetryState::Pending);
        let run = self.run_locked(RunTrigger::Forced).await;
        drop(guard);

        self.settle_or_retry(&run, RunTrigger::Forced);
        Ok(run)
    }

    /// Seconds since the last completed run and seconds left in the window,
    /// when the cooldown still applies.
    fn cooldown_remaining(&self) -> Option<(u64, u64)> {
        let last = (*self.last_completed.read())?;
        let since = (Utc::now() - last).num_seconds().max(0) as u64;
        let cooldown = self.config.cooldown_secs;
        if since < cooldown {
            Some((since, cooldown - since))
        } else {
            None
        }
    }

    /// The clock loop: sleep until the earliest rule fires, run, repeat.
    /// When both rules pick the same instant (the 02:00 overlap) a single
    /// run serves both.
    async fn clock_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_rx.clone();
        info!("Scheduler clock loop running");

        loop {
            let now = Utc::now();
            let Some((rule, next)) = self
                .rules
                .iter()
                .map(|rule| (rule, rule.next_fire(now)))
                .min_by_key(|(_, fire)| *fire)
            else {
                warn!("No trigger rules configured, clock loop idle");
                let _ = shutdown.changed().await;
                break;
            };

            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            debug!(rule = rule.name(), next = %next, "Waiting for next trigger");

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(wait) => {
                    crate::metrics::record_trigger_fired(rule.name());
                    info!(rule = rule.name(), "Schedule rule fired");
                    self.scheduled_tick().await;
                }
            }
        }
    }

    /// Body of one scheduled firing. An overlapping tick is skipped, not
    /// queued, which keeps at-most-one-run trivially true.
    async fn scheduled_tick(self: &Arc<Self>) {
        let Ok(guard) = self.run_guard.try_lock() else {
            crate::metrics::record_trigger_skipped("busy");
            debug!("Run already in flight, skipping scheduled tick");
            return;
        };

        self.set_retry_state(RunRetryState::Pending);
        let run = self.run_locked(RunTrigger::Scheduled).await;
        drop(guard);

        self.settle_or_retry(&run, RunTrigger::Scheduled);
    }

    /// Execute one attempt. The caller must hold `run_guard`.
    async fn run_locked(&self, trigger: RunTrigger) -> SyncRun {
        self.set_retry_state(RunRetryState::Running);
        self.in_flight.store(true, Ordering::Release);
        crate::metrics::set_run_in_flight(true);

        let run = self.engine.run_sync(trigger).await;

        if run.status != RunStatus::Failed {
            *self.last_completed.write() = run.finished_at;
        }
        self.history.record(run.clone());

        self.in_flight.store(false, Ordering::Release);
        crate::metrics::set_run_in_flight(false);
        run
    }

    /// Close out the occurrence, or hand a transient failure to the retry
    /// driver. Retries run in the background so the caller (clock loop or
    /// management call) is never parked on a backoff timer.
    fn settle_or_retry(self: &Arc<Self>, run: &SyncRun, trigger: RunTrigger) {
        if !Self::failed_transiently(run) {
            self.settle(run);
            return;
        }

        if self.config.retry.max_attempts <= 1 {
            self.set_retry_state(RunRetryState::FailedTerminal);
            warn!(trigger = %trigger, "Run failed and retries are disabled");
            return;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move { this.drive_retries(trigger, 1).await });
    }

    fn settle(&self, run: &SyncRun) {
        if run.status == RunStatus::Failed {
            self.set_retry_state(RunRetryState::FailedTerminal);
            warn!(
                failure = run.failure.map(|f| f.as_str()).unwrap_or("unknown"),
                "Run failed without a retryable cause"
            );
        } else {
            self.set_retry_state(RunRetryState::Succeeded);
        }
    }

    /// The retry driver: wait out the backoff, re-acquire the guard, try
    /// again, up to the configured attempt bound.
    async fn drive_retries(self: Arc<Self>, trigger: RunTrigger, attempts_done: u32) {
        let mut attempt = attempts_done;
        let max_attempts = self.config.retry.max_attempts;

        while attempt < max_attempts {
            let delay = self.config.retry.delay_for_attempt(attempt);
            self.set_retry_state(RunRetryState::Retrying {
                attempt,
                next_delay: delay,
            });
            crate::metrics::record_retry_scheduled(attempt);
            info!(attempt, delay_secs = delay.as_secs(), "Retrying failed run after backoff");

            let mut shutdown = self.shutdown_rx.clone();
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("Shutdown during retry backoff, abandoning occurrence");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            // A newer trigger owning the guard supersedes this occurrence.
            let Ok(guard) = self.run_guard.try_lock() else {
                debug!("Another run took over, abandoning retry");
                return;
            };
            let run = self.run_locked(trigger).await;
            drop(guard);
            attempt += 1;

            if !Self::failed_transiently(&run) {
                self.settle(&run);
                return;
            }
        }

        self.set_retry_state(RunRetryState::FailedTerminal);
        warn!(
            attempts = max_attempts,
            trigger = %trigger,
            "Run retries exhausted; next scheduled trigger proceeds normally"
        );
    }

    fn failed_transiently(run: &SyncRun) -> bool {
        run.status == RunStatus::Failed && run.failure.is_some_and(|f| f.is_retryable())
    }

    fn set_retry_state(&self, state: RunRetryState) {
        *self.retry_state.write() = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{InMemoryCache, InMemoryStore};

    struct Harness {
        cache: Arc<InMemoryCache>,
        store: Arc<InMemoryStore>,
        history: Arc<RunHistory>,
        scheduler: Arc<Scheduler>,
    }

    fn harness(config_json: &str) -> Harness {
        let config: SyncConfig = serde_json::from_str(config_json).unwrap();
        let cache = Arc::new(InMemoryCache::new());
        let store = Arc::new(InMemoryStore::new());
        let history = Arc::new(RunHistory::new(config.history_capacity));
        let engine = Arc::new(SyncEngine::new(
            cache.clone(),
            store.clone(),
            config.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(engine, history.clone(), config));
        Harness {
            cache,
            store,
            history,
            scheduler,
        }
    }

    // Zero cooldown and instant retries unless a test opts back in.
    const FAST: &str = r#"{"cooldown_secs": 0, "retry": {"base_delay_secs": 0}}"#;

    #[tokio::test]
    async fn force_sync_runs_and_records_history() {
        let h = harness(FAST);
        h.cache.set_balance("1", "100.00");

        let run = h.scheduler.force_sync(false).await.unwrap();

        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.trigger, RunTrigger::Forced);
        assert_eq!(h.history.len(), 1);
        assert_eq!(h.scheduler.status().retry, RunRetryState::Succeeded);
        assert!(!h.scheduler.is_run_in_flight());
    }

    #[tokio::test]
    async fn unforced_trigger_is_busy_while_guard_is_held() {
        let h = harness(FAST);
        let _held = h.scheduler.run_guard.lock().await;

        let err = h.scheduler.force_sync(false).await.unwrap_err();
        assert!(matches!(err, SyncError::RunAlreadyInFlight));
        assert_eq!(h.history.len(), 0);
    }

    #[tokio::test]
    async fn concurrent_unforced_triggers_collapse_to_one_run() {
        let h = harness(FAST);
        h.cache.set_balance("1", "100.00");
        h.cache.set_latency(Duration::from_millis(100));

        let a = {
            let s = h.scheduler.clone();
            tokio::spawn(async move { s.force_sync(false).await })
        };
        // Let the first trigger take the guard before racing it.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let b = h.scheduler.force_sync(false).await;

        let a = a.await.unwrap();
        assert!(a.is_ok());
        assert!(matches!(b, Err(SyncError::RunAlreadyInFlight)));
        assert_eq!(h.history.len(), 1);
        assert_eq!(h.store.upsert_calls(), 1);
    }

    #[tokio::test]
    async fn forced_trigger_waits_for_the_in_flight_run() {
        let h = harness(FAST);
        h.cache.set_balance("1", "100.00");
        h.cache.set_latency(Duration::from_millis(80));

        let first = {
            let s = h.scheduler.clone();
            tokio::spawn(async move { s.force_sync(false).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Waits out the in-flight run instead of bouncing.
        let second = h.scheduler.force_sync(true).await.unwrap();
        assert!(first.await.unwrap().is_ok());
        assert_eq!(second.status, RunStatus::Success);
        assert_eq!(h.history.len(), 2);
    }

    #[tokio::test]
    async fn cooldown_rejects_unforced_and_yields_to_force() {
        let h = harness(r#"{"cooldown_secs": 3600, "retry": {"base_delay_secs": 0}}"#);
        h.cache.set_balance("1", "100.00");

        h.scheduler.force_sync(true).await.unwrap();

        let err = h.scheduler.force_sync(false).await.unwrap_err();
        match err {
            SyncError::CooldownActive { remaining_secs, .. } => {
                assert!(remaining_secs > 0 && remaining_secs <= 3600);
            }
            other => panic!("expected CooldownActive, got {other}"),
        }

        // force=true bypasses the window.
        let run = h.scheduler.force_sync(true).await.unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(h.history.len(), 2);
    }

    #[tokio::test]
    async fn failed_run_does_not_arm_the_cooldown() {
        let h = harness(r#"{"cooldown_secs": 3600, "retry": {"max_attempts": 1}}"#);
        h.cache.set_balance("1", "100.00");
        h.cache.set_down(true);

        let run = h.scheduler.force_sync(false).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);

        // The next unforced trigger proceeds: no cooldown from a failure.
        h.cache.set_down(false);
        let run = h.scheduler.force_sync(false).await.unwrap();
        assert_eq!(run.status, RunStatus::Success);
    }

    #[tokio::test]
    async fn store_failure_retries_until_exhausted() {
        let h = harness(FAST); // 3 attempts, zero delay
        h.cache.set_balance("1", "100.00");
        h.store.set_fail_writes(true);

        let run = h.scheduler.force_sync(true).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);

        // Current-thread runtime: the retry task runs once we yield.
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(h.history.len(), 3);
        assert_eq!(h.scheduler.status().retry, RunRetryState::FailedTerminal);
        for run in h.history.snapshot() {
            assert_eq!(run.status, RunStatus::Failed);
        }
    }

    #[tokio::test]
    async fn retry_succeeds_once_the_store_recovers() {
        let h = harness(FAST);
        h.cache.set_balance("1", "100.00");
        h.store.set_fail_writes(true);

        let run = h.scheduler.force_sync(true).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);

        // Store comes back before the background retry fires.
        h.store.set_fail_writes(false);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(h.scheduler.status().retry, RunRetryState::Succeeded);
        assert_eq!(h.history.last().unwrap().status, RunStatus::Success);
        assert_eq!(h.store.balance_of(1), Some(100.0));
    }

    #[tokio::test]
    async fn cache_outage_is_not_retried() {
        let h = harness(FAST);
        h.cache.set_balance("1", "100.00");
        h.cache.set_down(true);

        let run = h.scheduler.force_sync(true).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);

        tokio::time::sleep(Duration::from_millis(50)).await;

        // CacheUnavailable is terminal: nothing to read until the next pass.
        assert_eq!(h.history.len(), 1);
        assert_eq!(h.scheduler.status().retry, RunRetryState::FailedTerminal);
    }

    #[tokio::test]
    async fn scheduled_tick_records_a_scheduled_run() {
        let h = harness(FAST);
        h.cache.set_balance("1", "100.00");

        h.scheduler.scheduled_tick().await;

        let run = h.history.last().unwrap();
        assert_eq!(run.trigger, RunTrigger::Scheduled);
        assert_eq!(run.status, RunStatus::Success);
    }

    #[tokio::test]
    async fn lifecycle_start_and_shutdown() {
        let h = harness(FAST);
        assert_eq!(h.scheduler.state(), SchedulerState::Created);

        h.scheduler.start().await;
        assert_eq!(h.scheduler.state(), SchedulerState::Running);

        // Second start is a no-op.
        h.scheduler.start().await;

        h.scheduler.shutdown().await;
        assert_eq!(h.scheduler.state(), SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn schedule_lists_both_rules_with_future_fire_times() {
        let h = harness(FAST);
        let entries = h.scheduler.schedule();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].rule, "hourly");
        assert_eq!(entries[1].rule, "daily");
        let now = Utc::now();
        for entry in &entries {
            assert!(entry.next_fire > now);
        }
    }
}
