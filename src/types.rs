use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A single user balance as it exists in one of the two stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceRecord {
    pub user_id: i64,
    /// Non-negative, finite. Enforced at parse time on the cache side.
    pub balance: f64,
    pub updated_at: DateTime<Utc>,
}

impl BalanceRecord {
    #[must_use]
    pub fn new(user_id: i64, balance: f64) -> Self {
        Self {
            user_id,
            balance,
            updated_at: Utc::now(),
        }
    }
}

/// What caused a run to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunTrigger {
    /// Fired by a schedule rule.
    Scheduled,
    /// Requested through the management surface.
    Forced,
    /// Invoked directly, e.g. a dry run or an operator call.
    Manual,
}

impl std::fmt::Display for RunTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunTrigger::Scheduled => write!(f, "scheduled"),
            RunTrigger::Forced => write!(f, "forced"),
            RunTrigger::Manual => write!(f, "manual"),
        }
    }
}

/// Terminal status of a reconciliation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Every record processed cleanly.
    Success,
    /// Run completed but some records were skipped or failed.
    Partial,
    /// The run could not complete at all.
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Success)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Success => write!(f, "success"),
            RunStatus::Partial => write!(f, "partial"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Why a run failed outright, when it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunFailure {
    CacheUnavailable,
    StoreUnavailable,
}

impl RunFailure {
    /// Whether the failure is transient enough that a retry may succeed.
    /// A dead durable store usually comes back; a dead cache means there is
    /// nothing to read until the next scheduled pass anyway.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, RunFailure::StoreUnavailable)
    }

    /// Stable label used in logs and metric tags.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RunFailure::CacheUnavailable => "cache_unavailable",
            RunFailure::StoreUnavailable => "store_unavailable",
        }
    }
}

/// Record of one reconciliation run. Built at the start of an invocation,
/// frozen once `finished_at` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: Uuid,
    pub trigger: RunTrigger,
    pub status: RunStatus,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    /// Balance keys found in the cache at scan time.
    pub keys_found: u64,
    /// Records examined (valid and malformed alike).
    pub processed_count: u64,
    /// Rows actually written to the durable store (inserts and updates).
    pub updated_count: u64,
    /// Malformed records skipped plus rows that failed to write.
    pub error_count: u64,
    pub error: Option<String>,
    pub failure: Option<RunFailure>,
}

impl SyncRun {
    #[must_use]
    pub fn begin(trigger: RunTrigger, dry_run: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            trigger,
            status: RunStatus::Success,
            dry_run,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: 0,
            keys_found: 0,
            processed_count: 0,
            updated_count: 0,
            error_count: 0,
            error: None,
            failure: None,
        }
    }

    pub fn finish(&mut self, status: RunStatus) {
        let now = Utc::now();
        self.duration_ms = (now - self.started_at).num_milliseconds().max(0) as u64;
        self.finished_at = Some(now);
        self.status = status;
    }

    pub fn fail(&mut self, failure: RunFailure, message: String) {
        self.failure = Some(failure);
        self.error = Some(message);
        self.finish(RunStatus::Failed);
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

/// Result of a dry run: the run record plus a preview of the records that a
/// real run would have written.
#[derive(Debug, Clone, Serialize)]
pub struct DryRunReport {
    pub run: SyncRun,
    /// First few pending writes, capped by `SyncConfig::dry_run_preview`.
    pub preview: Vec<BalanceRecord>,
    /// Total writes a real run would have made.
    pub would_write: u64,
}

/// Point-in-time reachability of both stores. Probes report, they never fail.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub cache_reachable: bool,
    pub store_reachable: bool,
    pub cache_latency_ms: Option<u64>,
    pub store_latency_ms: Option<u64>,
    pub last_run: Option<SyncRun>,
    pub checked_at: DateTime<Utc>,
}

impl HealthSnapshot {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.cache_reachable && self.store_reachable
    }
}

/// Aggregates over the retained run history.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStats {
    pub runs_recorded: u64,
    pub runs_succeeded: u64,
    pub runs_partial: u64,
    pub runs_failed: u64,
    pub total_processed: u64,
    pub total_updated: u64,
    pub total_errors: u64,
    pub average_duration_ms: u64,
    pub last_run: Option<SyncRun>,
}

/// Errors surfaced to callers of the management operations. Coordination
/// signals (busy, cooldown) travel here too so callers always get a typed
/// outcome instead of a bare connection error.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("cache store unavailable: {0}")]
    CacheUnavailable(String),
    #[error("durable store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("malformed record for key '{key}': {reason}")]
    MalformedRecord { key: String, reason: String },
    #[error("a sync run is already in flight")]
    RunAlreadyInFlight,
    #[error("last run finished {since_secs}s ago, next unforced run allowed in {remaining_secs}s")]
    CooldownActive { since_secs: u64, remaining_secs: u64 },
}
