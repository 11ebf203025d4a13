//! Configuration for the balance reconciler.
//!
//! # Example
//!
//! ```
//! use balance_reconciler::SyncConfig;
//!
//! // Minimal config (uses defaults)
//! let config = SyncConfig::default();
//! assert_eq!(config.schedule.daily_hour, 2);
//!
//! // Full config
//! let config = SyncConfig {
//!     cooldown_secs: 600,
//!     history_capacity: 100,
//!     ..Default::default()
//! };
//! ```

use serde::Deserialize;
use std::time::Duration;

/// Configuration for the reconciler. Every field has a default, so an empty
/// document deserializes to a working setup; deployments override what they
/// need.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// When the scheduler fires on its own.
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Retry policy for failed runs.
    #[serde(default)]
    pub retry: RetryPolicyConfig,

    /// Per-operation time bounds.
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// How many completed runs the in-memory history retains.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Minimum gap between unforced on-demand runs.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// TTL on the diagnostic status entries written back to the cache.
    #[serde(default = "default_status_ttl_secs")]
    pub status_ttl_secs: u64,

    /// How many pending writes a dry run lists in its preview.
    #[serde(default = "default_dry_run_preview")]
    pub dry_run_preview: usize,
}

fn default_history_capacity() -> usize { 50 }
fn default_cooldown_secs() -> u64 { 3600 } // 1 hour
fn default_status_ttl_secs() -> u64 { 86_400 } // 24 hours
fn default_dry_run_preview() -> usize { 10 }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            schedule: ScheduleConfig::default(),
            retry: RetryPolicyConfig::default(),
            timeouts: TimeoutConfig::default(),
            history_capacity: default_history_capacity(),
            cooldown_secs: default_cooldown_secs(),
            status_ttl_secs: default_status_ttl_secs(),
            dry_run_preview: default_dry_run_preview(),
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Fire times for the two built-in schedule rules. Values are normalized
/// modulo their range at rule construction, so an out-of-range override
/// degrades instead of panicking.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// Minute of every hour for the primary pass.
    #[serde(default = "default_hourly_minute")]
    pub hourly_minute: u32,

    /// Hour of the daily safety pass.
    #[serde(default = "default_daily_hour")]
    pub daily_hour: u32,

    /// Minute of the daily safety pass.
    #[serde(default = "default_daily_minute")]
    pub daily_minute: u32,
}

fn default_hourly_minute() -> u32 { 0 }
fn default_daily_hour() -> u32 { 2 }
fn default_daily_minute() -> u32 { 0 }

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            hourly_minute: default_hourly_minute(),
            daily_hour: default_daily_hour(),
            daily_minute: default_daily_minute(),
        }
    }
}

/// Retry policy for failed runs. This governs whole runs, not individual
/// store operations; the scheduler owns the retry timer.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicyConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    #[serde(default = "default_backoff_factor")]
    pub factor: f64,
}

fn default_max_attempts() -> u32 { 3 }
fn default_base_delay_secs() -> u64 { 300 } // 5 minutes
fn default_max_delay_secs() -> u64 { 3600 }
fn default_backoff_factor() -> f64 { 2.0 }

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            factor: default_backoff_factor(),
        }
    }
}

impl RetryPolicyConfig {
    /// Delay before the given attempt (1-based), growing exponentially and
    /// capped at `max_delay_secs`. A non-finite or sub-1 factor degrades to
    /// constant delay rather than panicking.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = if self.factor.is_finite() && self.factor >= 1.0 {
            self.factor
        } else {
            1.0
        };
        let max = Duration::from_secs(self.max_delay_secs);
        let mut delay = Duration::from_secs(self.base_delay_secs);
        for _ in 1..attempt {
            if delay >= max || factor <= 1.0 {
                break;
            }
            delay = delay.mul_f64(factor).min(max);
        }
        delay.min(max)
    }
}

/// Per-operation time bounds. A slow store call stalls one phase of one run,
/// never the scheduler loop.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    /// Scans and reads against either store.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Bulk writes to the durable store.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Health probes.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_read_timeout_ms() -> u64 { 10_000 }
fn default_write_timeout_ms() -> u64 { 30_000 }
fn default_probe_timeout_ms() -> u64 { 2_000 }

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl TimeoutConfig {
    #[must_use]
    pub fn read(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    #[must_use]
    pub fn write(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    #[must_use]
    pub fn probe(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}
