//! Recurring trigger rules, evaluated by the scheduler's own clock loop.
//!
//! Two rules ship by default: an hourly pass at minute 0 and a daily pass
//! at 02:00. The daily rule fires a run the hourly rule would have fired
//! anyway; it is a deliberate secondary safety trigger, kept redundant on
//! purpose rather than folded into the hourly rule. Deployments override
//! both times through [`ScheduleConfig`](crate::config::ScheduleConfig).

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use serde::Serialize;

use crate::config::ScheduleConfig;

/// A single recurring fire rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerRule {
    /// Fires once per hour at the given minute.
    HourlyAt { minute: u32 },
    /// Fires once per day at the given time. Redundant with the hourly rule
    /// under the default config; see the module docs.
    DailyAt { hour: u32, minute: u32 },
}

impl TriggerRule {
    /// Build the two configured rules, normalizing out-of-range values
    /// modulo their field's range.
    #[must_use]
    pub fn from_schedule(schedule: &ScheduleConfig) -> Vec<TriggerRule> {
        vec![
            TriggerRule::HourlyAt {
                minute: schedule.hourly_minute % 60,
            },
            TriggerRule::DailyAt {
                hour: schedule.daily_hour % 24,
                minute: schedule.daily_minute % 60,
            },
        ]
    }

    /// Short label for logs and metric tags.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            TriggerRule::HourlyAt { .. } => "hourly",
            TriggerRule::DailyAt { .. } => "daily",
        }
    }

    /// Human-readable rendering for the management surface.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            TriggerRule::HourlyAt { minute } => format!("every hour at minute {minute}"),
            TriggerRule::DailyAt { hour, minute } => {
                format!("every day at {hour:02}:{minute:02} UTC")
            }
        }
    }

    /// The first fire time strictly after `after`.
    #[must_use]
    pub fn next_fire(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            TriggerRule::HourlyAt { minute } => {
                let candidate = at_time(after, after.hour(), minute);
                if candidate <= after {
                    candidate + Duration::hours(1)
                } else {
                    candidate
                }
            }
            TriggerRule::DailyAt { hour, minute } => {
                let candidate = at_time(after, hour, minute);
                if candidate <= after {
                    candidate + Duration::days(1)
                } else {
                    candidate
                }
            }
        }
    }
}

/// The same calendar day as `reference`, at `hour:minute:00`.
///
/// Fields are pre-normalized by [`TriggerRule::from_schedule`], so the
/// construction cannot fail; the fallback only guards the type system.
fn at_time(reference: DateTime<Utc>, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(
        reference.year(),
        reference.month(),
        reference.day(),
        hour,
        minute,
        0,
    )
    .single()
    .unwrap_or(reference)
}

/// One row of the management `schedule` listing.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleEntry {
    pub rule: String,
    pub description: String,
    pub next_fire: DateTime<Utc>,
}

impl ScheduleEntry {
    #[must_use]
    pub fn from_rule(rule: &TriggerRule, now: DateTime<Utc>) -> Self {
        Self {
            rule: rule.name().to_string(),
            description: rule.describe(),
            next_fire: rule.next_fire(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 29, h, m, s).single().unwrap()
    }

    #[test]
    fn default_schedule_builds_both_rules() {
        let rules = TriggerRule::from_schedule(&ScheduleConfig::default());
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0], TriggerRule::HourlyAt { minute: 0 });
        assert_eq!(rules[1], TriggerRule::DailyAt { hour: 2, minute: 0 });
    }

    #[test]
    fn out_of_range_config_is_normalized() {
        let schedule: ScheduleConfig = serde_json::from_str(
            r#"{"hourly_minute": 75, "daily_hour": 26, "daily_minute": 61}"#,
        )
        .unwrap();
        let rules = TriggerRule::from_schedule(&schedule);
        assert_eq!(rules[0], TriggerRule::HourlyAt { minute: 15 });
        assert_eq!(rules[1], TriggerRule::DailyAt { hour: 2, minute: 1 });
    }

    #[test]
    fn hourly_fires_at_the_next_minute_boundary() {
        let rule = TriggerRule::HourlyAt { minute: 0 };
        assert_eq!(rule.next_fire(at(10, 15, 30)), at(11, 0, 0));
        assert_eq!(rule.next_fire(at(10, 0, 0)), at(11, 0, 0)); // strictly after
        assert_eq!(rule.next_fire(at(9, 59, 59)), at(10, 0, 0));
    }

    #[test]
    fn hourly_rolls_over_midnight() {
        let rule = TriggerRule::HourlyAt { minute: 0 };
        let next = rule.next_fire(at(23, 30, 0));
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 8, 30, 0, 0, 0).single().unwrap());
    }

    #[test]
    fn daily_fires_today_or_tomorrow() {
        let rule = TriggerRule::DailyAt { hour: 2, minute: 0 };
        // Before 02:00 → today.
        assert_eq!(rule.next_fire(at(1, 30, 0)), at(2, 0, 0));
        // At or after 02:00 → tomorrow.
        let next = rule.next_fire(at(2, 0, 0));
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 8, 30, 2, 0, 0).single().unwrap());
    }

    #[test]
    fn daily_and_hourly_overlap_at_the_safety_time() {
        // The redundancy the defaults ship with: at 02:00 both rules want
        // to fire.
        let hourly = TriggerRule::HourlyAt { minute: 0 };
        let daily = TriggerRule::DailyAt { hour: 2, minute: 0 };
        let before = at(1, 30, 0);
        assert_eq!(hourly.next_fire(before), daily.next_fire(before));
    }

    #[test]
    fn describe_is_human_readable() {
        assert_eq!(
            TriggerRule::HourlyAt { minute: 0 }.describe(),
            "every hour at minute 0"
        );
        assert_eq!(
            TriggerRule::DailyAt { hour: 2, minute: 0 }.describe(),
            "every day at 02:00 UTC"
        );
    }

    #[test]
    fn schedule_entry_carries_next_fire() {
        let now = at(1, 30, 0);
        let entry = ScheduleEntry::from_rule(&TriggerRule::DailyAt { hour: 2, minute: 0 }, now);
        assert_eq!(entry.rule, "daily");
        assert_eq!(entry.next_fire, at(2, 0, 0));
    }
}
