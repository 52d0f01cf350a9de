//! Backup plan: schedule and retention configuration consumed by the scheduler.

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// How often automatic backups are due.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackupCadence {
    /// Fixed spacing from the previous run
    Interval { hours: u32 },
    /// Cron expression (5-field expressions get a leading seconds field)
    Cron { expression: String },
}

impl Default for BackupCadence {
    fn default() -> Self {
        BackupCadence::Interval { hours: 24 }
    }
}

impl BackupCadence {
    /// First due time strictly after `base`.
    pub fn next_after(&self, base: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            BackupCadence::Interval { hours } => base + Duration::hours(i64::from((*hours).max(1))),
            BackupCadence::Cron { expression } => {
                // The cron crate expects 6/7 fields (sec min hour dom month dow [year]).
                let normalized = if expression.split_whitespace().count() == 5 {
                    format!("0 {}", expression)
                } else {
                    expression.clone()
                };

                match Schedule::from_str(&normalized) {
                    Ok(schedule) => schedule
                        .after(&base)
                        .next()
                        .unwrap_or_else(|| base + Duration::hours(24)),
                    Err(e) => {
                        tracing::warn!(
                            "Invalid cron expression '{}': {}. Falling back to 24h cadence.",
                            expression,
                            e
                        );
                        base + Duration::hours(24)
                    }
                }
            }
        }
    }
}

/// Schedule configuration. Mutated by an external configuration surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupPlan {
    pub enabled: bool,
    #[serde(default)]
    pub cadence: BackupCadence,
    /// Data domains recorded on automatic backups
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub include_files: bool,
    /// Keep at most this many successful artifacts
    #[serde(default)]
    pub keep_last: Option<u32>,
    /// Delete successful artifacts older than this
    #[serde(default)]
    pub max_age_days: Option<u32>,
    #[serde(default)]
    pub last_auto_run_at: Option<DateTime<Utc>>,
}

impl Default for BackupPlan {
    fn default() -> Self {
        Self {
            enabled: false,
            cadence: BackupCadence::default(),
            scope: Vec::new(),
            label: Some("auto".to_string()),
            include_files: false,
            keep_last: None,
            max_age_days: None,
            last_auto_run_at: None,
        }
    }
}

impl BackupPlan {
    /// Whether an automatic backup is due at `now`.
    ///
    /// The base is the last automatic run, else the newest successful
    /// artifact, else `now` (a fresh install waits one full cadence).
    pub fn is_due(&self, latest_success: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        let base = self.last_auto_run_at.or(latest_success).unwrap_or(now);
        self.cadence.next_after(base) <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, 0, 0).unwrap()
    }

    #[test]
    fn test_disabled_plan_is_never_due() {
        let plan = BackupPlan::default();
        assert!(!plan.is_due(Some(at(0)), at(23) + Duration::days(10)));
    }

    #[test]
    fn test_due_falls_back_through_bases() {
        let mut plan = BackupPlan {
            enabled: true,
            cadence: BackupCadence::Interval { hours: 6 },
            ..Default::default()
        };

        // No history at all: base is now, never immediately due.
        assert!(!plan.is_due(None, at(12)));

        // Latest successful artifact is the base.
        assert!(plan.is_due(Some(at(0)), at(6)));
        assert!(!plan.is_due(Some(at(1)), at(6)));

        // Last automatic run wins over the artifact.
        plan.last_auto_run_at = Some(at(5));
        assert!(!plan.is_due(Some(at(0)), at(6)));
        assert!(plan.is_due(Some(at(0)), at(11)));
    }

    #[test]
    fn test_cron_cadence_five_fields() {
        let cadence = BackupCadence::Cron {
            expression: "30 2 * * *".to_string(),
        };
        let next = cadence.next_after(at(0));
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 1, 2, 30, 0).unwrap());
    }

    #[test]
    fn test_invalid_cron_falls_back_to_a_day() {
        let cadence = BackupCadence::Cron {
            expression: "not a cron".to_string(),
        };
        assert_eq!(cadence.next_after(at(0)), at(0) + Duration::hours(24));
    }

    #[test]
    fn test_cadence_serde_shape() {
        let json = serde_json::to_value(BackupCadence::Interval { hours: 12 }).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "interval", "hours": 12}));
    }
}
