// SPDX-License-Identifier: MIT OR Apache-2.0
//! Persisted schedule and cron-run records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Whether the scheduler should fire a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScheduleStatus {
    /// Eligible for firing.
    #[default]
    Active,
    /// Skipped by the poll loop.
    Paused,
}

/// A persisted cron schedule bound to a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronSchedule {
    /// Schedule identifier.
    pub id: Uuid,
    /// Job to trigger.
    pub job: String,
    /// Organization scope.
    pub org: String,
    /// Five-field cron expression.
    pub expression: String,
    /// IANA timezone name; `UTC` when unset.
    pub timezone: String,
    /// Next instant the schedule should fire. Recomputed after every
    /// successful or missed fire.
    pub next_run_at: Option<DateTime<Utc>>,
    /// Last instant the schedule actually fired.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Active or paused.
    pub status: ScheduleStatus,
    /// Parameter overlay applied to triggered builds.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

impl CronSchedule {
    /// Create an active schedule with no run history.
    #[must_use]
    pub fn new(
        job: impl Into<String>,
        org: impl Into<String>,
        expression: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job: job.into(),
            org: org.into(),
            expression: expression.into(),
            timezone: "UTC".to_string(),
            next_run_at: None,
            last_run_at: None,
            status: ScheduleStatus::Active,
            parameters: BTreeMap::new(),
        }
    }
}

/// Outcome of one poll-cycle decision for a schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum CronRunOutcome {
    /// A build was created.
    Triggered {
        /// The created build.
        build_id: Uuid,
    },
    /// The run was overdue past the missed-run threshold and skipped.
    Missed,
    /// The schedule references a job that does not exist, or triggering
    /// failed.
    Error {
        /// Human-readable detail.
        message: String,
    },
}

/// A recorded poll-cycle decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronRun {
    /// Record identifier.
    pub id: Uuid,
    /// The schedule this record belongs to.
    pub schedule_id: Uuid,
    /// When the decision was made.
    pub at: DateTime<Utc>,
    /// What happened.
    #[serde(flatten)]
    pub outcome: CronRunOutcome,
}

impl CronRun {
    /// Record a decision for `schedule_id` stamped now.
    #[must_use]
    pub fn record(schedule_id: Uuid, outcome: CronRunOutcome) -> Self {
        Self {
            id: Uuid::new_v4(),
            schedule_id,
            at: Utc::now(),
            outcome,
        }
    }
}
