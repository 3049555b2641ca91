// SPDX-License-Identifier: MIT OR Apache-2.0
//! Policy records and rule payloads.

use chrono::Weekday;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Allow-list / deny-list behaviour for restriction rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestrictionAction {
    /// Patterns form an allow-list; no match denies.
    Allow,
    /// Patterns form a deny-list; any match denies.
    Deny,
}

/// Behaviour of a time-window rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeWindowAction {
    /// Execution is only allowed inside the window.
    AllowOnly,
    /// Execution is denied inside the window.
    DenyDuring,
}

/// Comparison operator for parameter rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamOperator {
    /// Parameter exists and equals the value.
    Equals,
    /// Parameter exists and differs from the value.
    NotEquals,
    /// Parameter exists and contains the value as a substring.
    Contains,
    /// Parameter exists, value ignored.
    Exists,
    /// Parameter absent, value ignored.
    NotExists,
}

/// Day of week in cron convention (Sunday first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DayOfWeek {
    /// Sunday.
    Sun,
    /// Monday.
    Mon,
    /// Tuesday.
    Tue,
    /// Wednesday.
    Wed,
    /// Thursday.
    Thu,
    /// Friday.
    Fri,
    /// Saturday.
    Sat,
}

impl DayOfWeek {
    /// Convert from a chrono weekday.
    #[must_use]
    pub fn from_weekday(day: Weekday) -> Self {
        match day {
            Weekday::Sun => Self::Sun,
            Weekday::Mon => Self::Mon,
            Weekday::Tue => Self::Tue,
            Weekday::Wed => Self::Wed,
            Weekday::Thu => Self::Thu,
            Weekday::Fri => Self::Fri,
            Weekday::Sat => Self::Sat,
        }
    }
}

/// Kind-specific rule payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PolicyRule {
    /// Match the resolved git branch against glob patterns.
    BranchRestriction {
        /// Glob patterns (`*` stays within a segment, `**` crosses).
        branches: Vec<String>,
        /// Allow-list or deny-list behaviour.
        action: RestrictionAction,
    },
    /// Match the resolved git author against glob patterns.
    AuthorRestriction {
        /// Glob patterns.
        authors: Vec<String>,
        /// Allow-list or deny-list behaviour.
        action: RestrictionAction,
    },
    /// Constrain execution to (or away from) a recurring time window.
    TimeWindow {
        /// IANA timezone name the window is anchored in.
        timezone: String,
        /// Days the window applies to.
        days: Vec<DayOfWeek>,
        /// Window start hour, inclusive.
        start_hour: u8,
        /// Window end hour, exclusive.
        end_hour: u8,
        /// Allow-only or deny-during behaviour.
        action: TimeWindowAction,
    },
    /// Evaluate a build parameter.
    ParameterRestriction {
        /// Parameter name.
        parameter: String,
        /// Comparison operator.
        operator: ParamOperator,
        /// Comparison value, when the operator takes one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
        /// Allow or deny behaviour over the match result.
        action: RestrictionAction,
    },
    /// Amplify the approval requirement of matching stages.
    RequiredApproval {
        /// Stage-name glob patterns.
        stages: Vec<String>,
        /// Minimum approvals demanded.
        min_approvals: u32,
        /// Approver group to union into the gate.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        approver_group: Option<String>,
    },
}

/// A persisted policy scoped to an organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Unique policy id.
    pub id: Uuid,
    /// Organization scope.
    pub org: String,
    /// Human-readable name.
    pub name: String,
    /// Disabled policies are never evaluated.
    pub enabled: bool,
    /// Lower numbers evaluate first.
    pub priority: i32,
    /// Kind-specific payload.
    #[serde(flatten)]
    pub rule: PolicyRule,
}
