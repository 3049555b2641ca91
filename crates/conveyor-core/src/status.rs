// SPDX-License-Identifier: MIT OR Apache-2.0
//! Closed status enums used throughout the core.
//!
//! Persistence layers speak strings; everything in memory uses these enums.
//! [`std::str::FromStr`] / [`std::fmt::Display`] are the normalisation
//! boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error returned when a persisted status string does not map to a variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} status: {value}")]
pub struct UnknownStatus {
    /// Which enum the parse was for (`"build"` or `"step"`).
    pub kind: &'static str,
    /// The offending string.
    pub value: String,
}

// ---------------------------------------------------------------------------
// BuildStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a [`Build`](crate::Build).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildStatus {
    /// Created but not yet picked up by a worker.
    Queued,
    /// Currently executing.
    Running,
    /// All stages succeeded.
    Success,
    /// At least one stage failed.
    Failure,
    /// Cancelled, policy-denied, or approval-denied.
    Aborted,
    /// Parked on a pending approval gate.
    AwaitingApproval,
}

impl BuildStatus {
    /// `true` for the three statuses a finalized build can carry.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Aborted)
    }

    /// Stable string form used at the persistence boundary.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Aborted => "aborted",
            Self::AwaitingApproval => "awaiting-approval",
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "aborted" => Ok(Self::Aborted),
            "awaiting-approval" => Ok(Self::AwaitingApproval),
            other => Err(UnknownStatus {
                kind: "build",
                value: other.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// StepStatus
// ---------------------------------------------------------------------------

/// Status of a single stage or step result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    /// Completed with exit code 0.
    Success,
    /// Non-zero exit, timeout, or crash.
    Failure,
    /// Cancelled mid-flight or never started because of a denial.
    Aborted,
    /// Condition evaluated false; nothing ran.
    Skipped,
}

impl StepStatus {
    /// Stable string form used at the persistence boundary.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Aborted => "aborted",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "aborted" => Ok(Self::Aborted),
            "skipped" => Ok(Self::Skipped),
            other => Err(UnknownStatus {
                kind: "step",
                value: other.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// TriggerKind
// ---------------------------------------------------------------------------

/// What caused a build to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerKind {
    /// A user pressed the button.
    Manual,
    /// An SCM webhook fired.
    Webhook,
    /// The scheduler matched a cron expression.
    Cron,
    /// An upstream job completed and this job depends on it.
    Upstream,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Manual => "manual",
            Self::Webhook => "webhook",
            Self::Cron => "cron",
            Self::Upstream => "upstream",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// PipelineSource
// ---------------------------------------------------------------------------

/// Which definition a build actually executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineSource {
    /// The pipeline registered on the server.
    #[default]
    Server,
    /// An EDN-style definition found in the checked-out workspace.
    WorkspaceEdn,
    /// A YAML-style definition found in the checked-out workspace.
    WorkspaceYaml,
}
