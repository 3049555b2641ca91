// SPDX-License-Identifier: MIT OR Apache-2.0
//! Build records and the per-stage / per-step results they own.
//!
//! A [`Build`] exclusively owns its [`StageResult`]s and [`StepResult`]s;
//! nothing else mutates them. Stage results are appended in completion
//! order — declaration order in sequential mode, finish order in DAG mode.

use crate::status::{BuildStatus, PipelineSource, StepStatus, TriggerKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Git info
// ---------------------------------------------------------------------------

/// Resolved source metadata from a successful checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitInfo {
    /// Checked-out branch.
    pub branch: String,
    /// Full commit hash.
    pub commit: String,
    /// Abbreviated commit hash.
    pub commit_short: String,
    /// Commit author.
    pub author: String,
    /// Commit message subject.
    pub message: String,
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of a single step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Step name.
    pub name: String,
    /// Final status.
    pub status: StepStatus,
    /// Process exit code, when a process ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Captured output with secret masking already applied.
    #[serde(default)]
    pub output: String,
    /// Wall-clock duration in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
    /// When the step started.
    pub started_at: DateTime<Utc>,
    /// When the step finished.
    pub completed_at: DateTime<Utc>,
    /// Failure or abort reason, when one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl StepResult {
    /// A result for a step that never ran (skipped / aborted before start).
    #[must_use]
    pub fn unstarted(name: impl Into<String>, status: StepStatus, reason: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            status,
            exit_code: None,
            output: String::new(),
            duration_ms: 0,
            started_at: now,
            completed_at: now,
            reason,
        }
    }
}

/// Outcome of a single stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    /// Stage name (with the matrix suffix when expanded).
    pub name: String,
    /// Final status, derived from the step results via [`derive_stage_status`].
    pub status: StepStatus,
    /// Per-step results in execution order.
    pub steps: Vec<StepResult>,
    /// When the stage started.
    pub started_at: DateTime<Utc>,
    /// When the stage finished.
    pub completed_at: DateTime<Utc>,
    /// Denial / abort reason, when one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// `true` when this result was replayed from the result cache.
    #[serde(default)]
    pub cached: bool,
}

/// Derive a stage status from its step results.
///
/// `aborted` if any step aborted; else `failure` if any step failed; else
/// `skipped` when every step was skipped; else `success`.
#[must_use]
pub fn derive_stage_status(steps: &[StepResult]) -> StepStatus {
    derive_status(steps.iter().map(|s| s.status))
}

/// Derive a build status from its stage results (post-actions excluded).
#[must_use]
pub fn derive_build_status(stages: &[StageResult]) -> BuildStatus {
    match derive_status(stages.iter().map(|s| s.status)) {
        StepStatus::Aborted => BuildStatus::Aborted,
        StepStatus::Failure => BuildStatus::Failure,
        StepStatus::Success | StepStatus::Skipped => BuildStatus::Success,
    }
}

fn derive_status(statuses: impl Iterator<Item = StepStatus> + Clone) -> StepStatus {
    if statuses.clone().any(|s| s == StepStatus::Aborted) {
        StepStatus::Aborted
    } else if statuses.clone().any(|s| s == StepStatus::Failure) {
        StepStatus::Failure
    } else if statuses.clone().all(|s| s == StepStatus::Skipped) {
        StepStatus::Skipped
    } else {
        StepStatus::Success
    }
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

/// Metadata for one collected artifact file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// Flattened file name under the artifact root.
    pub file_name: String,
    /// Absolute path of the stored copy.
    pub path: String,
    /// Size in bytes.
    pub size: u64,
    /// Content type guessed from the extension.
    pub content_type: String,
    /// SHA-256 digest of the contents, hex-encoded.
    pub sha256: String,
}

// ---------------------------------------------------------------------------
// Build
// ---------------------------------------------------------------------------

/// One execution of a pipeline: the persistent record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    /// Unique build identifier.
    pub id: Uuid,
    /// Owning job.
    pub job: String,
    /// Organization scope.
    pub org: String,
    /// Monotonically increasing per-(job, org) number.
    pub number: u64,
    /// Current lifecycle status.
    pub status: BuildStatus,
    /// What triggered the build.
    pub trigger: TriggerKind,
    /// Effective parameter map (declared defaults + overrides).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
    /// Trigger metadata (e.g. the cron schedule id and expression).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    /// Stage results in completion order.
    #[serde(default)]
    pub stages: Vec<StageResult>,
    /// Workspace directory used by the build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    /// Collected artifact metadata.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<ArtifactRecord>,
    /// Which pipeline definition actually ran.
    #[serde(default)]
    pub pipeline_source: PipelineSource,
    /// Checkout metadata, when a checkout succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitInfo>,
    /// Failure detail for fast-failed builds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the build record was created.
    pub created_at: DateTime<Utc>,
    /// When execution started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When execution finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Build {
    /// Create a fresh queued build record.
    #[must_use]
    pub fn new(job: impl Into<String>, org: impl Into<String>, number: u64, trigger: TriggerKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            job: job.into(),
            org: org.into(),
            number,
            status: BuildStatus::Queued,
            trigger,
            parameters: BTreeMap::new(),
            metadata: BTreeMap::new(),
            stages: Vec::new(),
            workspace: None,
            artifacts: Vec::new(),
            pipeline_source: PipelineSource::Server,
            git: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Resolved branch for condition and policy evaluation.
    #[must_use]
    pub fn branch(&self) -> Option<&str> {
        self.git.as_ref().map(|g| g.branch.as_str())
    }
}

// ---------------------------------------------------------------------------
// BuildRequest
// ---------------------------------------------------------------------------

/// What a trigger hands to the lifecycle manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildRequest {
    /// Parameter overrides merged over the pipeline's declared defaults.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
    /// Extra environment handed to every step.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Trigger metadata (e.g. cron schedule id) recorded on the build.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn step(status: StepStatus) -> StepResult {
        StepResult::unstarted("s", status, None)
    }

    #[test]
    fn stage_status_empty_steps_is_skipped() {
        assert_eq!(derive_stage_status(&[]), StepStatus::Skipped);
    }

    #[test]
    fn stage_status_prefers_aborted() {
        let steps = vec![step(StepStatus::Failure), step(StepStatus::Aborted)];
        assert_eq!(derive_stage_status(&steps), StepStatus::Aborted);
    }

    #[test]
    fn stage_status_failure_beats_success() {
        let steps = vec![step(StepStatus::Success), step(StepStatus::Failure)];
        assert_eq!(derive_stage_status(&steps), StepStatus::Failure);
    }

    #[test]
    fn stage_status_all_skipped() {
        let steps = vec![step(StepStatus::Skipped), step(StepStatus::Skipped)];
        assert_eq!(derive_stage_status(&steps), StepStatus::Skipped);
    }

    #[test]
    fn stage_status_mixed_skip_and_success_is_success() {
        let steps = vec![step(StepStatus::Skipped), step(StepStatus::Success)];
        assert_eq!(derive_stage_status(&steps), StepStatus::Success);
    }

    fn arb_status() -> impl Strategy<Value = StepStatus> {
        prop_oneof![
            Just(StepStatus::Success),
            Just(StepStatus::Failure),
            Just(StepStatus::Aborted),
            Just(StepStatus::Skipped),
        ]
    }

    proptest! {
        // The §-style derivation invariant: aborted > failure > all-skipped > success.
        #[test]
        fn derivation_invariant(statuses in proptest::collection::vec(arb_status(), 1..12)) {
            let steps: Vec<StepResult> = statuses.iter().map(|s| step(*s)).collect();
            let derived = derive_stage_status(&steps);
            let any_aborted = statuses.contains(&StepStatus::Aborted);
            let any_failed = statuses.contains(&StepStatus::Failure);
            let all_skipped = statuses.iter().all(|s| *s == StepStatus::Skipped);
            if any_aborted {
                prop_assert_eq!(derived, StepStatus::Aborted);
            } else if any_failed {
                prop_assert_eq!(derived, StepStatus::Failure);
            } else if all_skipped {
                prop_assert_eq!(derived, StepStatus::Skipped);
            } else {
                prop_assert_eq!(derived, StepStatus::Success);
            }
        }

        #[test]
        fn build_derivation_mirrors_stage_derivation(statuses in proptest::collection::vec(arb_status(), 1..8)) {
            let now = Utc::now();
            let stages: Vec<StageResult> = statuses
                .iter()
                .map(|s| StageResult {
                    name: "stage".into(),
                    status: *s,
                    steps: Vec::new(),
                    started_at: now,
                    completed_at: now,
                    reason: None,
                    cached: false,
                })
                .collect();
            let derived = derive_build_status(&stages);
            if statuses.contains(&StepStatus::Aborted) {
                prop_assert_eq!(derived, BuildStatus::Aborted);
            } else if statuses.contains(&StepStatus::Failure) {
                prop_assert_eq!(derived, BuildStatus::Failure);
            } else {
                prop_assert_eq!(derived, BuildStatus::Success);
            }
        }
    }

    #[test]
    fn new_build_starts_queued() {
        let b = Build::new("deploy", "acme", 7, TriggerKind::Manual);
        assert_eq!(b.status, BuildStatus::Queued);
        assert_eq!(b.number, 7);
        assert!(b.stages.is_empty());
        assert!(b.completed_at.is_none());
    }

    #[test]
    fn branch_comes_from_git_info() {
        let mut b = Build::new("j", "o", 1, TriggerKind::Webhook);
        assert_eq!(b.branch(), None);
        b.git = Some(GitInfo {
            branch: "main".into(),
            commit: "abc123def".into(),
            commit_short: "abc123d".into(),
            author: "dev".into(),
            message: "fix".into(),
        });
        assert_eq!(b.branch(), Some("main"));
    }

    #[test]
    fn build_serde_roundtrip() {
        let b = Build::new("job", "org", 1, TriggerKind::Cron);
        let json = serde_json::to_string(&b).unwrap();
        let back: Build = serde_json::from_str(&json).unwrap();
        assert_eq!(back, b);
    }
}
