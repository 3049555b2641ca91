// SPDX-License-Identifier: MIT OR Apache-2.0
//! The declarative plan at three nesting levels: pipeline → stage → step.
//!
//! A [`Pipeline`] is an immutable value. The registered job owns one copy;
//! every build gets its own clone, so editing a job never affects a build
//! already in flight.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Source binding
// ---------------------------------------------------------------------------

/// Binding of a pipeline to a source repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    /// Clone URL of the repository.
    pub url: String,
    /// Branch to check out; `None` means the remote default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

// ---------------------------------------------------------------------------
// Containers
// ---------------------------------------------------------------------------

/// How aggressively to pull a container image before running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PullPolicy {
    /// Pull only when the image is not present locally.
    #[default]
    IfNotPresent,
    /// Always pull before running.
    Always,
    /// Never pull; fail if the image is missing.
    Never,
}

/// Container settings attached to a pipeline, a stage, or a container step.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Image reference, e.g. `rust:1.85` or `ghcr.io/acme/builder:latest`.
    pub image: String,
    /// Additional named volumes as `name:/mount/path` pairs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    /// Working directory inside the container; the workspace is mounted here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Container network mode (`bridge`, `host`, `none`, …).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// Image pull policy.
    #[serde(default)]
    pub pull_policy: PullPolicy,
    /// Extra raw arguments appended to the container invocation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}

impl ContainerSpec {
    /// Shorthand for a spec that only names an image.
    #[must_use]
    pub fn image(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// What a step actually does, by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StepKind {
    /// Run a command through the process executor.
    Shell {
        /// The command line, passed to `sh -c`.
        command: String,
        /// Per-step timeout; engine default applies when absent.
        #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_secs")]
        timeout: Option<Duration>,
        /// Environment additions for this step only.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
        /// Working directory relative to the workspace.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        working_dir: Option<String>,
    },
    /// Run a command inside a container.
    Container {
        /// Container configuration; the image is mandatory.
        #[serde(flatten)]
        spec: ContainerSpec,
        /// Command to run inside the container, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<String>,
    },
    /// Delegate to a registered step-executor plug-in.
    Plugin {
        /// Registered executor kind.
        executor: String,
        /// Opaque configuration handed to the plug-in.
        #[serde(default)]
        config: serde_json::Value,
    },
}

/// Serde helper: optional [`Duration`] as whole seconds.
mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

/// One unit of work inside a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Step name, unique within its stage.
    pub name: String,
    /// What the step does.
    #[serde(flatten)]
    pub kind: StepKind,
    /// Optional execution condition; absent means always run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

impl Step {
    /// Convenience constructor for a shell step with no extras.
    #[must_use]
    pub fn shell(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: StepKind::Shell {
                command: command.into(),
                timeout: None,
                env: BTreeMap::new(),
                working_dir: None,
            },
            condition: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

/// Execution condition evaluated against build parameters and the git branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "when", rename_all = "kebab-case")]
pub enum Condition {
    /// Run only when the resolved git branch equals `branch`.
    BranchEquals {
        /// Expected branch name.
        branch: String,
    },
    /// Run only when the named parameter equals `value`.
    ParameterEquals {
        /// Parameter name.
        name: String,
        /// Expected value.
        value: String,
    },
    /// Always run.
    Always,
}

impl Condition {
    /// Evaluate against the build's resolved branch and parameter map.
    #[must_use]
    pub fn evaluate(&self, branch: Option<&str>, params: &BTreeMap<String, String>) -> bool {
        match self {
            Self::BranchEquals { branch: expected } => branch == Some(expected.as_str()),
            Self::ParameterEquals { name, value } => {
                params.get(name).map(String::as_str) == Some(value.as_str())
            }
            Self::Always => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Caches and approvals
// ---------------------------------------------------------------------------

/// A cache declaration attached to a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheDecl {
    /// Key template; may embed `{{ hashFiles('path') }}` macros.
    pub key: String,
    /// Workspace-relative paths to cache.
    pub paths: Vec<String>,
    /// Prefixes tried against existing entries when the exact key misses.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub restore_keys: Vec<String>,
}

/// An approval requirement attached to a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalSpec {
    /// Message shown to approvers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Role required to approve.
    pub required_role: String,
    /// How long the gate stays open before timing out.
    pub timeout_minutes: u64,
    /// Optional approver group; unioned with policy overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver_group: Option<String>,
    /// Minimum number of distinct approvals.
    #[serde(default = "default_min_approvals")]
    pub min_approvals: u32,
}

fn default_min_approvals() -> u32 {
    1
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

/// A named group of steps with scheduling metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    /// Stage name, unique within the pipeline.
    pub name: String,
    /// Ordered steps.
    pub steps: Vec<Step>,
    /// Run steps as a bounded fan-out instead of sequentially.
    #[serde(default)]
    pub parallel: bool,
    /// Optional execution condition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    /// Names of stages that must complete before this one starts.
    /// Empty makes the stage a DAG root.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Container overlay applied to every step in the stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerSpec>,
    /// Cache declarations restored before and saved after the steps.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub caches: Vec<CacheDecl>,
    /// Approval requirement parked before the steps run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalSpec>,
}

impl Stage {
    /// A sequential stage with the given steps and no extras.
    #[must_use]
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            steps,
            parallel: false,
            condition: None,
            depends_on: Vec::new(),
            container: None,
            caches: Vec::new(),
            approval: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Matrix
// ---------------------------------------------------------------------------

/// Matrix configuration: dimensions and exclusions.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MatrixConfig {
    /// Dimension name → finite value sequence. Sorted map so expansion
    /// order is deterministic.
    pub dimensions: BTreeMap<String, Vec<String>>,
    /// Partial combinations to exclude: a combination is dropped when it
    /// agrees with every pair in an exclusion entry.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<BTreeMap<String, String>>,
}

impl MatrixConfig {
    /// Number of combinations before exclusions are applied.
    #[must_use]
    pub fn combination_count(&self) -> usize {
        if self.dimensions.is_empty() {
            return 0;
        }
        self.dimensions.values().map(Vec::len).product()
    }
}

// ---------------------------------------------------------------------------
// Post-actions
// ---------------------------------------------------------------------------

/// Step groups that run after the main stages have finalized the status.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PostActions {
    /// Runs regardless of the final status.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub always: Vec<Step>,
    /// Runs only when the build succeeded.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_success: Vec<Step>,
    /// Runs only when the build failed or aborted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_failure: Vec<Step>,
}

impl PostActions {
    /// `true` when no group contains any step.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.always.is_empty() && self.on_success.is_empty() && self.on_failure.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// The complete declarative plan for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline name.
    pub name: String,
    /// Optional human description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Ordered stage sequence.
    pub stages: Vec<Stage>,
    /// Optional matrix configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matrix: Option<MatrixConfig>,
    /// Pipeline-level container overlay, inherited by stages without one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerSpec>,
    /// Declared parameters with default values.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
    /// Glob patterns for artifact collection.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
    /// Notification target names resolved through the notifier registry.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notify: Vec<String>,
    /// Post-action step groups.
    #[serde(default, skip_serializing_if = "PostActions::is_empty")]
    pub post: PostActions,
    /// Source repository binding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceSpec>,
}

impl Pipeline {
    /// A minimal pipeline with the given stages and no extras.
    #[must_use]
    pub fn new(name: impl Into<String>, stages: Vec<Stage>) -> Self {
        Self {
            name: name.into(),
            description: None,
            stages,
            matrix: None,
            container: None,
            parameters: BTreeMap::new(),
            artifacts: Vec::new(),
            notify: Vec::new(),
            post: PostActions::default(),
            source: None,
        }
    }

    /// `true` when any stage declares dependencies, enabling DAG mode.
    #[must_use]
    pub fn has_dependencies(&self) -> bool {
        self.stages.iter().any(|s| !s.depends_on.is_empty())
    }
}
