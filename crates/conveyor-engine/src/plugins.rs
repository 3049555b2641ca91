// SPDX-License-Identifier: MIT OR Apache-2.0
//! Plug-in registry: step executors, notifiers, SCM status reporters,
//! pipeline formats, and supply-chain hooks, indexed by kind.
//!
//! The registry is written once at startup and read-only afterwards; the
//! runtime holds it behind an `Arc` with no interior mutability.

use crate::collab::{FeatureFlag, StatusReporter};
use conveyor_cancel::CancelToken;
use conveyor_core::{Build, Pipeline, Step};
use conveyor_process::ProcessOutput;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Step executors
// ---------------------------------------------------------------------------

/// Everything a step executor gets to work with.
pub struct StepInvocation<'a> {
    /// The step definition.
    pub step: &'a Step,
    /// Merged environment (build overlay + matrix + step additions).
    pub env: &'a BTreeMap<String, String>,
    /// Workspace directory.
    pub workspace: &'a Path,
    /// Effective timeout for the step.
    pub timeout: Duration,
    /// Secret values to mask from captured output.
    pub mask_values: &'a [String],
    /// The build's cancel token.
    pub cancel: &'a CancelToken,
}

/// Executes one step kind.
#[async_trait::async_trait]
pub trait StepExecutor: Send + Sync {
    /// Run the step to completion.
    ///
    /// # Errors
    ///
    /// An error means the step could not run at all (spawn failure, bad
    /// plug-in config); it becomes a step `failure` with the message
    /// captured. Non-zero exits are reported through the output.
    async fn execute_step(&self, invocation: StepInvocation<'_>) -> anyhow::Result<ProcessOutput>;
}

// ---------------------------------------------------------------------------
// Notifiers, reporters, formats, hooks
// ---------------------------------------------------------------------------

/// Notification transport plug-in.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a completion notification for the build.
    ///
    /// # Errors
    ///
    /// Propagates transport failures; the engine logs and swallows them.
    async fn notify(&self, target: &str, build: &Build) -> anyhow::Result<()>;
}

/// Workspace pipeline-definition parser plug-in, selected by extension.
pub trait PipelineFormat: Send + Sync {
    /// Parse a workspace definition file into a pipeline.
    ///
    /// # Errors
    ///
    /// A parse failure makes the engine fall back to the server pipeline.
    fn parse_pipeline(&self, text: &str) -> anyhow::Result<Pipeline>;
}

/// Post-build supply-chain hook (provenance, SBOM, scan, license, signing).
#[async_trait::async_trait]
pub trait SupplyChainHook: Send + Sync {
    /// Hook name for logging.
    fn name(&self) -> &str;
    /// The feature flag guarding this hook.
    fn flag(&self) -> FeatureFlag;
    /// Receive the completed build.
    ///
    /// # Errors
    ///
    /// Hook failures never change the build status; the engine logs them.
    async fn run(&self, build: &Build) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Kind-indexed plug-in tables.
#[derive(Default)]
pub struct PluginRegistry {
    step_executors: HashMap<String, Arc<dyn StepExecutor>>,
    notifiers: HashMap<String, Arc<dyn Notifier>>,
    status_reporters: HashMap<String, Arc<dyn StatusReporter>>,
    pipeline_formats: HashMap<String, Arc<dyn PipelineFormat>>,
    supply_chain: Vec<Arc<dyn SupplyChainHook>>,
}

impl PluginRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step executor under a kind name.
    pub fn register_step_executor(
        &mut self,
        kind: impl Into<String>,
        executor: Arc<dyn StepExecutor>,
    ) {
        self.step_executors.insert(kind.into(), executor);
    }

    /// Look up a step executor by kind.
    #[must_use]
    pub fn step_executor(&self, kind: &str) -> Option<Arc<dyn StepExecutor>> {
        self.step_executors.get(kind).cloned()
    }

    /// Register a notifier under a target kind.
    pub fn register_notifier(&mut self, kind: impl Into<String>, notifier: Arc<dyn Notifier>) {
        self.notifiers.insert(kind.into(), notifier);
    }

    /// Look up a notifier by target kind.
    #[must_use]
    pub fn notifier(&self, kind: &str) -> Option<Arc<dyn Notifier>> {
        self.notifiers.get(kind).cloned()
    }

    /// Register an SCM status reporter for a provider name.
    pub fn register_status_reporter(
        &mut self,
        provider: impl Into<String>,
        reporter: Arc<dyn StatusReporter>,
    ) {
        self.status_reporters.insert(provider.into(), reporter);
    }

    /// Look up an SCM status reporter by provider name.
    #[must_use]
    pub fn status_reporter(&self, provider: &str) -> Option<Arc<dyn StatusReporter>> {
        self.status_reporters.get(provider).cloned()
    }

    /// Register a pipeline format for a file extension (e.g. `"yaml"`).
    pub fn register_pipeline_format(
        &mut self,
        extension: impl Into<String>,
        format: Arc<dyn PipelineFormat>,
    ) {
        self.pipeline_formats.insert(extension.into(), format);
    }

    /// Look up a pipeline format by extension.
    #[must_use]
    pub fn pipeline_format(&self, extension: &str) -> Option<Arc<dyn PipelineFormat>> {
        self.pipeline_formats.get(extension).cloned()
    }

    /// Append a supply-chain hook.
    pub fn register_supply_chain_hook(&mut self, hook: Arc<dyn SupplyChainHook>) {
        self.supply_chain.push(hook);
    }

    /// All supply-chain hooks, in registration order.
    #[must_use]
    pub fn supply_chain_hooks(&self) -> &[Arc<dyn SupplyChainHook>] {
        &self.supply_chain
    }
}
