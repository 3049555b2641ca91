// SPDX-License-Identifier: MIT OR Apache-2.0
//! Collaborator contracts the engine consumes.
//!
//! Implementations are out of the core's scope; the engine ships no-op
//! defaults so a [`CoreRuntime`](crate::CoreRuntime) can be assembled
//! without wiring every seam.

use conveyor_core::{Build, GitInfo, SourceSpec};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::warn;

// ---------------------------------------------------------------------------
// VCS
// ---------------------------------------------------------------------------

/// Source checkout collaborator.
#[async_trait::async_trait]
pub trait VcsCheckout: Send + Sync {
    /// Check out `source` into `workspace`, optionally at a fixed commit.
    ///
    /// # Errors
    ///
    /// Returns the provider error; the build completes as `failure` with
    /// the message recorded and no stages run.
    async fn checkout(
        &self,
        source: &SourceSpec,
        workspace: &Path,
        commit: Option<&str>,
    ) -> anyhow::Result<GitInfo>;
}

/// Default checkout that refuses every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopVcs;

#[async_trait::async_trait]
impl VcsCheckout for NoopVcs {
    async fn checkout(
        &self,
        source: &SourceSpec,
        _workspace: &Path,
        _commit: Option<&str>,
    ) -> anyhow::Result<GitInfo> {
        anyhow::bail!("no VCS collaborator configured for {}", source.url)
    }
}

// ---------------------------------------------------------------------------
// Secrets
// ---------------------------------------------------------------------------

/// Secret store collaborator.
#[async_trait::async_trait]
pub trait SecretStore: Send + Sync {
    /// Secrets injected into a build's environment, by name.
    ///
    /// # Errors
    ///
    /// Propagates provider failures; the engine treats them as an empty
    /// set with a warning.
    async fn secrets_for_build(
        &self,
        job: &str,
        org: &str,
    ) -> anyhow::Result<BTreeMap<String, String>>;
}

/// Default secret store with no secrets.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSecrets;

#[async_trait::async_trait]
impl SecretStore for NoopSecrets {
    async fn secrets_for_build(
        &self,
        _job: &str,
        _org: &str,
    ) -> anyhow::Result<BTreeMap<String, String>> {
        Ok(BTreeMap::new())
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Metrics recorder collaborator.
///
/// Every engine call site goes through [`guard_metrics`], so a failing
/// recorder can never affect a build.
pub trait MetricsSink: Send + Sync {
    /// Increment a counter.
    ///
    /// # Errors
    ///
    /// Implementations may fail; the engine swallows the error.
    fn incr_counter(&self, name: &str, labels: &[(&str, &str)]) -> anyhow::Result<()>;

    /// Observe a histogram value.
    ///
    /// # Errors
    ///
    /// Implementations may fail; the engine swallows the error.
    fn observe_histogram(
        &self,
        name: &str,
        value: f64,
        labels: &[(&str, &str)],
    ) -> anyhow::Result<()>;
}

/// Default recorder that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn incr_counter(&self, _name: &str, _labels: &[(&str, &str)]) -> anyhow::Result<()> {
        Ok(())
    }

    fn observe_histogram(
        &self,
        _name: &str,
        _value: f64,
        _labels: &[(&str, &str)],
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Swallow and log a metrics failure.
pub fn guard_metrics(result: anyhow::Result<()>, what: &str) {
    if let Err(e) = result {
        warn!(target: "conveyor.engine", error = %e, what, "metrics recorder failed");
    }
}

// ---------------------------------------------------------------------------
// SCM status
// ---------------------------------------------------------------------------

/// SCM status reporter collaborator.
#[async_trait::async_trait]
pub trait StatusReporter: Send + Sync {
    /// Push the build's status to the SCM provider.
    ///
    /// # Errors
    ///
    /// Propagates provider failures; the engine logs and swallows them.
    async fn report_status(&self, build: &Build) -> anyhow::Result<()>;
}

/// Default reporter that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStatusReporter;

#[async_trait::async_trait]
impl StatusReporter for NoopStatusReporter {
    async fn report_status(&self, _build: &Build) -> anyhow::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Feature flags
// ---------------------------------------------------------------------------

/// Flags the engine consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FeatureFlag {
    /// DAG-mode stage execution.
    ParallelStages,
    /// Provenance hook after build completion.
    Provenance,
    /// SBOM hook after build completion.
    Sbom,
    /// Vulnerability scan hook after build completion.
    VulnerabilityScan,
    /// License check hook after build completion.
    LicenseCheck,
    /// Artifact signing hook after build completion.
    Signing,
}

/// Pure feature-flag predicate.
pub trait FeatureFlags: Send + Sync {
    /// Whether the flag is on.
    fn enabled(&self, flag: FeatureFlag) -> bool;
}

/// Flag set fixed at construction.
#[derive(Debug, Clone)]
pub struct StaticFlags {
    enabled: BTreeSet<FeatureFlag>,
}

impl StaticFlags {
    /// Build from an explicit list of enabled flags.
    #[must_use]
    pub fn new(flags: impl IntoIterator<Item = FeatureFlag>) -> Self {
        Self {
            enabled: flags.into_iter().collect(),
        }
    }
}

impl Default for StaticFlags {
    /// Parallel stages on; supply-chain hooks off.
    fn default() -> Self {
        Self::new([FeatureFlag::ParallelStages])
    }
}

impl FeatureFlags for StaticFlags {
    fn enabled(&self, flag: FeatureFlag) -> bool {
        self.enabled.contains(&flag)
    }
}
