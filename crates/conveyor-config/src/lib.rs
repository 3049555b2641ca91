// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration recognized by the Conveyor core.
//!
//! [`CoreConfig`] carries every knob the engine, bus, scheduler, and cache
//! consult. Loading is TOML-based; all sections and fields are optional and
//! fall back to documented defaults. [`CoreConfig::validate`] rejects values
//! the core cannot operate with and [`CoreConfig::warnings`] surfaces
//! suspicious-but-legal settings.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Errors from configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Semantic validation failed.
    #[error("config validation failed: {reasons:?}")]
    Validation {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

/// Advisory issues that do not prevent operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// The approval poll interval is so low it will hammer the gate store.
    TightApprovalPoll {
        /// Configured interval in milliseconds.
        ms: u64,
    },
    /// Cache retention of zero days evicts entries on every sweep.
    ZeroRetention,
    /// A pool sized larger than typical host parallelism.
    LargePool {
        /// Which pool.
        pool: &'static str,
        /// Configured size.
        size: usize,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TightApprovalPoll { ms } => {
                write!(f, "approvals.poll-interval-ms = {ms} is below 100 ms")
            }
            Self::ZeroRetention => write!(f, "cache.retention-days = 0 evicts everything"),
            Self::LargePool { pool, size } => write!(f, "{pool} pool size {size} is unusually large"),
        }
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// `[workspace]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct WorkspaceSection {
    /// Root directory for per-build workspaces.
    pub root: PathBuf,
}

impl Default for WorkspaceSection {
    fn default() -> Self {
        Self {
            root: PathBuf::from("workspaces"),
        }
    }
}

/// `[artifacts]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ArtifactsSection {
    /// Root directory for collected artifacts.
    pub root: PathBuf,
}

impl Default for ArtifactsSection {
    fn default() -> Self {
        Self {
            root: PathBuf::from("artifacts"),
        }
    }
}

/// `[cache]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CacheSection {
    /// Root directory for cache entries.
    pub root: PathBuf,
    /// Entries older than this many days are evicted.
    pub retention_days: u32,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            root: PathBuf::from("cache"),
            retention_days: 30,
        }
    }
}

/// `[parallel-stages]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ParallelStagesSection {
    /// Whether DAG-mode stage execution is enabled at all.
    pub enabled: bool,
    /// Maximum stages in flight within one build.
    pub max_concurrent: usize,
}

impl Default for ParallelStagesSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent: 4,
        }
    }
}

/// `[thread-pools]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ThreadPoolsSection {
    /// Builds executing concurrently across the whole server.
    pub build_pool_size: usize,
    /// Maximum steps in flight within one parallel stage.
    pub max_parallel_steps: usize,
}

impl Default for ThreadPoolsSection {
    fn default() -> Self {
        Self {
            build_pool_size: 4,
            max_parallel_steps: 8,
        }
    }
}

/// `[matrix]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct MatrixSection {
    /// Maximum cartesian expansion size.
    pub max_combinations: usize,
}

impl Default for MatrixSection {
    fn default() -> Self {
        Self {
            max_combinations: 25,
        }
    }
}

/// `[approvals]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ApprovalsSection {
    /// Re-check interval for parked approval waits, in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for ApprovalsSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
        }
    }
}

/// `[cron]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CronSection {
    /// Scheduler poll interval in seconds.
    pub poll_interval_seconds: u64,
    /// Runs overdue by more than this many minutes are marked missed.
    pub missed_run_threshold_minutes: u64,
}

impl Default for CronSection {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 60,
            missed_run_threshold_minutes: 10,
        }
    }
}

/// `[event-bus]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct EventBusSection {
    /// Blocking-publish timeout for critical events, in milliseconds.
    pub publish_timeout_ms: u64,
    /// Main channel capacity.
    pub capacity: usize,
    /// Per-subscriber queue capacity.
    pub subscriber_capacity: usize,
}

impl Default for EventBusSection {
    fn default() -> Self {
        Self {
            publish_timeout_ms: 30_000,
            capacity: 4_096,
            subscriber_capacity: 256,
        }
    }
}

/// `[steps]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct StepsSection {
    /// Default per-step timeout in seconds, when a step declares none.
    pub default_timeout_seconds: u64,
}

impl Default for StepsSection {
    fn default() -> Self {
        Self {
            default_timeout_seconds: 300,
        }
    }
}

// ---------------------------------------------------------------------------
// CoreConfig
// ---------------------------------------------------------------------------

/// Every configuration key the core consults.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CoreConfig {
    /// Workspace settings.
    pub workspace: WorkspaceSection,
    /// Artifact settings.
    pub artifacts: ArtifactsSection,
    /// Cache settings.
    pub cache: CacheSection,
    /// DAG-mode settings.
    pub parallel_stages: ParallelStagesSection,
    /// Pool sizing.
    pub thread_pools: ThreadPoolsSection,
    /// Matrix limits.
    pub matrix: MatrixSection,
    /// Approval wait settings.
    pub approvals: ApprovalsSection,
    /// Scheduler settings.
    pub cron: CronSection,
    /// Event bus settings.
    pub event_bus: EventBusSection,
    /// Step execution settings.
    pub steps: StepsSection,
}

impl CoreConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::FileNotFound`] when the path does not exist,
    /// and parse / validation errors otherwise.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.display().to_string(),
            });
        }
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the core cannot operate with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] listing every violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut reasons = Vec::new();
        if self.thread_pools.build_pool_size == 0 {
            reasons.push("thread-pools.build-pool-size must be at least 1".to_string());
        }
        if self.thread_pools.max_parallel_steps == 0 {
            reasons.push("thread-pools.max-parallel-steps must be at least 1".to_string());
        }
        if self.parallel_stages.max_concurrent == 0 {
            reasons.push("parallel-stages.max-concurrent must be at least 1".to_string());
        }
        if self.matrix.max_combinations == 0 {
            reasons.push("matrix.max-combinations must be at least 1".to_string());
        }
        if self.event_bus.capacity == 0 || self.event_bus.subscriber_capacity == 0 {
            reasons.push("event-bus capacities must be at least 1".to_string());
        }
        if self.cron.poll_interval_seconds == 0 {
            reasons.push("cron.poll-interval-seconds must be at least 1".to_string());
        }
        if reasons.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation { reasons })
        }
    }

    /// Advisory warnings for legal but suspicious settings.
    #[must_use]
    pub fn warnings(&self) -> Vec<ConfigWarning> {
        let mut out = Vec::new();
        if self.approvals.poll_interval_ms < 100 {
            out.push(ConfigWarning::TightApprovalPoll {
                ms: self.approvals.poll_interval_ms,
            });
        }
        if self.cache.retention_days == 0 {
            out.push(ConfigWarning::ZeroRetention);
        }
        if self.thread_pools.build_pool_size > 64 {
            out.push(ConfigWarning::LargePool {
                pool: "build",
                size: self.thread_pools.build_pool_size,
            });
        }
        if self.thread_pools.max_parallel_steps > 64 {
            out.push(ConfigWarning::LargePool {
                pool: "step",
                size: self.thread_pools.max_parallel_steps,
            });
        }
        out
    }

    /// Approval poll interval as a [`Duration`].
    #[must_use]
    pub fn approval_poll_interval(&self) -> Duration {
        Duration::from_millis(self.approvals.poll_interval_ms)
    }

    /// Critical-event publish timeout as a [`Duration`].
    #[must_use]
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.event_bus.publish_timeout_ms)
    }

    /// Default per-step timeout as a [`Duration`].
    #[must_use]
    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_secs(self.steps.default_timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let c = CoreConfig::default();
        assert_eq!(c.workspace.root, PathBuf::from("workspaces"));
        assert_eq!(c.cache.retention_days, 30);
        assert_eq!(c.parallel_stages.max_concurrent, 4);
        assert_eq!(c.thread_pools.build_pool_size, 4);
        assert_eq!(c.thread_pools.max_parallel_steps, 8);
        assert_eq!(c.matrix.max_combinations, 25);
        assert_eq!(c.approvals.poll_interval_ms, 5_000);
        assert_eq!(c.cron.poll_interval_seconds, 60);
        assert_eq!(c.cron.missed_run_threshold_minutes, 10);
        assert_eq!(c.event_bus.publish_timeout_ms, 30_000);
        assert_eq!(c.event_bus.capacity, 4_096);
        assert_eq!(c.event_bus.subscriber_capacity, 256);
        assert_eq!(c.steps.default_timeout_seconds, 300);
    }

    #[test]
    fn defaults_validate_cleanly() {
        CoreConfig::default().validate().unwrap();
        assert!(CoreConfig::default().warnings().is_empty());
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: CoreConfig = toml::from_str(
            r#"
            [workspace]
            root = "/srv/conveyor/workspaces"

            [thread-pools]
            build-pool-size = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.workspace.root, PathBuf::from("/srv/conveyor/workspaces"));
        assert_eq!(config.thread_pools.build_pool_size, 8);
        assert_eq!(config.thread_pools.max_parallel_steps, 8);
        assert_eq!(config.matrix.max_combinations, 25);
    }

    #[test]
    fn zero_pool_size_fails_validation() {
        let config: CoreConfig = toml::from_str(
            r#"
            [thread-pools]
            build-pool-size = 0
            "#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Validation { .. }));
    }

    #[test]
    fn tight_poll_interval_warns() {
        let config: CoreConfig = toml::from_str(
            r#"
            [approvals]
            poll-interval-ms = 10
            "#,
        )
        .unwrap();
        assert!(config
            .warnings()
            .iter()
            .any(|w| matches!(w, ConfigWarning::TightApprovalPoll { ms: 10 })));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[cache]\nretention-days = 7").unwrap();
        let config = CoreConfig::load(file.path()).unwrap();
        assert_eq!(config.cache.retention_days, 7);
    }

    #[test]
    fn load_missing_file_errors() {
        let err = CoreConfig::load(Path::new("/nonexistent/conveyor.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }
}
