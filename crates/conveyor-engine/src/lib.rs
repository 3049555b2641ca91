// SPDX-License-Identifier: MIT OR Apache-2.0
//! conveyor-engine
//!
//! The pipeline execution engine and build lifecycle manager.
//!
//! Responsibilities:
//! - run a pipeline through the stage state machine (result cache → policy
//!   → approval → cache restore → steps → cache save → result store)
//! - schedule stages sequentially or as a bounded-parallel DAG
//! - manage the build lifecycle: creation, the active-builds registry,
//!   cooperative cancellation, persistence, metrics
//! - poll cron schedules and emit triggers into the lifecycle manager
//!
//! Everything process-wide lives in an explicitly constructed
//! [`CoreRuntime`]; there are no global singletons.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Collaborator contracts consumed by the engine.
pub mod collab;
/// Container invocation construction for container steps.
pub mod container;
/// DAG-mode stage scheduling.
pub mod dag;
/// Environment overlay computation.
pub mod env;
/// The top-level pipeline executor.
pub mod executor;
/// Build lifecycle entry points.
pub mod lifecycle;
/// Matrix expansion.
pub mod matrix;
/// Plug-in registry: step executors, notifiers, reporters, formats, hooks.
pub mod plugins;
/// Post-action groups.
pub mod post;
/// The active-builds registry.
pub mod registry;
/// The explicitly constructed process-wide runtime.
pub mod runtime;
/// The cron scheduler poll loop.
pub mod scheduler;
/// Stage execution with the check pipeline.
pub mod stage;
/// Step execution and fan-out.
pub mod steps;
/// Process-local metrics collection.
pub mod telemetry;

pub use collab::{
    FeatureFlag, FeatureFlags, MetricsSink, NoopMetrics, NoopSecrets, NoopStatusReporter,
    NoopVcs, SecretStore, StatusReporter, StaticFlags, VcsCheckout,
};
pub use plugins::{Notifier, PipelineFormat, PluginRegistry, StepExecutor, SupplyChainHook};
pub use registry::{ActiveBuilds, ActiveGuard};
pub use runtime::{CoreRuntime, CoreRuntimeBuilder, EngineError};
pub use scheduler::{poll_once, spawn_cache_retention, spawn_scheduler};
pub use telemetry::{EngineMetrics, MetricsSnapshot};
