// SPDX-License-Identifier: MIT OR Apache-2.0
//! conveyor-core
//!
//! Shared data model for the Conveyor CI server core.
//!
//! This crate defines the declarative plan (pipeline → stages → steps), the
//! runtime record of one execution (build → stage results → step results),
//! the typed event vocabulary that flows over the event bus, and the
//! validation that rejects malformed plans before anything runs.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Build records, per-stage/per-step results, and status derivation.
pub mod build;
/// Execution context threaded through components for scoped logging.
pub mod context;
/// Dependency-graph helpers: adjacency maps, cycle detection, ready sets.
pub mod dag;
/// Typed build events published on the event bus.
pub mod event;
/// Jobs: named bindings of a pipeline to an organization.
pub mod job;
/// The declarative plan: pipelines, stages, steps, conditions, matrices.
pub mod pipeline;
/// Closed status enums and trigger kinds.
pub mod status;
/// Pre-execution validation of pipeline definitions.
pub mod validate;

pub use build::{
    ArtifactRecord, Build, BuildRequest, GitInfo, StageResult, StepResult, derive_build_status,
    derive_stage_status,
};
pub use context::RunContext;
pub use dag::DepGraph;
pub use event::{BuildEvent, EventKind};
pub use job::Job;
pub use pipeline::{
    ApprovalSpec, CacheDecl, Condition, ContainerSpec, MatrixConfig, Pipeline, PostActions,
    PullPolicy, SourceSpec, Stage, Step, StepKind,
};
pub use status::{BuildStatus, PipelineSource, StepStatus, TriggerKind, UnknownStatus};
pub use validate::{ValidationError, is_valid_image_ref, validate_pipeline};
