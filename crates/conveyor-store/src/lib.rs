// SPDX-License-Identifier: MIT OR Apache-2.0
//! Persistence collaborator traits and the in-memory reference store.
//!
//! Real deployments implement these traits against a database; the core
//! only ever talks to the traits. [`MemoryStore`] is a complete, threadsafe
//! implementation used by tests and by embedders that do not need
//! durability. Build numbering is serialized per (job, org) under one lock,
//! which is what makes concurrent creations strictly monotonic.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// The in-memory reference implementation.
pub mod memory;

pub use memory::MemoryStore;

use conveyor_core::{ArtifactRecord, Build, Job, TriggerKind};
use conveyor_cron::{CronRun, CronSchedule};
use conveyor_policy::Policy;
use uuid::Uuid;

/// CRUD for registered jobs.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Look up a job by organization and name.
    async fn get_job(&self, org: &str, name: &str) -> anyhow::Result<Option<Job>>;
    /// Insert or replace a job.
    async fn put_job(&self, job: &Job) -> anyhow::Result<()>;
    /// All jobs in an organization, sorted by name.
    async fn list_jobs(&self, org: &str) -> anyhow::Result<Vec<Job>>;
}

/// CRUD for builds, including the atomic numbered creation.
#[async_trait::async_trait]
pub trait BuildStore: Send + Sync {
    /// Atomically create a build with the next per-(job, org) number.
    async fn create_build(
        &self,
        job: &str,
        org: &str,
        trigger: TriggerKind,
    ) -> anyhow::Result<Build>;
    /// Replace a build's persisted state.
    async fn update_build(&self, build: &Build) -> anyhow::Result<()>;
    /// Load a build by id.
    async fn get_build(&self, id: Uuid) -> anyhow::Result<Option<Build>>;
    /// Builds for a job, newest first.
    async fn list_builds(&self, org: &str, job: &str) -> anyhow::Result<Vec<Build>>;
    /// Record collected artifact metadata for a build.
    async fn record_artifacts(
        &self,
        build_id: Uuid,
        artifacts: &[ArtifactRecord],
    ) -> anyhow::Result<()>;
}

/// CRUD for policies.
#[async_trait::async_trait]
pub trait PolicyStore: Send + Sync {
    /// Enabled policies for an organization, ordered by priority.
    async fn policies_for_org(&self, org: &str) -> anyhow::Result<Vec<Policy>>;
    /// Insert or replace a policy.
    async fn put_policy(&self, policy: &Policy) -> anyhow::Result<()>;
}

/// CRUD for cron schedules and their run records.
#[async_trait::async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Every persisted schedule.
    async fn list_schedules(&self) -> anyhow::Result<Vec<CronSchedule>>;
    /// Insert or replace a schedule.
    async fn put_schedule(&self, schedule: &CronSchedule) -> anyhow::Result<()>;
    /// Record a poll-cycle decision.
    async fn record_cron_run(&self, run: &CronRun) -> anyhow::Result<()>;
    /// Run records for a schedule, newest first.
    async fn cron_runs(&self, schedule_id: Uuid) -> anyhow::Result<Vec<CronRun>>;
}

/// Sink for notification dispatch records.
#[async_trait::async_trait]
pub trait NotificationLog: Send + Sync {
    /// Record one dispatched (or failed) notification.
    async fn record_notification(
        &self,
        build_id: Uuid,
        target: &str,
        detail: &str,
    ) -> anyhow::Result<()>;
}
