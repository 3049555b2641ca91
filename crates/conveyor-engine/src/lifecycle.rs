// SPDX-License-Identifier: MIT OR Apache-2.0
//! Build lifecycle entry points: creation, registration, execution,
//! terminal persistence, metrics, SCM status.
//!
//! Invariants: exactly one terminal persistence per build; the
//! active-builds entry is removed on every exit path; metrics and status
//! reporting failures never affect the build status.

use crate::collab::guard_metrics;
use crate::executor::run_build;
use crate::runtime::{CoreRuntime, EngineError};
use chrono::Utc;
use conveyor_core::{
    Build, BuildEvent, BuildRequest, BuildStatus, EventKind, Job, TriggerKind, validate_pipeline,
};
use conveyor_error::{CoreError, ErrorCode};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::time::Instant;
use tracing::{error, info};

impl CoreRuntime {
    /// Create and execute a build for a registered job.
    ///
    /// Blocks until the build finishes; the worker pool bound limits how
    /// many callers execute concurrently. Spawn this future to queue work
    /// without waiting.
    ///
    /// # Errors
    ///
    /// [`EngineError::UnknownJob`] when the job does not exist, or a store
    /// failure from build creation. Execution problems are recorded on the
    /// returned build, not surfaced as errors.
    pub async fn execute(
        &self,
        org: &str,
        job_name: &str,
        trigger: TriggerKind,
        request: BuildRequest,
    ) -> Result<Build, EngineError> {
        let job = self
            .jobs
            .get_job(org, job_name)
            .await?
            .ok_or_else(|| EngineError::UnknownJob {
                org: org.to_string(),
                name: job_name.to_string(),
            })?;
        let build = self.builds.create_build(&job.name, &job.org, trigger).await?;
        self.bus
            .publish(
                BuildEvent::new(build.id, EventKind::BuildQueued).with("number", build.number),
            )
            .await;
        self.execute_for_record(&job, build, request).await
    }

    /// Execute a build whose record already exists.
    ///
    /// Variant for callers (web, webhook) that need the build id before
    /// execution starts, e.g. to return a redirect. Same post-execution
    /// flow as [`execute`](Self::execute).
    ///
    /// # Errors
    ///
    /// Store failures from the terminal persistence.
    pub async fn execute_for_record(
        &self,
        job: &Job,
        mut build: Build,
        request: BuildRequest,
    ) -> Result<Build, EngineError> {
        // Effective parameters: declared defaults under caller overrides.
        let mut parameters = job.pipeline.parameters.clone();
        parameters.extend(request.parameters.clone());
        build.parameters = parameters;
        build.metadata.extend(request.metadata.clone());

        // One worker per in-flight build, process-wide.
        let _permit = self
            .build_slots
            .acquire()
            .await
            .expect("build pool semaphore closed");

        let guard = self.active.register(build.id);
        let job_label = [("job", job.name.as_str()), ("org", job.org.as_str())];
        guard_metrics(
            self.metrics.incr_counter("builds_started", &job_label),
            "build start counter",
        );
        let started = Instant::now();

        // Configuration errors fail fast: the build exists but never runs.
        if let Err(e) = validate_pipeline(&job.pipeline, self.config.matrix.max_combinations) {
            build.status = BuildStatus::Failure;
            build.error = Some(
                CoreError::new(ErrorCode::ConfigInvalidPipeline, format!("invalid pipeline: {e}"))
                    .to_string(),
            );
            self.bus
                .publish(
                    BuildEvent::new(build.id, EventKind::BuildCompleted)
                        .with("status", build.status),
                )
                .await;
        } else {
            build.status = BuildStatus::Running;
            build.started_at = Some(Utc::now());
            if let Err(e) = self.builds.update_build(&build).await {
                error!(target: "conveyor.engine", error = %e, "failed to persist running build");
            }
            self.bus
                .publish(
                    BuildEvent::new(build.id, EventKind::BuildStarted)
                        .with("number", build.number)
                        .with("trigger", build.trigger),
                )
                .await;
            info!(
                target: "conveyor.engine",
                build_id = %build.id,
                job = %job.name,
                number = build.number,
                trigger = %build.trigger,
                "build started"
            );

            // Fatal internal errors finalize the build as failure instead
            // of killing the worker.
            let outcome = AssertUnwindSafe(run_build(
                self,
                job,
                &mut build,
                &request,
                guard.token(),
            ))
            .catch_unwind()
            .await;
            if let Err(panic) = outcome {
                let message = panic_message(&panic);
                error!(
                    target: "conveyor.engine",
                    build_id = %build.id,
                    panic = %message,
                    "build execution panicked"
                );
                build.status = BuildStatus::Failure;
                build.error = Some(
                    CoreError::new(ErrorCode::Internal, format!("internal error: {message}"))
                        .to_string(),
                );
            }
        }

        // Exactly one terminal persistence.
        build.completed_at = Some(Utc::now());
        self.builds.update_build(&build).await?;

        let status_label = [
            ("job", job.name.as_str()),
            ("org", job.org.as_str()),
            ("status", build.status.as_str()),
        ];
        guard_metrics(
            self.metrics.observe_histogram(
                "build_duration_ms",
                started.elapsed().as_millis() as f64,
                &status_label,
            ),
            "build end histogram",
        );

        if let Err(e) = self.status_reporter.report_status(&build).await {
            tracing::warn!(
                target: "conveyor.engine",
                build_id = %build.id,
                error = %e,
                "SCM status report failed (build status unchanged)"
            );
        }

        info!(
            target: "conveyor.engine",
            build_id = %build.id,
            status = %build.status,
            "build finalized"
        );
        drop(guard);
        Ok(build)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
