// SPDX-License-Identifier: MIT OR Apache-2.0
//! The cron scheduler: a single poll loop that walks persisted schedules,
//! fires due ones through the lifecycle manager, records every decision,
//! and recomputes `next_run_at`.

use crate::runtime::CoreRuntime;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use conveyor_cancel::CancelToken;
use conveyor_core::{BuildEvent, BuildRequest, EventKind, TriggerKind};
use conveyor_cron::{CronExpr, CronRun, CronRunOutcome, CronSchedule, ScheduleStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Spawn the scheduler loop. One per process; stop it via `shutdown`.
pub fn spawn_scheduler(runtime: Arc<CoreRuntime>, shutdown: CancelToken) -> JoinHandle<()> {
    let interval = Duration::from_secs(runtime.config.cron.poll_interval_seconds);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(target: "conveyor.cron", interval_secs = interval.as_secs(), "scheduler started");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!(target: "conveyor.cron", "scheduler stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = poll_once(&runtime, Utc::now()).await {
                        warn!(target: "conveyor.cron", error = %e, "poll cycle failed");
                    }
                }
            }
        }
    })
}

/// One poll cycle over every persisted schedule. Returns how many builds
/// were triggered.
///
/// # Errors
///
/// Propagates a schedule-store listing failure; per-schedule problems are
/// recorded as cron runs and do not stop the cycle.
pub async fn poll_once(runtime: &Arc<CoreRuntime>, now: DateTime<Utc>) -> anyhow::Result<usize> {
    let missed_threshold =
        ChronoDuration::minutes(runtime.config.cron.missed_run_threshold_minutes as i64);
    let mut triggered = 0usize;

    for mut schedule in runtime.schedules.list_schedules().await? {
        if schedule.status == ScheduleStatus::Paused {
            continue;
        }

        let expr = match CronExpr::parse(&schedule.expression) {
            Ok(expr) => expr,
            Err(e) => {
                record(
                    runtime,
                    &schedule,
                    CronRunOutcome::Error {
                        message: format!("invalid cron expression: {e}"),
                    },
                )
                .await;
                continue;
            }
        };
        let tz: Tz = schedule.timezone.parse().unwrap_or_else(|_| {
            warn!(
                target: "conveyor.cron",
                schedule_id = %schedule.id,
                timezone = %schedule.timezone,
                "unknown timezone, falling back to UTC"
            );
            Tz::UTC
        });

        // First sighting: seed next_run_at without firing.
        let Some(next_run_at) = schedule.next_run_at else {
            schedule.next_run_at = expr.next_after(now, tz);
            runtime.schedules.put_schedule(&schedule).await?;
            continue;
        };

        if next_run_at > now {
            continue;
        }

        if now - next_run_at > missed_threshold {
            debug!(
                target: "conveyor.cron",
                schedule_id = %schedule.id,
                overdue_mins = (now - next_run_at).num_minutes(),
                "run overdue past threshold, marking missed"
            );
            record(runtime, &schedule, CronRunOutcome::Missed).await;
        } else {
            match trigger(runtime, &schedule).await {
                Ok(build_id) => {
                    triggered += 1;
                    schedule.last_run_at = Some(now);
                    record(runtime, &schedule, CronRunOutcome::Triggered { build_id }).await;
                }
                Err(message) => {
                    record(runtime, &schedule, CronRunOutcome::Error { message }).await;
                }
            }
        }

        // Always recompute after a fire or a miss.
        schedule.next_run_at = expr.next_after(now, tz);
        runtime.schedules.put_schedule(&schedule).await?;
    }

    Ok(triggered)
}

/// Create the build, publish `build-queued`, and hand execution to a
/// worker task. Returns the build id or a recordable error message.
async fn trigger(runtime: &Arc<CoreRuntime>, schedule: &CronSchedule) -> Result<uuid::Uuid, String> {
    let job = match runtime.jobs.get_job(&schedule.org, &schedule.job).await {
        Ok(Some(job)) => job,
        Ok(None) => return Err(format!("job '{}/{}' does not exist", schedule.org, schedule.job)),
        Err(e) => return Err(format!("job lookup failed: {e}")),
    };
    if job.paused {
        return Err(format!("job '{}/{}' is paused", schedule.org, schedule.job));
    }

    let build = runtime
        .builds
        .create_build(&job.name, &job.org, TriggerKind::Cron)
        .await
        .map_err(|e| format!("build creation failed: {e}"))?;

    runtime
        .bus
        .publish(
            BuildEvent::new(build.id, EventKind::BuildQueued)
                .with("number", build.number)
                .with("cron_schedule_id", schedule.id),
        )
        .await;

    let mut request = BuildRequest {
        parameters: schedule.parameters.clone(),
        ..BuildRequest::default()
    };
    request
        .metadata
        .insert("cron-schedule-id".to_string(), schedule.id.to_string());
    request
        .metadata
        .insert("cron-expression".to_string(), schedule.expression.clone());

    let build_id = build.id;
    info!(
        target: "conveyor.cron",
        schedule_id = %schedule.id,
        build_id = %build_id,
        job = %job.name,
        "cron trigger fired"
    );

    // Execution queues on the build pool; the poll loop moves on.
    let runtime = Arc::clone(runtime);
    tokio::spawn(async move {
        if let Err(e) = runtime.execute_for_record(&job, build, request).await {
            warn!(target: "conveyor.cron", build_id = %build_id, error = %e, "cron build failed to finalize");
        }
    });

    Ok(build_id)
}

async fn record(runtime: &CoreRuntime, schedule: &CronSchedule, outcome: CronRunOutcome) {
    let run = CronRun::record(schedule.id, outcome);
    if let Err(e) = runtime.schedules.record_cron_run(&run).await {
        warn!(target: "conveyor.cron", error = %e, "failed to record cron run");
    }
}

/// How often the retention task sweeps the cache.
const RETENTION_SWEEP: Duration = Duration::from_secs(3_600);

/// Spawn the cache retention task: every hour, evict entries past the
/// configured retention for every job in the given organizations.
pub fn spawn_cache_retention(
    runtime: Arc<CoreRuntime>,
    orgs: Vec<String>,
    shutdown: CancelToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RETENTION_SWEEP);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    for org in &orgs {
                        let jobs = match runtime.jobs.list_jobs(org).await {
                            Ok(jobs) => jobs,
                            Err(e) => {
                                warn!(target: "conveyor.cron", org = %org, error = %e, "job listing failed during retention sweep");
                                continue;
                            }
                        };
                        for job in jobs {
                            match runtime.evict_job_caches(&job.name).await {
                                Ok(evicted) if evicted > 0 => {
                                    info!(target: "conveyor.cron", job = %job.name, evicted, "retention sweep evicted cache entries");
                                }
                                Ok(_) => {}
                                Err(e) => warn!(target: "conveyor.cron", job = %job.name, error = %e, "cache eviction failed"),
                            }
                        }
                    }
                }
            }
        }
    })
}
