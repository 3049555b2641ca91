// SPDX-License-Identifier: MIT OR Apache-2.0
//! Step execution: cancel check, condition evaluation, executor dispatch,
//! and the sequential / bounded-fan-out loops.

use crate::container;
use crate::executor::ExecCtx;
use conveyor_core::{BuildEvent, EventKind, Step, StepKind, StepResult, StepStatus};
use conveyor_process::{ProcessOutput, ProcessRequest};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Run one step through cancel check → condition → executor dispatch.
pub async fn run_step(
    ctx: &Arc<ExecCtx>,
    stage_env: &BTreeMap<String, String>,
    step: &Step,
) -> StepResult {
    if ctx.cancel.is_cancelled() {
        let result = StepResult::unstarted(
            step.name.clone(),
            StepStatus::Aborted,
            Some("build cancelled".to_string()),
        );
        publish_completed(ctx, &result).await;
        return result;
    }

    if let Some(condition) = &step.condition {
        if !condition.evaluate(ctx.branch.as_deref(), &ctx.parameters) {
            debug!(
                target: "conveyor.engine",
                build_id = %ctx.build_id,
                step = %step.name,
                "step condition false, skipping"
            );
            let result = StepResult::unstarted(step.name.clone(), StepStatus::Skipped, None);
            publish_completed(ctx, &result).await;
            return result;
        }
    }

    ctx.bus
        .publish(
            BuildEvent::new(ctx.build_id, EventKind::StepStarted).with("step", &step.name),
        )
        .await;

    let started_at = chrono::Utc::now();
    let outcome = dispatch(ctx, stage_env, step).await;
    let completed_at = chrono::Utc::now();

    let result = match outcome {
        Ok(output) => {
            let status = if output.cancelled {
                StepStatus::Aborted
            } else if output.timed_out {
                StepStatus::Failure
            } else if output.exit_code == Some(0) {
                StepStatus::Success
            } else {
                StepStatus::Failure
            };
            let reason = if output.cancelled {
                Some("build cancelled".to_string())
            } else if output.timed_out {
                Some(format!("timed out after {} ms", output.duration_ms))
            } else if status == StepStatus::Failure {
                Some(format!("exit code {:?}", output.exit_code))
            } else {
                None
            };
            StepResult {
                name: step.name.clone(),
                status,
                exit_code: output.exit_code,
                output: combine_output(&output),
                duration_ms: output.duration_ms,
                started_at,
                completed_at,
                reason,
            }
        }
        Err(e) => StepResult {
            name: step.name.clone(),
            status: StepStatus::Failure,
            exit_code: None,
            output: String::new(),
            duration_ms: (completed_at - started_at).num_milliseconds().max(0) as u64,
            started_at,
            completed_at,
            reason: Some(e.to_string()),
        },
    };

    publish_completed(ctx, &result).await;
    result
}

async fn publish_completed(ctx: &Arc<ExecCtx>, result: &StepResult) {
    ctx.bus
        .publish(
            BuildEvent::new(ctx.build_id, EventKind::StepCompleted)
                .with("step", &result.name)
                .with("status", result.status)
                .with("exit_code", result.exit_code),
        )
        .await;
}

fn combine_output(output: &ProcessOutput) -> String {
    if output.stderr.is_empty() {
        output.stdout.clone()
    } else if output.stdout.is_empty() {
        output.stderr.clone()
    } else {
        format!("{}\n{}", output.stdout, output.stderr)
    }
}

/// Select an executor by step kind and run it.
async fn dispatch(
    ctx: &Arc<ExecCtx>,
    stage_env: &BTreeMap<String, String>,
    step: &Step,
) -> anyhow::Result<ProcessOutput> {
    match &step.kind {
        StepKind::Shell {
            command,
            timeout,
            env,
            working_dir,
        } => {
            // A registered executor for `shell` takes precedence; otherwise
            // fall back to the process collaborator directly.
            if let Some(executor) = ctx.plugins.step_executor("shell") {
                let merged = merge_env(&ctx.base_env, stage_env, env);
                return executor
                    .execute_step(crate::plugins::StepInvocation {
                        step,
                        env: &merged,
                        workspace: &ctx.workspace,
                        timeout: timeout.unwrap_or(ctx.default_step_timeout),
                        mask_values: &ctx.mask_values,
                        cancel: &ctx.cancel,
                    })
                    .await;
            }
            let dir = match working_dir {
                Some(wd) => ctx.workspace.join(wd),
                None => ctx.workspace.clone(),
            };
            ctx.process
                .execute(
                    ProcessRequest {
                        command: command.clone(),
                        dir,
                        env: merge_env(&ctx.base_env, stage_env, env),
                        timeout: timeout.unwrap_or(ctx.default_step_timeout),
                        mask_values: ctx.mask_values.clone(),
                    },
                    &ctx.cancel,
                )
                .await
        }
        StepKind::Container { spec, command } => {
            let merged = merge_env(&ctx.base_env, stage_env, &BTreeMap::new());
            let invocation =
                container::build_invocation(spec, command.as_deref(), &ctx.workspace, &merged)?;
            ctx.process
                .execute(
                    ProcessRequest {
                        command: invocation,
                        dir: ctx.workspace.clone(),
                        env: merged,
                        timeout: ctx.default_step_timeout,
                        mask_values: ctx.mask_values.clone(),
                    },
                    &ctx.cancel,
                )
                .await
        }
        StepKind::Plugin { executor, .. } => {
            let Some(plugin) = ctx.plugins.step_executor(executor) else {
                anyhow::bail!("no step executor registered for kind '{executor}'");
            };
            let merged = merge_env(&ctx.base_env, stage_env, &BTreeMap::new());
            plugin
                .execute_step(crate::plugins::StepInvocation {
                    step,
                    env: &merged,
                    workspace: &ctx.workspace,
                    timeout: ctx.default_step_timeout,
                    mask_values: &ctx.mask_values,
                    cancel: &ctx.cancel,
                })
                .await
        }
    }
}

fn merge_env(
    base: &BTreeMap<String, String>,
    stage: &BTreeMap<String, String>,
    step: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = base.clone();
    merged.extend(stage.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged.extend(step.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Run a stage's steps sequentially or as a bounded fan-out.
///
/// Sequential mode stops on the first `failure` or `aborted` step; later
/// steps do not appear in the results. Parallel mode launches every step,
/// bounded by the step semaphore, and waits for all of them.
pub async fn run_steps(
    ctx: &Arc<ExecCtx>,
    stage_env: &BTreeMap<String, String>,
    steps: &[Step],
    parallel: bool,
) -> Vec<StepResult> {
    if parallel {
        run_steps_parallel(ctx, stage_env, steps).await
    } else {
        let mut results = Vec::with_capacity(steps.len());
        for step in steps {
            let result = run_step(ctx, stage_env, step).await;
            let stop = matches!(result.status, StepStatus::Failure | StepStatus::Aborted);
            results.push(result);
            if stop {
                break;
            }
        }
        results
    }
}

async fn run_steps_parallel(
    ctx: &Arc<ExecCtx>,
    stage_env: &BTreeMap<String, String>,
    steps: &[Step],
) -> Vec<StepResult> {
    let semaphore = Arc::clone(&ctx.step_slots);
    let mut set: JoinSet<(usize, StepResult)> = JoinSet::new();

    for (index, step) in steps.iter().enumerate() {
        // Acquire before spawning so a full pool delays the launch, not a
        // spawned-but-starved task.
        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let ctx = Arc::clone(ctx);
        let stage_env = stage_env.clone();
        let step = step.clone();
        set.spawn(async move {
            let result = run_step(&ctx, &stage_env, &step).await;
            drop(permit);
            (index, result)
        });
    }

    let mut indexed: Vec<(usize, StepResult)> = Vec::with_capacity(steps.len());
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(pair) => indexed.push(pair),
            Err(e) => warn!(target: "conveyor.engine", error = %e, "step task panicked"),
        }
    }
    indexed.sort_by_key(|(index, _)| *index);
    indexed.into_iter().map(|(_, result)| result).collect()
}
