// SPDX-License-Identifier: MIT OR Apache-2.0
//! Stage execution: every stage passes through a fixed pipeline of checks
//! before and after its steps.
//!
//! Order: result cache → policy → approval-override folding → approval
//! gate → cache restore → step execution → cache save → result store.
//! A denial at any check aborts the stage without running its steps.

use crate::executor::ExecCtx;
use crate::matrix::StageUnit;
use crate::steps::run_steps;
use conveyor_approvals::{GateOutcome, GateRequest};
use conveyor_cache::{CachedStageResult, StageFingerprint};
use conveyor_core::{
    ApprovalSpec, BuildEvent, BuildStatus, EventKind, Stage, StageResult, StepStatus,
    derive_stage_status,
};
use conveyor_policy::{ApprovalOverride, Decision, PolicyContext};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Gate timeout applied when a policy override imposes approval on a stage
/// that declared none.
const OVERRIDE_GATE_TIMEOUT_MINUTES: u64 = 60;

/// Execute one stage through the full check pipeline.
pub async fn run_stage(ctx: Arc<ExecCtx>, unit: StageUnit) -> StageResult {
    let stage = &unit.stage;
    let started_at = Utc::now();

    ctx.bus
        .publish(BuildEvent::new(ctx.build_id, EventKind::StageStarted).with("stage", &stage.name))
        .await;

    let result = run_checks(&ctx, &unit, started_at).await;

    ctx.bus
        .publish(
            BuildEvent::new(ctx.build_id, EventKind::StageCompleted)
                .with("stage", &stage.name)
                .with("status", result.status),
        )
        .await;
    result
}

async fn run_checks(
    ctx: &Arc<ExecCtx>,
    unit: &StageUnit,
    started_at: chrono::DateTime<Utc>,
) -> StageResult {
    let stage = &unit.stage;

    // Stage condition gates everything else.
    if let Some(condition) = &stage.condition {
        if !condition.evaluate(ctx.branch.as_deref(), &ctx.parameters) {
            ctx.bus
                .publish(
                    BuildEvent::new(ctx.build_id, EventKind::StageSkipped)
                        .with("stage", &stage.name),
                )
                .await;
            return finished(stage, StepStatus::Skipped, Vec::new(), started_at, None, false);
        }
    }

    // 1. Result cache.
    let fingerprint = StageFingerprint::compute(
        stage,
        &ctx.parameters,
        ctx.branch.as_deref(),
        ctx.commit.as_deref(),
    );
    if let Some(fp) = &fingerprint {
        match ctx.result_cache.get_result(&ctx.job, &fp.value).await {
            Ok(Some(cached)) => {
                info!(
                    target: "conveyor.engine",
                    build_id = %ctx.build_id,
                    stage = %stage.name,
                    fingerprint = %fp.value,
                    "stage result replayed from cache"
                );
                ctx.bus
                    .publish(
                        BuildEvent::new(ctx.build_id, EventKind::StageCached)
                            .with("stage", &stage.name)
                            .with("fingerprint", &fp.value),
                    )
                    .await;
                let mut replayed = cached.result;
                replayed.name = stage.name.clone();
                replayed.cached = true;
                return replayed;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(target: "conveyor.engine", error = %e, "result cache lookup failed");
            }
        }
    }

    // 2. Policy.
    let overrides = match evaluate_policies(ctx, stage).await {
        Ok(overrides) => overrides,
        Err(reason) => {
            ctx.bus
                .publish(
                    BuildEvent::new(ctx.build_id, EventKind::StagePolicyDenied)
                        .with("stage", &stage.name)
                        .with("reason", &reason),
                )
                .await;
            return finished(stage, StepStatus::Aborted, Vec::new(), started_at, Some(reason), false);
        }
    };

    // 3 + 4. Approval-override folding, then the gate itself.
    if let Some(request) = effective_approval(ctx, stage, &overrides) {
        if let Some(reason) = pass_gate(ctx, stage, request).await {
            return finished(stage, StepStatus::Aborted, Vec::new(), started_at, Some(reason), false);
        }
    }

    // 5. Cache restore.
    if !stage.caches.is_empty() {
        match ctx
            .cache
            .restore(&ctx.workspace, &ctx.job, &stage.caches, ctx.cache_index.as_ref())
            .await
        {
            Ok(outcomes) => {
                for outcome in outcomes {
                    if let Some(key) = &outcome.effective_key {
                        info!(
                            target: "conveyor.engine",
                            stage = %stage.name,
                            key = %key,
                            "cache hit"
                        );
                    }
                }
            }
            Err(e) => warn!(target: "conveyor.engine", error = %e, "cache restore failed"),
        }
    }

    // 6. Steps.
    let steps = run_steps(ctx, &unit.extra_env, &stage.steps, stage.parallel).await;
    let status = derive_stage_status(&steps);

    // 7 + 8. Cache save and result store, on success only.
    if status == StepStatus::Success {
        if !stage.caches.is_empty() {
            if let Err(e) = ctx
                .cache
                .save(&ctx.workspace, &ctx.job, &stage.caches, ctx.cache_index.as_ref())
                .await
            {
                warn!(target: "conveyor.engine", error = %e, "cache save failed");
            }
        }
        if let Some(fp) = fingerprint {
            let record = CachedStageResult {
                job: ctx.job.clone(),
                fingerprint: fp.value,
                result: finished(stage, status, steps.clone(), started_at, None, false),
                fingerprint_inputs: fp.inputs,
                stored_at: Utc::now(),
            };
            if let Err(e) = ctx.result_cache.put_result(&record).await {
                warn!(target: "conveyor.engine", error = %e, "result cache store failed");
            }
        }
    }

    finished(stage, status, steps, started_at, None, false)
}

fn finished(
    stage: &Stage,
    status: StepStatus,
    steps: Vec<conveyor_core::StepResult>,
    started_at: chrono::DateTime<Utc>,
    reason: Option<String>,
    cached: bool,
) -> StageResult {
    StageResult {
        name: stage.name.clone(),
        status,
        steps,
        started_at,
        completed_at: Utc::now(),
        reason,
        cached,
    }
}

/// Evaluate the organization's policies; `Err` carries the denial reason.
async fn evaluate_policies(
    ctx: &Arc<ExecCtx>,
    stage: &Stage,
) -> Result<Vec<ApprovalOverride>, String> {
    let policies = match ctx.policies.policies_for_org(&ctx.org).await {
        Ok(policies) => policies,
        Err(e) => {
            // Fail closed: unknown policy state must not run guarded work.
            return Err(format!("policy state unavailable: {e}"));
        }
    };
    if policies.is_empty() {
        return Ok(Vec::new());
    }
    let outcome = ctx
        .policy_engine
        .evaluate(
            &policies,
            &PolicyContext {
                build_id: ctx.build_id,
                job: ctx.job.clone(),
                stage: stage.name.clone(),
                branch: ctx.branch.clone(),
                author: ctx.author.clone(),
                parameters: ctx.parameters.clone(),
                now: Utc::now(),
            },
        )
        .map_err(|e| format!("policy evaluation failed: {e}"))?;
    match outcome.decision {
        Decision::Allow => Ok(outcome.overrides),
        Decision::Deny { policy, reason } => Err(format!("denied by policy '{policy}': {reason}")),
    }
}

/// Fold policy overrides into the stage's approval declaration.
///
/// Overrides only ever raise `min_approvals` and widen the approver group
/// set. An override against a stage with no declared approval imposes one.
fn effective_approval(
    ctx: &Arc<ExecCtx>,
    stage: &Stage,
    overrides: &[ApprovalOverride],
) -> Option<GateRequest> {
    if stage.approval.is_none() && overrides.is_empty() {
        return None;
    }

    let declared = stage.approval.clone().unwrap_or(ApprovalSpec {
        message: None,
        required_role: "any".to_string(),
        timeout_minutes: OVERRIDE_GATE_TIMEOUT_MINUTES,
        approver_group: None,
        min_approvals: 1,
    });

    let mut min_approvals = declared.min_approvals.max(1);
    let mut groups: Vec<String> = declared.approver_group.clone().into_iter().collect();
    for o in overrides {
        min_approvals = min_approvals.max(o.min_approvals);
        if let Some(group) = &o.approver_group {
            groups.push(group.clone());
        }
    }
    groups.sort();
    groups.dedup();

    Some(GateRequest {
        build_id: ctx.build_id,
        stage: stage.name.clone(),
        required_role: declared.required_role,
        approver_groups: groups,
        min_approvals,
        message: declared.message,
        timeout: Duration::from_secs(declared.timeout_minutes * 60),
    })
}

/// Open the gate and park on it. Returns the denial reason, or `None` when
/// the stage may proceed.
async fn pass_gate(ctx: &Arc<ExecCtx>, stage: &Stage, request: GateRequest) -> Option<String> {
    let gate = match ctx.approvals.open_gate(request).await {
        Ok(gate) => gate,
        Err(e) => {
            warn!(
                target: "conveyor.engine",
                build_id = %ctx.build_id,
                stage = %stage.name,
                error = %e,
                "approval gate creation failed, failing closed"
            );
            return Some("approval gate could not be created".to_string());
        }
    };

    ctx.bus
        .publish(
            BuildEvent::new(ctx.build_id, EventKind::ApprovalRequested)
                .with("stage", &stage.name)
                .with("gate_id", gate.id)
                .with("min_approvals", gate.min_approvals)
                .with("message", gate.message.clone()),
        )
        .await;

    set_build_status(ctx, BuildStatus::AwaitingApproval).await;
    let outcome = ctx.approvals.wait(gate.id, &ctx.cancel).await;
    set_build_status(ctx, BuildStatus::Running).await;

    match outcome {
        GateOutcome::Proceed { approved_by } => {
            info!(
                target: "conveyor.engine",
                build_id = %ctx.build_id,
                stage = %stage.name,
                approved_by = ?approved_by,
                "approval gate passed"
            );
            None
        }
        GateOutcome::Denied { reason } => Some(reason),
    }
}

/// Best-effort persisted status flip around the approval park.
async fn set_build_status(ctx: &Arc<ExecCtx>, status: BuildStatus) {
    match ctx.builds.get_build(ctx.build_id).await {
        Ok(Some(mut build)) => {
            build.status = status;
            if let Err(e) = ctx.builds.update_build(&build).await {
                warn!(target: "conveyor.engine", error = %e, "failed to persist build status");
            }
        }
        Ok(None) => {}
        Err(e) => warn!(target: "conveyor.engine", error = %e, "failed to load build for status flip"),
    }
}
