// SPDX-License-Identifier: MIT OR Apache-2.0
//! Post-action groups: `always` runs unconditionally after the main stages
//! finalize the status, then the conditional group matching it. Failures
//! here are logged and never change the build status.

use crate::executor::ExecCtx;
use crate::steps::run_step;
use conveyor_cancel::CancelToken;
use conveyor_core::{BuildStatus, PostActions, StepStatus};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Run the post-action groups for a finalized status.
///
/// The cancel path still runs post-actions, so the steps here execute
/// under a fresh token instead of the build's (possibly tripped) one.
pub async fn run_post_actions(ctx: &Arc<ExecCtx>, post: &PostActions, status: BuildStatus) {
    if post.is_empty() {
        return;
    }

    let ctx = Arc::new(ExecCtx {
        cancel: CancelToken::new(),
        ..(**ctx).clone()
    });

    run_group(&ctx, "always", &post.always).await;
    match status {
        BuildStatus::Success => run_group(&ctx, "on-success", &post.on_success).await,
        BuildStatus::Failure | BuildStatus::Aborted => {
            run_group(&ctx, "on-failure", &post.on_failure).await;
        }
        // Post-actions only run against terminal statuses.
        BuildStatus::Queued | BuildStatus::Running | BuildStatus::AwaitingApproval => {}
    }
}

async fn run_group(ctx: &Arc<ExecCtx>, group: &str, steps: &[conveyor_core::Step]) {
    if steps.is_empty() {
        return;
    }
    info!(
        target: "conveyor.engine",
        build_id = %ctx.build_id,
        group,
        steps = steps.len(),
        "running post-action group"
    );
    let env = BTreeMap::new();
    for step in steps {
        let result = run_step(ctx, &env, step).await;
        if matches!(result.status, StepStatus::Failure | StepStatus::Aborted) {
            warn!(
                target: "conveyor.engine",
                build_id = %ctx.build_id,
                group,
                step = %step.name,
                status = %result.status,
                reason = result.reason.as_deref().unwrap_or(""),
                "post-action step failed (build status unchanged)"
            );
        }
    }
}
