// SPDX-License-Identifier: MIT OR Apache-2.0
//! The top-level pipeline executor: workspace, checkout, pipeline-as-code
//! resolution, environment overlay, matrix expansion, mode selection,
//! post-actions, artifacts, supply-chain hooks, notifications.

use crate::collab::FeatureFlag;
use crate::dag::run_dag;
use crate::matrix::{StageUnit, expand};
use crate::plugins::PluginRegistry;
use crate::post::run_post_actions;
use crate::runtime::CoreRuntime;
use crate::stage::run_stage;
use crate::env;
use conveyor_approvals::ApprovalEngine;
use conveyor_cache::{CacheIndex, CacheStore, ResultCache};
use conveyor_cancel::CancelToken;
use conveyor_config::CoreConfig;
use conveyor_core::{
    Build, BuildEvent, BuildRequest, BuildStatus, EventKind, Job, Pipeline, PipelineSource,
    RunContext, StepStatus, derive_build_status, validate_pipeline,
};
use conveyor_error::{CoreError, ErrorCode};
use conveyor_events::EventBus;
use conveyor_policy::PolicyEngine;
use conveyor_process::ProcessExecutor;
use conveyor_store::{BuildStore, PolicyStore};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

/// Shared, immutable context for one build's stage and step execution.
#[derive(Clone)]
pub struct ExecCtx {
    /// Engine configuration snapshot.
    pub config: CoreConfig,
    /// The event bus.
    pub bus: Arc<EventBus>,
    /// Build persistence (status flips around approval parks).
    pub builds: Arc<dyn BuildStore>,
    /// Policy persistence.
    pub policies: Arc<dyn PolicyStore>,
    /// Stage result cache.
    pub result_cache: Arc<dyn ResultCache>,
    /// Cache entry metadata index.
    pub cache_index: Arc<dyn CacheIndex>,
    /// Directory-backed artifact cache.
    pub cache: Arc<CacheStore>,
    /// The approval engine.
    pub approvals: Arc<ApprovalEngine>,
    /// The process collaborator.
    pub process: Arc<dyn ProcessExecutor>,
    /// The plug-in registry.
    pub plugins: Arc<PluginRegistry>,
    /// The policy evaluator.
    pub policy_engine: PolicyEngine,
    /// Bounded launcher for DAG-mode stages.
    pub stage_slots: Arc<Semaphore>,
    /// Bounded launcher for within-stage step fan-out.
    pub step_slots: Arc<Semaphore>,
    /// The build under execution.
    pub build_id: Uuid,
    /// Owning job name.
    pub job: String,
    /// Organization scope.
    pub org: String,
    /// Resolved git branch.
    pub branch: Option<String>,
    /// Resolved git commit.
    pub commit: Option<String>,
    /// Resolved git author.
    pub author: Option<String>,
    /// Effective build parameters.
    pub parameters: BTreeMap<String, String>,
    /// Environment overlay injected into every step.
    pub base_env: BTreeMap<String, String>,
    /// Workspace directory.
    pub workspace: PathBuf,
    /// Secret values masked from captured output.
    pub mask_values: Vec<String>,
    /// Default per-step timeout.
    pub default_step_timeout: Duration,
    /// The build's cancel token.
    pub cancel: CancelToken,
    /// Logging context.
    pub run_context: RunContext,
}

/// Execute the pipeline for `build`, mutating it in place.
///
/// The build arrives with status `Running`; this function sets the
/// terminal status, stage results, git info, workspace, artifacts, and
/// pipeline-source tag. Persistence of the final record stays with the
/// lifecycle manager.
pub(crate) async fn run_build(
    rt: &CoreRuntime,
    job: &Job,
    build: &mut Build,
    request: &BuildRequest,
    cancel: &CancelToken,
) {
    let run_context = RunContext::for_build(build.id, job.name.clone());

    // 1. Workspace, with path safety.
    let workspace = match rt.workspaces.build_dir(&job.name, build.number) {
        Ok(dir) => dir,
        Err(e) => {
            let code = match e {
                conveyor_workspace::WorkspaceError::Traversal { .. } => ErrorCode::PathTraversal,
                conveyor_workspace::WorkspaceError::Io { .. } => ErrorCode::Internal,
            };
            build.status = BuildStatus::Failure;
            build.error = Some(CoreError::new(code, e.to_string()).to_string());
            publish_completed(rt, build).await;
            return;
        }
    };
    build.workspace = Some(workspace.display().to_string());

    let mut pipeline = job.pipeline.clone();

    // 2. Checkout.
    if let Some(source) = pipeline.source.clone() {
        rt.bus
            .publish(BuildEvent::new(build.id, EventKind::GitStarted).with("url", &source.url))
            .await;
        match rt.vcs.checkout(&source, &workspace, None).await {
            Ok(git) => {
                rt.bus
                    .publish(
                        BuildEvent::new(build.id, EventKind::GitCompleted)
                            .with("branch", &git.branch)
                            .with("commit", &git.commit_short),
                    )
                    .await;
                build.git = Some(git);
            }
            Err(e) => {
                warn!(
                    target: "conveyor.engine",
                    build_id = %build.id,
                    error = %e,
                    "checkout failed"
                );
                rt.bus
                    .publish(
                        BuildEvent::new(build.id, EventKind::GitFailed).with("error", e.to_string()),
                    )
                    .await;
                build.status = BuildStatus::Failure;
                build.error = Some(
                    CoreError::new(ErrorCode::CheckoutFailed, format!("checkout failed: {e}"))
                        .to_string(),
                );
                publish_completed(rt, build).await;
                return;
            }
        }
    }

    // 3. Pipeline-as-code resolution.
    if let Some((workspace_pipeline, source_tag)) =
        resolve_workspace_pipeline(&rt.plugins, &workspace)
    {
        info!(
            target: "conveyor.engine",
            build_id = %build.id,
            source = ?source_tag,
            "using workspace pipeline definition"
        );
        pipeline = overlay_workspace_pipeline(pipeline, workspace_pipeline);
        build.pipeline_source = source_tag;
    }

    // The effective pipeline (workspace definitions included) must be valid.
    if let Err(e) = validate_pipeline(&pipeline, rt.config.matrix.max_combinations) {
        build.status = BuildStatus::Failure;
        build.error = Some(
            CoreError::new(ErrorCode::ConfigInvalidPipeline, format!("invalid pipeline: {e}"))
                .to_string(),
        );
        publish_completed(rt, build).await;
        return;
    }

    // 4. Environment overlay.
    let secrets = match rt.secrets.secrets_for_build(&job.name, &job.org).await {
        Ok(secrets) => secrets,
        Err(e) => {
            warn!(target: "conveyor.engine", error = %e, "secret store unavailable");
            BTreeMap::new()
        }
    };
    let mask_values: Vec<String> = secrets.values().cloned().collect();
    let base_env = env::build_env(build, &workspace, &secrets, &request.env);

    // 5. Container overlay propagation.
    if let Some(container) = &pipeline.container {
        for stage in &mut pipeline.stages {
            if stage.container.is_none() {
                stage.container = Some(container.clone());
            }
        }
    }

    // 6. Matrix expansion.
    let units = expand(pipeline.stages.clone(), pipeline.matrix.as_ref());

    let ctx = Arc::new(ExecCtx {
        config: rt.config.clone(),
        bus: Arc::clone(&rt.bus),
        builds: Arc::clone(&rt.builds),
        policies: Arc::clone(&rt.policies),
        result_cache: Arc::clone(&rt.result_cache),
        cache_index: Arc::clone(&rt.cache_index),
        cache: Arc::clone(&rt.cache),
        approvals: Arc::clone(&rt.approvals),
        process: Arc::clone(&rt.process),
        plugins: Arc::clone(&rt.plugins),
        policy_engine: PolicyEngine,
        stage_slots: Arc::new(Semaphore::new(rt.config.parallel_stages.max_concurrent)),
        step_slots: Arc::new(Semaphore::new(rt.config.thread_pools.max_parallel_steps)),
        build_id: build.id,
        job: job.name.clone(),
        org: job.org.clone(),
        branch: build.git.as_ref().map(|g| g.branch.clone()),
        commit: build.git.as_ref().map(|g| g.commit.clone()),
        author: build.git.as_ref().map(|g| g.author.clone()),
        parameters: build.parameters.clone(),
        base_env,
        workspace: workspace.clone(),
        mask_values,
        default_step_timeout: rt.config.default_step_timeout(),
        cancel: cancel.clone(),
        run_context,
    });

    // 7. Mode selection and stage execution.
    let dag_enabled = rt.flags.enabled(FeatureFlag::ParallelStages);
    let has_deps = units.iter().any(|u| !u.stage.depends_on.is_empty());
    build.stages = if has_deps && dag_enabled {
        run_dag(&ctx, units).await
    } else {
        run_sequential(&ctx, units).await
    };

    // 8. Overall status.
    let cancelled = cancel.is_cancelled();
    build.status = if cancelled {
        BuildStatus::Aborted
    } else {
        derive_build_status(&build.stages)
    };
    if cancelled {
        build.error.get_or_insert_with(|| {
            CoreError::new(ErrorCode::BuildCancelled, "build cancelled").to_string()
        });
        rt.bus
            .publish(BuildEvent::new(build.id, EventKind::BuildCancelled))
            .await;
    }

    // 9. Post-actions.
    run_post_actions(&ctx, &pipeline.post, build.status).await;

    // 10. Artifact collection.
    if !pipeline.artifacts.is_empty() {
        match conveyor_workspace::collect_artifacts(
            &pipeline.artifacts,
            &workspace,
            &rt.config.artifacts.root,
            &job.name,
            build.number,
        ) {
            Ok(artifacts) => {
                if let Err(e) = rt.builds.record_artifacts(build.id, &artifacts).await {
                    warn!(target: "conveyor.engine", error = %e, "artifact persistence failed");
                }
                build.artifacts = artifacts;
            }
            Err(e) => warn!(target: "conveyor.engine", error = %e, "artifact collection failed"),
        }
    }

    // 11. Supply-chain hooks, each flag-guarded and failure-isolated.
    for hook in rt.plugins.supply_chain_hooks() {
        if !rt.flags.enabled(hook.flag()) {
            continue;
        }
        if let Err(e) = hook.run(build).await {
            warn!(
                target: "conveyor.engine",
                hook = hook.name(),
                error = %e,
                "supply-chain hook failed (build status unchanged)"
            );
        }
    }

    // 12. Notifications.
    dispatch_notifications(rt, &pipeline, build).await;

    // 13. Completion event.
    publish_completed(rt, build).await;
}

async fn run_sequential(ctx: &Arc<ExecCtx>, units: Vec<StageUnit>) -> Vec<conveyor_core::StageResult> {
    let mut results = Vec::with_capacity(units.len());
    for unit in units {
        if ctx.cancel.is_cancelled() {
            break;
        }
        let result = run_stage(Arc::clone(ctx), unit).await;
        let stop = matches!(result.status, StepStatus::Failure | StepStatus::Aborted);
        results.push(result);
        if stop {
            break;
        }
    }
    results
}

async fn publish_completed(rt: &CoreRuntime, build: &Build) {
    rt.bus
        .publish(
            BuildEvent::new(build.id, EventKind::BuildCompleted)
                .with("status", build.status)
                .with("number", build.number),
        )
        .await;
}

/// Look for a recognized workspace pipeline definition: EDN first, then
/// YAML. Parsers come from the plug-in registry; a parse failure falls
/// back to the server pipeline.
fn resolve_workspace_pipeline(
    plugins: &PluginRegistry,
    workspace: &std::path::Path,
) -> Option<(Pipeline, PipelineSource)> {
    const CANDIDATES: &[(&str, &str, PipelineSource)] = &[
        ("pipeline.edn", "edn", PipelineSource::WorkspaceEdn),
        ("pipeline.yaml", "yaml", PipelineSource::WorkspaceYaml),
        ("pipeline.yml", "yaml", PipelineSource::WorkspaceYaml),
    ];
    for &(file_name, extension, source) in CANDIDATES {
        let path = workspace.join(file_name);
        if !path.is_file() {
            continue;
        }
        let Some(format) = plugins.pipeline_format(extension) else {
            continue;
        };
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) => {
                warn!(target: "conveyor.engine", file = file_name, error = %e, "unreadable workspace pipeline");
                continue;
            }
        };
        match format.parse_pipeline(&text) {
            Ok(pipeline) => return Some((pipeline, source)),
            Err(e) => {
                warn!(
                    target: "conveyor.engine",
                    file = file_name,
                    error = %e,
                    "workspace pipeline failed to parse, using server definition"
                );
            }
        }
    }
    None
}

/// Replace the server pipeline's stages and overridable top-level fields
/// with the workspace definition's. The source binding stays server-side.
fn overlay_workspace_pipeline(mut server: Pipeline, workspace: Pipeline) -> Pipeline {
    server.stages = workspace.stages;
    server.matrix = workspace.matrix;
    if workspace.container.is_some() {
        server.container = workspace.container;
    }
    if !workspace.artifacts.is_empty() {
        server.artifacts = workspace.artifacts;
    }
    if !workspace.notify.is_empty() {
        server.notify = workspace.notify;
    }
    if !workspace.post.is_empty() {
        server.post = workspace.post;
    }
    server
}

async fn dispatch_notifications(rt: &CoreRuntime, pipeline: &Pipeline, build: &Build) {
    for target in &pipeline.notify {
        let Some(notifier) = rt.plugins.notifier(target) else {
            warn!(target: "conveyor.engine", notify_target = %target, "no notifier registered");
            continue;
        };
        match notifier.notify(target, build).await {
            Ok(()) => {
                if let Err(e) = rt
                    .notifications
                    .record_notification(build.id, target, build.status.as_str())
                    .await
                {
                    warn!(target: "conveyor.engine", error = %e, "notification log failed");
                }
            }
            Err(e) => warn!(
                target: "conveyor.engine",
                notify_target = %target,
                error = %e,
                "notification dispatch failed (build status unchanged)"
            ),
        }
    }
}
