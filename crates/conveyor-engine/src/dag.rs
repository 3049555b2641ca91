// SPDX-License-Identifier: MIT OR Apache-2.0
//! DAG-mode stage scheduling: launch ready stages in bounded parallel,
//! abort the dependents of failed stages without running them.

use crate::executor::ExecCtx;
use crate::matrix::StageUnit;
use crate::stage::run_stage;
use chrono::Utc;
use conveyor_core::{DepGraph, StageResult, StepStatus};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::warn;

/// Reason recorded on stages that never ran because a dependency failed.
const DEPENDENCY_FAILED: &str = "Dependency failed";

/// Idle backoff when nothing is ready and nothing is in flight yet.
const IDLE_WAIT: Duration = Duration::from_millis(25);

/// Execute stages as a dependency graph.
///
/// Results are appended in completion order. A stage with a failed or
/// aborted dependency is marked `aborted(Dependency failed)` without
/// running; cancellation at any boundary terminates the loop, leaving
/// not-yet-started stages out of the results.
pub async fn run_dag(ctx: &Arc<ExecCtx>, units: Vec<StageUnit>) -> Vec<StageResult> {
    let graph = DepGraph::from_stages(
        units
            .iter()
            .map(|u| (u.stage.name.as_str(), u.stage.depends_on.as_slice())),
    );
    let mut by_name: BTreeMap<String, StageUnit> = units
        .into_iter()
        .map(|u| (u.stage.name.clone(), u))
        .collect();

    let total = graph.len();
    let mut completed: BTreeSet<String> = BTreeSet::new();
    let mut failed: BTreeSet<String> = BTreeSet::new();
    let mut ineligible: BTreeSet<String> = BTreeSet::new();
    let mut results: Vec<StageResult> = Vec::with_capacity(total);
    let mut in_flight: JoinSet<StageResult> = JoinSet::new();
    let mut finished = 0usize;

    while finished < total {
        if ctx.cancel.is_cancelled() {
            // Let in-flight stages observe the flag and finish.
            while let Some(joined) = in_flight.join_next().await {
                if let Ok(result) = joined {
                    record(&mut results, &mut completed, &mut failed, result);
                }
            }
            break;
        }

        // Mark every stage blocked by a failed dependency, transitively.
        loop {
            let blocked = graph.blocked(&failed, &ineligible);
            if blocked.is_empty() {
                break;
            }
            for name in blocked {
                ineligible.insert(name.clone());
                let now = Utc::now();
                let result = StageResult {
                    name: name.clone(),
                    status: StepStatus::Aborted,
                    steps: Vec::new(),
                    started_at: now,
                    completed_at: now,
                    reason: Some(DEPENDENCY_FAILED.to_string()),
                    cached: false,
                };
                failed.insert(name);
                finished += 1;
                results.push(result);
            }
        }
        if finished >= total {
            break;
        }

        // Launch whatever is ready, bounded by the stage semaphore.
        // Acquisition happens before spawning so a full pool delays the
        // launch instead of starving the shared dispatch pool.
        let mut launched = false;
        for name in graph.ready(&completed, &ineligible) {
            let Ok(permit) = Arc::clone(&ctx.stage_slots).try_acquire_owned() else {
                break;
            };
            let Some(unit) = by_name.remove(&name) else {
                continue;
            };
            ineligible.insert(name);
            let ctx = Arc::clone(ctx);
            in_flight.spawn(async move {
                let result = run_stage(ctx, unit).await;
                drop(permit);
                result
            });
            launched = true;
        }

        if !in_flight.is_empty() {
            if let Some(joined) = in_flight.join_next().await {
                match joined {
                    Ok(result) => {
                        finished += 1;
                        record(&mut results, &mut completed, &mut failed, result);
                    }
                    Err(e) => {
                        // The stage identity is lost with the panic; stop
                        // scheduling rather than spin on an unsatisfiable
                        // graph.
                        warn!(target: "conveyor.engine", error = %e, "stage task panicked, stopping DAG loop");
                        break;
                    }
                }
            }
        } else if !launched {
            // Nothing runnable and nothing in flight: wait briefly and retry.
            tokio::time::sleep(IDLE_WAIT).await;
        }
    }

    results
}

fn record(
    results: &mut Vec<StageResult>,
    completed: &mut BTreeSet<String>,
    failed: &mut BTreeSet<String>,
    result: StageResult,
) {
    match result.status {
        StepStatus::Success | StepStatus::Skipped => {
            completed.insert(result.name.clone());
        }
        StepStatus::Failure | StepStatus::Aborted => {
            failed.insert(result.name.clone());
        }
    }
    results.push(result);
}
