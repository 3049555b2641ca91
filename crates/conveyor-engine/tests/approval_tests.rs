// SPDX-License-Identifier: MIT OR Apache-2.0
//! Approval gates inside the stage state machine.

use conveyor_approvals::GateStatus;
use conveyor_config::CoreConfig;
use conveyor_core::{
    ApprovalSpec, BuildRequest, BuildStatus, EventKind, Job, Pipeline, Stage, Step, StepStatus,
    TriggerKind,
};
use conveyor_engine::CoreRuntime;
use conveyor_policy::{Policy, PolicyRule};
use conveyor_store::{BuildStore, JobStore, MemoryStore, PolicyStore};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn test_config(tmp: &TempDir) -> CoreConfig {
    let mut config = CoreConfig::default();
    config.workspace.root = tmp.path().join("workspaces");
    config.artifacts.root = tmp.path().join("artifacts");
    config.cache.root = tmp.path().join("cache");
    config.approvals.poll_interval_ms = 25;
    config
}

async fn runtime(tmp: &TempDir, store: Arc<MemoryStore>) -> Arc<CoreRuntime> {
    Arc::new(
        CoreRuntime::builder(test_config(tmp))
            .memory_store(store)
            .build()
            .expect("assemble runtime"),
    )
}

fn approval(timeout_minutes: u64, min_approvals: u32) -> ApprovalSpec {
    ApprovalSpec {
        message: Some("ship it?".into()),
        required_role: "admin".into(),
        timeout_minutes,
        approver_group: Some("release-managers".into()),
        min_approvals,
    }
}

fn gated_pipeline(spec: ApprovalSpec) -> Pipeline {
    let mut deploy = Stage::new("Deploy", vec![Step::shell("ship", "true")]);
    deploy.approval = Some(spec);
    Pipeline::new("gated", vec![deploy])
}

#[tokio::test]
async fn zero_timeout_gate_aborts_the_stage() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let rt = runtime(&tmp, Arc::clone(&store)).await;

    let job = Job::new("demo", "acme", gated_pipeline(approval(0, 1)));
    store.put_job(&job).await.unwrap();

    let build = store
        .create_build("demo", "acme", TriggerKind::Manual)
        .await
        .unwrap();
    let mut sub = rt.bus().subscribe(build.id);

    let finished = rt
        .execute_for_record(&job, build, BuildRequest::default())
        .await
        .unwrap();

    assert_eq!(finished.status, BuildStatus::Aborted);
    assert_eq!(finished.stages[0].status, StepStatus::Aborted);
    assert_eq!(finished.stages[0].reason.as_deref(), Some("Approval timed out"));
    assert!(finished.stages[0].steps.is_empty(), "guarded steps never ran");

    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut kinds = Vec::new();
    while let Some(event) = sub.try_recv() {
        kinds.push(event.kind);
    }
    assert!(kinds.contains(&EventKind::ApprovalRequested));
    assert!(kinds.contains(&EventKind::StageCompleted));
}

#[tokio::test]
async fn approving_the_gate_lets_the_stage_run() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let rt = runtime(&tmp, Arc::clone(&store)).await;

    let job = Job::new("demo", "acme", gated_pipeline(approval(10, 1)));
    store.put_job(&job).await.unwrap();

    let build = store
        .create_build("demo", "acme", TriggerKind::Manual)
        .await
        .unwrap();
    let build_id = build.id;

    let rt2 = Arc::clone(&rt);
    let job2 = job.clone();
    let handle = tokio::spawn(async move {
        rt2.execute_for_record(&job2, build, BuildRequest::default()).await
    });

    // Wait for the gate to appear, then approve it.
    let gate = loop {
        let pending = rt.approvals().pending_for_build(build_id).await.unwrap();
        if let Some(gate) = pending.into_iter().next() {
            break gate;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    let status = rt.approvals().approve(gate.id, "alice").await.unwrap();
    assert_eq!(status, GateStatus::Approved);

    let finished = handle.await.unwrap().unwrap();
    assert_eq!(finished.status, BuildStatus::Success);
    assert_eq!(finished.stages[0].status, StepStatus::Success);
}

#[tokio::test]
async fn rejecting_the_gate_aborts_with_the_user() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let rt = runtime(&tmp, Arc::clone(&store)).await;

    let job = Job::new("demo", "acme", gated_pipeline(approval(10, 1)));
    store.put_job(&job).await.unwrap();

    let build = store
        .create_build("demo", "acme", TriggerKind::Manual)
        .await
        .unwrap();
    let build_id = build.id;

    let rt2 = Arc::clone(&rt);
    let job2 = job.clone();
    let handle = tokio::spawn(async move {
        rt2.execute_for_record(&job2, build, BuildRequest::default()).await
    });

    let gate = loop {
        let pending = rt.approvals().pending_for_build(build_id).await.unwrap();
        if let Some(gate) = pending.into_iter().next() {
            break gate;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    rt.approvals().reject(gate.id, "mallory").await.unwrap();

    let finished = handle.await.unwrap().unwrap();
    assert_eq!(finished.status, BuildStatus::Aborted);
    assert_eq!(
        finished.stages[0].reason.as_deref(),
        Some("rejected by mallory")
    );
}

#[tokio::test]
async fn required_approval_policy_amplifies_the_gate() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let rt = runtime(&tmp, Arc::clone(&store)).await;

    store
        .put_policy(&Policy {
            id: uuid::Uuid::new_v4(),
            org: "acme".into(),
            name: "deploys-need-two".into(),
            enabled: true,
            priority: 1,
            rule: PolicyRule::RequiredApproval {
                stages: vec!["Deploy*".into()],
                min_approvals: 2,
                approver_group: Some("security".into()),
            },
        })
        .await
        .unwrap();

    let job = Job::new("demo", "acme", gated_pipeline(approval(10, 1)));
    store.put_job(&job).await.unwrap();

    let build = store
        .create_build("demo", "acme", TriggerKind::Manual)
        .await
        .unwrap();
    let build_id = build.id;

    let rt2 = Arc::clone(&rt);
    let job2 = job.clone();
    let handle = tokio::spawn(async move {
        rt2.execute_for_record(&job2, build, BuildRequest::default()).await
    });

    let gate = loop {
        let pending = rt.approvals().pending_for_build(build_id).await.unwrap();
        if let Some(gate) = pending.into_iter().next() {
            break gate;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    // Override raised the minimum and unioned the groups.
    assert_eq!(gate.min_approvals, 2);
    assert_eq!(
        gate.approver_groups,
        vec!["release-managers".to_string(), "security".to_string()]
    );

    assert_eq!(
        rt.approvals().approve(gate.id, "alice").await.unwrap(),
        GateStatus::Pending
    );
    assert_eq!(
        rt.approvals().approve(gate.id, "bob").await.unwrap(),
        GateStatus::Approved
    );

    let finished = handle.await.unwrap().unwrap();
    assert_eq!(finished.status, BuildStatus::Success);
}

#[tokio::test]
async fn policy_denial_aborts_the_stage_before_any_gate() {
    use conveyor_policy::RestrictionAction;

    let tmp = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let rt = runtime(&tmp, Arc::clone(&store)).await;

    store
        .put_policy(&Policy {
            id: uuid::Uuid::new_v4(),
            org: "acme".into(),
            name: "main-only".into(),
            enabled: true,
            priority: 1,
            rule: PolicyRule::BranchRestriction {
                branches: vec!["main".into()],
                action: RestrictionAction::Allow,
            },
        })
        .await
        .unwrap();

    // No checkout happens, so the branch is unknown and the allow-list denies.
    let job = Job::new("demo", "acme", gated_pipeline(approval(10, 1)));
    store.put_job(&job).await.unwrap();

    let build = store
        .create_build("demo", "acme", TriggerKind::Manual)
        .await
        .unwrap();
    let build_id = build.id;
    let mut sub = rt.bus().subscribe(build_id);

    let finished = rt
        .execute_for_record(&job, build, BuildRequest::default())
        .await
        .unwrap();

    assert_eq!(finished.status, BuildStatus::Aborted);
    assert!(finished.stages[0]
        .reason
        .as_deref()
        .unwrap()
        .contains("main-only"));
    assert!(
        rt.approvals().pending_for_build(build_id).await.unwrap().is_empty(),
        "no gate is opened for a denied stage"
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut kinds = Vec::new();
    while let Some(event) = sub.try_recv() {
        kinds.push(event.kind);
    }
    assert!(kinds.contains(&EventKind::StagePolicyDenied));
}
