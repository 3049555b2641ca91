// SPDX-License-Identifier: MIT OR Apache-2.0
//! Artifact cache and stage result cache behaviour through the engine.

use chrono::Utc;
use conveyor_cache::{CacheEntry, CacheIndex};
use conveyor_config::CoreConfig;
use conveyor_core::{
    BuildRequest, BuildStatus, CacheDecl, EventKind, Job, Pipeline, Stage, Step, TriggerKind,
};
use conveyor_engine::CoreRuntime;
use conveyor_store::{BuildStore, JobStore, MemoryStore};
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

fn test_config(tmp: &TempDir) -> CoreConfig {
    let mut config = CoreConfig::default();
    config.workspace.root = tmp.path().join("workspaces");
    config.artifacts.root = tmp.path().join("artifacts");
    config.cache.root = tmp.path().join("cache");
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

#[tokio::test]
async fn restore_key_prefix_hits_a_seeded_entry() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let rt = runtime(&tmp, Arc::clone(&store)).await;

    // Seed a persisted entry `deps-abcd` with content on disk.
    let entry_dir = tmp.path().join("cache/demo/deps-abcd/node_modules");
    fs::create_dir_all(&entry_dir).unwrap();
    fs::write(entry_dir.join("dep.js"), "cached-module").unwrap();
    store
        .record_entry(&CacheEntry {
            job: "demo".into(),
            key: "deps-abcd".into(),
            paths: "node_modules".into(),
            size: 13,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    // The exact key resolves to `deps-missing` (no lock file), so only the
    // `deps-` restore prefix can satisfy the restore.
    let mut stage = Stage::new(
        "Build",
        vec![Step::shell("verify", "cat node_modules/dep.js")],
    );
    stage.caches.push(CacheDecl {
        key: "deps-{{ hashFiles('lock') }}".into(),
        paths: vec!["node_modules".into()],
        restore_keys: vec!["deps-".into()],
    });
    let pipeline = Pipeline::new("cached", vec![stage]);
    store.put_job(&Job::new("demo", "acme", pipeline)).await.unwrap();

    let build = rt
        .execute("acme", "demo", TriggerKind::Manual, BuildRequest::default())
        .await
        .unwrap();

    assert_eq!(build.status, BuildStatus::Success);
    assert_eq!(build.stages[0].steps[0].output.trim(), "cached-module");
}

#[tokio::test]
async fn successful_stage_saves_its_cache_once() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let rt = runtime(&tmp, Arc::clone(&store)).await;

    let mut stage = Stage::new(
        "Build",
        vec![Step::shell("produce", "mkdir -p out && echo one > out/file")],
    );
    stage.caches.push(CacheDecl {
        key: "out-v1".into(),
        paths: vec!["out".into()],
        restore_keys: vec![],
    });
    let pipeline = Pipeline::new("saving", vec![stage]);
    store.put_job(&Job::new("demo", "acme", pipeline)).await.unwrap();

    let build = rt
        .execute("acme", "demo", TriggerKind::Manual, BuildRequest::default())
        .await
        .unwrap();
    assert_eq!(build.status, BuildStatus::Success);

    let cached = tmp.path().join("cache/demo/out-v1/out/file");
    assert_eq!(fs::read_to_string(&cached).unwrap().trim(), "one");
    let entries = store.entries_for_job("demo").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].key, "out-v1");
}

#[tokio::test]
async fn identical_rerun_replays_the_stage_from_the_result_cache() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let rt = runtime(&tmp, Arc::clone(&store)).await;

    let pipeline = Pipeline::new(
        "replayable",
        vec![Stage::new("Build", vec![Step::shell("work", "echo computed")])],
    );
    let job = Job::new("demo", "acme", pipeline);
    store.put_job(&job).await.unwrap();

    let first = rt
        .execute("acme", "demo", TriggerKind::Manual, BuildRequest::default())
        .await
        .unwrap();
    assert_eq!(first.status, BuildStatus::Success);
    assert!(!first.stages[0].cached);

    // Second run with identical inputs: the stage replays.
    let build = store
        .create_build("demo", "acme", TriggerKind::Manual)
        .await
        .unwrap();
    let mut sub = rt.bus().subscribe(build.id);
    let second = rt
        .execute_for_record(&job, build, BuildRequest::default())
        .await
        .unwrap();

    assert_eq!(second.status, BuildStatus::Success);
    assert!(second.stages[0].cached, "stage must come from the result cache");
    assert_eq!(second.stages[0].steps[0].output.trim(), "computed");

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let mut kinds = Vec::new();
    while let Some(event) = sub.try_recv() {
        kinds.push(event.kind);
    }
    assert!(kinds.contains(&EventKind::StageCached));
}

#[tokio::test]
async fn changed_parameters_miss_the_result_cache() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let rt = runtime(&tmp, Arc::clone(&store)).await;

    let pipeline = Pipeline::new(
        "parameterised",
        vec![Stage::new("Build", vec![Step::shell("work", "true")])],
    );
    store.put_job(&Job::new("demo", "acme", pipeline)).await.unwrap();

    let first = rt
        .execute("acme", "demo", TriggerKind::Manual, BuildRequest::default())
        .await
        .unwrap();
    assert!(!first.stages[0].cached);

    let mut request = BuildRequest::default();
    request.parameters.insert("flavor".into(), "debug".into());
    let second = rt
        .execute("acme", "demo", TriggerKind::Manual, request)
        .await
        .unwrap();
    assert!(
        !second.stages[0].cached,
        "different parameters must produce a different fingerprint"
    );
}

#[tokio::test]
async fn retention_eviction_drops_old_entries() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let rt = runtime(&tmp, Arc::clone(&store)).await;

    let dir = tmp.path().join("cache/demo/stale-key");
    fs::create_dir_all(&dir).unwrap();
    store
        .record_entry(&CacheEntry {
            job: "demo".into(),
            key: "stale-key".into(),
            paths: "out".into(),
            size: 0,
            created_at: Utc::now() - chrono::Duration::days(90),
        })
        .await
        .unwrap();

    let evicted = rt.evict_job_caches("demo").await.unwrap();
    assert_eq!(evicted, 1);
    assert!(!dir.exists());
}
