// SPDX-License-Identifier: MIT OR Apache-2.0
//! The in-memory reference store.

use crate::{BuildStore, JobStore, NotificationLog, PolicyStore, ScheduleStore};
use conveyor_approvals::{ApprovalGate, GateStatus, GateStore};
use conveyor_cache::{CacheEntry, CacheIndex, CachedStageResult, ResultCache};
use conveyor_core::{ArtifactRecord, Build, Job, TriggerKind};
use conveyor_cron::{CronRun, CronSchedule};
use conveyor_policy::Policy;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    jobs: HashMap<(String, String), Job>,
    builds: HashMap<Uuid, Build>,
    // Serialized under the same lock as `builds`, which is what makes
    // numbering strictly monotonic under concurrency.
    build_numbers: HashMap<(String, String), u64>,
    gates: HashMap<Uuid, ApprovalGate>,
    policies: Vec<Policy>,
    schedules: HashMap<Uuid, CronSchedule>,
    cron_runs: Vec<CronRun>,
    cache_entries: HashMap<(String, String), CacheEntry>,
    stage_results: HashMap<(String, String), CachedStageResult>,
    notifications: Vec<(Uuid, String, String)>,
}

/// Threadsafe in-memory implementation of every persistence trait.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().expect("memory store lock poisoned")
    }

    /// Recorded notifications, for assertions in tests.
    #[must_use]
    pub fn notifications(&self) -> Vec<(Uuid, String, String)> {
        self.lock().notifications.clone()
    }
}

#[async_trait::async_trait]
impl JobStore for MemoryStore {
    async fn get_job(&self, org: &str, name: &str) -> anyhow::Result<Option<Job>> {
        Ok(self
            .lock()
            .jobs
            .get(&(org.to_string(), name.to_string()))
            .cloned())
    }

    async fn put_job(&self, job: &Job) -> anyhow::Result<()> {
        self.lock()
            .jobs
            .insert((job.org.clone(), job.name.clone()), job.clone());
        Ok(())
    }

    async fn list_jobs(&self, org: &str) -> anyhow::Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .lock()
            .jobs
            .values()
            .filter(|j| j.org == org)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(jobs)
    }
}

#[async_trait::async_trait]
impl BuildStore for MemoryStore {
    async fn create_build(
        &self,
        job: &str,
        org: &str,
        trigger: TriggerKind,
    ) -> anyhow::Result<Build> {
        let mut tables = self.lock();
        let counter = tables
            .build_numbers
            .entry((org.to_string(), job.to_string()))
            .or_insert(0);
        *counter += 1;
        let build = Build::new(job, org, *counter, trigger);
        tables.builds.insert(build.id, build.clone());
        Ok(build)
    }

    async fn update_build(&self, build: &Build) -> anyhow::Result<()> {
        self.lock().builds.insert(build.id, build.clone());
        Ok(())
    }

    async fn get_build(&self, id: Uuid) -> anyhow::Result<Option<Build>> {
        Ok(self.lock().builds.get(&id).cloned())
    }

    async fn list_builds(&self, org: &str, job: &str) -> anyhow::Result<Vec<Build>> {
        let mut builds: Vec<Build> = self
            .lock()
            .builds
            .values()
            .filter(|b| b.org == org && b.job == job)
            .cloned()
            .collect();
        builds.sort_by(|a, b| b.number.cmp(&a.number));
        Ok(builds)
    }

    async fn record_artifacts(
        &self,
        build_id: Uuid,
        artifacts: &[ArtifactRecord],
    ) -> anyhow::Result<()> {
        let mut tables = self.lock();
        if let Some(build) = tables.builds.get_mut(&build_id) {
            build.artifacts = artifacts.to_vec();
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl GateStore for MemoryStore {
    async fn create_gate(&self, gate: &ApprovalGate) -> anyhow::Result<()> {
        self.lock().gates.insert(gate.id, gate.clone());
        Ok(())
    }

    async fn load_gate(&self, gate_id: Uuid) -> anyhow::Result<Option<ApprovalGate>> {
        Ok(self.lock().gates.get(&gate_id).cloned())
    }

    async fn update_gate(&self, gate: &ApprovalGate) -> anyhow::Result<()> {
        self.lock().gates.insert(gate.id, gate.clone());
        Ok(())
    }

    async fn pending_gates(&self, build_id: Uuid) -> anyhow::Result<Vec<ApprovalGate>> {
        Ok(self
            .lock()
            .gates
            .values()
            .filter(|g| g.build_id == build_id && g.status == GateStatus::Pending)
            .cloned()
            .collect())
    }
}

#[async_trait::async_trait]
impl PolicyStore for MemoryStore {
    async fn policies_for_org(&self, org: &str) -> anyhow::Result<Vec<Policy>> {
        let mut policies: Vec<Policy> = self
            .lock()
            .policies
            .iter()
            .filter(|p| p.org == org && p.enabled)
            .cloned()
            .collect();
        policies.sort_by_key(|p| p.priority);
        Ok(policies)
    }

    async fn put_policy(&self, policy: &Policy) -> anyhow::Result<()> {
        let mut tables = self.lock();
        tables.policies.retain(|p| p.id != policy.id);
        tables.policies.push(policy.clone());
        Ok(())
    }
}

#[async_trait::async_trait]
impl ScheduleStore for MemoryStore {
    async fn list_schedules(&self) -> anyhow::Result<Vec<CronSchedule>> {
        let mut schedules: Vec<CronSchedule> = self.lock().schedules.values().cloned().collect();
        schedules.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(schedules)
    }

    async fn put_schedule(&self, schedule: &CronSchedule) -> anyhow::Result<()> {
        self.lock().schedules.insert(schedule.id, schedule.clone());
        Ok(())
    }

    async fn record_cron_run(&self, run: &CronRun) -> anyhow::Result<()> {
        self.lock().cron_runs.push(run.clone());
        Ok(())
    }

    async fn cron_runs(&self, schedule_id: Uuid) -> anyhow::Result<Vec<CronRun>> {
        let mut runs: Vec<CronRun> = self
            .lock()
            .cron_runs
            .iter()
            .filter(|r| r.schedule_id == schedule_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.at.cmp(&a.at));
        Ok(runs)
    }
}

#[async_trait::async_trait]
impl CacheIndex for MemoryStore {
    async fn record_entry(&self, entry: &CacheEntry) -> anyhow::Result<()> {
        self.lock()
            .cache_entries
            .insert((entry.job.clone(), entry.key.clone()), entry.clone());
        Ok(())
    }

    async fn entries_for_job(&self, job: &str) -> anyhow::Result<Vec<CacheEntry>> {
        let mut entries: Vec<CacheEntry> = self
            .lock()
            .cache_entries
            .values()
            .filter(|e| e.job == job)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries)
    }

    async fn remove_entry(&self, job: &str, key: &str) -> anyhow::Result<()> {
        self.lock()
            .cache_entries
            .remove(&(job.to_string(), key.to_string()));
        Ok(())
    }
}

#[async_trait::async_trait]
impl ResultCache for MemoryStore {
    async fn get_result(
        &self,
        job: &str,
        fingerprint: &str,
    ) -> anyhow::Result<Option<CachedStageResult>> {
        Ok(self
            .lock()
            .stage_results
            .get(&(job.to_string(), fingerprint.to_string()))
            .cloned())
    }

    async fn put_result(&self, result: &CachedStageResult) -> anyhow::Result<()> {
        self.lock()
            .stage_results
            .insert((result.job.clone(), result.fingerprint.clone()), result.clone());
        Ok(())
    }
}

#[async_trait::async_trait]
impl NotificationLog for MemoryStore {
    async fn record_notification(
        &self,
        build_id: Uuid,
        target: &str,
        detail: &str,
    ) -> anyhow::Result<()> {
        self.lock()
            .notifications
            .push((build_id, target.to_string(), detail.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::{Pipeline, Stage, Step};
    use std::sync::Arc;

    #[tokio::test]
    async fn build_numbers_increment_per_job_and_org() {
        let store = MemoryStore::new();
        let a1 = store.create_build("a", "org", TriggerKind::Manual).await.unwrap();
        let a2 = store.create_build("a", "org", TriggerKind::Manual).await.unwrap();
        let b1 = store.create_build("b", "org", TriggerKind::Manual).await.unwrap();
        let other = store.create_build("a", "other", TriggerKind::Manual).await.unwrap();
        assert_eq!(a1.number, 1);
        assert_eq!(a2.number, 2);
        assert_eq!(b1.number, 1);
        assert_eq!(other.number, 1);
    }

    #[tokio::test]
    async fn concurrent_creations_produce_unique_increasing_numbers() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .create_build("job", "org", TriggerKind::Webhook)
                    .await
                    .unwrap()
                    .number
            }));
        }
        let mut numbers = Vec::new();
        for handle in handles {
            numbers.push(handle.await.unwrap());
        }
        numbers.sort_unstable();
        let expected: Vec<u64> = (1..=32).collect();
        assert_eq!(numbers, expected);
    }

    #[tokio::test]
    async fn jobs_roundtrip() {
        let store = MemoryStore::new();
        let job = Job::new(
            "deploy",
            "acme",
            Pipeline::new("p", vec![Stage::new("s", vec![Step::shell("x", "true")])]),
        );
        store.put_job(&job).await.unwrap();
        let loaded = store.get_job("acme", "deploy").await.unwrap().unwrap();
        assert_eq!(loaded, job);
        assert!(store.get_job("acme", "ghost").await.unwrap().is_none());
        assert_eq!(store.list_jobs("acme").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn policies_are_filtered_and_ordered() {
        use conveyor_policy::{PolicyRule, RestrictionAction};
        let store = MemoryStore::new();
        let mut low = Policy {
            id: Uuid::new_v4(),
            org: "acme".into(),
            name: "low".into(),
            enabled: true,
            priority: 10,
            rule: PolicyRule::BranchRestriction {
                branches: vec!["main".into()],
                action: RestrictionAction::Allow,
            },
        };
        let mut high = low.clone();
        high.id = Uuid::new_v4();
        high.name = "high".into();
        high.priority = 1;
        let mut disabled = low.clone();
        disabled.id = Uuid::new_v4();
        disabled.name = "disabled".into();
        disabled.enabled = false;
        low.priority = 10;

        store.put_policy(&low).await.unwrap();
        store.put_policy(&high).await.unwrap();
        store.put_policy(&disabled).await.unwrap();

        let loaded = store.policies_for_org("acme").await.unwrap();
        let names: Vec<&str> = loaded.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["high", "low"]);
    }

    #[tokio::test]
    async fn builds_list_newest_first() {
        let store = MemoryStore::new();
        store.create_build("j", "o", TriggerKind::Manual).await.unwrap();
        store.create_build("j", "o", TriggerKind::Manual).await.unwrap();
        let builds = store.list_builds("o", "j").await.unwrap();
        assert_eq!(builds[0].number, 2);
        assert_eq!(builds[1].number, 1);
    }

    #[tokio::test]
    async fn artifacts_attach_to_the_build() {
        let store = MemoryStore::new();
        let build = store.create_build("j", "o", TriggerKind::Manual).await.unwrap();
        let artifact = ArtifactRecord {
            file_name: "report.xml".into(),
            path: "/artifacts/j/1/report.xml".into(),
            size: 12,
            content_type: "application/xml".into(),
            sha256: "ab".repeat(32),
        };
        store.record_artifacts(build.id, &[artifact.clone()]).await.unwrap();
        let loaded = store.get_build(build.id).await.unwrap().unwrap();
        assert_eq!(loaded.artifacts, vec![artifact]);
    }
}
