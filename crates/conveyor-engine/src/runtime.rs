// SPDX-License-Identifier: MIT OR Apache-2.0
//! The explicitly constructed process-wide runtime.
//!
//! Everything that used to be a global — event channel, active-builds
//! registry, scheduler handle, worker pool, gate waiters — is a field of
//! [`CoreRuntime`], created at startup and passed into every entry point.

use crate::collab::{
    FeatureFlags, MetricsSink, NoopMetrics, NoopSecrets, NoopStatusReporter, NoopVcs, SecretStore,
    StaticFlags, StatusReporter, VcsCheckout,
};
use crate::plugins::PluginRegistry;
use crate::registry::ActiveBuilds;
use conveyor_approvals::{ApprovalEngine, GateStore};
use conveyor_cache::{CacheIndex, CacheStore, ResultCache};
use conveyor_config::CoreConfig;
use conveyor_events::{BusConfig, DepthSink, EventBus};
use conveyor_process::{LocalExecutor, ProcessExecutor};
use conveyor_store::{
    BuildStore, JobStore, MemoryStore, NotificationLog, PolicyStore, ScheduleStore,
};
use conveyor_workspace::WorkspaceManager;
use std::sync::Arc;
use tokio::sync::Semaphore;
use uuid::Uuid;

/// Errors surfaced by the lifecycle entry points.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The requested job does not exist.
    #[error("unknown job '{org}/{name}'")]
    UnknownJob {
        /// Organization that was searched.
        org: String,
        /// Job name that was searched.
        name: String,
    },

    /// A persistence collaborator failed.
    #[error("persistence failure")]
    Store(#[from] anyhow::Error),
}

impl EngineError {
    /// The stable [`ErrorCode`](conveyor_error::ErrorCode) for this error.
    #[must_use]
    pub fn error_code(&self) -> conveyor_error::ErrorCode {
        match self {
            Self::UnknownJob { .. } => conveyor_error::ErrorCode::JobNotFound,
            Self::Store(_) => conveyor_error::ErrorCode::StoreUnavailable,
        }
    }

    /// Convert into the unified taxonomy, preserving the message.
    #[must_use]
    pub fn into_core_error(self) -> conveyor_error::CoreError {
        let code = self.error_code();
        conveyor_error::CoreError::new(code, self.to_string())
    }
}

/// Bridges the bus's queue-depth sampler into the metrics collaborator.
struct MetricsDepthSink(Arc<dyn MetricsSink>);

impl DepthSink for MetricsDepthSink {
    fn record_depth(&self, depth: usize) {
        crate::collab::guard_metrics(
            self.0
                .observe_histogram("event_bus_queue_depth", depth as f64, &[]),
            "queue depth sample",
        );
    }
}

/// The assembled core: every process-wide collaborator and table.
pub struct CoreRuntime {
    pub(crate) config: CoreConfig,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) jobs: Arc<dyn JobStore>,
    pub(crate) builds: Arc<dyn BuildStore>,
    pub(crate) policies: Arc<dyn PolicyStore>,
    pub(crate) schedules: Arc<dyn ScheduleStore>,
    pub(crate) notifications: Arc<dyn NotificationLog>,
    pub(crate) result_cache: Arc<dyn ResultCache>,
    pub(crate) cache_index: Arc<dyn CacheIndex>,
    pub(crate) cache: Arc<CacheStore>,
    pub(crate) approvals: Arc<ApprovalEngine>,
    pub(crate) workspaces: WorkspaceManager,
    pub(crate) process: Arc<dyn ProcessExecutor>,
    pub(crate) vcs: Arc<dyn VcsCheckout>,
    pub(crate) secrets: Arc<dyn SecretStore>,
    pub(crate) metrics: Arc<dyn MetricsSink>,
    pub(crate) status_reporter: Arc<dyn StatusReporter>,
    pub(crate) flags: Arc<dyn FeatureFlags>,
    pub(crate) plugins: Arc<PluginRegistry>,
    pub(crate) active: ActiveBuilds,
    pub(crate) build_slots: Arc<Semaphore>,
}

impl CoreRuntime {
    /// Start building a runtime over the given configuration.
    #[must_use]
    pub fn builder(config: CoreConfig) -> CoreRuntimeBuilder {
        CoreRuntimeBuilder::new(config)
    }

    /// The configuration snapshot the runtime was built with.
    #[must_use]
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// The event bus, for subscriptions.
    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// The approval engine, for the web/API collaborator to resolve gates.
    #[must_use]
    pub fn approvals(&self) -> &Arc<ApprovalEngine> {
        &self.approvals
    }

    /// The active-builds registry.
    #[must_use]
    pub fn active(&self) -> &ActiveBuilds {
        &self.active
    }

    /// Request cancellation of a running build. Best-effort, idempotent;
    /// returns whether the build was active.
    pub fn cancel(&self, build_id: Uuid) -> bool {
        self.active.cancel(build_id)
    }

    /// Evict cache entries past the configured retention for one job.
    ///
    /// # Errors
    ///
    /// Propagates cache index failures.
    pub async fn evict_job_caches(&self, job: &str) -> anyhow::Result<usize> {
        self.cache
            .evict(job, self.config.cache.retention_days, self.cache_index.as_ref())
            .await
    }
}

/// Step-by-step construction of a [`CoreRuntime`].
///
/// Unset collaborators fall back to working defaults: a shared
/// [`MemoryStore`], the local process executor, no-op VCS / secrets /
/// metrics / status reporter, and default feature flags. `build` must run
/// inside a tokio runtime because it spawns the event bus tasks.
pub struct CoreRuntimeBuilder {
    config: CoreConfig,
    memory: Arc<MemoryStore>,
    jobs: Option<Arc<dyn JobStore>>,
    builds: Option<Arc<dyn BuildStore>>,
    policies: Option<Arc<dyn PolicyStore>>,
    schedules: Option<Arc<dyn ScheduleStore>>,
    notifications: Option<Arc<dyn NotificationLog>>,
    result_cache: Option<Arc<dyn ResultCache>>,
    cache_index: Option<Arc<dyn CacheIndex>>,
    gates: Option<Arc<dyn GateStore>>,
    process: Option<Arc<dyn ProcessExecutor>>,
    vcs: Option<Arc<dyn VcsCheckout>>,
    secrets: Option<Arc<dyn SecretStore>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    status_reporter: Option<Arc<dyn StatusReporter>>,
    flags: Option<Arc<dyn FeatureFlags>>,
    plugins: PluginRegistry,
}

impl CoreRuntimeBuilder {
    fn new(config: CoreConfig) -> Self {
        Self {
            config,
            memory: Arc::new(MemoryStore::new()),
            jobs: None,
            builds: None,
            policies: None,
            schedules: None,
            notifications: None,
            result_cache: None,
            cache_index: None,
            gates: None,
            process: None,
            vcs: None,
            secrets: None,
            metrics: None,
            status_reporter: None,
            flags: None,
            plugins: PluginRegistry::new(),
        }
    }

    /// Use one shared [`MemoryStore`] for every persistence trait.
    ///
    /// Useful in tests that want to seed and inspect the same store the
    /// runtime uses.
    #[must_use]
    pub fn memory_store(mut self, store: Arc<MemoryStore>) -> Self {
        self.memory = store;
        self
    }

    /// Replace the job store.
    #[must_use]
    pub fn job_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.jobs = Some(store);
        self
    }

    /// Replace the build store.
    #[must_use]
    pub fn build_store(mut self, store: Arc<dyn BuildStore>) -> Self {
        self.builds = Some(store);
        self
    }

    /// Replace the policy store.
    #[must_use]
    pub fn policy_store(mut self, store: Arc<dyn PolicyStore>) -> Self {
        self.policies = Some(store);
        self
    }

    /// Replace the schedule store.
    #[must_use]
    pub fn schedule_store(mut self, store: Arc<dyn ScheduleStore>) -> Self {
        self.schedules = Some(store);
        self
    }

    /// Replace the gate store.
    #[must_use]
    pub fn gate_store(mut self, store: Arc<dyn GateStore>) -> Self {
        self.gates = Some(store);
        self
    }

    /// Replace the notification log.
    #[must_use]
    pub fn notification_log(mut self, log: Arc<dyn NotificationLog>) -> Self {
        self.notifications = Some(log);
        self
    }

    /// Replace the stage result cache.
    #[must_use]
    pub fn result_cache(mut self, cache: Arc<dyn ResultCache>) -> Self {
        self.result_cache = Some(cache);
        self
    }

    /// Replace the cache entry index.
    #[must_use]
    pub fn cache_index(mut self, index: Arc<dyn CacheIndex>) -> Self {
        self.cache_index = Some(index);
        self
    }

    /// Replace the process executor.
    #[must_use]
    pub fn process_executor(mut self, process: Arc<dyn ProcessExecutor>) -> Self {
        self.process = Some(process);
        self
    }

    /// Replace the VCS collaborator.
    #[must_use]
    pub fn vcs(mut self, vcs: Arc<dyn VcsCheckout>) -> Self {
        self.vcs = Some(vcs);
        self
    }

    /// Replace the secret store.
    #[must_use]
    pub fn secret_store(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Replace the metrics recorder.
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Replace the SCM status reporter.
    #[must_use]
    pub fn status_reporter(mut self, reporter: Arc<dyn StatusReporter>) -> Self {
        self.status_reporter = Some(reporter);
        self
    }

    /// Replace the feature flags.
    #[must_use]
    pub fn feature_flags(mut self, flags: Arc<dyn FeatureFlags>) -> Self {
        self.flags = Some(flags);
        self
    }

    /// Mutable access to the plug-in registry, for startup registration.
    pub fn plugins_mut(&mut self) -> &mut PluginRegistry {
        &mut self.plugins
    }

    /// Assemble the runtime, spawning the event bus and its sampler.
    ///
    /// # Errors
    ///
    /// Fails when the workspace root cannot be created.
    pub fn build(self) -> anyhow::Result<CoreRuntime> {
        let metrics: Arc<dyn MetricsSink> = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(NoopMetrics),
        };

        let bus = Arc::new(EventBus::spawn_with(
            BusConfig {
                capacity: self.config.event_bus.capacity,
                subscriber_capacity: self.config.event_bus.subscriber_capacity,
                publish_timeout: self.config.publish_timeout(),
                ..BusConfig::default()
            },
            Some(Arc::new(MetricsDepthSink(Arc::clone(&metrics)))),
        ));

        let memory = self.memory;
        let gates: Arc<dyn GateStore> = match self.gates {
            Some(gates) => gates,
            None => memory.clone(),
        };
        let approvals = Arc::new(ApprovalEngine::new(
            gates,
            self.config.approval_poll_interval(),
        ));

        let jobs: Arc<dyn JobStore> = match self.jobs {
            Some(store) => store,
            None => memory.clone(),
        };
        let builds: Arc<dyn BuildStore> = match self.builds {
            Some(store) => store,
            None => memory.clone(),
        };
        let policies: Arc<dyn PolicyStore> = match self.policies {
            Some(store) => store,
            None => memory.clone(),
        };
        let schedules: Arc<dyn ScheduleStore> = match self.schedules {
            Some(store) => store,
            None => memory.clone(),
        };
        let notifications: Arc<dyn NotificationLog> = match self.notifications {
            Some(log) => log,
            None => memory.clone(),
        };
        let result_cache: Arc<dyn ResultCache> = match self.result_cache {
            Some(cache) => cache,
            None => memory.clone(),
        };
        let cache_index: Arc<dyn CacheIndex> = match self.cache_index {
            Some(index) => index,
            None => memory.clone(),
        };
        let process: Arc<dyn ProcessExecutor> = match self.process {
            Some(process) => process,
            None => Arc::new(LocalExecutor),
        };
        let vcs: Arc<dyn VcsCheckout> = match self.vcs {
            Some(vcs) => vcs,
            None => Arc::new(NoopVcs),
        };
        let secrets: Arc<dyn SecretStore> = match self.secrets {
            Some(secrets) => secrets,
            None => Arc::new(NoopSecrets),
        };
        let status_reporter: Arc<dyn StatusReporter> = match self.status_reporter {
            Some(reporter) => reporter,
            None => Arc::new(NoopStatusReporter),
        };
        let flags: Arc<dyn FeatureFlags> = match self.flags {
            Some(flags) => flags,
            None => Arc::new(StaticFlags::default()),
        };

        let workspaces = WorkspaceManager::new(self.config.workspace.root.clone())?;
        let cache = Arc::new(CacheStore::new(self.config.cache.root.clone()));
        let build_slots = Arc::new(Semaphore::new(self.config.thread_pools.build_pool_size));

        Ok(CoreRuntime {
            bus,
            jobs,
            builds,
            policies,
            schedules,
            notifications,
            result_cache,
            cache_index,
            cache,
            approvals,
            workspaces,
            process,
            vcs,
            secrets,
            metrics,
            status_reporter,
            flags,
            plugins: Arc::new(self.plugins),
            active: ActiveBuilds::new(),
            build_slots,
            config: self.config,
        })
    }
}
