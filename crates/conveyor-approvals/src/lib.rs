// SPDX-License-Identifier: MIT OR Apache-2.0
//! Approval gate engine: a long-parking wait-point in the stage state
//! machine with wake-on-event and timeout.
//!
//! A waiting build never busy-loops and never pins a worker thread: the
//! wait is a `tokio::select!` over a per-gate [`Notify`] channel, the poll
//! interval, and the build's cancellation token. The web/API collaborator
//! resolves gates through [`ApprovalEngine::approve`] /
//! [`ApprovalEngine::reject`], which signal every registered waiter.
//!
//! Gate creation **fails closed**: when the store cannot persist the gate,
//! the guarded stage must not run.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use conveyor_cancel::CancelToken;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Gate model
// ---------------------------------------------------------------------------

/// Lifecycle status of an approval gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GateStatus {
    /// Waiting for approvals.
    Pending,
    /// Accumulated approvals met the minimum.
    Approved,
    /// Explicitly rejected.
    Rejected,
    /// The timeout elapsed while pending.
    TimedOut,
}

/// One recorded approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    /// Who approved.
    pub user: String,
    /// When.
    pub at: DateTime<Utc>,
}

/// A persisted approval gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalGate {
    /// Gate identifier.
    pub id: Uuid,
    /// Build the gate belongs to.
    pub build_id: Uuid,
    /// Guarded stage name.
    pub stage: String,
    /// Role required to approve.
    pub required_role: String,
    /// Approver groups (stage declaration unioned with policy overrides).
    pub approver_groups: Vec<String>,
    /// Minimum number of distinct approvals.
    pub min_approvals: u32,
    /// Message shown to approvers.
    pub message: Option<String>,
    /// Creation instant; the timeout counts from here.
    pub created_at: DateTime<Utc>,
    /// How long the gate stays open.
    pub timeout: Duration,
    /// Current status.
    pub status: GateStatus,
    /// Accumulated approvals, in arrival order.
    pub approvals: Vec<ApprovalRecord>,
    /// Who rejected, when rejected.
    pub rejected_by: Option<String>,
}

impl ApprovalGate {
    /// `true` once `now` is past the creation instant plus the timeout.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let elapsed = now.signed_duration_since(self.created_at);
        elapsed.to_std().map_or(false, |e| e > self.timeout)
    }

    /// Distinct approvers so far.
    #[must_use]
    pub fn distinct_approvals(&self) -> usize {
        let mut users: Vec<&str> = self.approvals.iter().map(|a| a.user.as_str()).collect();
        users.sort_unstable();
        users.dedup();
        users.len()
    }
}

/// What the engine needs to open a gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateRequest {
    /// Build the gate belongs to.
    pub build_id: Uuid,
    /// Guarded stage name.
    pub stage: String,
    /// Role required to approve.
    pub required_role: String,
    /// Approver groups after override folding.
    pub approver_groups: Vec<String>,
    /// Minimum approvals after override folding.
    pub min_approvals: u32,
    /// Message shown to approvers.
    pub message: Option<String>,
    /// Gate timeout.
    pub timeout: Duration,
}

/// Result of waiting on a gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    /// The gate was approved; the stage may run.
    Proceed {
        /// Users whose approvals satisfied the gate.
        approved_by: Vec<String>,
    },
    /// The gate was rejected, timed out, or could not be created.
    Denied {
        /// Human-readable reason recorded on the stage.
        reason: String,
    },
}

impl GateOutcome {
    /// `true` when the stage may run.
    #[must_use]
    pub fn proceed(&self) -> bool {
        matches!(self, Self::Proceed { .. })
    }
}

// ---------------------------------------------------------------------------
// Store contract
// ---------------------------------------------------------------------------

/// Persistence contract for approval gates.
#[async_trait::async_trait]
pub trait GateStore: Send + Sync {
    /// Persist a freshly created gate.
    async fn create_gate(&self, gate: &ApprovalGate) -> anyhow::Result<()>;
    /// Load a gate by id.
    async fn load_gate(&self, gate_id: Uuid) -> anyhow::Result<Option<ApprovalGate>>;
    /// Replace a gate's persisted state.
    async fn update_gate(&self, gate: &ApprovalGate) -> anyhow::Result<()>;
    /// All pending gates for a build, for prompt rendering.
    async fn pending_gates(&self, build_id: Uuid) -> anyhow::Result<Vec<ApprovalGate>>;
}

/// Errors from gate resolution operations.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// The gate id resolves to nothing.
    #[error("gate {0} not found")]
    NotFound(Uuid),
    /// The gate is already approved, rejected, or timed out.
    #[error("gate {id} already resolved as {status:?}")]
    AlreadyResolved {
        /// The gate.
        id: Uuid,
        /// Its terminal status.
        status: GateStatus,
    },
    /// The store failed.
    #[error("gate store failure")]
    Store(#[from] anyhow::Error),
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

type Waiters = Mutex<HashMap<Uuid, Vec<Arc<Notify>>>>;

/// The approval engine: gate creation, resolution, and the wait protocol.
pub struct ApprovalEngine {
    store: Arc<dyn GateStore>,
    waiters: Waiters,
    poll_interval: Duration,
}

impl ApprovalEngine {
    /// Create an engine over the given store.
    pub fn new(store: Arc<dyn GateStore>, poll_interval: Duration) -> Self {
        Self {
            store,
            waiters: Mutex::new(HashMap::new()),
            poll_interval,
        }
    }

    /// Atomically create a gate.
    ///
    /// # Errors
    ///
    /// Returns the store error; callers must fail closed (the guarded stage
    /// never runs).
    pub async fn open_gate(&self, request: GateRequest) -> anyhow::Result<ApprovalGate> {
        let gate = ApprovalGate {
            id: Uuid::new_v4(),
            build_id: request.build_id,
            stage: request.stage,
            required_role: request.required_role,
            approver_groups: request.approver_groups,
            min_approvals: request.min_approvals.max(1),
            message: request.message,
            created_at: Utc::now(),
            timeout: request.timeout,
            status: GateStatus::Pending,
            approvals: Vec::new(),
            rejected_by: None,
        };
        self.store.create_gate(&gate).await?;
        info!(
            target: "conveyor.approvals",
            gate_id = %gate.id,
            build_id = %gate.build_id,
            stage = %gate.stage,
            min_approvals = gate.min_approvals,
            "approval gate opened"
        );
        Ok(gate)
    }

    /// Record an approval; transitions the gate to `Approved` once the
    /// distinct-approver count meets the minimum.
    ///
    /// # Errors
    ///
    /// [`GateError::NotFound`] for unknown ids, [`GateError::AlreadyResolved`]
    /// for gates past `Pending`.
    pub async fn approve(&self, gate_id: Uuid, user: &str) -> Result<GateStatus, GateError> {
        let mut gate = self.load_pending(gate_id).await?;
        gate.approvals.push(ApprovalRecord {
            user: user.to_string(),
            at: Utc::now(),
        });
        if gate.distinct_approvals() as u32 >= gate.min_approvals {
            gate.status = GateStatus::Approved;
        }
        self.store.update_gate(&gate).await?;
        if gate.status != GateStatus::Pending {
            self.notify_resolved(gate_id);
        }
        Ok(gate.status)
    }

    /// Reject the gate outright.
    ///
    /// # Errors
    ///
    /// Same as [`approve`](Self::approve).
    pub async fn reject(&self, gate_id: Uuid, user: &str) -> Result<GateStatus, GateError> {
        let mut gate = self.load_pending(gate_id).await?;
        gate.status = GateStatus::Rejected;
        gate.rejected_by = Some(user.to_string());
        self.store.update_gate(&gate).await?;
        self.notify_resolved(gate_id);
        Ok(gate.status)
    }

    /// Wake every waiter registered for `gate_id`.
    ///
    /// Called by the web/API collaborator after it mutates gate state out of
    /// band; [`approve`](Self::approve) and [`reject`](Self::reject) call it
    /// themselves.
    pub fn notify_resolved(&self, gate_id: Uuid) {
        let table = self.waiters.lock().expect("gate waiters lock poisoned");
        if let Some(list) = table.get(&gate_id) {
            for notify in list {
                notify.notify_one();
            }
        }
    }

    /// Park until the gate resolves, times out, or the build is cancelled.
    ///
    /// The wait yields the task between polls; wake-up arrives through the
    /// per-gate notification channel, the poll interval, or cancellation —
    /// whichever fires first.
    pub async fn wait(&self, gate_id: Uuid, cancel: &CancelToken) -> GateOutcome {
        let notify = self.register_waiter(gate_id);
        let outcome = self.wait_inner(gate_id, cancel, &notify).await;
        self.remove_waiter(gate_id, &notify);
        outcome
    }

    async fn wait_inner(
        &self,
        gate_id: Uuid,
        cancel: &CancelToken,
        notify: &Arc<Notify>,
    ) -> GateOutcome {
        loop {
            let gate = match self.store.load_gate(gate_id).await {
                Ok(Some(gate)) => gate,
                Ok(None) => {
                    warn!(target: "conveyor.approvals", gate_id = %gate_id, "gate vanished while waiting");
                    return GateOutcome::Denied {
                        reason: "approval gate no longer exists".to_string(),
                    };
                }
                Err(e) => {
                    warn!(target: "conveyor.approvals", gate_id = %gate_id, error = %e, "gate store failure while waiting");
                    return GateOutcome::Denied {
                        reason: "approval gate state unavailable".to_string(),
                    };
                }
            };

            match gate.status {
                GateStatus::Approved => {
                    let mut approved_by: Vec<String> =
                        gate.approvals.iter().map(|a| a.user.clone()).collect();
                    approved_by.sort();
                    approved_by.dedup();
                    return GateOutcome::Proceed { approved_by };
                }
                GateStatus::Rejected => {
                    let who = gate.rejected_by.as_deref().unwrap_or("unknown");
                    return GateOutcome::Denied {
                        reason: format!("rejected by {who}"),
                    };
                }
                GateStatus::TimedOut => {
                    return GateOutcome::Denied {
                        reason: "Approval timed out".to_string(),
                    };
                }
                GateStatus::Pending => {}
            }

            if gate.is_expired(Utc::now()) {
                let mut expired = gate;
                expired.status = GateStatus::TimedOut;
                if let Err(e) = self.store.update_gate(&expired).await {
                    warn!(target: "conveyor.approvals", gate_id = %gate_id, error = %e, "failed to persist gate timeout");
                }
                info!(target: "conveyor.approvals", gate_id = %gate_id, "approval gate timed out");
                return GateOutcome::Denied {
                    reason: "Approval timed out".to_string(),
                };
            }

            if cancel.is_cancelled() {
                let mut cancelled = gate;
                cancelled.status = GateStatus::Rejected;
                cancelled.rejected_by = Some("system:build-cancelled".to_string());
                if let Err(e) = self.store.update_gate(&cancelled).await {
                    warn!(target: "conveyor.approvals", gate_id = %gate_id, error = %e, "failed to persist gate cancellation");
                }
                return GateOutcome::Denied {
                    reason: "build cancelled".to_string(),
                };
            }

            debug!(target: "conveyor.approvals", gate_id = %gate_id, "gate still pending, re-parking");
            tokio::select! {
                () = notify.notified() => {}
                () = tokio::time::sleep(self.poll_interval) => {}
                () = cancel.cancelled() => {}
            }
        }
    }

    /// Pending gates for a build, for API collaborators rendering prompts.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn pending_for_build(&self, build_id: Uuid) -> anyhow::Result<Vec<ApprovalGate>> {
        self.store.pending_gates(build_id).await
    }

    async fn load_pending(&self, gate_id: Uuid) -> Result<ApprovalGate, GateError> {
        let gate = self
            .store
            .load_gate(gate_id)
            .await?
            .ok_or(GateError::NotFound(gate_id))?;
        if gate.status != GateStatus::Pending {
            return Err(GateError::AlreadyResolved {
                id: gate_id,
                status: gate.status,
            });
        }
        Ok(gate)
    }

    fn register_waiter(&self, gate_id: Uuid) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.waiters
            .lock()
            .expect("gate waiters lock poisoned")
            .entry(gate_id)
            .or_default()
            .push(Arc::clone(&notify));
        notify
    }

    fn remove_waiter(&self, gate_id: Uuid, notify: &Arc<Notify>) {
        let mut table = self.waiters.lock().expect("gate waiters lock poisoned");
        if let Some(list) = table.get_mut(&gate_id) {
            list.retain(|n| !Arc::ptr_eq(n, notify));
            if list.is_empty() {
                table.remove(&gate_id);
            }
        }
    }
}
