// SPDX-License-Identifier: MIT OR Apache-2.0
//! The active-builds registry: build id → cancel token, enabling
//! cooperative cancellation and liveness queries.
//!
//! Registration returns an RAII guard; dropping it removes the entry, so
//! the id is absent on every exit path of execution — including panics
//! unwinding through the worker task.

use conveyor_cancel::CancelToken;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;
use uuid::Uuid;

type Table = Arc<Mutex<HashMap<Uuid, CancelToken>>>;

/// Process-wide table of builds currently executing.
#[derive(Clone, Default)]
pub struct ActiveBuilds {
    table: Table,
}

impl ActiveBuilds {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an entry for `build_id` and hand back the guard that removes
    /// it on drop.
    #[must_use]
    pub fn register(&self, build_id: Uuid) -> ActiveGuard {
        let token = CancelToken::new();
        self.table
            .lock()
            .expect("active builds lock poisoned")
            .insert(build_id, token.clone());
        ActiveGuard {
            table: Arc::clone(&self.table),
            build_id,
            token,
        }
    }

    /// Set the cancel flag and wake the worker. Returns whether the build
    /// was active. Best-effort and idempotent.
    pub fn cancel(&self, build_id: Uuid) -> bool {
        let token = self
            .table
            .lock()
            .expect("active builds lock poisoned")
            .get(&build_id)
            .cloned();
        match token {
            Some(token) => {
                token.cancel();
                info!(target: "conveyor.engine", build_id = %build_id, "build cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Whether the build is currently registered.
    #[must_use]
    pub fn is_active(&self, build_id: Uuid) -> bool {
        self.table
            .lock()
            .expect("active builds lock poisoned")
            .contains_key(&build_id)
    }

    /// Number of builds currently executing.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.lock().expect("active builds lock poisoned").len()
    }

    /// `true` when nothing is executing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// RAII registration: removes the entry when dropped.
pub struct ActiveGuard {
    table: Table,
    build_id: Uuid,
    token: CancelToken,
}

impl ActiveGuard {
    /// The cancel token observed by every suspension point of the build.
    #[must_use]
    pub fn token(&self) -> &CancelToken {
        &self.token
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.table
            .lock()
            .expect("active builds lock poisoned")
            .remove(&self.build_id);
    }
}
