// SPDX-License-Identifier: MIT OR Apache-2.0
//! Execution context threaded through components for scoped logging.
//!
//! Replaces thread-local logging context with an explicit value: every
//! component that logs takes a [`RunContext`] and attaches its fields.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies where in a build's execution a log line or error originated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    /// The build being executed.
    pub build_id: Uuid,
    /// Owning job name.
    pub job: String,
    /// Current stage, once stage execution has begun.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Current step, once step execution has begun.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    /// Correlation id spanning the whole build.
    pub trace_id: Uuid,
}

impl RunContext {
    /// Root context for a build, with a fresh trace id.
    #[must_use]
    pub fn for_build(build_id: Uuid, job: impl Into<String>) -> Self {
        Self {
            build_id,
            job: job.into(),
            stage: None,
            step: None,
            trace_id: Uuid::new_v4(),
        }
    }

    /// Derive a context scoped to a stage.
    #[must_use]
    pub fn stage(&self, name: impl Into<String>) -> Self {
        Self {
            stage: Some(name.into()),
            step: None,
            ..self.clone()
        }
    }

    /// Derive a context scoped to a step within the current stage.
    #[must_use]
    pub fn step(&self, name: impl Into<String>) -> Self {
        Self {
            step: Some(name.into()),
            ..self.clone()
        }
    }
}
