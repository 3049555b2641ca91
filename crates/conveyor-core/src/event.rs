// SPDX-License-Identifier: MIT OR Apache-2.0
//! Typed build events: the wire contract of the event bus.
//!
//! Critical kinds mark build lifecycle transitions a consumer cannot afford
//! to miss; the bus gives them a blocking-with-timeout publish path while
//! everything else is fire-and-forget.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Event type vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    /// Build created and waiting for a worker.
    BuildQueued,
    /// Build picked up and executing.
    BuildStarted,
    /// Build finalized; `data.status` carries the terminal status.
    BuildCompleted,
    /// Build cancelled by request.
    BuildCancelled,
    /// Stage began its check pipeline.
    StageStarted,
    /// Stage finished; `data.status` carries the stage status.
    StageCompleted,
    /// Stage replayed from the result cache.
    StageCached,
    /// Stage condition evaluated false.
    StageSkipped,
    /// A policy denied the stage.
    StagePolicyDenied,
    /// Step began executing.
    StepStarted,
    /// Step finished; `data.status` carries the step status.
    StepCompleted,
    /// Checkout began.
    GitStarted,
    /// Checkout succeeded.
    GitCompleted,
    /// Checkout failed.
    GitFailed,
    /// An approval gate was created and is awaiting consent.
    ApprovalRequested,
}

impl EventKind {
    /// Whether loss of this event would hide a lifecycle transition.
    ///
    /// Critical events are published with a blocking enqueue and a timeout;
    /// non-critical events are offered without blocking and may be dropped.
    #[must_use]
    pub fn is_critical(self) -> bool {
        matches!(
            self,
            Self::BuildStarted
                | Self::BuildCompleted
                | Self::BuildCancelled
                | Self::StageStarted
                | Self::StageCompleted
                | Self::StepStarted
                | Self::StepCompleted
        )
    }

    /// Stable string form matching the serde representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BuildQueued => "build-queued",
            Self::BuildStarted => "build-started",
            Self::BuildCompleted => "build-completed",
            Self::BuildCancelled => "build-cancelled",
            Self::StageStarted => "stage-started",
            Self::StageCompleted => "stage-completed",
            Self::StageCached => "stage-cached",
            Self::StageSkipped => "stage-skipped",
            Self::StagePolicyDenied => "stage-policy-denied",
            Self::StepStarted => "step-started",
            Self::StepCompleted => "step-completed",
            Self::GitStarted => "git-started",
            Self::GitCompleted => "git-completed",
            Self::GitFailed => "git-failed",
            Self::ApprovalRequested => "approval-requested",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event on the bus, routed by `build_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildEvent {
    /// Routing key: the build this event belongs to.
    pub build_id: Uuid,
    /// Event type.
    pub kind: EventKind,
    /// When the event was produced.
    pub timestamp: DateTime<Utc>,
    /// Structured payload; keys depend on the kind.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, serde_json::Value>,
}

impl BuildEvent {
    /// Create an event stamped with the current time and an empty payload.
    #[must_use]
    pub fn new(build_id: Uuid, kind: EventKind) -> Self {
        Self {
            build_id,
            kind,
            timestamp: Utc::now(),
            data: BTreeMap::new(),
        }
    }

    /// Attach a payload entry, serialising the value to JSON.
    ///
    /// Values that fail to serialise are skipped.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.data.insert(key.into(), v);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_KINDS: &[EventKind] = &[
        EventKind::BuildQueued,
        EventKind::BuildStarted,
        EventKind::BuildCompleted,
        EventKind::BuildCancelled,
        EventKind::StageStarted,
        EventKind::StageCompleted,
        EventKind::StageCached,
        EventKind::StageSkipped,
        EventKind::StagePolicyDenied,
        EventKind::StepStarted,
        EventKind::StepCompleted,
        EventKind::GitStarted,
        EventKind::GitCompleted,
        EventKind::GitFailed,
        EventKind::ApprovalRequested,
    ];

    #[test]
    fn critical_set_is_exactly_the_lifecycle_transitions() {
        let critical: Vec<_> = ALL_KINDS.iter().filter(|k| k.is_critical()).collect();
        assert_eq!(
            critical,
            vec![
                &EventKind::BuildStarted,
                &EventKind::BuildCompleted,
                &EventKind::BuildCancelled,
                &EventKind::StageStarted,
                &EventKind::StageCompleted,
                &EventKind::StepStarted,
                &EventKind::StepCompleted,
            ]
        );
    }

    #[test]
    fn serde_matches_as_str() {
        for kind in ALL_KINDS {
            let json = serde_json::to_string(kind).unwrap();
            assert_eq!(json, format!(r#""{}""#, kind.as_str()));
        }
    }

    #[test]
    fn as_str_values_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for kind in ALL_KINDS {
            assert!(seen.insert(kind.as_str()), "duplicate: {kind}");
        }
    }

    #[test]
    fn with_attaches_payload() {
        let ev = BuildEvent::new(Uuid::new_v4(), EventKind::StageCompleted)
            .with("stage", "Build")
            .with("status", "success");
        assert_eq!(ev.data["stage"], serde_json::json!("Build"));
        assert_eq!(ev.data["status"], serde_json::json!("success"));
    }

    #[test]
    fn event_serde_roundtrip() {
        let ev = BuildEvent::new(Uuid::new_v4(), EventKind::BuildStarted).with("number", 42);
        let json = serde_json::to_string(&ev).unwrap();
        let back: BuildEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ev);
    }
}
