// SPDX-License-Identifier: MIT OR Apache-2.0
//! Atomic build metrics with a serialisable snapshot.
//!
//! [`EngineMetrics`] is the shipped [`MetricsSink`]: it keeps process-local
//! counters that embedders can read without an external metrics system.
//! Deployments with a real backend replace it through the runtime builder.

use crate::collab::MetricsSink;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

/// Atomic counters fed through the [`MetricsSink`] seam.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    builds_started: AtomicU64,
    builds_succeeded: AtomicU64,
    builds_failed: AtomicU64,
    builds_aborted: AtomicU64,
    cumulative_build_ms: AtomicU64,
    last_queue_depth: AtomicU64,
}

impl EngineMetrics {
    /// Create a zeroed collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time snapshot of the counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let started = self.builds_started.load(Relaxed);
        let finished = self.builds_succeeded.load(Relaxed)
            + self.builds_failed.load(Relaxed)
            + self.builds_aborted.load(Relaxed);
        MetricsSnapshot {
            builds_started: started,
            builds_succeeded: self.builds_succeeded.load(Relaxed),
            builds_failed: self.builds_failed.load(Relaxed),
            builds_aborted: self.builds_aborted.load(Relaxed),
            average_build_duration_ms: if finished == 0 {
                0
            } else {
                self.cumulative_build_ms.load(Relaxed) / finished
            },
            event_bus_queue_depth: self.last_queue_depth.load(Relaxed),
        }
    }
}

impl MetricsSink for EngineMetrics {
    fn incr_counter(&self, name: &str, _labels: &[(&str, &str)]) -> anyhow::Result<()> {
        if name == "builds_started" {
            self.builds_started.fetch_add(1, Relaxed);
        }
        Ok(())
    }

    fn observe_histogram(
        &self,
        name: &str,
        value: f64,
        labels: &[(&str, &str)],
    ) -> anyhow::Result<()> {
        match name {
            "build_duration_ms" => {
                self.cumulative_build_ms.fetch_add(value as u64, Relaxed);
                let status = labels
                    .iter()
                    .find(|(k, _)| *k == "status")
                    .map(|(_, v)| *v)
                    .unwrap_or("");
                match status {
                    "success" => self.builds_succeeded.fetch_add(1, Relaxed),
                    "failure" => self.builds_failed.fetch_add(1, Relaxed),
                    "aborted" => self.builds_aborted.fetch_add(1, Relaxed),
                    _ => 0,
                };
            }
            "event_bus_queue_depth" => {
                self.last_queue_depth.store(value as u64, Relaxed);
            }
            _ => {}
        }
        Ok(())
    }
}

/// Non-atomic, serialisable snapshot of [`EngineMetrics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Builds that entered execution.
    pub builds_started: u64,
    /// Builds that finalized as success.
    pub builds_succeeded: u64,
    /// Builds that finalized as failure.
    pub builds_failed: u64,
    /// Builds that finalized as aborted.
    pub builds_aborted: u64,
    /// Running average of finalized build durations.
    pub average_build_duration_ms: u64,
    /// Most recent sampled event-bus depth.
    pub event_bus_queue_depth: u64,
}
