// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-build publish/subscribe event bus with adaptive backpressure.
//!
//! Publishers classify events by their kind's criticality: critical
//! lifecycle events use a blocking enqueue with a timeout; everything else
//! is a non-blocking offer that may be dropped when the main channel is
//! full. A single dispatcher task fans events out to per-build subscriber
//! queues, so a given subscriber always observes one build's events in
//! publish order. Slow subscribers only lose their own events — the
//! dispatcher never blocks on a full subscriber queue.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use conveyor_core::BuildEvent;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default main channel capacity.
pub const DEFAULT_CAPACITY: usize = 4_096;
/// Default per-subscriber queue capacity.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;
/// Default blocking-publish timeout for critical events.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(30);
/// Default queue-depth sampling interval.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Outcome and stats
// ---------------------------------------------------------------------------

/// Result of a publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The event entered the main channel.
    Enqueued,
    /// Critical publish blocked until the timeout and gave up.
    Timeout,
    /// Non-critical publish found the channel full.
    Dropped,
}

/// Shared statistics counters for an [`EventBus`].
#[derive(Debug, Default)]
struct StatsInner {
    published: AtomicU64,
    dropped: AtomicU64,
    publish_timeouts: AtomicU64,
    subscriber_drops: AtomicU64,
}

/// Point-in-time snapshot of bus statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusStats {
    /// Events that entered the main channel.
    pub published: u64,
    /// Non-critical events dropped at the main channel.
    pub dropped: u64,
    /// Critical publishes that hit the timeout.
    pub publish_timeouts: u64,
    /// Events lost to full subscriber queues.
    pub subscriber_drops: u64,
}

/// First-class hook the depth sampler reports into.
///
/// Implemented by the metrics collaborator; the bus never needs reflection
/// into its own channel internals.
pub trait DepthSink: Send + Sync {
    /// Record the current main-channel depth.
    fn record_depth(&self, depth: usize);
}

// ---------------------------------------------------------------------------
// Bus configuration
// ---------------------------------------------------------------------------

/// Tunables for an [`EventBus`].
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Main channel capacity.
    pub capacity: usize,
    /// Per-subscriber queue capacity.
    pub subscriber_capacity: usize,
    /// Blocking-publish timeout for critical events.
    pub publish_timeout: Duration,
    /// Queue-depth sampling interval.
    pub sample_interval: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
        }
    }
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

struct SubEntry {
    id: Uuid,
    tx: mpsc::Sender<BuildEvent>,
}

type SubTable = Arc<Mutex<HashMap<Uuid, Vec<SubEntry>>>>;

/// A handle for receiving one build's events.
///
/// Dropping the subscription detaches it; the dispatcher prunes closed
/// queues lazily. [`EventBus::unsubscribe`] removes it eagerly.
pub struct Subscription {
    id: Uuid,
    build_id: Uuid,
    rx: mpsc::Receiver<BuildEvent>,
}

impl Subscription {
    /// The build this subscription is filtered to.
    #[must_use]
    pub fn build_id(&self) -> Uuid {
        self.build_id
    }

    /// Receive the next event, waiting asynchronously.
    ///
    /// Returns `None` once the subscription is detached and drained.
    pub async fn recv(&mut self) -> Option<BuildEvent> {
        self.rx.recv().await
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&mut self) -> Option<BuildEvent> {
        self.rx.try_recv().ok()
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Process-wide publish/subscribe hub keyed on build id.
pub struct EventBus {
    tx: mpsc::Sender<BuildEvent>,
    subs: SubTable,
    stats: Arc<StatsInner>,
    capacity: usize,
    subscriber_capacity: usize,
    publish_timeout: Duration,
}

impl EventBus {
    /// Spawn a bus with default configuration and no depth sink.
    #[must_use]
    pub fn spawn() -> Self {
        Self::spawn_with(BusConfig::default(), None)
    }

    /// Spawn a bus, its dispatcher task, and (when a sink is given) the
    /// background depth sampler.
    #[must_use]
    pub fn spawn_with(config: BusConfig, depth_sink: Option<Arc<dyn DepthSink>>) -> Self {
        let (tx, mut rx) = mpsc::channel::<BuildEvent>(config.capacity);
        let subs: SubTable = Arc::new(Mutex::new(HashMap::new()));
        let stats = Arc::new(StatsInner::default());

        let dispatch_subs = Arc::clone(&subs);
        let dispatch_stats = Arc::clone(&stats);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                dispatch(&dispatch_subs, &dispatch_stats, event);
            }
            debug!(target: "conveyor.bus", "dispatcher stopped");
        });

        if let Some(sink) = depth_sink {
            let weak = tx.downgrade();
            let capacity = config.capacity;
            let interval = config.sample_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    let Some(tx) = weak.upgrade() else { break };
                    sink.record_depth(capacity - tx.capacity());
                }
            });
        }

        Self {
            tx,
            subs,
            stats,
            capacity: config.capacity,
            subscriber_capacity: config.subscriber_capacity,
            publish_timeout: config.publish_timeout,
        }
    }

    /// Publish an event.
    ///
    /// Critical events block up to the configured timeout; non-critical
    /// events are offered without blocking and dropped when the channel is
    /// full.
    pub async fn publish(&self, event: BuildEvent) -> PublishOutcome {
        let kind = event.kind;
        if kind.is_critical() {
            match self.tx.send_timeout(event, self.publish_timeout).await {
                Ok(()) => {
                    self.stats.published.fetch_add(1, Ordering::Relaxed);
                    PublishOutcome::Enqueued
                }
                Err(mpsc::error::SendTimeoutError::Timeout(ev)) => {
                    self.stats.publish_timeouts.fetch_add(1, Ordering::Relaxed);
                    error!(
                        target: "conveyor.bus",
                        build_id = %ev.build_id,
                        kind = %ev.kind,
                        timeout_ms = self.publish_timeout.as_millis() as u64,
                        "critical event publish timed out"
                    );
                    PublishOutcome::Timeout
                }
                Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                    self.stats.publish_timeouts.fetch_add(1, Ordering::Relaxed);
                    error!(target: "conveyor.bus", kind = %kind, "bus closed during publish");
                    PublishOutcome::Timeout
                }
            }
        } else {
            match self.tx.try_send(event) {
                Ok(()) => {
                    self.stats.published.fetch_add(1, Ordering::Relaxed);
                    PublishOutcome::Enqueued
                }
                Err(_) => {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    PublishOutcome::Dropped
                }
            }
        }
    }

    /// Create a subscription receiving all future events for `build_id`.
    #[must_use]
    pub fn subscribe(&self, build_id: Uuid) -> Subscription {
        let (tx, rx) = mpsc::channel(self.subscriber_capacity);
        let id = Uuid::new_v4();
        self.subs
            .lock()
            .expect("subscriber table lock poisoned")
            .entry(build_id)
            .or_default()
            .push(SubEntry { id, tx });
        Subscription { id, build_id, rx }
    }

    /// Detach a subscription and release its queue.
    pub fn unsubscribe(&self, subscription: Subscription) {
        let mut table = self.subs.lock().expect("subscriber table lock poisoned");
        if let Some(entries) = table.get_mut(&subscription.build_id) {
            entries.retain(|e| e.id != subscription.id);
            if entries.is_empty() {
                table.remove(&subscription.build_id);
            }
        }
    }

    /// Number of subscriptions currently attached to `build_id`.
    #[must_use]
    pub fn subscriber_count(&self, build_id: Uuid) -> usize {
        self.subs
            .lock()
            .expect("subscriber table lock poisoned")
            .get(&build_id)
            .map_or(0, Vec::len)
    }

    /// Main channel capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Snapshot of the bus statistics.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.stats.published.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            publish_timeouts: self.stats.publish_timeouts.load(Ordering::Relaxed),
            subscriber_drops: self.stats.subscriber_drops.load(Ordering::Relaxed),
        }
    }
}

/// Route one event to every live subscriber of its build.
///
/// Full or closed subscriber queues are skipped; closed ones are pruned.
fn dispatch(subs: &SubTable, stats: &StatsInner, event: BuildEvent) {
    let mut table = subs.lock().expect("subscriber table lock poisoned");
    let Some(entries) = table.get_mut(&event.build_id) else {
        return;
    };
    entries.retain(|entry| !entry.tx.is_closed());
    for entry in entries.iter() {
        if entry.tx.try_send(event.clone()).is_err() {
            stats.subscriber_drops.fetch_add(1, Ordering::Relaxed);
            warn!(
                target: "conveyor.bus",
                build_id = %event.build_id,
                kind = %event.kind,
                "subscriber queue full, event dropped for that subscriber"
            );
        }
    }
    if entries.is_empty() {
        table.remove(&event.build_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::EventKind;

    fn event(build_id: Uuid, kind: EventKind) -> BuildEvent {
        BuildEvent::new(build_id, kind)
    }

    #[tokio::test]
    async fn subscriber_receives_matching_events_in_order() {
        let bus = EventBus::spawn();
        let build = Uuid::new_v4();
        let mut sub = bus.subscribe(build);

        for kind in [
            EventKind::BuildStarted,
            EventKind::StageStarted,
            EventKind::StageCompleted,
            EventKind::BuildCompleted,
        ] {
            assert_eq!(bus.publish(event(build, kind)).await, PublishOutcome::Enqueued);
        }

        assert_eq!(sub.recv().await.unwrap().kind, EventKind::BuildStarted);
        assert_eq!(sub.recv().await.unwrap().kind, EventKind::StageStarted);
        assert_eq!(sub.recv().await.unwrap().kind, EventKind::StageCompleted);
        assert_eq!(sub.recv().await.unwrap().kind, EventKind::BuildCompleted);
    }

    #[tokio::test]
    async fn events_are_routed_by_build_id() {
        let bus = EventBus::spawn();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut sub_a = bus.subscribe(a);

        bus.publish(event(b, EventKind::BuildStarted)).await;
        bus.publish(event(a, EventKind::BuildStarted)).await;

        let got = sub_a.recv().await.unwrap();
        assert_eq!(got.build_id, a);
        assert!(sub_a.try_recv().is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_loses_only_its_own_events() {
        let config = BusConfig {
            subscriber_capacity: 1,
            ..BusConfig::default()
        };
        let bus = EventBus::spawn_with(config, None);
        let build = Uuid::new_v4();
        let mut slow = bus.subscribe(build);
        let mut healthy = bus.subscribe(build);

        // Never drain `slow`; its 1-slot queue overflows after the first event.
        for _ in 0..5 {
            bus.publish(event(build, EventKind::StepStarted)).await;
        }
        // Give the dispatcher a moment to fan out.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut healthy_count = 0;
        while healthy.try_recv().is_some() {
            healthy_count += 1;
        }
        assert_eq!(healthy_count, 5, "healthy subscriber must see every event");

        let mut slow_count = 0;
        while slow.try_recv().is_some() {
            slow_count += 1;
        }
        assert_eq!(slow_count, 1);
        assert_eq!(bus.stats().subscriber_drops, 4);
    }

    #[tokio::test]
    async fn noncritical_publish_drops_when_channel_is_full() {
        // Tiny main channel with no subscriber draining it.
        let config = BusConfig {
            capacity: 1,
            ..BusConfig::default()
        };
        let bus = EventBus::spawn_with(config, None);
        let build = Uuid::new_v4();

        // Fill the channel faster than the dispatcher drains it. With no
        // yields the dispatcher task has not run yet, so the second offer
        // sees a full channel.
        let first = bus.publish(event(build, EventKind::GitStarted)).await;
        let second = bus.publish(event(build, EventKind::GitCompleted)).await;
        assert_eq!(first, PublishOutcome::Enqueued);
        assert_eq!(second, PublishOutcome::Dropped);
        assert_eq!(bus.stats().dropped, 1);
    }

    #[tokio::test]
    async fn unsubscribe_detaches_the_queue() {
        let bus = EventBus::spawn();
        let build = Uuid::new_v4();
        let sub = bus.subscribe(build);
        assert_eq!(bus.subscriber_count(build), 1);
        bus.unsubscribe(sub);
        assert_eq!(bus.subscriber_count(build), 0);
    }

    #[tokio::test]
    async fn depth_sampler_reports_into_the_sink() {
        struct Recorder(AtomicU64);
        impl DepthSink for Recorder {
            fn record_depth(&self, _depth: usize) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let sink = Arc::new(Recorder(AtomicU64::new(0)));
        let config = BusConfig {
            sample_interval: Duration::from_millis(10),
            ..BusConfig::default()
        };
        let _bus = EventBus::spawn_with(config, Some(sink.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sink.0.load(Ordering::Relaxed) >= 2);
    }

    #[tokio::test]
    async fn stats_count_published_events() {
        let bus = EventBus::spawn();
        let build = Uuid::new_v4();
        bus.publish(event(build, EventKind::BuildStarted)).await;
        bus.publish(event(build, EventKind::BuildCompleted)).await;
        assert_eq!(bus.stats().published, 2);
        assert_eq!(bus.stats().publish_timeouts, 0);
    }
}
