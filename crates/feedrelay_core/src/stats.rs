//! Relay statistics.
//!
//! Counters are atomic and can be read while the relay is running. They are
//! cumulative over the lifetime of a [`Relay`](crate::Relay) across restarts.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Relay statistics and metrics.
#[derive(Debug, Default)]
pub struct RelayStats {
    // Consumer path
    events_received: AtomicU64,
    events_filtered: AtomicU64,
    events_handled: AtomicU64,

    // Publish tasks
    published: AtomicU64,
    publish_failures: AtomicU64,
    in_flight: AtomicU64,
    max_in_flight: AtomicU64,

    // Checkpoints
    checkpoints_written: AtomicU64,
    checkpoint_failures: AtomicU64,

    last_error: Mutex<Option<String>>,
}

impl RelayStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_filtered(&self) {
        self.events_filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handled(&self) {
        self.events_handled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_publish_failure(&self, error: &str) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
        self.record_error(error);
    }

    /// Marks a publish task as started and tracks the high-water mark.
    pub(crate) fn task_started(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    pub(crate) fn task_finished(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn record_checkpoint(&self) {
        self.checkpoints_written.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_checkpoint_failure(&self, error: &str) {
        self.checkpoint_failures.fetch_add(1, Ordering::Relaxed);
        self.record_error(error);
    }

    pub(crate) fn record_error(&self, error: &str) {
        *self.last_error.lock() = Some(error.to_string());
    }

    /// Events received from the subscription, before filtering.
    pub fn events_received(&self) -> u64 {
        self.events_received.load(Ordering::Relaxed)
    }

    /// Events dropped because their kind is not relayed.
    pub fn events_filtered(&self) -> u64 {
        self.events_filtered.load(Ordering::Relaxed)
    }

    /// Events transformed and handed to the fan-out pool.
    pub fn events_handled(&self) -> u64 {
        self.events_handled.load(Ordering::Relaxed)
    }

    /// Successful publishes.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Failed publishes.
    pub fn publish_failures(&self) -> u64 {
        self.publish_failures.load(Ordering::Relaxed)
    }

    /// Publish tasks currently running.
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of publish tasks that ran at once.
    pub fn max_in_flight(&self) -> u64 {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Checkpoint writes that succeeded.
    pub fn checkpoints_written(&self) -> u64 {
        self.checkpoints_written.load(Ordering::Relaxed)
    }

    /// Checkpoint writes that failed.
    pub fn checkpoint_failures(&self) -> u64 {
        self.checkpoint_failures.load(Ordering::Relaxed)
    }

    /// Message of the most recent error.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Returns a snapshot of all stats.
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            events_received: self.events_received(),
            events_filtered: self.events_filtered(),
            events_handled: self.events_handled(),
            published: self.published(),
            publish_failures: self.publish_failures(),
            in_flight: self.in_flight(),
            max_in_flight: self.max_in_flight(),
            checkpoints_written: self.checkpoints_written(),
            checkpoint_failures: self.checkpoint_failures(),
            last_error: self.last_error(),
        }
    }
}

/// A point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RelayStatsSnapshot {
    /// Events received from the subscription.
    pub events_received: u64,
    /// Events dropped by the operation filter.
    pub events_filtered: u64,
    /// Events handed to the fan-out pool.
    pub events_handled: u64,
    /// Successful publishes.
    pub published: u64,
    /// Failed publishes.
    pub publish_failures: u64,
    /// Publish tasks running when the snapshot was taken.
    pub in_flight: u64,
    /// Highest number of concurrent publish tasks.
    pub max_in_flight: u64,
    /// Successful checkpoint writes.
    pub checkpoints_written: u64,
    /// Failed checkpoint writes.
    pub checkpoint_failures: u64,
    /// Most recent error message.
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_and_snapshot() {
        let stats = RelayStats::new();
        stats.record_received();
        stats.record_received();
        stats.record_filtered();
        stats.record_handled();
        stats.record_published();
        stats.record_checkpoint();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.events_received, 2);
        assert_eq!(snapshot.events_filtered, 1);
        assert_eq!(snapshot.events_handled, 1);
        assert_eq!(snapshot.published, 1);
        assert_eq!(snapshot.checkpoints_written, 1);
        assert!(snapshot.last_error.is_none());
    }

    #[test]
    fn in_flight_high_water_mark() {
        let stats = RelayStats::new();
        stats.task_started();
        stats.task_started();
        stats.task_finished();
        stats.task_started();
        stats.task_finished();
        stats.task_finished();

        assert_eq!(stats.in_flight(), 0);
        assert_eq!(stats.max_in_flight(), 2);
    }

    #[test]
    fn failures_record_last_error() {
        let stats = RelayStats::new();
        stats.record_publish_failure("nack");
        assert_eq!(stats.last_error().as_deref(), Some("nack"));

        stats.record_checkpoint_failure("store down");
        assert_eq!(stats.publish_failures(), 1);
        assert_eq!(stats.checkpoint_failures(), 1);
        assert_eq!(stats.last_error().as_deref(), Some("store down"));
    }
}
