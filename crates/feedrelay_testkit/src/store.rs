//! Instrumented checkpoint store.

use async_trait::async_trait;
use feedrelay_checkpoint::{
    Checkpoint, CheckpointResult, CheckpointStore, InMemoryCheckpointStore,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// An in-memory checkpoint store that records every write.
///
/// Keeps the full write history, can slow writes down, and tracks how many
/// writes overlapped, which must never exceed one for a single relay.
#[derive(Debug, Default)]
pub struct RecordingCheckpointStore {
    inner: InMemoryCheckpointStore,
    history: Mutex<Vec<Checkpoint>>,
    delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingCheckpointStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding a pre-existing checkpoint.
    pub fn with_checkpoint(checkpoint: Checkpoint) -> Self {
        Self {
            inner: InMemoryCheckpointStore::with_checkpoint(checkpoint),
            ..Self::default()
        }
    }

    /// Delays every `save` by `delay`.
    pub fn set_save_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Makes every call fail while `unavailable` is true.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.set_unavailable(unavailable);
    }

    /// Returns the stored checkpoint of an identity.
    pub fn get(&self, relay_identity: &str) -> Option<Checkpoint> {
        self.inner.get(relay_identity)
    }

    /// Returns every successfully written checkpoint, oldest first.
    pub fn history(&self) -> Vec<Checkpoint> {
        self.history.lock().clone()
    }

    /// Number of records in the store.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if nothing was stored.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Highest number of `save` calls that overlapped.
    pub fn max_concurrent_saves(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CheckpointStore for RecordingCheckpointStore {
    async fn prepare(&self) -> CheckpointResult<()> {
        self.inner.prepare().await
    }

    async fn load(&self, relay_identity: &str) -> CheckpointResult<Option<Checkpoint>> {
        self.inner.load(relay_identity).await
    }

    async fn save(&self, checkpoint: &Checkpoint) -> CheckpointResult<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let result = self.inner.save(checkpoint).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if result.is_ok() {
            self.history.lock().push(checkpoint.clone());
        }
        result
    }
}
