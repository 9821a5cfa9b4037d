//! In-memory checkpoint store for testing.

use crate::checkpoint::Checkpoint;
use crate::error::{CheckpointError, CheckpointResult};
use crate::store::{validate_identity, CheckpointStore};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// An in-memory checkpoint store.
///
/// Suitable for unit tests, integration tests and relays that are allowed
/// to restart "from now". Records survive for as long as the store value does,
/// so sharing one store between two relay runs simulates a process restart.
///
/// # Example
///
/// ```rust
/// use feedrelay_checkpoint::InMemoryCheckpointStore;
///
/// let store = InMemoryCheckpointStore::new();
/// assert!(store.is_empty());
/// assert_eq!(store.write_count(), 0);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    records: RwLock<HashMap<String, Checkpoint>>,
    writes: AtomicU64,
    unavailable: AtomicBool,
}

impl InMemoryCheckpointStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding a pre-existing checkpoint.
    ///
    /// Useful for testing resume scenarios.
    #[must_use]
    pub fn with_checkpoint(checkpoint: Checkpoint) -> Self {
        let store = Self::new();
        store
            .records
            .write()
            .insert(checkpoint.relay_identity.clone(), checkpoint);
        store
    }

    /// Returns the checkpoint for an identity without going through the async API.
    #[must_use]
    pub fn get(&self, relay_identity: &str) -> Option<Checkpoint> {
        self.records.read().get(relay_identity).cloned()
    }

    /// Returns the number of stored checkpoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns true if no checkpoint has been stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Returns the number of successful `save` calls.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Makes every subsequent call fail with [`CheckpointError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> CheckpointResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CheckpointError::Unavailable(
                "in-memory store marked unavailable".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn prepare(&self) -> CheckpointResult<()> {
        self.check_available()
    }

    async fn load(&self, relay_identity: &str) -> CheckpointResult<Option<Checkpoint>> {
        self.check_available()?;
        Ok(self.get(relay_identity))
    }

    async fn save(&self, checkpoint: &Checkpoint) -> CheckpointResult<()> {
        self.check_available()?;
        validate_identity(&checkpoint.relay_identity)?;

        self.records
            .write()
            .insert(checkpoint.relay_identity.clone(), checkpoint.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
