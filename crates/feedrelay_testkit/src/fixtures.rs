//! Test fixtures and relay helpers.
//!
//! A [`RelayHarness`] bundles the three collaborators of a relay. Building
//! several relays from one harness simulates process restarts: the change log
//! and the checkpoint store outlive each relay, just as the data source and
//! the checkpoint collection outlive a crashed process.

use crate::broker::RecordingBroker;
use crate::source::MemoryChangeLog;
use crate::store::RecordingCheckpointStore;
use feedrelay_checkpoint::FileCheckpointStore;
use feedrelay_core::{
    Broker, ChangeSource, CheckpointStore, OperationKind, Relay, RelayConfig, RelayResult,
    SinkConfig, SourceConfig,
};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Database name used by harness configurations.
pub const TEST_DATABASE: &str = "testdatabase";
/// Collection name used by harness configurations.
pub const TEST_COLLECTION: &str = "testcollection";
/// Exchange name used by harness configurations.
pub const TEST_EXCHANGE: &str = "testexchange";
/// Checkpoint collection used by harness configurations.
pub const TEST_STATE_COLLECTION: &str = "teststatecollection";
/// Relay identity used by harness configurations.
pub const TEST_RELAY_IDENTITY: &str = "testobserverid";

/// Default time tests wait for asynchronous effects.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared collaborators for one or more relays.
#[derive(Debug, Clone, Default)]
pub struct RelayHarness {
    /// Source change log.
    pub log: Arc<MemoryChangeLog>,
    /// Destination broker.
    pub broker: Arc<RecordingBroker>,
    /// Checkpoint store.
    pub store: Arc<RecordingCheckpointStore>,
}

impl RelayHarness {
    /// Creates a harness with empty collaborators.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration relaying `operations` with checkpointing enabled.
    pub fn config(&self, operations: &[OperationKind], concurrency: usize) -> RelayConfig {
        test_config(operations, concurrency).with_checkpoint(TEST_STATE_COLLECTION, TEST_RELAY_IDENTITY)
    }

    /// Builds a relay over the harness collaborators.
    ///
    /// The checkpoint store is passed only when `config` enables checkpointing.
    pub fn relay(&self, config: RelayConfig) -> RelayResult<Relay> {
        let store = config
            .checkpointing_enabled()
            .then(|| Arc::clone(&self.store) as Arc<dyn CheckpointStore>);
        Relay::new(
            config,
            Arc::clone(&self.log) as Arc<dyn ChangeSource>,
            Arc::clone(&self.broker) as Arc<dyn Broker>,
            store,
        )
    }

    /// Waits until the broker holds at least `count` messages.
    ///
    /// # Panics
    ///
    /// Panics after [`WAIT_TIMEOUT`].
    pub async fn expect_messages(&self, count: usize) {
        assert!(
            self.broker.wait_for_messages(count, WAIT_TIMEOUT).await,
            "expected {count} messages, got {}",
            self.broker.message_count()
        );
    }
}

/// Configuration relaying `operations` without checkpointing.
pub fn test_config(operations: &[OperationKind], concurrency: usize) -> RelayConfig {
    RelayConfig::new(
        SourceConfig::new("memory://source", TEST_DATABASE, TEST_COLLECTION)
            .with_operations(operations.iter().copied()),
        SinkConfig::new("memory://broker", TEST_EXCHANGE),
    )
    .with_concurrency(concurrency)
}

/// A test document with string fields, keyed by `id`.
pub fn test_document(id: &str, n: u64) -> Value {
    json!({
        "_id": id,
        "field1": format!("test-{n}"),
        "field2": format!("test-{}", n + 1),
    })
}

/// A file checkpoint store rooted in a fresh temporary directory.
///
/// The directory is removed when the returned [`TempDir`] is dropped.
pub fn temp_file_store() -> (TempDir, FileCheckpointStore) {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let store = FileCheckpointStore::new(&dir.path().join(TEST_STATE_COLLECTION));
    (dir, store)
}

/// Polls `condition` until it holds.
///
/// Returns false if it did not hold within `timeout`.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Runs `future` with [`WAIT_TIMEOUT`], panicking if it does not complete.
///
/// # Panics
///
/// Panics on timeout.
pub async fn within_timeout<F: Future>(future: F) -> F::Output {
    match tokio::time::timeout(WAIT_TIMEOUT, future).await {
        Ok(output) => output,
        Err(_) => panic!("operation did not complete within {WAIT_TIMEOUT:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn harness_config_is_valid() {
        let harness = RelayHarness::new();
        let config = harness.config(&[OperationKind::Insert], 2);
        assert!(config.validate().is_ok());
        assert_eq!(config.relay_identity(), Some(TEST_RELAY_IDENTITY));
    }

    #[test]
    fn test_document_fields() {
        let doc = test_document("a1", 1);
        assert_eq!(doc["_id"], "a1");
        assert_eq!(doc["field1"], "test-1");
        assert_eq!(doc["field2"], "test-2");
    }

    #[tokio::test]
    async fn wait_until_times_out() {
        assert!(wait_until(Duration::from_millis(20), || true).await);
        assert!(!wait_until(Duration::from_millis(20), || false).await);
    }
}
