//! Checkpoint store trait definition.

use crate::checkpoint::Checkpoint;
use crate::error::{CheckpointError, CheckpointResult};
use async_trait::async_trait;

/// Durable storage for relay checkpoints.
///
/// # Invariants
///
/// - `save` upserts: after it returns, `load` for the same identity returns
///   exactly the saved record
/// - At most one record exists per relay identity
/// - Stores never delete records on their own
///
/// Callers serialize their own writes; stores do not order concurrent `save`
/// calls for the same identity.
///
/// # Implementors
///
/// - [`super::InMemoryCheckpointStore`] - For testing
/// - [`super::FileCheckpointStore`] - For persistent checkpoints
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Prepares the backing namespace (directory, table, unique index).
    ///
    /// Called once each time a relay starts. Must be idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace cannot be created.
    async fn prepare(&self) -> CheckpointResult<()>;

    /// Loads the checkpoint for a relay identity.
    ///
    /// Returns `Ok(None)` when no checkpoint has been written yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the record exists but cannot be read.
    async fn load(&self, relay_identity: &str) -> CheckpointResult<Option<Checkpoint>>;

    /// Upserts the checkpoint keyed by `checkpoint.relay_identity`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written durably.
    async fn save(&self, checkpoint: &Checkpoint) -> CheckpointResult<()>;
}

/// Checks that a relay identity is usable as a checkpoint key.
///
/// # Errors
///
/// Returns [`CheckpointError::InvalidIdentity`] for empty or whitespace-only identities.
pub fn validate_identity(relay_identity: &str) -> CheckpointResult<()> {
    if relay_identity.trim().is_empty() {
        return Err(CheckpointError::invalid_identity(
            relay_identity,
            "identity must not be empty",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trait_is_object_safe() {
        fn _assert_object_safe(_: &dyn CheckpointStore) {}
    }

    #[test]
    fn empty_identity_rejected() {
        assert!(validate_identity("").is_err());
        assert!(validate_identity("   ").is_err());
        assert!(validate_identity("relay-1").is_ok());
    }
}
