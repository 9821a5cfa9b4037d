//! Error types for checkpoint operations.

use std::io;
use thiserror::Error;

/// Result type for checkpoint operations.
pub type CheckpointResult<T> = Result<T, CheckpointError>;

/// Errors that can occur while reading or writing checkpoints.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A checkpoint record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The relay identity cannot be used as a checkpoint key.
    #[error("invalid relay identity {identity:?}: {reason}")]
    InvalidIdentity {
        /// The rejected identity.
        identity: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The backing store cannot be reached.
    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),
}

impl CheckpointError {
    /// Creates an invalid identity error.
    pub fn invalid_identity(identity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidIdentity {
            identity: identity.into(),
            reason: reason.into(),
        }
    }
}
