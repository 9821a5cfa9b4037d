//! CLI error type.

use feedrelay_checkpoint::CheckpointError;
use feedrelay_core::RelayError;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for CLI commands.
pub type CliResult<T> = Result<T, CliError>;

/// Errors reported by CLI commands.
#[derive(Error, Debug)]
pub enum CliError {
    /// A file could not be read or written.
    #[error("{path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// A configuration file is not valid JSON for a relay configuration.
    #[error("cannot parse {path}: {source}")]
    Json {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },

    /// Output could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The relay failed.
    #[error(transparent)]
    Relay(#[from] RelayError),

    /// The checkpoint store failed.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// The command line or configuration cannot be used as given.
    #[error("{0}")]
    Usage(String),
}

impl CliError {
    /// Creates an I/O error for a path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a usage error.
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage(message.into())
    }
}
