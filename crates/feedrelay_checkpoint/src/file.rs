//! File-based checkpoint store for persistent checkpoints.

use crate::checkpoint::Checkpoint;
use crate::error::{CheckpointError, CheckpointResult};
use crate::store::{validate_identity, CheckpointStore};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A directory of checkpoint documents, one JSON file per relay identity.
///
/// The file name is the relay identity, which gives the store its uniqueness
/// constraint for free. Checkpoints survive process restarts.
///
/// # Durability
///
/// `save` writes a temporary file, syncs it, then renames it over the previous
/// record, so a crash mid-write leaves the previous checkpoint intact.
///
/// # Example
///
/// ```no_run
/// use feedrelay_checkpoint::FileCheckpointStore;
/// use std::path::Path;
///
/// let store = FileCheckpointStore::new(Path::new("state/checkpoints"));
/// assert_eq!(store.dir(), Path::new("state/checkpoints"));
/// ```
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Creates a store rooted at `dir`. The directory is created by [`CheckpointStore::prepare`].
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    /// Returns the directory holding the checkpoint files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the file path for a relay identity.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::InvalidIdentity`] if the identity is not a
    /// plain file name (ASCII alphanumerics, `-`, `_` and `.`, not starting with `.`).
    pub fn path_for(&self, relay_identity: &str) -> CheckpointResult<PathBuf> {
        validate_identity(relay_identity)?;

        if relay_identity.starts_with('.') {
            return Err(CheckpointError::invalid_identity(
                relay_identity,
                "identity must not start with '.'",
            ));
        }
        if let Some(c) = relay_identity
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(CheckpointError::invalid_identity(
                relay_identity,
                format!("character {c:?} is not allowed in a file checkpoint identity"),
            ));
        }

        Ok(self.dir.join(format!("{relay_identity}.json")))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn prepare(&self) -> CheckpointResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    async fn load(&self, relay_identity: &str) -> CheckpointResult<Option<Checkpoint>> {
        let path = self.path_for(relay_identity)?;

        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let checkpoint: Checkpoint = serde_json::from_slice(&data)?;
        Ok(Some(checkpoint))
    }

    async fn save(&self, checkpoint: &Checkpoint) -> CheckpointResult<()> {
        let path = self.path_for(&checkpoint.relay_identity)?;
        let tmp_path = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(checkpoint)?;

        {
            use tokio::io::AsyncWriteExt;

            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
        }
        tokio::fs::rename(&tmp_path, &path).await?;

        debug!(
            relay = %checkpoint.relay_identity,
            position = %checkpoint.resume_position,
            path = ?path,
            "checkpoint file written"
        );
        Ok(())
    }
}
