//! Configuration file loading and local file layout.
//!
//! The CLI runs relays against the local file system. Both `source.uri` and
//! `sink.uri` are directories, written either as plain paths or as `file://`
//! URIs:
//!
//! ```text
//! <source root>/<database>/<collection>.jsonl          change log
//! <source root>/<database>/<checkpoint collection>/    checkpoint records
//! <sink root>/<exchange>/<routing key>.jsonl           published messages
//! ```
//!
//! Every configured name in these paths must be a single path component.

use crate::error::{CliError, CliResult};
use feedrelay_checkpoint::FileCheckpointStore;
use feedrelay_core::{RelayConfig, RelayError, RelayResult};
use std::path::{Path, PathBuf};

const FILE_SCHEME: &str = "file://";

/// Reads and validates a relay configuration file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, is not a relay configuration,
/// or fails validation.
pub fn load(path: &Path) -> CliResult<RelayConfig> {
    let text = std::fs::read_to_string(path).map_err(|e| CliError::io(path, e))?;
    let config: RelayConfig = serde_json::from_str(&text).map_err(|source| CliError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}

/// Resolves a `file://` URI or plain path to a directory.
///
/// # Errors
///
/// Returns [`CliError::Usage`] for other URI schemes.
pub fn uri_path(uri: &str) -> CliResult<PathBuf> {
    if let Some(path) = uri.strip_prefix(FILE_SCHEME) {
        return Ok(PathBuf::from(path));
    }
    if uri.contains("://") {
        return Err(CliError::usage(format!(
            "unsupported uri {uri:?}: only file:// locations can be used from the command line"
        )));
    }
    Ok(PathBuf::from(uri))
}

/// Checks that a configured name maps to exactly one path component.
///
/// # Errors
///
/// Returns [`RelayError::Configuration`] for `field` if `name` is empty,
/// starts with `.`, or contains a path separator.
pub fn check_file_name(field: &str, name: &str) -> RelayResult<()> {
    let reason = if name.is_empty() {
        "must not be empty"
    } else if name.starts_with('.') {
        "must not start with '.'"
    } else if name.contains(['/', '\\', '\0']) {
        "must not contain path separators"
    } else {
        return Ok(());
    };
    Err(RelayError::configuration(
        field,
        format!("{field} {name:?} {reason}"),
    ))
}

/// Paths a relay configuration maps to on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalLayout {
    /// Directory of the source database.
    pub database_dir: PathBuf,
    /// Change log file of the watched collection.
    pub change_log: PathBuf,
    /// Directory holding checkpoint records, when checkpointing is enabled.
    pub checkpoint_dir: Option<PathBuf>,
    /// Root directory of published messages.
    pub sink_root: PathBuf,
}

impl LocalLayout {
    /// Resolves the layout of a configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CliError::Usage`] if either URI is not a local location, and
    /// [`RelayError::Configuration`] if a configured name would leave its
    /// directory or the relay identity cannot name a checkpoint file.
    pub fn resolve(config: &RelayConfig) -> CliResult<Self> {
        check_file_name("source.database", &config.source.database)?;
        check_file_name("source.collection", &config.source.collection)?;
        check_file_name("sink.exchange", &config.sink.exchange)?;
        if !config.sink.routing_key.is_empty() {
            check_file_name("sink.routingKey", &config.sink.routing_key)?;
        }

        let database_dir = uri_path(&config.source.uri)?.join(&config.source.database);
        let change_log = database_dir.join(format!("{}.jsonl", config.source.collection));
        let checkpoint_dir = match &config.checkpoint {
            Some(checkpoint) => {
                check_file_name("checkpoint.collection", &checkpoint.collection)?;
                let dir = database_dir.join(&checkpoint.collection);
                FileCheckpointStore::new(&dir)
                    .path_for(checkpoint.relay_identity.as_deref().unwrap_or_default())
                    .map_err(|e| RelayError::configuration("checkpoint.relayIdentity", e.to_string()))?;
                Some(dir)
            }
            None => None,
        };
        let sink_root = uri_path(&config.sink.uri)?;

        Ok(Self {
            database_dir,
            change_log,
            checkpoint_dir,
            sink_root,
        })
    }
}
