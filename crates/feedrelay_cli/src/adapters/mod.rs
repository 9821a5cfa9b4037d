//! File-backed collaborators for running relays locally.

mod broker;
mod change_log;

pub use broker::JsonLinesBroker;
pub use change_log::JsonLinesSource;

use crate::config::LocalLayout;
use crate::error::CliResult;
use feedrelay_checkpoint::FileCheckpointStore;
use feedrelay_core::{Broker, ChangeSource, CheckpointStore, Relay, RelayConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Builds a relay over the local files a configuration points at.
///
/// `poll_interval` is how often an idle change log is read again.
///
/// # Errors
///
/// Returns an error if a URI is not local or the configuration is invalid.
pub fn build_relay(config: RelayConfig, poll_interval: Duration) -> CliResult<Relay> {
    let layout = LocalLayout::resolve(&config)?;

    let source = JsonLinesSource::new(&layout.database_dir, &layout.change_log)
        .with_poll_interval(poll_interval);
    let broker = JsonLinesBroker::new(&layout.sink_root);
    debug!(
        change_log = %source.path().display(),
        messages = %broker.message_path(&config.sink.destination())?.display(),
        "local relay layout"
    );

    let source: Arc<dyn ChangeSource> = Arc::new(source);
    let broker: Arc<dyn Broker> = Arc::new(broker);
    let store = checkpoint_store(&layout);

    Ok(Relay::new(config, source, broker, store)?)
}

/// Returns the checkpoint store of a layout, if checkpointing is enabled.
pub fn checkpoint_store(layout: &LocalLayout) -> Option<Arc<dyn CheckpointStore>> {
    layout
        .checkpoint_dir
        .as_ref()
        .map(|dir| Arc::new(FileCheckpointStore::new(dir)) as Arc<dyn CheckpointStore>)
}
