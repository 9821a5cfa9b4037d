//! Checkpoint command implementation.

use crate::adapters;
use crate::config::{self, LocalLayout};
use crate::error::{CliError, CliResult};
use feedrelay_core::Checkpoint;
use serde::Serialize;
use std::path::Path;

/// Stored checkpoint of one relay.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointReport {
    /// Relay identity.
    pub relay_identity: String,
    /// Directory holding the checkpoint records.
    pub store: String,
    /// Stored checkpoint, if one was written.
    pub checkpoint: Option<Checkpoint>,
}

/// Loads the checkpoint of the relay a configuration describes.
///
/// # Errors
///
/// Returns an error if checkpointing is disabled or the record cannot be read.
pub async fn load(config_path: &Path) -> CliResult<CheckpointReport> {
    let config = config::load(config_path)?;
    let layout = LocalLayout::resolve(&config)?;

    let (Some(store), Some(dir), Some(identity)) = (
        adapters::checkpoint_store(&layout),
        layout.checkpoint_dir.as_ref(),
        config.relay_identity(),
    ) else {
        return Err(CliError::usage(format!(
            "checkpointing is not enabled in {}",
            config_path.display()
        )));
    };

    Ok(CheckpointReport {
        relay_identity: identity.to_string(),
        store: dir.display().to_string(),
        checkpoint: store.load(identity).await?,
    })
}

/// Runs the checkpoint command.
pub async fn run(config_path: &Path, format: &str) -> CliResult<()> {
    let report = load(config_path).await?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            print_text_output(&report);
        }
    }

    Ok(())
}

fn print_text_output(report: &CheckpointReport) {
    println!("Relay Checkpoint");
    println!("================");
    println!();
    println!("Relay identity: {}", report.relay_identity);
    println!("Store:          {}", report.store);
    println!();

    match &report.checkpoint {
        Some(checkpoint) => {
            println!("Collection:      {}", checkpoint.collection);
            println!("Resume position: {}", checkpoint.resume_position);
            match &checkpoint.last_handled_document_key {
                Some(key) => println!("Last handled:    {key}"),
                None => println!("Last handled:    (no document key)"),
            }
        }
        None => {
            println!("No checkpoint written yet; the next start begins from now.");
        }
    }
}
