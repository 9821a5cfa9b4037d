//! Validate command implementation.

use crate::config::{self, LocalLayout};
use crate::error::CliResult;
use std::path::Path;

/// Validates a configuration file and prints what the relay would use.
pub fn run(config_path: &Path) -> CliResult<()> {
    let config = config::load(config_path)?;
    let layout = LocalLayout::resolve(&config)?;

    println!("Configuration {} is valid", config_path.display());
    println!();
    println!("Source:");
    println!("  Change log:  {}", layout.change_log.display());
    let operations: Vec<&str> = config
        .source
        .operations
        .iter()
        .map(|kind| kind.as_str())
        .collect();
    println!("  Operations:  {}", operations.join(", "));
    println!();
    println!("Sink:");
    println!("  Destination: {}", config.sink.destination());
    println!("  Messages:    {}", layout.sink_root.display());
    println!();
    println!("Concurrency:   {}", config.concurrency);
    match (&layout.checkpoint_dir, config.relay_identity()) {
        (Some(dir), Some(identity)) => {
            println!("Checkpoints:   {identity} in {}", dir.display());
        }
        _ => println!("Checkpoints:   disabled (every start begins from now)"),
    }

    Ok(())
}
