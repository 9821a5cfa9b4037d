//! feedrelay CLI
//!
//! Command-line tools for running and inspecting relays against local files.
//!
//! # Commands
//!
//! - `run` - Relay a JSON-lines change log until Ctrl-C
//! - `checkpoint` - Print the stored checkpoint of a relay
//! - `validate` - Validate a configuration file
//! - `version` - Show version information

mod adapters;
mod commands;
mod config;
mod error;
mod supervisor;

use clap::{Parser, Subcommand};
use error::{CliError, CliResult};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// feedrelay command-line tools.
#[derive(Parser)]
#[command(name = "feedrelay")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the relay configuration file (JSON)
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Relay change events until interrupted
    Run {
        /// Override the configured concurrency
        #[arg(long)]
        concurrency: Option<usize>,

        /// Consecutive failures before giving up (0 = never give up)
        #[arg(short, long, default_value = "0")]
        max_failures: u32,

        /// Milliseconds between reads of an idle change log
        #[arg(long, default_value = "200")]
        poll_interval_ms: u64,
    },

    /// Print the stored checkpoint
    Checkpoint {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Validate the configuration file
    Validate,

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> CliResult<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run {
            concurrency,
            max_failures,
            poll_interval_ms,
        } => {
            let path = required_config(cli.config, "run")?;
            let poll_interval = Duration::from_millis(poll_interval_ms);
            commands::run::run(&path, concurrency, max_failures, poll_interval).await?;
        }
        Commands::Checkpoint { format } => {
            let path = required_config(cli.config, "checkpoint")?;
            commands::checkpoint::run(&path, &format).await?;
        }
        Commands::Validate => {
            let path = required_config(cli.config, "validate")?;
            commands::validate::run(&path)?;
        }
        Commands::Version => {
            println!("feedrelay CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("feedrelay Core v{}", feedrelay_core::VERSION);
        }
    }

    Ok(())
}

fn required_config(config: Option<PathBuf>, command: &str) -> CliResult<PathBuf> {
    config.ok_or_else(|| CliError::usage(format!("configuration file required for {command}")))
}
