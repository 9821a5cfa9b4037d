//! Run command implementation.

use crate::adapters;
use crate::config;
use crate::error::CliResult;
use crate::supervisor::{supervise, RunSummary};
use feedrelay_core::{RelayStatsSnapshot, RestartPolicy};
use std::path::Path;
use std::time::Duration;
use tracing::{error, info};

/// Runs a relay until Ctrl-C, restarting it after fatal errors.
///
/// `max_failures` of 0 restarts forever.
pub async fn run(
    config_path: &Path,
    concurrency: Option<usize>,
    max_failures: u32,
    poll_interval: Duration,
) -> CliResult<()> {
    let mut config = config::load(config_path)?;
    if let Some(concurrency) = concurrency {
        config = config.with_concurrency(concurrency);
        config.validate()?;
    }
    info!(
        config = %config_path.display(),
        collection = %config.source.collection,
        exchange = %config.sink.exchange,
        concurrency = config.concurrency,
        "loaded relay configuration"
    );

    let relay = adapters::build_relay(config, poll_interval)?;
    let policy = RestartPolicy::new(max_failures);
    let result = supervise(&relay, &policy, shutdown_signal()).await;

    print_summary(result.as_ref().ok(), &relay.stats());
    result.map(|_| ())
}

/// Resolves on Ctrl-C. Never resolves if the handler cannot be installed.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
}

fn print_summary(summary: Option<&RunSummary>, stats: &RelayStatsSnapshot) {
    println!();
    println!("Relay Summary");
    println!("=============");
    if let Some(summary) = summary {
        println!("  Starts:              {}", summary.starts);
        println!("  Restarts:            {}", summary.restarts);
    }
    println!("  Events received:     {}", stats.events_received);
    println!("  Events filtered:     {}", stats.events_filtered);
    println!("  Events handled:      {}", stats.events_handled);
    println!("  Published:           {}", stats.published);
    println!("  Publish failures:    {}", stats.publish_failures);
    println!("  Checkpoints written: {}", stats.checkpoints_written);
    println!("  Checkpoint failures: {}", stats.checkpoint_failures);
    if let Some(last_error) = &stats.last_error {
        println!("  Last error:          {last_error}");
    }
}
