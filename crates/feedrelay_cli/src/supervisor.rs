//! Supervised relay runs.
//!
//! A relay reports fatal errors and leaves restarting to its owner. The
//! supervisor is that owner for the command line: it starts the relay, stops
//! it on a fatal error and starts it again after the [`RestartPolicy`] delay,
//! until shutdown is requested or the policy gives up.

use crate::error::{CliError, CliResult};
use feedrelay_core::{Relay, RelayError, RestartPolicy};
use std::future::Future;
use tracing::{error, info, warn};

/// How a supervised run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunSummary {
    /// Successful starts, the first one included.
    pub starts: u32,
    /// Fatal errors handled with a restart.
    pub restarts: u32,
}

/// Runs `relay` until `shutdown` resolves.
///
/// Non-fatal errors are logged. A fatal error, or a failed start, counts as
/// one consecutive failure; the count resets once a start succeeds.
///
/// # Errors
///
/// Returns the last fatal error once `policy` gives up, or the error of the
/// final stop.
pub async fn supervise<F>(relay: &Relay, policy: &RestartPolicy, shutdown: F) -> CliResult<RunSummary>
where
    F: Future<Output = ()>,
{
    let mut errors = relay
        .take_error_receiver()
        .ok_or_else(|| CliError::usage("relay is already supervised"))?;
    let mut shutdown = std::pin::pin!(shutdown);

    let mut summary = RunSummary::default();
    let mut failures = 0u32;

    loop {
        let failure = match relay.start().await {
            Ok(()) => {
                summary.starts += 1;
                failures = 0;

                let outcome = loop {
                    tokio::select! {
                        () = &mut shutdown => break None,
                        reported = errors.recv() => match reported {
                            Some(e) if e.is_fatal() => break Some(e),
                            Some(e) => warn!(error = %e, "relay reported an error"),
                            None => break None,
                        },
                    }
                };

                let Some(fatal) = outcome else {
                    info!("shutdown requested");
                    relay.stop().await?;
                    return Ok(summary);
                };

                error!(error = %fatal, "relay run ended");
                if let Err(e) = relay.stop().await {
                    warn!(error = %e, "failed to stop relay after fatal error");
                }
                fatal
            }
            Err(e) => {
                error!(error = %e, "relay failed to start");
                e
            }
        };

        failures += 1;
        if !policy.allows(failures) {
            error!(failures, "giving up");
            return Err(failure.into());
        }

        let delay = policy.delay_for_attempt(failures);
        info!(attempt = failures, delay = ?delay, "restarting relay");
        tokio::select! {
            () = &mut shutdown => {
                info!("shutdown requested");
                return Ok(summary);
            }
            () = tokio::time::sleep(delay) => {}
        }
        summary.restarts += 1;
        drain_stale(&mut errors);
    }
}

/// Discards errors reported by the previous run.
fn drain_stale(errors: &mut tokio::sync::mpsc::UnboundedReceiver<RelayError>) {
    while let Ok(stale) = errors.try_recv() {
        warn!(error = %stale, "discarding error from previous run");
    }
}
