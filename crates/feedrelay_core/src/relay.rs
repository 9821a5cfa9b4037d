//! Relay orchestration and lifecycle.

use crate::config::RelayConfig;
use crate::consumer::{CheckpointGate, CheckpointTarget, EventHandler, FeedConsumer, HandlerRegistry};
use crate::error::{ErrorReporter, RelayError, RelayResult};
use crate::event::ChangeEvent;
use crate::pool::{FanoutPool, PublishTask};
use crate::sink::{Broker, Publisher};
use crate::source::ChangeSource;
use crate::stats::{RelayStats, RelayStatsSnapshot};
use crate::transform::Transformer;
use feedrelay_checkpoint::CheckpointStore;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Lifecycle state of a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Nothing is open.
    Stopped,
    /// Connecting the sink, then starting the consumer.
    Starting,
    /// Consuming and publishing.
    Running,
    /// Stopping the consumer, then closing the sink.
    Stopping,
}

impl RelayState {
    /// Returns the lowercase name of the state.
    pub const fn as_str(&self) -> &'static str {
        match self {
            RelayState::Stopped => "stopped",
            RelayState::Starting => "starting",
            RelayState::Running => "running",
            RelayState::Stopping => "stopping",
        }
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transforms each event and submits it to the fan-out pool.
struct PublishHandler {
    transformer: Transformer,
    pool: Arc<FanoutPool>,
}

impl EventHandler for PublishHandler {
    fn handle(&self, event: &ChangeEvent) -> RelayResult<()> {
        let payload = self.transformer.transform(event)?;
        self.pool
            .submit(PublishTask::new(payload, event.source_position.clone()))?;
        debug!(
            operation = %event.operation_kind,
            position = %event.source_position,
            "event submitted"
        );
        Ok(())
    }
}

/// Relays change events from one source collection to one broker destination.
///
/// A relay is started and stopped by its owner. It never restarts itself: a
/// fatal error while running is sent to the error channel and the owner is
/// expected to call [`Relay::stop`] followed by [`Relay::start`], which resumes
/// from the last checkpoint.
///
/// # Example
///
/// ```rust,ignore
/// let relay = Relay::new(config, source, broker, Some(store))?;
/// let mut errors = relay.take_error_receiver().unwrap();
/// relay.start().await?;
/// while let Some(err) = errors.recv().await {
///     if err.is_fatal() {
///         relay.stop().await?;
///         relay.start().await?;
///     }
/// }
/// ```
pub struct Relay {
    config: RelayConfig,
    transformer: Transformer,
    state: RwLock<RelayState>,
    publisher: Arc<Publisher>,
    consumer: FeedConsumer,
    pool: Mutex<Option<Arc<FanoutPool>>>,
    stats: Arc<RelayStats>,
    reporter: ErrorReporter,
    errors: Mutex<Option<mpsc::UnboundedReceiver<RelayError>>>,
}

impl Relay {
    /// Validates `config` and assembles a stopped relay.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Configuration`] if the configuration is invalid,
    /// or if checkpointing is enabled and no store was given.
    pub fn new(
        config: RelayConfig,
        source: Arc<dyn ChangeSource>,
        broker: Arc<dyn Broker>,
        store: Option<Arc<dyn CheckpointStore>>,
    ) -> RelayResult<Self> {
        config.validate()?;

        let checkpoint = match (&config.checkpoint, store) {
            (Some(checkpoint), Some(store)) => Some(CheckpointTarget {
                store,
                relay_identity: checkpoint.relay_identity.clone().unwrap_or_default(),
                collection: config.source.collection.clone(),
            }),
            (Some(_), None) => {
                return Err(RelayError::configuration(
                    "checkpoint",
                    "checkpointing is enabled but no checkpoint store was given",
                ));
            }
            (None, Some(_)) => {
                warn!("checkpoint store given but checkpointing is disabled, ignoring it");
                None
            }
            (None, None) => None,
        };

        let stats = Arc::new(RelayStats::new());
        let (reporter, errors) = ErrorReporter::channel();
        let publisher = Arc::new(Publisher::new(broker, config.sink.destination()));
        let consumer = FeedConsumer::new(
            source,
            checkpoint,
            config.checkpoint_interval(),
            Arc::clone(&stats),
            reporter.clone(),
        );

        Ok(Self {
            transformer: config.source.transformer(),
            config,
            state: RwLock::new(RelayState::Stopped),
            publisher,
            consumer,
            pool: Mutex::new(None),
            stats,
            reporter,
            errors: Mutex::new(Some(errors)),
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Returns the current state.
    pub fn state(&self) -> RelayState {
        *self.state.read()
    }

    /// Returns true while the consume loop is alive.
    ///
    /// A relay can be `Running` with a dead loop after a fatal error, until
    /// its owner stops it.
    pub fn is_consuming(&self) -> bool {
        self.consumer.is_running()
    }

    /// Returns a snapshot of the statistics.
    pub fn stats(&self) -> RelayStatsSnapshot {
        self.stats.snapshot()
    }

    /// Takes the receiver of runtime errors. Returns `None` after the first call.
    pub fn take_error_receiver(&self) -> Option<mpsc::UnboundedReceiver<RelayError>> {
        self.errors.lock().take()
    }

    fn transition(&self, from: RelayState, to: RelayState) -> RelayResult<()> {
        let mut state = self.state.write();
        if *state != from {
            return Err(RelayError::InvalidStateTransition {
                from: state.to_string(),
                to: to.to_string(),
            });
        }
        *state = to;
        Ok(())
    }

    fn set_state(&self, state: RelayState) {
        *self.state.write() = state;
    }

    /// Connects the sink, then starts consuming from the last checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidStateTransition`] unless the relay is
    /// stopped, and [`RelayError::Connection`] if the sink, source or
    /// checkpoint store cannot be reached. A failed start leaves the relay
    /// stopped with nothing open.
    pub async fn start(&self) -> RelayResult<()> {
        self.transition(RelayState::Stopped, RelayState::Starting)?;
        info!(
            collection = %self.config.source.collection,
            destination = %self.publisher.destination(),
            concurrency = self.config.concurrency,
            "relay starting"
        );

        if let Err(e) = self.start_pipeline().await {
            warn!(error = %e, "relay failed to start");
            self.stats.record_error(&e.to_string());
            if let Err(cleanup) = self.shutdown_pipeline().await {
                debug!(error = %cleanup, "cleanup after failed start");
            }
            self.set_state(RelayState::Stopped);
            return Err(e);
        }

        self.set_state(RelayState::Running);
        info!("relay running");
        Ok(())
    }

    async fn start_pipeline(&self) -> RelayResult<()> {
        self.publisher.connect().await?;

        let pool = Arc::new(FanoutPool::spawn(
            self.config.concurrency,
            Arc::clone(&self.publisher),
            Arc::clone(&self.stats),
            self.reporter.clone(),
        ));
        *self.pool.lock() = Some(Arc::clone(&pool));

        let handler: Arc<dyn EventHandler> = Arc::new(PublishHandler {
            transformer: self.transformer.clone(),
            pool: Arc::clone(&pool),
        });
        let handlers: HandlerRegistry = self
            .config
            .source
            .operation_set()
            .into_iter()
            .map(|kind| (kind, Arc::clone(&handler)))
            .collect();

        let gate: Arc<dyn CheckpointGate> = pool;
        self.consumer.start_gated(handlers, gate).await
    }

    /// Stops consuming, waits for queued publishes, then closes the sink.
    ///
    /// Publishes still outstanding after the configured drain timeout are
    /// abandoned. Calling it on a stopped relay does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidStateTransition`] while the relay is
    /// starting or already stopping, or the first error hit while releasing
    /// the source or sink. The relay ends up stopped either way.
    pub async fn stop(&self) -> RelayResult<()> {
        {
            let mut state = self.state.write();
            match *state {
                RelayState::Stopped => return Ok(()),
                RelayState::Running => *state = RelayState::Stopping,
                other => {
                    return Err(RelayError::InvalidStateTransition {
                        from: other.to_string(),
                        to: RelayState::Stopping.to_string(),
                    });
                }
            }
        }
        info!("relay stopping");

        let result = self.shutdown_pipeline().await;
        self.set_state(RelayState::Stopped);
        info!(stats = ?self.stats.snapshot(), "relay stopped");
        result
    }

    async fn shutdown_pipeline(&self) -> RelayResult<()> {
        let mut first_error = None;

        if let Err(e) = self.consumer.stop().await {
            warn!(error = %e, "failed to release source");
            first_error.get_or_insert(e);
        }

        let pool = self.pool.lock().take();
        if let Some(pool) = pool {
            pool.drain(self.config.drain_timeout()).await;
        }

        if let Err(e) = self.publisher.close().await {
            warn!(error = %e, "failed to close sink");
            first_error.get_or_insert(e);
        }

        first_error.map_or(Ok(()), Err)
    }
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("state", &self.state())
            .field("collection", &self.config.source.collection)
            .field("destination", self.publisher.destination())
            .finish_non_exhaustive()
    }
}
