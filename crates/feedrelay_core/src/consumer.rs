//! Resumable change-feed consumer.
//!
//! The consumer owns the single sequential path of the pipeline. For each
//! event it:
//!
//! 1. drops the event if no handler is registered for its kind,
//! 2. waits for the in-flight checkpoint write, if any,
//! 3. invokes the handler,
//! 4. advances the checkpoint counter and, when it wraps to zero, waits for
//!    the [`CheckpointGate`] and starts a checkpoint write for the event just
//!    handled.
//!
//! Checkpoint writes therefore never overlap and are never reordered, and a
//! stored resume position always belongs to an event that was already handed
//! to its handler.

use crate::error::{ErrorReporter, RelayError, RelayResult};
use crate::event::{ChangeEvent, OperationKind};
use crate::source::{ChangeSource, ChangeStream, WatchOptions};
use crate::stats::RelayStats;
use feedrelay_checkpoint::{Checkpoint, CheckpointStore, SourcePosition};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Receives the events of one operation kind.
///
/// `handle` is synchronous: the consumer does not read the next event until
/// it returns. Slow work belongs in a task the handler spawns or submits.
pub trait EventHandler: Send + Sync {
    /// Handles one event.
    ///
    /// # Errors
    ///
    /// Any error ends the current run and is reported on the error channel.
    fn handle(&self, event: &ChangeEvent) -> RelayResult<()>;
}

/// Handlers keyed by operation kind. Kinds without a handler are dropped.
pub type HandlerRegistry = BTreeMap<OperationKind, Arc<dyn EventHandler>>;

/// Holds checkpoint writes back until handed-off work has caught up.
///
/// The consumer awaits [`CheckpointGate::ready`] before every checkpoint
/// write. No event is read while it waits.
#[async_trait]
pub trait CheckpointGate: Send + Sync {
    /// Resolves once a checkpoint for every event handled so far may be written.
    async fn ready(&self);
}

/// Where the consumer records its progress.
#[derive(Clone)]
pub struct CheckpointTarget {
    /// Backing store.
    pub store: Arc<dyn CheckpointStore>,
    /// Key of this relay's record.
    pub relay_identity: String,
    /// Watched collection, stored alongside the position.
    pub collection: String,
}

impl std::fmt::Debug for CheckpointTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointTarget")
            .field("relay_identity", &self.relay_identity)
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

struct RunningLoop {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Consumes a [`ChangeSource`] from the last checkpoint.
pub struct FeedConsumer {
    source: Arc<dyn ChangeSource>,
    checkpoint: Option<CheckpointTarget>,
    interval: usize,
    stats: Arc<RelayStats>,
    reporter: ErrorReporter,
    connected: AtomicBool,
    running: Mutex<Option<RunningLoop>>,
}

impl FeedConsumer {
    /// Creates a consumer.
    ///
    /// `interval` is the number of handled events between checkpoint writes.
    /// Without a checkpoint target every start begins from now.
    pub fn new(
        source: Arc<dyn ChangeSource>,
        checkpoint: Option<CheckpointTarget>,
        interval: usize,
        stats: Arc<RelayStats>,
        reporter: ErrorReporter,
    ) -> Self {
        Self {
            source,
            checkpoint,
            interval: interval.max(1),
            stats,
            reporter,
            connected: AtomicBool::new(false),
            running: Mutex::new(None),
        }
    }

    /// Returns true while the consume loop is alive.
    ///
    /// Turns false on its own when the subscription is lost.
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    /// Reads the stored resume position, if any.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Connection`] if the checkpoint store cannot be read.
    pub async fn resume_position(&self) -> RelayResult<Option<SourcePosition>> {
        let Some(target) = &self.checkpoint else {
            return Ok(None);
        };

        target
            .store
            .prepare()
            .await
            .map_err(|e| RelayError::connection("checkpoint store", e.to_string()))?;

        let stored = target
            .store
            .load(&target.relay_identity)
            .await
            .map_err(|e| RelayError::connection("checkpoint store", e.to_string()))?;

        Ok(stored.map(|checkpoint| {
            if checkpoint.collection != target.collection {
                warn!(
                    relay = %target.relay_identity,
                    stored = %checkpoint.collection,
                    configured = %target.collection,
                    "checkpoint was written for a different collection"
                );
            }
            checkpoint.resume_position
        }))
    }

    /// Connects to the source and starts delivering events to `handlers`.
    ///
    /// The subscription resumes strictly after the stored checkpoint, or
    /// starts from now if there is none.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidStateTransition`] if already running and
    /// [`RelayError::Connection`] if the source or checkpoint store cannot be
    /// reached. On error nothing is left open.
    pub async fn start(&self, handlers: HandlerRegistry) -> RelayResult<()> {
        self.launch(handlers, None).await
    }

    /// Like [`FeedConsumer::start`], but every checkpoint write first waits
    /// for `gate`.
    ///
    /// # Errors
    ///
    /// Same as [`FeedConsumer::start`].
    pub async fn start_gated(
        &self,
        handlers: HandlerRegistry,
        gate: Arc<dyn CheckpointGate>,
    ) -> RelayResult<()> {
        self.launch(handlers, Some(gate)).await
    }

    async fn launch(
        &self,
        handlers: HandlerRegistry,
        gate: Option<Arc<dyn CheckpointGate>>,
    ) -> RelayResult<()> {
        if self.running.lock().is_some() {
            return Err(RelayError::InvalidStateTransition {
                from: "running".into(),
                to: "running".into(),
            });
        }

        match self.source.connect().await {
            Ok(()) => {}
            Err(e @ RelayError::Connection { .. }) => return Err(e),
            Err(e) => return Err(RelayError::connection("source", e.to_string())),
        }
        self.connected.store(true, Ordering::SeqCst);

        let stream = match self.open_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                self.release_source().await;
                return Err(e);
            }
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let ctx = LoopContext {
            handlers,
            interval: self.interval,
            checkpoint: self.checkpoint.clone(),
            gate,
            stats: Arc::clone(&self.stats),
            reporter: self.reporter.clone(),
        };
        let task = tokio::spawn(consume(stream, ctx, shutdown_rx));

        *self.running.lock() = Some(RunningLoop {
            shutdown: shutdown_tx,
            task,
        });
        Ok(())
    }

    async fn open_stream(&self) -> RelayResult<Box<dyn ChangeStream>> {
        let resume_after = self.resume_position().await?;
        match &resume_after {
            Some(position) => info!(position = %position, "resuming change feed"),
            None => info!("no checkpoint, consuming change feed from now"),
        }

        let options = WatchOptions::from_now()
            .with_resume_after(resume_after)
            .with_full_document_lookup(true);

        match self.source.watch(options).await {
            Ok(stream) => Ok(stream),
            Err(e @ (RelayError::Connection { .. } | RelayError::Subscription(_))) => Err(e),
            Err(e) => Err(RelayError::connection("source", e.to_string())),
        }
    }

    /// Stops the loop, closes the subscription and releases the source.
    ///
    /// A pending checkpoint write is awaited before the subscription closes.
    /// Idempotent and safe to call when never started.
    ///
    /// # Errors
    ///
    /// Returns the source's error if closing the connection failed.
    pub async fn stop(&self) -> RelayResult<()> {
        let running = self.running.lock().take();
        if let Some(running) = running {
            let _ = running.shutdown.send(());
            if let Err(e) = running.task.await {
                warn!(error = %e, "consume loop terminated abnormally");
            }
        }

        if self.connected.swap(false, Ordering::SeqCst) {
            self.source.close().await?;
            debug!("source connection closed");
        }
        Ok(())
    }

    async fn release_source(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.source.close().await {
                warn!(error = %e, "failed to close source after aborted start");
            }
        }
    }
}

impl std::fmt::Debug for FeedConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedConsumer")
            .field("checkpoint", &self.checkpoint)
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

struct LoopContext {
    handlers: HandlerRegistry,
    interval: usize,
    checkpoint: Option<CheckpointTarget>,
    gate: Option<Arc<dyn CheckpointGate>>,
    stats: Arc<RelayStats>,
    reporter: ErrorReporter,
}

impl LoopContext {
    fn spawn_checkpoint(&self, target: &CheckpointTarget, event: &ChangeEvent) -> JoinHandle<()> {
        let checkpoint = Checkpoint::new(
            target.relay_identity.clone(),
            target.collection.clone(),
            event.source_position.clone(),
        )
        .with_document_key(event.document_key.clone());

        let store = Arc::clone(&target.store);
        let stats = Arc::clone(&self.stats);
        let reporter = self.reporter.clone();

        tokio::spawn(async move {
            match store.save(&checkpoint).await {
                Ok(()) => {
                    stats.record_checkpoint();
                    debug!(
                        relay = %checkpoint.relay_identity,
                        position = %checkpoint.resume_position,
                        "checkpoint written"
                    );
                }
                Err(e) => {
                    warn!(
                        relay = %checkpoint.relay_identity,
                        position = %checkpoint.resume_position,
                        error = %e,
                        "checkpoint write failed"
                    );
                    stats.record_checkpoint_failure(&e.to_string());
                    reporter.report(RelayError::Checkpoint(e));
                }
            }
        })
    }
}

/// Waits for the in-flight checkpoint write, if any.
async fn settle(pending: &mut Option<JoinHandle<()>>) {
    if let Some(write) = pending.take() {
        if let Err(e) = write.await {
            warn!(error = %e, "checkpoint task terminated abnormally");
        }
    }
}

async fn consume(
    mut stream: Box<dyn ChangeStream>,
    ctx: LoopContext,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut counter = 0usize;
    let mut pending: Option<JoinHandle<()>> = None;

    loop {
        let next = tokio::select! {
            biased;
            _ = &mut shutdown => break,
            next = stream.next_event() => next,
        };

        let event = match next {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                error!(error = %e, "change stream failed");
                ctx.stats.record_error(&e.to_string());
                ctx.reporter.report(match e {
                    RelayError::Subscription(_) => e,
                    other => RelayError::Subscription(other.to_string()),
                });
                break;
            }
            None => {
                error!("change stream ended");
                let e = RelayError::Subscription("change stream ended".into());
                ctx.stats.record_error(&e.to_string());
                ctx.reporter.report(e);
                break;
            }
        };
        ctx.stats.record_received();

        let Some(handler) = ctx.handlers.get(&event.operation_kind) else {
            ctx.stats.record_filtered();
            debug!(operation = %event.operation_kind, position = %event.source_position, "event filtered");
            continue;
        };

        settle(&mut pending).await;

        if let Err(e) = handler.handle(&event) {
            error!(
                operation = %event.operation_kind,
                position = %event.source_position,
                error = %e,
                "event handling failed"
            );
            ctx.stats.record_error(&e.to_string());
            ctx.reporter.report(e);
            break;
        }
        ctx.stats.record_handled();

        counter = (counter + 1) % ctx.interval;
        if counter == 0 {
            if let Some(target) = &ctx.checkpoint {
                if let Some(gate) = &ctx.gate {
                    tokio::select! {
                        biased;
                        () = gate.ready() => {}
                        _ = &mut shutdown => {
                            debug!(position = %event.source_position, "checkpoint skipped on shutdown");
                            break;
                        }
                    }
                }
                pending = Some(ctx.spawn_checkpoint(target, &event));
            }
        }
    }

    settle(&mut pending).await;
    stream.close().await;
    debug!("consume loop stopped");
}
