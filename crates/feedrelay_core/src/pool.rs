//! Bounded-concurrency fan-out of publish tasks.
//!
//! Submissions go into an unbounded FIFO queue and never block. A dispatcher
//! task pops the queue in order and spawns one publish per semaphore permit,
//! so at most `concurrency` publishes run at once and the rest wait in
//! submission order.
//!
//! A task counts as backlog from submission until it holds a slot. The
//! consumer waits for an empty backlog before writing a checkpoint, so at most
//! `concurrency` publishes behind a stored position are unconfirmed.

use crate::consumer::CheckpointGate;
use crate::error::{ErrorReporter, RelayError, RelayResult};
use crate::event::Payload;
use crate::sink::Publisher;
use crate::stats::RelayStats;
use feedrelay_checkpoint::SourcePosition;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// One publish attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishTask {
    /// Message payload.
    pub payload: Payload,
    /// Position of the event the payload was built from, for diagnostics.
    pub position: SourcePosition,
}

impl PublishTask {
    /// Creates a task.
    pub fn new(payload: Payload, position: SourcePosition) -> Self {
        Self { payload, position }
    }
}

/// Tasks submitted but not yet holding a slot.
#[derive(Debug, Default)]
struct Backlog {
    queued: AtomicUsize,
    emptied: Notify,
}

impl Backlog {
    fn push(&self) {
        self.queued.fetch_add(1, Ordering::SeqCst);
    }

    fn pop(&self) {
        if self.queued.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.emptied.notify_waiters();
        }
    }

    fn len(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    async fn wait_empty(&self) {
        loop {
            let mut emptied = std::pin::pin!(self.emptied.notified());
            emptied.as_mut().enable();
            if self.len() == 0 {
                return;
            }
            emptied.await;
        }
    }
}

/// Runs publish tasks with bounded concurrency.
///
/// Failed publishes are logged, counted and reported; they never stop the
/// pool and are not retried.
#[derive(Debug)]
pub struct FanoutPool {
    queue: Mutex<Option<mpsc::UnboundedSender<PublishTask>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    slots: Arc<Semaphore>,
    backlog: Arc<Backlog>,
    permits: u32,
}

impl FanoutPool {
    /// Starts a pool and its dispatcher on the current runtime.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        concurrency: usize,
        publisher: Arc<Publisher>,
        stats: Arc<RelayStats>,
        reporter: ErrorReporter,
    ) -> Self {
        let permits = u32::try_from(concurrency.max(1)).unwrap_or(u32::MAX);
        let slots = Arc::new(Semaphore::new(permits as usize));
        let backlog = Arc::new(Backlog::default());
        let (tx, rx) = mpsc::unbounded_channel();

        let dispatcher = tokio::spawn(dispatch(
            rx,
            Arc::clone(&slots),
            Arc::clone(&backlog),
            publisher,
            stats,
            reporter,
        ));

        Self {
            queue: Mutex::new(Some(tx)),
            dispatcher: Mutex::new(Some(dispatcher)),
            slots,
            backlog,
            permits,
        }
    }

    /// Maximum number of concurrent publishes.
    pub fn concurrency(&self) -> usize {
        self.permits as usize
    }

    /// Queues a task without waiting for a free slot.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Publish`] if the pool was drained.
    pub fn submit(&self, task: PublishTask) -> RelayResult<()> {
        let queue = self.queue.lock();
        let Some(tx) = queue.as_ref() else {
            return Err(RelayError::Publish("fan-out pool is closed".into()));
        };
        self.backlog.push();
        tx.send(task).map_err(|_| {
            self.backlog.pop();
            RelayError::Publish("fan-out pool is closed".into())
        })
    }

    /// Number of submitted tasks still waiting for a slot.
    pub fn backlog(&self) -> usize {
        self.backlog.len()
    }

    /// Waits until every submitted task holds a slot.
    ///
    /// Running publishes are not awaited.
    pub async fn wait_backlog_empty(&self) {
        self.backlog.wait_empty().await;
    }

    /// Returns true once the pool stopped accepting tasks.
    pub fn is_closed(&self) -> bool {
        self.queue.lock().is_none()
    }

    /// Stops accepting tasks and waits up to `grace` for every queued and
    /// running publish to finish. Idempotent.
    ///
    /// Returns false if `grace` ran out. Queued tasks are then dropped and
    /// running publishes are left to settle on their own.
    pub async fn drain(&self, grace: Duration) -> bool {
        drop(self.queue.lock().take());
        let dispatcher = self.dispatcher.lock().take();
        let abort = dispatcher.as_ref().map(JoinHandle::abort_handle);

        let settle = async {
            if let Some(dispatcher) = dispatcher {
                if let Err(e) = dispatcher.await {
                    warn!(error = %e, "fan-out dispatcher terminated abnormally");
                }
            }

            // Every spawned publish holds a permit until it finishes.
            match self.slots.acquire_many(self.permits).await {
                Ok(permits) => drop(permits),
                Err(e) => warn!(error = %e, "fan-out slots closed while draining"),
            }
        };

        if tokio::time::timeout(grace, settle).await.is_ok() {
            return true;
        }

        if let Some(abort) = abort {
            abort.abort();
        }
        warn!(
            grace = ?grace,
            queued = self.backlog(),
            running = self.concurrency().saturating_sub(self.slots.available_permits()),
            "fan-out pool did not drain in time, abandoning outstanding publishes"
        );
        false
    }
}

#[async_trait]
impl CheckpointGate for FanoutPool {
    async fn ready(&self) {
        self.wait_backlog_empty().await;
    }
}

async fn dispatch(
    mut rx: mpsc::UnboundedReceiver<PublishTask>,
    slots: Arc<Semaphore>,
    backlog: Arc<Backlog>,
    publisher: Arc<Publisher>,
    stats: Arc<RelayStats>,
    reporter: ErrorReporter,
) {
    while let Some(task) = rx.recv().await {
        let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
            break;
        };

        let publisher = Arc::clone(&publisher);
        let stats = Arc::clone(&stats);
        let reporter = reporter.clone();

        tokio::spawn(async move {
            stats.task_started();
            let result = publisher.publish(&task.payload).await;
            stats.task_finished();

            match result {
                Ok(()) => {
                    stats.record_published();
                    debug!(position = %task.position, "event published");
                }
                Err(e) => {
                    warn!(position = %task.position, error = %e, "publish failed");
                    stats.record_publish_failure(&e.to_string());
                    reporter.report(e);
                }
            }
            drop(permit);
        });
        backlog.pop();
    }
}
