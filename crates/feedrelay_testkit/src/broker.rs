//! Recording broker for asserting on published messages.

use async_trait::async_trait;
use bytes::Bytes;
use feedrelay_core::{Broker, Destination, RelayError, RelayResult};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// One message as the broker received it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedMessage {
    /// Where it was published.
    pub destination: Destination,
    /// Raw body.
    pub body: Bytes,
}

impl RecordedMessage {
    /// Parses the body as JSON. Returns `Value::Null` for non-JSON bodies.
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or(Value::Null)
    }
}

/// A [`Broker`] that keeps every message in memory.
///
/// Supports injected latency, refused connections and rejected publishes,
/// and tracks how many publishes were in flight at once.
#[derive(Debug, Default)]
pub struct RecordingBroker {
    messages: Mutex<Vec<RecordedMessage>>,
    arrived: Notify,
    delay: Mutex<Option<Duration>>,
    unreachable: AtomicBool,
    connected: AtomicBool,
    reject_all: AtomicBool,
    reject_next: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    connects: AtomicUsize,
    closes: AtomicUsize,
}

impl RecordingBroker {
    /// Creates a broker accepting everything immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every publish by `delay`.
    #[must_use]
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock() = Some(delay);
        self
    }

    /// Changes the publish delay.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Makes `connect` fail while `reachable` is false.
    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Rejects every publish while `reject` is true.
    pub fn set_rejecting(&self, reject: bool) {
        self.reject_all.store(reject, Ordering::SeqCst);
    }

    /// Rejects the next `count` publishes.
    pub fn reject_next(&self, count: usize) {
        self.reject_next.store(count, Ordering::SeqCst);
    }

    /// Returns every accepted message in arrival order.
    pub fn messages(&self) -> Vec<RecordedMessage> {
        self.messages.lock().clone()
    }

    /// Returns every accepted message body parsed as JSON.
    pub fn payloads(&self) -> Vec<Value> {
        self.messages.lock().iter().map(RecordedMessage::json).collect()
    }

    /// Number of accepted messages.
    pub fn message_count(&self) -> usize {
        self.messages.lock().len()
    }

    /// Highest number of concurrent publishes seen.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Returns true between `connect` and `close`.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Number of successful connects.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Number of closes.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Waits until at least `count` messages arrived.
    ///
    /// Returns false if `timeout` elapsed first.
    pub async fn wait_for_messages(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let arrived = self.arrived.notified();
                tokio::pin!(arrived);
                arrived.as_mut().enable();
                if self.message_count() >= count {
                    return;
                }
                arrived.await;
            }
        })
        .await
        .is_ok()
    }

    fn should_reject(&self) -> bool {
        if self.reject_all.load(Ordering::SeqCst) {
            return true;
        }
        self.reject_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Broker for RecordingBroker {
    async fn connect(&self) -> RelayResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(RelayError::connection("sink", "connection refused"));
        }
        self.connected.store(true, Ordering::SeqCst);
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, destination: &Destination, body: Bytes) -> RelayResult<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.should_reject() {
            return Err(RelayError::Publish("message nacked by broker".into()));
        }

        self.messages.lock().push(RecordedMessage {
            destination: destination.clone(),
            body,
        });
        self.arrived.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> RelayResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
