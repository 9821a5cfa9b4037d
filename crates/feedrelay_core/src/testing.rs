//! In-crate doubles for unit tests.

use crate::error::{RelayError, RelayResult};
use crate::event::ChangeEvent;
use crate::sink::{Broker, Destination};
use crate::source::{ChangeSource, ChangeStream, WatchOptions};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Broker that records messages in memory.
#[derive(Debug, Default)]
pub struct MockBroker {
    messages: Mutex<Vec<(Destination, Bytes)>>,
    unreachable: AtomicBool,
    rejecting: AtomicBool,
    delay: Mutex<Option<Duration>>,
    connects: AtomicUsize,
    closes: AtomicUsize,
    current: AtomicUsize,
    max_concurrent: AtomicUsize,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(Destination, Bytes)> {
        self.messages.lock().clone()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn connect(&self) -> RelayResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(RelayError::connection("sink", "connection refused"));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, destination: &Destination, body: Bytes) -> RelayResult<()> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.current.fetch_sub(1, Ordering::SeqCst);

        if self.rejecting.load(Ordering::SeqCst) {
            return Err(RelayError::Publish("message nacked".into()));
        }
        self.messages.lock().push((destination.clone(), body));
        Ok(())
    }

    async fn close(&self) -> RelayResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Source replaying a fixed list of events.
///
/// Streams yield every scripted event after the resume position, then either
/// wait forever or fail, depending on `set_fail_at_end`.
#[derive(Debug, Default)]
pub struct MockSource {
    events: Mutex<Vec<ChangeEvent>>,
    fail_at_end: AtomicBool,
    unreachable: AtomicBool,
    watches: Mutex<Vec<WatchOptions>>,
    open_streams: Arc<AtomicUsize>,
    closes: AtomicUsize,
}

impl MockSource {
    pub fn new(events: Vec<ChangeEvent>) -> Self {
        Self {
            events: Mutex::new(events),
            ..Self::default()
        }
    }

    pub fn set_fail_at_end(&self, fail: bool) {
        self.fail_at_end.store(fail, Ordering::SeqCst);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub fn watches(&self) -> Vec<WatchOptions> {
        self.watches.lock().clone()
    }

    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChangeSource for MockSource {
    async fn connect(&self) -> RelayResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(RelayError::connection("source", "no primary available"));
        }
        Ok(())
    }

    async fn watch(&self, options: WatchOptions) -> RelayResult<Box<dyn ChangeStream>> {
        let events: Vec<ChangeEvent> = self
            .events
            .lock()
            .iter()
            .filter(|e| {
                options
                    .resume_after
                    .as_ref()
                    .map_or(true, |after| e.source_position > *after)
            })
            .cloned()
            .collect();
        self.watches.lock().push(options);
        self.open_streams.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MockStream {
            events: events.into_iter(),
            fail_at_end: self.fail_at_end.load(Ordering::SeqCst),
            open_streams: Arc::clone(&self.open_streams),
            closed: false,
        }))
    }

    async fn close(&self) -> RelayResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MockStream {
    events: std::vec::IntoIter<ChangeEvent>,
    fail_at_end: bool,
    open_streams: Arc<AtomicUsize>,
    closed: bool,
}

#[async_trait]
impl ChangeStream for MockStream {
    async fn next_event(&mut self) -> Option<RelayResult<ChangeEvent>> {
        if let Some(event) = self.events.next() {
            return Some(Ok(event));
        }
        if self.fail_at_end {
            return Some(Err(RelayError::Subscription("cursor killed".into())));
        }
        std::future::pending().await
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.open_streams.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
