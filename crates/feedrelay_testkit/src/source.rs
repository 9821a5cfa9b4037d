//! In-memory change log acting as a [`ChangeSource`].

use async_trait::async_trait;
use feedrelay_core::{
    ChangeEvent, ChangeSource, ChangeStream, OperationKind, RelayError, RelayResult,
    SourcePosition, WatchOptions,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Formats a sequence number as a source position.
///
/// Fixed-width hex keeps lexicographic and numeric order identical.
pub fn position(seq: u64) -> SourcePosition {
    SourcePosition::new(format!("{seq:016x}"))
}

#[derive(Default)]
struct LogState {
    events: Vec<ChangeEvent>,
    documents: HashMap<String, Value>,
    next_id: u64,
    epoch: u64,
    failure: Option<String>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<LogState>,
    appended: Notify,
    open_streams: AtomicUsize,
}

/// A replicated collection's change log, kept in memory.
///
/// Writes append change events with monotonically increasing positions and
/// maintain the current documents, so update lookups see the latest version
/// at read time. Subscriptions block until new events arrive, which lets a
/// test write to the log while a relay is consuming it.
///
/// # Example
///
/// ```rust
/// use feedrelay_testkit::MemoryChangeLog;
/// use serde_json::json;
///
/// let log = MemoryChangeLog::new();
/// log.insert(json!({ "_id": "a1", "field1": "test-1" }));
/// log.delete(json!("a1"));
/// assert_eq!(log.len(), 2);
/// ```
#[derive(Default)]
pub struct MemoryChangeLog {
    shared: Arc<Shared>,
    unreachable: AtomicBool,
    connected: AtomicBool,
    connects: AtomicUsize,
}

impl MemoryChangeLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    fn append(
        &self,
        kind: OperationKind,
        document_key: Option<Value>,
        full_document: Option<Value>,
    ) -> SourcePosition {
        let pos = {
            let mut state = self.shared.state.lock();
            let pos = position(state.events.len() as u64 + 1);
            let mut event = ChangeEvent::new(kind, pos.clone());
            event.document_key = document_key;
            event.full_document = full_document;
            state.events.push(event);
            pos
        };
        self.shared.appended.notify_waiters();
        pos
    }

    /// Inserts a document, assigning a numeric `_id` if it has none.
    pub fn insert(&self, mut document: Value) -> SourcePosition {
        let id = {
            let mut state = self.shared.state.lock();
            let id = match document.get("_id") {
                Some(id) => id.clone(),
                None => {
                    state.next_id += 1;
                    json!(state.next_id)
                }
            };
            if let Some(object) = document.as_object_mut() {
                object.insert("_id".into(), id.clone());
            }
            state.documents.insert(id.to_string(), document.clone());
            id
        };
        self.append(
            OperationKind::Insert,
            Some(json!({ "_id": id })),
            Some(document),
        )
    }

    /// Merges `changes` into an existing document.
    ///
    /// Like a real source, the event itself carries no document; a lookup
    /// subscription fills it in at read time.
    pub fn update(&self, id: Value, changes: Value) -> SourcePosition {
        {
            let mut state = self.shared.state.lock();
            let document = state
                .documents
                .entry(id.to_string())
                .or_insert_with(|| json!({ "_id": id.clone() }));
            if let (Some(target), Some(changes)) = (document.as_object_mut(), changes.as_object()) {
                for (field, value) in changes {
                    target.insert(field.clone(), value.clone());
                }
            }
        }
        self.append(OperationKind::Update, Some(json!({ "_id": id })), None)
    }

    /// Replaces a document as a whole.
    pub fn replace(&self, id: Value, mut document: Value) -> SourcePosition {
        if let Some(object) = document.as_object_mut() {
            object.insert("_id".into(), id.clone());
        }
        self.shared
            .state
            .lock()
            .documents
            .insert(id.to_string(), document.clone());
        self.append(
            OperationKind::Replace,
            Some(json!({ "_id": id })),
            Some(document),
        )
    }

    /// Deletes a document.
    pub fn delete(&self, id: Value) -> SourcePosition {
        self.shared.state.lock().documents.remove(&id.to_string());
        self.append(OperationKind::Delete, Some(json!({ "_id": id })), None)
    }

    /// Appends a collection-level event such as `drop` or `invalidate`.
    pub fn collection_event(&self, kind: OperationKind) -> SourcePosition {
        self.append(kind, None, None)
    }

    /// Appends a raw event with the given fields.
    pub fn push_raw(
        &self,
        kind: OperationKind,
        document_key: Option<Value>,
        full_document: Option<Value>,
    ) -> SourcePosition {
        self.append(kind, document_key, full_document)
    }

    /// Returns every event in log order.
    pub fn events(&self) -> Vec<ChangeEvent> {
        self.shared.state.lock().events.clone()
    }

    /// Returns the number of events.
    pub fn len(&self) -> usize {
        self.shared.state.lock().events.len()
    }

    /// Returns true if nothing was written.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the position of the newest event.
    pub fn last_position(&self) -> Option<SourcePosition> {
        self.shared
            .state
            .lock()
            .events
            .last()
            .map(|e| e.source_position.clone())
    }

    /// Returns the current version of a document.
    pub fn document(&self, id: &Value) -> Option<Value> {
        self.shared.state.lock().documents.get(&id.to_string()).cloned()
    }

    /// Fails every open subscription with `reason`. Later subscriptions work.
    pub fn fail_subscriptions(&self, reason: impl Into<String>) {
        {
            let mut state = self.shared.state.lock();
            state.epoch += 1;
            state.failure = Some(reason.into());
        }
        self.shared.appended.notify_waiters();
    }

    /// Makes `connect` fail while `reachable` is false.
    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Returns true between a successful `connect` and `close`.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Number of successful connects.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Number of subscriptions not yet closed or dropped.
    pub fn open_streams(&self) -> usize {
        self.shared.open_streams.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MemoryChangeLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChangeLog")
            .field("events", &self.len())
            .field("open_streams", &self.open_streams())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ChangeSource for MemoryChangeLog {
    async fn connect(&self) -> RelayResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(RelayError::connection("source", "server selection timed out"));
        }
        self.connected.store(true, Ordering::SeqCst);
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn watch(&self, options: WatchOptions) -> RelayResult<Box<dyn ChangeStream>> {
        if !self.is_connected() {
            return Err(RelayError::Subscription("source is not connected".into()));
        }

        let (cursor, epoch) = {
            let state = self.shared.state.lock();
            let cursor = match &options.resume_after {
                Some(after) => state
                    .events
                    .iter()
                    .position(|e| e.source_position > *after)
                    .unwrap_or(state.events.len()),
                None => state.events.len(),
            };
            (cursor, state.epoch)
        };

        self.shared.open_streams.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryChangeStream {
            shared: Arc::clone(&self.shared),
            cursor,
            epoch,
            lookup: options.lookup_full_document,
            open: true,
        }))
    }

    async fn close(&self) -> RelayResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryChangeStream {
    shared: Arc<Shared>,
    cursor: usize,
    epoch: u64,
    lookup: bool,
    open: bool,
}

impl MemoryChangeStream {
    fn poll_log(&mut self) -> Option<RelayResult<ChangeEvent>> {
        let state = self.shared.state.lock();

        if state.epoch != self.epoch {
            let reason = state.failure.clone().unwrap_or_default();
            return Some(Err(RelayError::Subscription(reason)));
        }

        let mut event = state.events.get(self.cursor)?.clone();
        self.cursor += 1;

        if self.lookup && event.operation_kind == OperationKind::Update {
            event.full_document = event
                .document_key
                .as_ref()
                .and_then(|key| key.get("_id"))
                .and_then(|id| state.documents.get(&id.to_string()).cloned());
        }
        Some(Ok(event))
    }

    fn release(&mut self) {
        if self.open {
            self.open = false;
            self.shared.open_streams.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl ChangeStream for MemoryChangeStream {
    async fn next_event(&mut self) -> Option<RelayResult<ChangeEvent>> {
        let shared = Arc::clone(&self.shared);
        loop {
            if !self.open {
                return None;
            }

            let notified = shared.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(next) = self.poll_log() {
                return Some(next);
            }
            notified.await;
        }
    }

    async fn close(&mut self) {
        self.release();
    }
}

impl Drop for MemoryChangeStream {
    fn drop(&mut self) {
        self.release();
    }
}
