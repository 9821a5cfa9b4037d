//! A change source tailing a JSON-lines change log.
//!
//! Each line of the log is one [`ChangeEvent`] in its JSON form:
//!
//! ```text
//! {"operationKind":"insert","sourcePosition":"0000000000000001","documentKey":{"_id":1},"fullDocument":{"_id":1,"sku":"a"}}
//! ```
//!
//! Positions must sort in log order (zero-padded counters or timestamps).
//! The log is append-only; a stream polls the file for new lines.

use async_trait::async_trait;
use feedrelay_core::{
    ChangeEvent, ChangeSource, ChangeStream, OperationKind, RelayError, RelayResult,
    SourcePosition, WatchOptions,
};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

/// Default delay between polls of an idle log.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Change source reading `<database dir>/<collection>.jsonl`.
#[derive(Debug)]
pub struct JsonLinesSource {
    database_dir: PathBuf,
    path: PathBuf,
    poll_interval: Duration,
    connected: AtomicBool,
}

impl JsonLinesSource {
    /// Creates a source for the change log at `path` inside `database_dir`.
    pub fn new(database_dir: impl Into<PathBuf>, path: impl Into<PathBuf>) -> Self {
        Self {
            database_dir: database_dir.into(),
            path: path.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            connected: AtomicBool::new(false),
        }
    }

    /// Sets how long an idle stream waits before reading the log again.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Returns the change log path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ChangeSource for JsonLinesSource {
    async fn connect(&self) -> RelayResult<()> {
        match tokio::fs::metadata(&self.database_dir).await {
            Ok(meta) if meta.is_dir() => {
                self.connected.store(true, Ordering::SeqCst);
                Ok(())
            }
            Ok(_) => Err(RelayError::connection(
                "source",
                format!("{} is not a directory", self.database_dir.display()),
            )),
            Err(e) => Err(RelayError::connection(
                "source",
                format!("{}: {e}", self.database_dir.display()),
            )),
        }
    }

    async fn watch(&self, options: WatchOptions) -> RelayResult<Box<dyn ChangeStream>> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(RelayError::Subscription("source is not connected".into()));
        }

        let from_now = options.resume_after.is_none();
        let mut stream = JsonLinesStream::new(self.path.clone(), options, self.poll_interval);
        if from_now {
            let existing = read_from(&stream.path, 0).await?;
            stream.ingest(&existing, false)?;
        }
        debug!(path = %self.path.display(), offset = stream.offset, "change log opened");
        Ok(Box::new(stream))
    }

    async fn close(&self) -> RelayResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct JsonLinesStream {
    path: PathBuf,
    offset: u64,
    line: u64,
    resume_after: Option<SourcePosition>,
    lookup: bool,
    documents: HashMap<String, Value>,
    pending: VecDeque<ChangeEvent>,
    poll_interval: Duration,
    open: bool,
}

impl JsonLinesStream {
    fn new(path: PathBuf, options: WatchOptions, poll_interval: Duration) -> Self {
        Self {
            path,
            offset: 0,
            line: 0,
            resume_after: options.resume_after,
            lookup: options.lookup_full_document,
            documents: HashMap::new(),
            pending: VecDeque::new(),
            poll_interval,
            open: true,
        }
    }

    /// Parses the complete lines of `bytes`, which start at `self.offset`.
    ///
    /// Events are queued only when `deliver` is set; skipped events still
    /// feed the document index used for update lookups.
    fn ingest(&mut self, bytes: &[u8], deliver: bool) -> RelayResult<()> {
        let Some(end) = bytes.iter().rposition(|b| *b == b'\n') else {
            return Ok(());
        };

        for raw in bytes[..end].split(|b| *b == b'\n') {
            self.line += 1;
            if raw.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let mut event: ChangeEvent = serde_json::from_slice(raw).map_err(|e| {
                RelayError::Subscription(format!(
                    "{}:{}: malformed change event: {e}",
                    self.path.display(),
                    self.line
                ))
            })?;

            if self.lookup
                && event.operation_kind == OperationKind::Update
                && event.full_document.is_none()
            {
                event.full_document = document_id(&event)
                    .and_then(|id| self.documents.get(&id))
                    .cloned();
            }
            self.index(&event);

            let replayed = self
                .resume_after
                .as_ref()
                .is_some_and(|after| event.source_position <= *after);
            if deliver && !replayed {
                self.pending.push_back(event);
            }
        }

        self.offset += end as u64 + 1;
        Ok(())
    }

    fn index(&mut self, event: &ChangeEvent) {
        let Some(id) = document_id(event) else {
            return;
        };
        match event.operation_kind {
            OperationKind::Delete => {
                self.documents.remove(&id);
            }
            _ => {
                if let Some(document) = &event.full_document {
                    self.documents.insert(id, document.clone());
                }
            }
        }
    }

    /// Reads lines appended since the last poll. Returns true if any arrived.
    async fn poll(&mut self) -> RelayResult<bool> {
        let bytes = read_from(&self.path, self.offset).await?;
        let queued = self.pending.len();
        self.ingest(&bytes, true)?;
        Ok(self.pending.len() > queued)
    }
}

#[async_trait]
impl ChangeStream for JsonLinesStream {
    async fn next_event(&mut self) -> Option<RelayResult<ChangeEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }
            if !self.open {
                return None;
            }
            match self.poll().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(self.poll_interval).await,
                Err(e) => {
                    self.open = false;
                    return Some(Err(e));
                }
            }
        }
    }

    async fn close(&mut self) {
        self.open = false;
        self.pending.clear();
    }
}

fn document_id(event: &ChangeEvent) -> Option<String> {
    event
        .document_key
        .as_ref()
        .and_then(|key| key.get("_id"))
        .map(Value::to_string)
}

/// Reads the log from `offset` to its current end. A missing log reads as empty.
async fn read_from(path: &Path, offset: u64) -> RelayResult<Vec<u8>> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(subscription_io(path, &e)),
    };

    let len = file
        .metadata()
        .await
        .map_err(|e| subscription_io(path, &e))?
        .len();
    if len < offset {
        return Err(RelayError::Subscription(format!(
            "{} was truncated",
            path.display()
        )));
    }

    file.seek(std::io::SeekFrom::Start(offset))
        .await
        .map_err(|e| subscription_io(path, &e))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)
        .await
        .map_err(|e| subscription_io(path, &e))?;
    Ok(bytes)
}

fn subscription_io(path: &Path, error: &std::io::Error) -> RelayError {
    RelayError::Subscription(format!("{}: {error}", path.display()))
}
