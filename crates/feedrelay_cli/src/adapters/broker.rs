//! A broker appending messages to JSON-lines files.

use crate::config::check_file_name;
use async_trait::async_trait;
use bytes::Bytes;
use feedrelay_core::{Broker, Destination, RelayError, RelayResult};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// File name used for messages published with an empty routing key.
pub const DEFAULT_ROUTE_FILE: &str = "_default";

/// Broker writing each message as one line of `<root>/<exchange>/<routing key>.jsonl`.
///
/// Appends are serialized so that lines from concurrent publishes never interleave.
#[derive(Debug)]
pub struct JsonLinesBroker {
    root: PathBuf,
    write_lock: Mutex<()>,
    connected: AtomicBool,
}

impl JsonLinesBroker {
    /// Creates a broker rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
            connected: AtomicBool::new(false),
        }
    }

    /// Returns the file messages for `destination` are appended to.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Configuration`] if the exchange or routing key
    /// is not a plain file name.
    pub fn message_path(&self, destination: &Destination) -> RelayResult<PathBuf> {
        check_file_name("sink.exchange", &destination.exchange)?;
        let route = if destination.routing_key.is_empty() {
            DEFAULT_ROUTE_FILE
        } else {
            check_file_name("sink.routingKey", &destination.routing_key)?;
            destination.routing_key.as_str()
        };
        Ok(self
            .root
            .join(&destination.exchange)
            .join(format!("{route}.jsonl")))
    }
}

#[async_trait]
impl Broker for JsonLinesBroker {
    async fn connect(&self) -> RelayResult<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| RelayError::connection("sink", format!("{}: {e}", self.root.display())))?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, destination: &Destination, body: Bytes) -> RelayResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(RelayError::NotConnected);
        }

        let path = self.message_path(destination)?;
        let publish_err = |e: std::io::Error| RelayError::Publish(format!("{}: {e}", path.display()));

        let _guard = self.write_lock.lock().await;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(publish_err)?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(publish_err)?;

        let mut line = Vec::with_capacity(body.len() + 1);
        line.extend_from_slice(&body);
        line.push(b'\n');
        file.write_all(&line).await.map_err(publish_err)?;
        file.flush().await.map_err(publish_err)?;
        Ok(())
    }

    async fn close(&self) -> RelayResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn read_lines(path: &Path) -> Vec<Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn publish_requires_connect() {
        let dir = TempDir::new().unwrap();
        let broker = JsonLinesBroker::new(dir.path());
        let destination = Destination::new("orders", "");

        let err = broker
            .publish(&destination, Bytes::from_static(b"{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NotConnected));
    }

    #[tokio::test]
    async fn appends_one_line_per_message() {
        let dir = TempDir::new().unwrap();
        let broker = JsonLinesBroker::new(dir.path().join("broker"));
        broker.connect().await.unwrap();

        let destination = Destination::new("orders", "created");
        broker
            .publish(&destination, Bytes::from(json!({ "_id": 1 }).to_string()))
            .await
            .unwrap();
        broker
            .publish(&destination, Bytes::from(json!({ "_id": 2 }).to_string()))
            .await
            .unwrap();

        let path = broker.message_path(&destination).unwrap();
        assert!(path.ends_with("orders/created.jsonl"));
        assert_eq!(read_lines(&path), vec![json!({ "_id": 1 }), json!({ "_id": 2 })]);
    }

    #[test]
    fn empty_routing_key_uses_default_file() {
        let broker = JsonLinesBroker::new("/srv/broker");
        let path = broker.message_path(&Destination::new("orders", "")).unwrap();
        assert_eq!(path, PathBuf::from("/srv/broker/orders/_default.jsonl"));
    }

    #[tokio::test]
    async fn concurrent_publishes_do_not_interleave() {
        let dir = TempDir::new().unwrap();
        let broker = Arc::new(JsonLinesBroker::new(dir.path()));
        broker.connect().await.unwrap();
        let destination = Destination::new("orders", "");

        let mut handles = Vec::new();
        for i in 0..20 {
            let broker = Arc::clone(&broker);
            let destination = destination.clone();
            handles.push(tokio::spawn(async move {
                let body = json!({ "_id": i, "padding": "x".repeat(512) }).to_string();
                broker.publish(&destination, Bytes::from(body)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(read_lines(&broker.message_path(&destination).unwrap()).len(), 20);
    }

    #[tokio::test]
    async fn names_outside_the_root_are_rejected() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("broker");
        let broker = JsonLinesBroker::new(&root);
        broker.connect().await.unwrap();

        for destination in [
            Destination::new("../escaped", ""),
            Destination::new("orders", "../../escaped"),
            Destination::new("orders", ".."),
        ] {
            let err = broker
                .publish(&destination, Bytes::from_static(b"{}"))
                .await
                .unwrap_err();
            assert!(matches!(err, RelayError::Configuration { .. }));
        }
        assert!(!dir.path().join("escaped.jsonl").exists());
        assert!(!dir.path().join("escaped").exists());
    }
}
