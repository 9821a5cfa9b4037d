//! Publisher sink: the broker seam and the connection-tracking publisher.

use crate::error::{RelayError, RelayResult};
use crate::event::Payload;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// A static (exchange, routing key) pair every message is published to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    /// Exchange name.
    pub exchange: String,
    /// Routing key; may be empty.
    pub routing_key: String,
}

impl Destination {
    /// Creates a destination.
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.exchange, self.routing_key)
    }
}

/// Message broker client.
///
/// This trait abstracts the broker wire protocol. `publish` resolves once the
/// broker acknowledged the message, or once it was enqueued locally when the
/// broker offers no acknowledgment.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Opens the connection and channel.
    async fn connect(&self) -> RelayResult<()>;

    /// Publishes one message body.
    async fn publish(&self, destination: &Destination, body: Bytes) -> RelayResult<()>;

    /// Closes the channel and connection.
    async fn close(&self) -> RelayResult<()>;
}

/// Publishes payloads to a fixed destination over a [`Broker`].
///
/// Shared between the relay and its publish tasks.
pub struct Publisher {
    broker: Arc<dyn Broker>,
    destination: Destination,
    connected: AtomicBool,
}

impl Publisher {
    /// Creates a publisher. Nothing is connected until [`Publisher::connect`].
    pub fn new(broker: Arc<dyn Broker>, destination: Destination) -> Self {
        Self {
            broker,
            destination,
            connected: AtomicBool::new(false),
        }
    }

    /// Returns the destination.
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Returns true while the broker channel is open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Establishes the broker channel. Calling it while connected does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Connection`] if the broker cannot be reached.
    pub async fn connect(&self) -> RelayResult<()> {
        if self.is_connected() {
            return Ok(());
        }

        match self.broker.connect().await {
            Ok(()) => {}
            Err(e @ RelayError::Connection { .. }) => return Err(e),
            Err(e) => return Err(RelayError::connection("sink", e.to_string())),
        }

        self.connected.store(true, Ordering::SeqCst);
        info!(destination = %self.destination, "sink connected");
        Ok(())
    }

    /// Publishes one payload as a JSON message.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::NotConnected`] before `connect` or after `close`,
    /// and [`RelayError::Publish`] if the broker rejects the message.
    pub async fn publish(&self, payload: &Payload) -> RelayResult<()> {
        if !self.is_connected() {
            return Err(RelayError::NotConnected);
        }

        let body = serde_json::to_vec(payload)
            .map(Bytes::from)
            .map_err(|e| RelayError::Publish(e.to_string()))?;
        let len = body.len();

        match self.broker.publish(&self.destination, body).await {
            Ok(()) => {
                debug!(destination = %self.destination, bytes = len, "message published");
                Ok(())
            }
            Err(e @ (RelayError::Publish(_) | RelayError::NotConnected)) => Err(e),
            Err(e) => Err(RelayError::Publish(e.to_string())),
        }
    }

    /// Releases the channel and connection. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns the broker's error if closing failed; the publisher counts as
    /// closed either way.
    pub async fn close(&self) -> RelayResult<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.broker.close().await?;
        info!(destination = %self.destination, "sink closed");
        Ok(())
    }
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("destination", &self.destination)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBroker;
    use serde_json::json;

    fn publisher(broker: &Arc<MockBroker>) -> Publisher {
        Publisher::new(broker.clone(), Destination::new("testexchange", ""))
    }

    #[tokio::test]
    async fn publish_requires_connect() {
        let broker = Arc::new(MockBroker::new());
        let publisher = publisher(&broker);

        let result = publisher.publish(&json!({ "_id": 1 })).await;
        assert!(matches!(result, Err(RelayError::NotConnected)));
        assert!(broker.messages().is_empty());
    }

    #[tokio::test]
    async fn publish_sends_json_body() {
        let broker = Arc::new(MockBroker::new());
        let publisher = publisher(&broker);
        publisher.connect().await.unwrap();

        publisher
            .publish(&json!({ "_id": "a1", "field1": "test-1" }))
            .await
            .unwrap();

        let messages = broker.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, Destination::new("testexchange", ""));
        let body: serde_json::Value = serde_json::from_slice(&messages[0].1).unwrap();
        assert_eq!(body["field1"], "test-1");
    }

    #[tokio::test]
    async fn connect_failure_is_connection_error() {
        let broker = Arc::new(MockBroker::new());
        broker.set_reachable(false);
        let publisher = publisher(&broker);

        let result = publisher.connect().await;
        assert!(matches!(result, Err(RelayError::Connection { ref target, .. }) if target == "sink"));
        assert!(!publisher.is_connected());
    }

    #[tokio::test]
    async fn broker_rejection_is_publish_error() {
        let broker = Arc::new(MockBroker::new());
        let publisher = publisher(&broker);
        publisher.connect().await.unwrap();
        broker.set_rejecting(true);

        let result = publisher.publish(&json!({})).await;
        assert!(matches!(result, Err(RelayError::Publish(_))));
    }

    #[tokio::test]
    async fn connect_and_close_are_idempotent() {
        let broker = Arc::new(MockBroker::new());
        let publisher = publisher(&broker);

        publisher.close().await.unwrap();
        publisher.connect().await.unwrap();
        publisher.connect().await.unwrap();
        assert_eq!(broker.connect_count(), 1);

        publisher.close().await.unwrap();
        publisher.close().await.unwrap();
        assert_eq!(broker.close_count(), 1);
        assert!(!publisher.is_connected());
    }
}
