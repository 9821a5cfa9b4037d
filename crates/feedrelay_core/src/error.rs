//! Error types for the relay pipeline.

use crate::event::OperationKind;
use feedrelay_checkpoint::{CheckpointError, SourcePosition};
use thiserror::Error;
use tokio::sync::mpsc;

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

/// Errors that can occur while building or running a relay.
#[derive(Error, Debug)]
pub enum RelayError {
    /// A construction field is missing or invalid.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Dotted path of the offending field.
        field: String,
        /// Description naming the field.
        message: String,
    },

    /// The source, sink or checkpoint store could not be reached during start.
    #[error("connection to {target} failed: {message}")]
    Connection {
        /// What was being connected ("source", "sink", "checkpoint store").
        target: String,
        /// Error message.
        message: String,
    },

    /// The open subscription terminated while running.
    #[error("subscription lost: {0}")]
    Subscription(String),

    /// A single publish failed.
    #[error("publish failed: {0}")]
    Publish(String),

    /// An event does not carry the fields its payload shape needs.
    #[error("cannot transform {operation} event at position {position}: {message}")]
    Transform {
        /// Operation kind of the event.
        operation: OperationKind,
        /// Source position of the event.
        position: SourcePosition,
        /// What is missing or malformed.
        message: String,
    },

    /// Checkpoint store error.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Invalid lifecycle transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// The publisher has no open broker channel.
    #[error("sink is not connected")]
    NotConnected,
}

impl RelayError {
    /// Creates a configuration error for a field.
    pub fn configuration(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates a "field is required" configuration error.
    pub fn missing_field(field: &str) -> Self {
        Self::configuration(field, format!("{field} is required"))
    }

    /// Creates a connection error.
    pub fn connection(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Returns true if this error ends the current run (or the construction).
    ///
    /// Publish failures and failed checkpoint writes are reported but the
    /// relay keeps running.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            RelayError::Publish(_) | RelayError::Checkpoint(_) | RelayError::NotConnected
        )
    }
}

/// Forwards runtime errors to the owner of a relay.
///
/// Reporting never blocks and never fails; errors reported after the owner
/// dropped its receiver are discarded.
#[derive(Debug, Clone)]
pub struct ErrorReporter {
    tx: mpsc::UnboundedSender<RelayError>,
}

impl ErrorReporter {
    /// Creates a reporter and the receiver the owner listens on.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RelayError>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Reports an error.
    pub fn report(&self, error: RelayError) {
        let _ = self.tx.send(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_errors() {
        assert!(RelayError::missing_field("source.uri").is_fatal());
        assert!(RelayError::connection("sink", "refused").is_fatal());
        assert!(RelayError::Subscription("cursor killed".into()).is_fatal());
        assert!(!RelayError::Publish("channel closed".into()).is_fatal());
        assert!(!RelayError::Checkpoint(CheckpointError::Unavailable("down".into())).is_fatal());
    }

    #[test]
    fn missing_field_names_field() {
        let err = RelayError::missing_field("source.collection");
        assert_eq!(
            err.to_string(),
            "invalid configuration: source.collection is required"
        );
        assert!(matches!(err, RelayError::Configuration { ref field, .. } if field == "source.collection"));
    }

    #[test]
    fn transform_error_display() {
        let err = RelayError::Transform {
            operation: OperationKind::Update,
            position: SourcePosition::new("0000000000000004"),
            message: "fullDocument is missing".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("update"));
        assert!(msg.contains("0000000000000004"));
    }

    #[tokio::test]
    async fn reporter_delivers_and_tolerates_closed_receiver() {
        let (reporter, mut rx) = ErrorReporter::channel();
        reporter.report(RelayError::Publish("nack".into()));
        assert!(matches!(rx.recv().await, Some(RelayError::Publish(_))));

        drop(rx);
        reporter.report(RelayError::Publish("ignored".into()));
    }
}
