//! # feedrelay Core
//!
//! Relays change events from an ordered, resumable data-source feed into a
//! message-broker destination with at-least-once delivery.
//!
//! This crate provides:
//! - Change events and operation kinds
//! - Per-kind payload shaping ([`Transformer`])
//! - The broker seam and connection-tracking [`Publisher`]
//! - A bounded-concurrency [`FanoutPool`] for publish tasks
//! - The resumable [`FeedConsumer`] with throttled, serialized checkpoints
//! - The [`Relay`] lifecycle tying them together
//!
//! ## Delivery guarantees
//!
//! A checkpoint is written every `concurrency` handled events, recording the
//! position of the event just handed to the pool. After a crash the relay
//! resumes after that position, so at most `concurrency` events are
//! redelivered and none is permanently lost. Events the source emitted before
//! the first-ever start (no checkpoint yet) are not relayed.
//!
//! ## Collaborators
//!
//! The data source and the broker are reached through the [`ChangeSource`]
//! and [`Broker`] traits; checkpoints go through
//! [`feedrelay_checkpoint::CheckpointStore`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod consumer;
pub mod error;
pub mod event;
pub mod pool;
pub mod relay;
pub mod sink;
pub mod source;
pub mod stats;
pub mod transform;

#[cfg(test)]
mod testing;

pub use config::{
    CheckpointConfig, RelayConfig, RestartPolicy, SinkConfig, SourceConfig, DEFAULT_CONCURRENCY,
    DEFAULT_DRAIN_TIMEOUT_MS,
};
pub use consumer::{CheckpointGate, CheckpointTarget, EventHandler, FeedConsumer, HandlerRegistry};
pub use error::{ErrorReporter, RelayError, RelayResult};
pub use event::{ChangeEvent, OperationKind, Payload};
pub use pool::{FanoutPool, PublishTask};
pub use relay::{Relay, RelayState};
pub use sink::{Broker, Destination, Publisher};
pub use source::{ChangeSource, ChangeStream, WatchOptions};
pub use stats::{RelayStats, RelayStatsSnapshot};
pub use transform::{PayloadShape, Transformer};

pub use feedrelay_checkpoint::{Checkpoint, CheckpointStore, SourcePosition};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
