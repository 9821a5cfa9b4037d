//! Configuration for a relay.

use crate::error::{RelayError, RelayResult};
use crate::event::OperationKind;
use crate::sink::Destination;
use crate::transform::{PayloadShape, Transformer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Concurrency used when a configuration file does not set one.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Milliseconds [`crate::Relay::stop`] waits for outstanding publishes.
pub const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 5_000;

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_drain_timeout_ms() -> u64 {
    DEFAULT_DRAIN_TIMEOUT_MS
}

/// Configuration of one relay instance.
///
/// Validated once by [`RelayConfig::validate`] when the relay is built and
/// immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    /// Maximum number of in-flight publishes, and the checkpoint interval.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Where change events come from.
    pub source: SourceConfig,
    /// Where payloads are published.
    pub sink: SinkConfig,
    /// Checkpointing; `None` disables it and every start begins "from now".
    #[serde(default)]
    pub checkpoint: Option<CheckpointConfig>,
    /// How long stopping waits for outstanding publishes, in milliseconds.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl RelayConfig {
    /// Creates a configuration with default concurrency and checkpointing disabled.
    pub fn new(source: SourceConfig, sink: SinkConfig) -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            source,
            sink,
            checkpoint: None,
            drain_timeout_ms: DEFAULT_DRAIN_TIMEOUT_MS,
        }
    }

    /// Sets the concurrency.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Sets how long stopping waits for outstanding publishes.
    #[must_use]
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Returns how long stopping waits for outstanding publishes.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Enables checkpointing into `collection` under `relay_identity`.
    #[must_use]
    pub fn with_checkpoint(
        mut self,
        collection: impl Into<String>,
        relay_identity: impl Into<String>,
    ) -> Self {
        self.checkpoint = Some(CheckpointConfig {
            collection: collection.into(),
            relay_identity: Some(relay_identity.into()),
        });
        self
    }

    /// Returns true if checkpoints are written.
    pub fn checkpointing_enabled(&self) -> bool {
        self.checkpoint.is_some()
    }

    /// Returns the relay identity, when checkpointing is enabled.
    pub fn relay_identity(&self) -> Option<&str> {
        self.checkpoint
            .as_ref()
            .and_then(|c| c.relay_identity.as_deref())
    }

    /// Number of handled events between two checkpoint writes.
    ///
    /// Equal to the concurrency, which bounds redelivery after a crash to at
    /// most `concurrency` events.
    pub fn checkpoint_interval(&self) -> usize {
        self.concurrency
    }

    /// Validates every field.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Configuration`] naming the first invalid field.
    pub fn validate(&self) -> RelayResult<()> {
        self.source.validate()?;
        self.sink.validate()?;

        if self.concurrency == 0 {
            return Err(RelayError::configuration(
                "concurrency",
                "concurrency must be at least 1",
            ));
        }

        if let Some(checkpoint) = &self.checkpoint {
            checkpoint.validate()?;
        }

        Ok(())
    }
}

/// The watched collection and the operations relayed from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceConfig {
    /// Location of the source.
    #[serde(default)]
    pub uri: String,
    /// Database holding the collection.
    #[serde(default)]
    pub database: String,
    /// Watched collection.
    #[serde(default)]
    pub collection: String,
    /// Operation kinds that are relayed; everything else is dropped.
    #[serde(default)]
    pub operations: Vec<OperationKind>,
    /// Per-kind payload shape overrides.
    #[serde(default)]
    pub payload_shapes: BTreeMap<OperationKind, PayloadShape>,
}

impl SourceConfig {
    /// Creates a source configuration with no operations selected.
    pub fn new(
        uri: impl Into<String>,
        database: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            uri: uri.into(),
            database: database.into(),
            collection: collection.into(),
            operations: Vec::new(),
            payload_shapes: BTreeMap::new(),
        }
    }

    /// Sets the relayed operation kinds.
    #[must_use]
    pub fn with_operations(mut self, operations: impl IntoIterator<Item = OperationKind>) -> Self {
        self.operations = operations.into_iter().collect();
        self
    }

    /// Overrides the payload shape for one operation kind.
    #[must_use]
    pub fn with_payload_shape(mut self, kind: OperationKind, shape: PayloadShape) -> Self {
        self.payload_shapes.insert(kind, shape);
        self
    }

    /// Returns the relayed operation kinds as a set.
    pub fn operation_set(&self) -> BTreeSet<OperationKind> {
        self.operations.iter().copied().collect()
    }

    /// Builds the transformer for this source.
    pub fn transformer(&self) -> Transformer {
        Transformer::with_overrides(self.payload_shapes.clone())
    }

    fn validate(&self) -> RelayResult<()> {
        if self.uri.trim().is_empty() {
            return Err(RelayError::missing_field("source.uri"));
        }
        if self.database.trim().is_empty() {
            return Err(RelayError::missing_field("source.database"));
        }
        if self.collection.trim().is_empty() {
            return Err(RelayError::missing_field("source.collection"));
        }
        if self.operations.is_empty() {
            return Err(RelayError::missing_field("source.operations"));
        }
        Ok(())
    }
}

/// The broker and the static destination payloads are published to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkConfig {
    /// Location of the broker.
    #[serde(default)]
    pub uri: String,
    /// Exchange every message is published to.
    #[serde(default)]
    pub exchange: String,
    /// Routing key of every message.
    #[serde(default)]
    pub routing_key: String,
}

impl SinkConfig {
    /// Creates a sink configuration with an empty routing key.
    pub fn new(uri: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            exchange: exchange.into(),
            routing_key: String::new(),
        }
    }

    /// Sets the routing key.
    #[must_use]
    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    /// Returns the publish destination.
    pub fn destination(&self) -> Destination {
        Destination::new(self.exchange.clone(), self.routing_key.clone())
    }

    fn validate(&self) -> RelayResult<()> {
        if self.uri.trim().is_empty() {
            return Err(RelayError::missing_field("sink.uri"));
        }
        if self.exchange.trim().is_empty() {
            return Err(RelayError::missing_field("sink.exchange"));
        }
        Ok(())
    }
}

/// Where checkpoints are stored and under which identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointConfig {
    /// Name of the checkpoint collection (or directory).
    pub collection: String,
    /// Unique key of this relay in the checkpoint collection.
    #[serde(default)]
    pub relay_identity: Option<String>,
}

impl CheckpointConfig {
    fn validate(&self) -> RelayResult<()> {
        if self.collection.trim().is_empty() {
            return Err(RelayError::missing_field("checkpoint.collection"));
        }
        match self.relay_identity.as_deref() {
            Some(identity) if !identity.trim().is_empty() => Ok(()),
            _ => Err(RelayError::configuration(
                "checkpoint.relayIdentity",
                "cannot specify checkpoint collection without a relay identity",
            )),
        }
    }
}

/// Backoff policy for restarting a relay after a fatal error.
///
/// The relay never restarts itself; this policy is consumed by whoever owns
/// the relay.
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    /// Consecutive failures after which the owner gives up (0 = unlimited).
    pub max_attempts: u32,
    /// Delay before the first restart.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Multiplier applied per attempt.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% jitter.
    pub add_jitter: bool,
}

impl RestartPolicy {
    /// Creates a policy giving up after `max_attempts` consecutive failures.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// A policy that never restarts.
    pub fn never() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Returns true if another attempt is allowed after `attempt` failures.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt < self.max_attempts
    }

    /// Delay before restart attempt `attempt` (0-indexed; attempt 0 is immediate).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            Duration::from_secs_f64(delay_secs + delay_secs * 0.25 * jitter_fraction())
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Pseudo-random fraction in `[0, 1)` derived from the clock.
fn jitter_fraction() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos % 1000) / 1000.0
}
