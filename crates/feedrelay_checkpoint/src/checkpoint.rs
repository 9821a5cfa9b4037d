//! Checkpoint record and source position token.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// An opaque, totally ordered position in a change feed.
///
/// Positions are assigned by the source. The relay only hands them back to the
/// source as a resume cursor and persists them as checkpoint values; it never
/// inspects their contents.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourcePosition(String);

impl SourcePosition {
    /// Creates a position from a source token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the raw token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the position, returning the raw token.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourcePosition {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}

impl From<String> for SourcePosition {
    fn from(token: String) -> Self {
        Self(token)
    }
}

/// The persisted resume marker of one relay.
///
/// # Invariants
///
/// - `resume_position` is the position of an event that was handed to the
///   publisher before the write started, never of a future event
/// - One record per `relay_identity`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Unique key of the relay owning this checkpoint.
    pub relay_identity: String,
    /// Name of the watched collection.
    pub collection: String,
    /// Document key of the last handled event, if the event carried one.
    pub last_handled_document_key: Option<Value>,
    /// Position to resume the subscription after.
    pub resume_position: SourcePosition,
}

impl Checkpoint {
    /// Creates a checkpoint without a document key.
    pub fn new(
        relay_identity: impl Into<String>,
        collection: impl Into<String>,
        resume_position: SourcePosition,
    ) -> Self {
        Self {
            relay_identity: relay_identity.into(),
            collection: collection.into(),
            last_handled_document_key: None,
            resume_position,
        }
    }

    /// Sets the document key of the last handled event.
    #[must_use]
    pub fn with_document_key(mut self, document_key: Option<Value>) -> Self {
        self.last_handled_document_key = document_key;
        self
    }
}
