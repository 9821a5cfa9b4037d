//! Change events observed on the source feed.

use crate::error::RelayError;
use feedrelay_checkpoint::SourcePosition;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Payload handed to the publisher for one event.
pub type Payload = Value;

/// Kind of mutation a change event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    /// A document was inserted.
    Insert,
    /// A document was partially updated.
    Update,
    /// A document was replaced as a whole.
    Replace,
    /// A document was deleted.
    Delete,
    /// The watched collection was dropped.
    Drop,
    /// The watched collection was renamed.
    Rename,
    /// The database holding the collection was dropped.
    DropDatabase,
    /// The subscription was invalidated by the source.
    Invalidate,
}

impl OperationKind {
    /// Every operation kind, in declaration order.
    pub const ALL: [OperationKind; 8] = [
        OperationKind::Insert,
        OperationKind::Update,
        OperationKind::Replace,
        OperationKind::Delete,
        OperationKind::Drop,
        OperationKind::Rename,
        OperationKind::DropDatabase,
        OperationKind::Invalidate,
    ];

    /// Returns the source's name for this kind.
    pub const fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Replace => "replace",
            OperationKind::Delete => "delete",
            OperationKind::Drop => "drop",
            OperationKind::Rename => "rename",
            OperationKind::DropDatabase => "dropDatabase",
            OperationKind::Invalidate => "invalidate",
        }
    }

    /// Returns true for kinds that describe a single document.
    pub const fn is_document_level(&self) -> bool {
        matches!(
            self,
            OperationKind::Insert
                | OperationKind::Update
                | OperationKind::Replace
                | OperationKind::Delete
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| {
                RelayError::configuration(
                    "source.operations",
                    format!("unknown operation kind {s:?}"),
                )
            })
    }
}

/// One notification emitted by the source for a mutation on the watched collection.
///
/// Events are immutable once observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    /// Kind of mutation.
    pub operation_kind: OperationKind,
    /// Position of the event in the feed; doubles as the resume cursor.
    pub source_position: SourcePosition,
    /// Identity key of the affected document (`{"_id": ...}`).
    #[serde(default)]
    pub document_key: Option<Value>,
    /// Current full document, when the source provides one.
    #[serde(default)]
    pub full_document: Option<Value>,
}

impl ChangeEvent {
    /// Creates an event carrying neither key nor document.
    pub fn new(operation_kind: OperationKind, source_position: SourcePosition) -> Self {
        Self {
            operation_kind,
            source_position,
            document_key: None,
            full_document: None,
        }
    }

    /// Creates an insert event.
    pub fn insert(source_position: SourcePosition, document_key: Value, document: Value) -> Self {
        Self::new(OperationKind::Insert, source_position)
            .with_document_key(document_key)
            .with_full_document(document)
    }

    /// Creates an update event. `document` is the looked-up post-image, if any.
    pub fn update(
        source_position: SourcePosition,
        document_key: Value,
        document: Option<Value>,
    ) -> Self {
        let mut event =
            Self::new(OperationKind::Update, source_position).with_document_key(document_key);
        event.full_document = document;
        event
    }

    /// Creates a delete event. Deletions never carry a full document.
    pub fn delete(source_position: SourcePosition, document_key: Value) -> Self {
        Self::new(OperationKind::Delete, source_position).with_document_key(document_key)
    }

    /// Sets the document key.
    #[must_use]
    pub fn with_document_key(mut self, document_key: Value) -> Self {
        self.document_key = Some(document_key);
        self
    }

    /// Sets the full document.
    #[must_use]
    pub fn with_full_document(mut self, document: Value) -> Self {
        self.full_document = Some(document);
        self
    }
}
