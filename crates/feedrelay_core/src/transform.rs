//! Payload shaping per operation kind.
//!
//! The transformer is a pure mapping from a change event to the payload that
//! gets published. Every operation kind maps to one [`PayloadShape`]:
//!
//! | kind | default shape |
//! |---|---|
//! | `delete` | [`PayloadShape::DocumentKey`] |
//! | other document-level kinds | [`PayloadShape::FullDocument`] |
//! | collection-level kinds | [`PayloadShape::Envelope`] |
//!
//! Shapes can be overridden per kind. An update or replace whose post-image
//! was not found (the document is already gone) publishes `null`. Any other
//! event that lacks the field its shape needs yields
//! [`RelayError::Transform`]; it is never silently skipped.

use crate::error::{RelayError, RelayResult};
use crate::event::{ChangeEvent, OperationKind, Payload};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// What part of a change event is published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PayloadShape {
    /// The current full document.
    FullDocument,
    /// Only the document identity key.
    DocumentKey,
    /// The whole event: kind, position, key and document.
    Envelope,
}

/// Maps change events to publishable payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transformer {
    overrides: BTreeMap<OperationKind, PayloadShape>,
}

impl Transformer {
    /// Creates a transformer using the default shapes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transformer from a map of per-kind overrides.
    #[must_use]
    pub fn with_overrides(overrides: BTreeMap<OperationKind, PayloadShape>) -> Self {
        Self { overrides }
    }

    /// Overrides the shape used for one operation kind.
    #[must_use]
    pub fn with_shape(mut self, kind: OperationKind, shape: PayloadShape) -> Self {
        self.overrides.insert(kind, shape);
        self
    }

    /// Returns the shape used for an operation kind.
    pub fn shape_for(&self, kind: OperationKind) -> PayloadShape {
        if let Some(shape) = self.overrides.get(&kind) {
            return *shape;
        }
        match kind {
            OperationKind::Delete => PayloadShape::DocumentKey,
            kind if kind.is_document_level() => PayloadShape::FullDocument,
            _ => PayloadShape::Envelope,
        }
    }

    /// Builds the payload for an event.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Transform`] if the event lacks the field its shape
    /// requires, or if the document key is not an object. A missing full
    /// document is only an error for inserts, which always carry one.
    pub fn transform(&self, event: &ChangeEvent) -> RelayResult<Payload> {
        match self.shape_for(event.operation_kind) {
            PayloadShape::FullDocument => match &event.full_document {
                Some(document) if !document.is_null() => Ok(document.clone()),
                _ if event.operation_kind == OperationKind::Insert => {
                    Err(malformed(event, "fullDocument is missing"))
                }
                _ => Ok(Value::Null),
            },
            PayloadShape::DocumentKey => Ok(document_key(event)?.clone()),
            PayloadShape::Envelope => {
                if let Some(key) = &event.document_key {
                    if !key.is_object() {
                        return Err(malformed(event, "documentKey is not an object"));
                    }
                }
                Ok(json!({
                    "operationKind": event.operation_kind,
                    "sourcePosition": event.source_position,
                    "documentKey": event.document_key.clone().unwrap_or(Value::Null),
                    "fullDocument": event.full_document.clone().unwrap_or(Value::Null),
                }))
            }
        }
    }
}

fn document_key(event: &ChangeEvent) -> RelayResult<&Value> {
    match &event.document_key {
        Some(key) if key.is_object() => Ok(key),
        Some(_) => Err(malformed(event, "documentKey is not an object")),
        None => Err(malformed(event, "documentKey is missing")),
    }
}

fn malformed(event: &ChangeEvent, message: &str) -> RelayError {
    RelayError::Transform {
        operation: event.operation_kind,
        position: event.source_position.clone(),
        message: message.into(),
    }
}
