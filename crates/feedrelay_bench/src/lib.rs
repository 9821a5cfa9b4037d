//! Benchmark utilities.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use feedrelay_core::{ChangeEvent, OperationKind, SourcePosition};
use serde_json::{json, Map, Value};

/// Position token for the `seq`-th event.
pub fn position(seq: u64) -> SourcePosition {
    SourcePosition::new(format!("{seq:016x}"))
}

/// A document with `fields` string fields of `field_len` bytes each.
pub fn document(id: u64, fields: usize, field_len: usize) -> Value {
    let mut doc = Map::new();
    doc.insert("_id".into(), json!(id));
    for i in 0..fields {
        doc.insert(format!("field_{i}"), json!("x".repeat(field_len)));
    }
    Value::Object(doc)
}

/// An event of `kind` carrying a key and, except for deletes, a full document.
pub fn event(kind: OperationKind, seq: u64, fields: usize) -> ChangeEvent {
    let event = ChangeEvent::new(kind, position(seq)).with_document_key(json!({ "_id": seq }));
    if kind == OperationKind::Delete {
        event
    } else {
        event.with_full_document(document(seq, fields, 32))
    }
}
