//! Property-based test generators using proptest.
//!
//! Provides strategies for generating operation kinds, documents and write
//! scripts that can be replayed against a [`MemoryChangeLog`].

use crate::source::MemoryChangeLog;
use feedrelay_core::OperationKind;
use proptest::prelude::*;
use serde_json::{json, Value};

/// One write against the source collection.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Insert a document with this id and payload value.
    Insert(u32, i64),
    /// Update the `value` field of a document.
    Update(u32, i64),
    /// Replace a document.
    Replace(u32, i64),
    /// Delete a document.
    Delete(u32),
}

impl WriteOp {
    /// The kind of change event this write produces.
    pub fn kind(&self) -> OperationKind {
        match self {
            WriteOp::Insert(..) => OperationKind::Insert,
            WriteOp::Update(..) => OperationKind::Update,
            WriteOp::Replace(..) => OperationKind::Replace,
            WriteOp::Delete(_) => OperationKind::Delete,
        }
    }

    /// Applies the write to a change log.
    pub fn apply(&self, log: &MemoryChangeLog) {
        match self {
            WriteOp::Insert(id, value) => {
                log.insert(json!({ "_id": id, "value": value }));
            }
            WriteOp::Update(id, value) => {
                log.update(json!(id), json!({ "value": value }));
            }
            WriteOp::Replace(id, value) => {
                log.replace(json!(id), json!({ "value": value }));
            }
            WriteOp::Delete(id) => {
                log.delete(json!(id));
            }
        }
    }
}

/// Applies every write in order.
pub fn apply_script(log: &MemoryChangeLog, script: &[WriteOp]) {
    for op in script {
        op.apply(log);
    }
}

/// Strategy for any operation kind.
pub fn operation_kind_strategy() -> impl Strategy<Value = OperationKind> {
    prop::sample::select(OperationKind::ALL.to_vec())
}

/// Strategy for a non-empty set of document-level operation kinds.
pub fn operation_set_strategy() -> impl Strategy<Value = Vec<OperationKind>> {
    prop::sample::subsequence(
        vec![
            OperationKind::Insert,
            OperationKind::Update,
            OperationKind::Replace,
            OperationKind::Delete,
        ],
        1..=4,
    )
}

/// Strategy for a relay concurrency.
pub fn concurrency_strategy() -> impl Strategy<Value = usize> {
    1usize..=8
}

/// Strategy for a flat JSON document with an `_id`.
pub fn document_strategy() -> impl Strategy<Value = Value> {
    (
        any::<u32>(),
        prop::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..6),
    )
        .prop_map(|(id, fields)| {
            let mut doc = serde_json::Map::new();
            for (field, value) in fields {
                doc.insert(field, json!(value));
            }
            doc.insert("_id".into(), json!(id));
            Value::Object(doc)
        })
}

/// Strategy for a write.
pub fn write_op_strategy() -> impl Strategy<Value = WriteOp> {
    let id = 0u32..16;
    prop_oneof![
        3 => (id.clone(), any::<i64>()).prop_map(|(id, v)| WriteOp::Insert(id, v)),
        2 => (id.clone(), any::<i64>()).prop_map(|(id, v)| WriteOp::Update(id, v)),
        1 => (id.clone(), any::<i64>()).prop_map(|(id, v)| WriteOp::Replace(id, v)),
        1 => id.prop_map(WriteOp::Delete),
    ]
}

/// Strategy for a sequence of writes.
pub fn write_script_strategy(max_len: usize) -> impl Strategy<Value = Vec<WriteOp>> {
    prop::collection::vec(write_op_strategy(), 0..=max_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn documents_have_ids(doc in document_strategy()) {
            prop_assert!(doc.get("_id").is_some());
        }

        #[test]
        fn operation_sets_are_non_empty(ops in operation_set_strategy()) {
            prop_assert!(!ops.is_empty());
        }

        #[test]
        fn scripts_produce_one_event_per_write(script in write_script_strategy(20)) {
            let log = MemoryChangeLog::new();
            apply_script(&log, &script);

            let kinds: Vec<OperationKind> = log.events().iter().map(|e| e.operation_kind).collect();
            let expected: Vec<OperationKind> = script.iter().map(WriteOp::kind).collect();
            prop_assert_eq!(kinds, expected);
        }
    }
}
