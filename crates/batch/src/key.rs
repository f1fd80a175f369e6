//! Batch-key policies: which operations may share a batch.

use std::sync::Arc;

use relink_core::Operation;
use serde_json::Value;

/// Maps an operation to its batch partition. Operations with different keys
/// never share a batch or a flush timer.
///
/// The batcher calls the function once per request, so stateful key
/// functions are tolerated.
pub type BatchKeyFn = Arc<dyn Fn(&Operation) -> String + Send + Sync>;

/// Every operation shares one global batch.
pub fn default_batch_key() -> BatchKeyFn {
    Arc::new(|_: &Operation| String::new())
}

/// One batch per operation name; unnamed operations share the empty key.
pub fn by_operation_name() -> BatchKeyFn {
    Arc::new(|op: &Operation| op.name.clone().unwrap_or_default())
}

/// Partition on a context entry, e.g. the target endpoint set by an earlier
/// link. Strings are used verbatim, other values by their JSON text, and a
/// missing entry maps to the empty key.
pub fn by_context_field(field: impl Into<String>) -> BatchKeyFn {
    let field = field.into();
    Arc::new(move |op: &Operation| match op.context().get(&field) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    })
}
