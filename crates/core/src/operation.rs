//! GraphQL operation descriptor and response types flowing through links.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type Variables = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Query => f.write_str("query"),
            OperationKind::Mutation => f.write_str("mutation"),
            OperationKind::Subscription => f.write_str("subscription"),
        }
    }
}

/// One logical GraphQL request.
///
/// Everything except the context is fixed at construction. The context is a
/// side channel that links can read and extend; clones of an operation share
/// the same context.
#[derive(Debug, Clone)]
pub struct Operation {
    pub id: Option<String>,
    pub name: Option<String>,
    pub kind: OperationKind,
    pub query: Option<String>,
    pub variables: Variables,
    pub metadata: Map<String, Value>,
    context: Arc<RwLock<Map<String, Value>>>,
}

impl Operation {
    pub fn new(kind: OperationKind, query: impl Into<String>) -> Self {
        Self {
            id: None,
            name: None,
            kind,
            query: Some(query.into()),
            variables: Map::new(),
            metadata: Map::new(),
            context: Arc::new(RwLock::new(Map::new())),
        }
    }

    /// A query identified only by a persisted document id.
    pub fn persisted(kind: OperationKind, id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            query: None,
            ..Self::new(kind, String::new())
        }
    }

    pub fn query(query: impl Into<String>) -> Self {
        Self::new(OperationKind::Query, query)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    /// Set a single variable.
    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    /// Attach request metadata. The metadata also seeds the context.
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.set_context(metadata.clone());
        self.metadata = metadata;
        self
    }

    /// Identity of the document: `[id, name, text]` as JSON.
    pub fn key(&self) -> String {
        Value::Array(vec![
            opt_string(&self.id),
            opt_string(&self.name),
            opt_string(&self.query),
        ])
        .to_string()
    }

    /// Document identity plus the variables, stably serialized.
    pub fn unique_key(&self) -> String {
        let variables = canonical(&Value::Object(self.variables.clone())).to_string();
        Value::Array(vec![
            opt_string(&self.id),
            opt_string(&self.name),
            opt_string(&self.query),
            Value::String(variables),
        ])
        .to_string()
    }

    /// Snapshot of the current context.
    pub fn context(&self) -> Map<String, Value> {
        self.context
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Deep-merge `patch` into the context. Nested objects merge key by key;
    /// any other value replaces what was there.
    pub fn set_context(&self, patch: Map<String, Value>) {
        let mut context = self.context.write().unwrap_or_else(PoisonError::into_inner);
        merge_objects(&mut context, patch);
    }

    /// Compute a patch from the current context and deep-merge it.
    pub fn update_context<F>(&self, f: F)
    where
        F: FnOnce(&Map<String, Value>) -> Map<String, Value>,
    {
        let mut context = self.context.write().unwrap_or_else(PoisonError::into_inner);
        let patch = f(&context);
        merge_objects(&mut context, patch);
    }
}

fn opt_string(value: &Option<String>) -> Value {
    value.clone().map(Value::String).unwrap_or(Value::Null)
}

fn merge_objects(target: &mut Map<String, Value>, patch: Map<String, Value>) {
    for (key, incoming) in patch {
        match (target.get_mut(&key), incoming) {
            (Some(Value::Object(existing)), Value::Object(nested)) => {
                merge_objects(existing, nested);
            }
            (_, incoming) => {
                target.insert(key, incoming);
            }
        }
    }
}

/// Rebuild `value` with object keys in sorted order at every depth, so the
/// serialized form does not depend on insertion order.
fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonical(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

/// A GraphQL response as delivered to subscribers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,

    /// Context attached by the transport (status, headers, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, Value>>,
}

impl Response {
    pub fn data(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::default()
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}
