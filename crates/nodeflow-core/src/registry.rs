use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{NodeflowError, Result};
use crate::types::Kwargs;

pub type SyncCallable = Arc<dyn Fn(Kwargs) -> anyhow::Result<Value> + Send + Sync>;
pub type AsyncCallable =
    Arc<dyn Fn(Kwargs) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// A node callable, tagged at registration time as blocking or natively async.
#[derive(Clone)]
pub enum CallableKind {
    Sync(SyncCallable),
    Async(AsyncCallable),
}

impl CallableKind {
    /// Call with keyword arguments, suspending if the callable is async.
    pub async fn invoke(&self, kwargs: Kwargs) -> anyhow::Result<Value> {
        match self {
            Self::Sync(f) => f(kwargs),
            Self::Async(f) => f(kwargs).await,
        }
    }

    pub fn is_async(&self) -> bool {
        matches!(self, Self::Async(_))
    }
}

impl std::fmt::Debug for CallableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("CallableKind::Sync"),
            Self::Async(_) => f.write_str("CallableKind::Async"),
        }
    }
}

/// What the registry knows about one node type.
#[derive(Debug, Clone)]
pub struct NodeTypeEntry {
    pub type_name: String,
    pub callable: CallableKind,
    /// Output port names, in the order the callable returns them.
    pub outputs: Vec<String>,
    pub description: Option<String>,
}

impl NodeTypeEntry {
    pub fn new(type_name: impl Into<String>, callable: CallableKind, outputs: &[&str]) -> Self {
        Self {
            type_name: type_name.into(),
            callable,
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn is_async(&self) -> bool {
        self.callable.is_async()
    }

    /// Key a raw return value by this type's output names.
    pub fn map_outputs(&self, value: &Value) -> Kwargs {
        map_outputs(value, &self.outputs)
    }
}

/// Zip a return value against ordered output names.
///
/// With more than one output name an array is treated as the ordered
/// sequence of outputs. Anything else is a one-element sequence. Extra
/// values or names are dropped.
pub fn map_outputs(value: &Value, names: &[String]) -> Kwargs {
    let values: Vec<&Value> = match value {
        Value::Array(items) if names.len() > 1 => items.iter().collect(),
        single => vec![single],
    };
    names
        .iter()
        .zip(values)
        .map(|(name, v)| (name.clone(), v.clone()))
        .collect()
}

/// Fetch and deserialize a required keyword argument.
pub fn required_arg<T: DeserializeOwned>(kwargs: &Kwargs, name: &str) -> anyhow::Result<T> {
    let value = kwargs
        .get(name)
        .ok_or_else(|| anyhow::anyhow!("missing required argument '{}'", name))?;
    serde_json::from_value(value.clone())
        .map_err(|e| anyhow::anyhow!("invalid argument '{}': {}", name, e))
}

/// Registry of node types, keyed by type name.
#[derive(Clone, Default)]
pub struct NodeTypeRegistry {
    entries: HashMap<String, NodeTypeEntry>,
}

impl NodeTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entry, replacing any previous entry of the same type.
    pub fn register(&mut self, entry: NodeTypeEntry) {
        self.entries.insert(entry.type_name.clone(), entry);
    }

    /// Register a blocking callable.
    pub fn register_sync<F>(&mut self, type_name: &str, outputs: &[&str], f: F)
    where
        F: Fn(Kwargs) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let callable = CallableKind::Sync(Arc::new(f));
        self.register(NodeTypeEntry::new(type_name, callable, outputs));
    }

    /// Register a natively async callable.
    pub fn register_async<F, Fut>(&mut self, type_name: &str, outputs: &[&str], f: F)
    where
        F: Fn(Kwargs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let callable: AsyncCallable =
            Arc::new(move |kwargs| -> BoxFuture<'static, anyhow::Result<Value>> {
                Box::pin(f(kwargs))
            });
        self.register(NodeTypeEntry::new(
            type_name,
            CallableKind::Async(callable),
            outputs,
        ));
    }

    /// Unregister a type by name.
    pub fn unregister(&mut self, type_name: &str) -> bool {
        self.entries.remove(type_name).is_some()
    }

    pub fn get(&self, type_name: &str) -> Option<&NodeTypeEntry> {
        self.entries.get(type_name)
    }

    /// Like [`get`](Self::get), but a missing type is an error.
    pub fn lookup(&self, type_name: &str) -> Result<&NodeTypeEntry> {
        self.get(type_name)
            .ok_or_else(|| NodeflowError::NodeTypeNotFound(type_name.to_string()))
    }

    /// Registered type names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
