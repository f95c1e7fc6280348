use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ChainflowError, Result};

/// The runtime object a node's `init` produces.
///
/// Type-erased and cheap to clone; consumers recover the concrete handle
/// (usually an `Arc<dyn Trait>`) with [`NodeInstance::get`].
#[derive(Clone)]
pub struct NodeInstance {
    inner: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl NodeInstance {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            inner: Arc::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// Clone out the wrapped value if it has type `T`.
    pub fn get<T: Any + Clone>(&self) -> Option<T> {
        self.downcast_ref::<T>().cloned()
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Whether two handles point at the same constructed instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for NodeInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeInstance")
            .field("type", &self.type_name)
            .finish()
    }
}

/// A value bound to one input port.
#[derive(Debug, Clone)]
pub enum ResolvedValue {
    Literal(serde_json::Value),
    Node {
        node_id: String,
        instance: NodeInstance,
    },
    List(Vec<ResolvedValue>),
}

/// Input-port name to resolved value, as handed to `init`.
#[derive(Debug, Clone, Default)]
pub struct ResolvedInputs {
    values: HashMap<String, ResolvedValue>,
}

impl ResolvedInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, port: impl Into<String>, value: ResolvedValue) {
        self.values.insert(port.into(), value);
    }

    pub fn get(&self, port: &str) -> Option<&ResolvedValue> {
        self.values.get(port)
    }

    pub fn contains(&self, port: &str) -> bool {
        self.values.contains_key(port)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn literal(&self, port: &str) -> Option<&serde_json::Value> {
        match self.values.get(port) {
            Some(ResolvedValue::Literal(v)) => Some(v),
            _ => None,
        }
    }

    /// String literal; empty strings count as unset.
    pub fn str(&self, port: &str) -> Option<&str> {
        self.literal(port)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }

    /// Numeric literal, also accepting numbers written as strings.
    pub fn number(&self, port: &str) -> Option<f64> {
        match self.literal(port)? {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn usize(&self, port: &str) -> Option<usize> {
        self.number(port)
            .filter(|n| *n >= 0.0)
            .map(|n| n as usize)
    }

    pub fn bool(&self, port: &str) -> Option<bool> {
        match self.literal(port)? {
            serde_json::Value::Bool(b) => Some(*b),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// JSON literal, parsing strings that hold JSON text.
    pub fn json(&self, port: &str) -> Option<serde_json::Value> {
        match self.literal(port)? {
            serde_json::Value::String(s) if !s.is_empty() => serde_json::from_str(s).ok(),
            serde_json::Value::String(_) | serde_json::Value::Null => None,
            other => Some(other.clone()),
        }
    }

    /// Upstream instance on `port`, downcast to `T`.
    pub fn node<T: std::any::Any + Clone>(&self, port: &str) -> Option<T> {
        match self.values.get(port) {
            Some(ResolvedValue::Node { instance, .. }) => instance.get::<T>(),
            _ => None,
        }
    }

    /// Like [`node`](Self::node) but failing when absent or of another type.
    pub fn require_node<T: std::any::Any + Clone>(&self, port: &str) -> Result<T> {
        self.node(port).ok_or_else(|| {
            ChainflowError::Node(format!(
                "input '{}' is missing or does not provide {}",
                port,
                std::any::type_name::<T>()
            ))
        })
    }

    /// Instances on a list port, in edge order. A single connection counts
    /// as a one-element list.
    pub fn nodes<T: std::any::Any + Clone>(&self, port: &str) -> Vec<T> {
        fn collect<T: std::any::Any + Clone>(value: &ResolvedValue, out: &mut Vec<T>) {
            match value {
                ResolvedValue::Node { instance, .. } => out.extend(instance.get::<T>()),
                ResolvedValue::List(items) => items.iter().for_each(|i| collect(i, out)),
                ResolvedValue::Literal(_) => {}
            }
        }
        let mut out = Vec::new();
        if let Some(value) = self.values.get(port) {
            collect(value, &mut out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_literal_accessors() {
        let mut inputs = ResolvedInputs::new();
        inputs.insert("chunkSize", ResolvedValue::Literal(json!("500")));
        inputs.insert("temperature", ResolvedValue::Literal(json!(0.7)));
        inputs.insert("separator", ResolvedValue::Literal(json!("")));
        inputs.insert("headers", ResolvedValue::Literal(json!(r#"{"a":"b"}"#)));

        assert_eq!(inputs.usize("chunkSize"), Some(500));
        assert_eq!(inputs.number("temperature"), Some(0.7));
        assert_eq!(inputs.str("separator"), None);
        assert_eq!(inputs.json("headers"), Some(json!({"a": "b"})));
        assert_eq!(inputs.str("missing"), None);
    }

    #[test]
    fn test_node_downcast() {
        let mut inputs = ResolvedInputs::new();
        let shared: Arc<String> = Arc::new("model".to_string());
        inputs.insert(
            "model",
            ResolvedValue::Node {
                node_id: "m1".into(),
                instance: NodeInstance::new(shared.clone()),
            },
        );

        let got: Arc<String> = inputs.require_node("model").unwrap();
        assert!(Arc::ptr_eq(&got, &shared));
        assert!(inputs.require_node::<Arc<u32>>("model").is_err());
    }

    #[test]
    fn test_list_port_flattening() {
        let mut inputs = ResolvedInputs::new();
        let item = |n: u32| ResolvedValue::Node {
            node_id: format!("t{n}"),
            instance: NodeInstance::new(n),
        };
        inputs.insert("tools", ResolvedValue::List(vec![item(1), item(2)]));
        inputs.insert("single", item(3));

        assert_eq!(inputs.nodes::<u32>("tools"), vec![1, 2]);
        assert_eq!(inputs.nodes::<u32>("single"), vec![3]);
        assert!(inputs.nodes::<u32>("none").is_empty());
    }
}
