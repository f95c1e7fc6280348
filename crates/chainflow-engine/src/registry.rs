use std::collections::HashMap;
use std::sync::Arc;

use chainflow_core::error::{ChainflowError, Result};
use chainflow_core::traits::NodeType;
use chainflow_core::types::NodeSchema;

/// A registered node type: its factory and the schema captured at registration.
#[derive(Clone)]
pub struct RegisteredType {
    pub schema: NodeSchema,
    pub factory: Arc<dyn NodeType>,
}

/// Registry of available node types, populated once at startup.
#[derive(Default)]
pub struct TypeRegistry {
    types: HashMap<String, RegisteredType>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node type. A later registration under the same name wins.
    pub fn register(&mut self, node_type: impl NodeType) {
        self.register_arc(Arc::new(node_type));
    }

    pub fn register_arc(&mut self, factory: Arc<dyn NodeType>) {
        let schema = factory.schema();
        if self.types.contains_key(&schema.name) {
            tracing::warn!(node_type = %schema.name, "Replacing registered node type");
        }
        self.types
            .insert(schema.name.clone(), RegisteredType { schema, factory });
    }

    /// Look up a type by name.
    pub fn lookup(&self, name: &str) -> Result<&RegisteredType> {
        self.types
            .get(name)
            .ok_or_else(|| ChainflowError::UnknownType(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredType> {
        self.types.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Registered type names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.types.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Schemas of all registered types, sorted by name.
    pub fn schemas(&self) -> Vec<&NodeSchema> {
        let mut schemas: Vec<&NodeSchema> = self.types.values().map(|t| &t.schema).collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainflow_test_utils::StubNode;

    #[test]
    fn test_register_and_lookup() {
        let mut registry = TypeRegistry::new();
        registry.register(StubNode::new("zeta", "Chains"));
        registry.register(StubNode::new("alpha", "Chat Models").capabilities(["BaseChatModel"]));

        assert_eq!(registry.list(), vec!["alpha", "zeta"]);
        let alpha = registry.lookup("alpha").unwrap();
        assert!(alpha.schema.capabilities.contains("BaseChatModel"));
        assert_eq!(registry.schemas()[1].name, "zeta");
    }

    #[test]
    fn test_unknown_type() {
        let registry = TypeRegistry::new();
        let err = registry.lookup("missing").err().unwrap();
        assert!(matches!(err, ChainflowError::UnknownType(ref name) if name == "missing"));
        assert_eq!(err.kind(), "UnknownTypeError");
    }

    #[test]
    fn test_reregistration_replaces() {
        let mut registry = TypeRegistry::new();
        registry.register(StubNode::new("model", "Chat Models"));
        registry.register(StubNode::new("model", "Chat Models").stateful());
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup("model").unwrap().schema.stateful);
    }
}
