use serde::{Deserialize, Serialize};

/// Declarative graph as submitted by a caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphDefinition {
    #[serde(default)]
    pub nodes: Vec<RawNode>,
    #[serde(default)]
    pub edges: Vec<RawEdge>,
}

/// A node as submitted: id, type name, and literal parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawNode {
    pub id: String,
    #[serde(rename = "type")]
    pub type_name: String,
    /// Literal values for parameter ports.
    #[serde(default)]
    pub inputs: serde_json::Map<String, serde_json::Value>,
    /// Explicit output selection for nodes declaring several outputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// An edge as submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEdge {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    pub target: String,
    pub target_handle: String,
}

impl GraphDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node with no literals.
    pub fn node(mut self, id: impl Into<String>, type_name: impl Into<String>) -> Self {
        self.nodes.push(RawNode::new(id, type_name));
        self
    }

    /// Append a fully specified node.
    pub fn with_node(mut self, node: RawNode) -> Self {
        self.nodes.push(node);
        self
    }

    /// Connect `source`'s default output to `target`'s `port`.
    pub fn edge(
        mut self,
        source: impl Into<String>,
        target: impl Into<String>,
        port: impl Into<String>,
    ) -> Self {
        self.edges.push(RawEdge {
            source: source.into(),
            source_handle: None,
            target: target.into(),
            target_handle: port.into(),
        });
        self
    }

    /// Connect a named output of `source` to `target`'s `port`.
    pub fn edge_from(
        mut self,
        source: impl Into<String>,
        output: impl Into<String>,
        target: impl Into<String>,
        port: impl Into<String>,
    ) -> Self {
        self.edges.push(RawEdge {
            source: source.into(),
            source_handle: Some(output.into()),
            target: target.into(),
            target_handle: port.into(),
        });
        self
    }
}

impl RawNode {
    pub fn new(id: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            type_name: type_name.into(),
            inputs: serde_json::Map::new(),
            output: None,
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.inputs.insert(name.into(), value);
        self
    }
}
