use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique session identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// A role-tagged chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }
}

/// Primitive parameter types. Ports accepting only these take literals,
/// every other accepted type name is a capability a connected node must carry.
pub const PARAM_TYPES: &[&str] = &["string", "number", "boolean", "json", "password", "options"];

/// A declared input port of a node type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputPort {
    pub name: String,
    #[serde(default)]
    pub label: String,
    /// Type names this port accepts.
    pub accepted: BTreeSet<String>,
    #[serde(default = "default_true")]
    pub required: bool,
    /// Accepts several edges, resolved to an ordered list.
    #[serde(default)]
    pub list: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

fn default_true() -> bool {
    true
}

impl InputPort {
    /// A port fed by an upstream node carrying one of `accepted`.
    pub fn node<I, S>(name: impl Into<String>, accepted: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            accepted: accepted.into_iter().map(Into::into).collect(),
            required: true,
            list: false,
            default: None,
        }
    }

    /// A literal parameter port (`string`, `number`, ...).
    pub fn param(name: impl Into<String>, param_type: &str) -> Self {
        Self::node(name, [param_type])
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn list(mut self) -> Self {
        self.list = true;
        self
    }

    pub fn with_default(mut self, value: serde_json::Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Whether this port takes literals rather than connections.
    pub fn is_param(&self) -> bool {
        !self.accepted.is_empty()
            && self
                .accepted
                .iter()
                .all(|t| PARAM_TYPES.contains(&t.as_str()))
    }
}

/// A selectable output of a node type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputPort {
    pub name: String,
    #[serde(default)]
    pub label: String,
    pub capabilities: BTreeSet<String>,
}

impl OutputPort {
    pub fn new<I, S>(name: impl Into<String>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            capabilities: capabilities.into_iter().map(Into::into).collect(),
        }
    }
}

/// Static description of a node type: ports, capabilities, behaviour flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSchema {
    pub name: String,
    pub label: String,
    pub category: String,
    #[serde(default)]
    pub description: String,
    /// Interface names this node's output structurally satisfies.
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub inputs: Vec<InputPort>,
    #[serde(default)]
    pub outputs: Vec<OutputPort>,
    /// Holds per-session state; cached instances are never shared across sessions.
    #[serde(default)]
    pub stateful: bool,
    /// Implements `run` and may be a terminal node.
    #[serde(default)]
    pub executable: bool,
}

impl NodeSchema {
    pub fn new(name: impl Into<String>, category: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            category: category.into(),
            description: String::new(),
            capabilities: BTreeSet::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            stateful: false,
            executable: false,
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn capabilities<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn input(mut self, port: InputPort) -> Self {
        self.inputs.push(port);
        self
    }

    pub fn output(mut self, port: OutputPort) -> Self {
        self.outputs.push(port);
        self
    }

    pub fn stateful(mut self) -> Self {
        self.stateful = true;
        self
    }

    pub fn executable(mut self) -> Self {
        self.executable = true;
        self
    }

    pub fn input_port(&self, name: &str) -> Option<&InputPort> {
        self.inputs.iter().find(|p| p.name == name)
    }

    pub fn output_port(&self, name: &str) -> Option<&OutputPort> {
        self.outputs.iter().find(|p| p.name == name)
    }

    /// Capabilities offered through `selected`, falling back to the first
    /// declared output and then to the node-level tags.
    pub fn output_capabilities(&self, selected: Option<&str>) -> &BTreeSet<String> {
        let port = match selected {
            Some(name) => self.output_port(name),
            None => self.outputs.first(),
        };
        port.map(|p| &p.capabilities).unwrap_or(&self.capabilities)
    }
}

/// A retrievable unit of text.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub page_content: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Document {
    pub fn new(page_content: impl Into<String>) -> Self {
        Self {
            page_content: page_content.into(),
            metadata: serde_json::Map::new(),
        }
    }
}

/// Output of a terminal node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum NodeOutput {
    Text(String),
    Structured(serde_json::Value),
}

impl NodeOutput {
    /// Text form of the output, as persisted to chat history.
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Structured(v) => v.to_string(),
        }
    }
}

impl From<String> for NodeOutput {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

/// Environment flags carried by every run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EnvFlags {
    #[serde(default)]
    pub verbose: bool,
}

impl EnvFlags {
    /// Flags from the process environment (`DEBUG=true` enables verbose).
    pub fn from_env() -> Self {
        Self {
            verbose: std::env::var("DEBUG").is_ok_and(|v| v == "true"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_schema() -> NodeSchema {
        NodeSchema::new("store", "Vector Stores")
            .capabilities(["Store", "VectorStore"])
            .output(OutputPort::new("retriever", ["BaseRetriever"]))
            .output(OutputPort::new("vectorStore", ["VectorStore"]))
    }

    #[test]
    fn test_output_capabilities_selection() {
        let schema = store_schema();
        assert!(schema
            .output_capabilities(Some("vectorStore"))
            .contains("VectorStore"));
        assert!(schema.output_capabilities(None).contains("BaseRetriever"));

        let plain = NodeSchema::new("m", "Memory").capabilities(["BaseChatMemory"]);
        assert!(plain.output_capabilities(None).contains("BaseChatMemory"));
    }

    #[test]
    fn test_param_port_detection() {
        assert!(InputPort::param("separator", "string").is_param());
        assert!(!InputPort::node("model", ["BaseChatModel"]).is_param());
    }

    #[test]
    fn test_role_serialization() {
        let msg = ChatMessage::user("hi");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(Role::parse("assistant"), Some(Role::Assistant));
        assert_eq!(Role::parse("bot"), None);
    }

    #[test]
    fn test_node_output_untagged() {
        let text = serde_json::to_value(NodeOutput::Text("ok".into())).unwrap();
        assert_eq!(text, serde_json::json!("ok"));
        let structured = NodeOutput::Structured(serde_json::json!({"a": 1}));
        assert_eq!(structured.as_text(), r#"{"a":1}"#);
    }
}
