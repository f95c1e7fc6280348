use serde::{Deserialize, Serialize};

use chainflow_core::definition::GraphDefinition;
use chainflow_core::error::{ChainflowError, Result};
use chainflow_core::types::{ChatMessage, NodeOutput, Role, SessionId};

use crate::executor::RunReport;

/// Execution request as submitted over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineRequest {
    pub graph: GraphDefinition,
    pub user_input: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_history: Option<Vec<HistoryEntry>>,
    #[serde(default)]
    pub streaming: bool,
    /// The session id was generated for this request. Per-session instances
    /// are dropped once the run ends.
    #[serde(skip)]
    pub transient_session: bool,
}

impl EngineRequest {
    pub fn new(graph: GraphDefinition, user_input: impl Into<String>) -> Self {
        Self {
            graph,
            user_input: user_input.into(),
            session_id: None,
            prior_history: None,
            streaming: false,
            transient_session: false,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.prior_history = Some(history.iter().map(HistoryEntry::from).collect());
        self
    }

    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    /// Whether the caller named a session.
    pub fn has_session(&self) -> bool {
        self.session_id
            .as_deref()
            .is_some_and(|id| !id.trim().is_empty())
    }

    /// The caller's session, or a fresh one when absent or empty.
    pub fn session(&self) -> SessionId {
        match self.session_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => SessionId::from_string(id),
            _ => SessionId::new(),
        }
    }

    /// Prior history as chat messages, oldest first.
    pub fn history(&self) -> Vec<ChatMessage> {
        self.prior_history
            .iter()
            .flatten()
            .map(|entry| ChatMessage::new(entry.role.into(), entry.content.clone()))
            .collect()
    }
}

/// Role of a history entry. Also accepts the editor's message type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryRole {
    #[serde(alias = "userMessage")]
    User,
    #[serde(alias = "apiMessage")]
    Assistant,
    System,
}

impl From<EntryRole> for Role {
    fn from(role: EntryRole) -> Self {
        match role {
            EntryRole::User => Role::User,
            EntryRole::Assistant => Role::Assistant,
            EntryRole::System => Role::System,
        }
    }
}

impl From<Role> for EntryRole {
    fn from(role: Role) -> Self {
        match role {
            Role::User => EntryRole::User,
            Role::Assistant => EntryRole::Assistant,
            Role::System => EntryRole::System,
        }
    }
}

/// One prior message: `{role, content}` or `{type, message}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(alias = "type")]
    pub role: EntryRole,
    #[serde(alias = "message")]
    pub content: String,
}

impl From<&ChatMessage> for HistoryEntry {
    fn from(msg: &ChatMessage) -> Self {
        Self {
            role: msg.role.into(),
            content: msg.content.clone(),
        }
    }
}

/// Non-streaming response: the output or a structured error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum EngineResponse {
    Success {
        output: NodeOutput,
    },
    Failure {
        #[serde(rename = "errorKind")]
        error_kind: String,
        #[serde(rename = "nodeId", default, skip_serializing_if = "Option::is_none")]
        node_id: Option<String>,
        message: String,
    },
}

impl EngineResponse {
    pub fn from_error(err: &ChainflowError) -> Self {
        Self::Failure {
            error_kind: err.kind().to_string(),
            node_id: err.node_id().map(String::from),
            message: err.to_string(),
        }
    }

    pub fn from_result(result: &Result<RunReport>) -> Self {
        match result {
            Ok(report) => Self::Success {
                output: report.output.clone(),
            },
            Err(err) => Self::from_error(err),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request() {
        let json = serde_json::json!({
            "graph": {"nodes": [{"id": "a", "type": "echoChatModel"}], "edges": []},
            "userInput": "bye",
            "sessionId": "s1",
            "priorHistory": [
                {"role": "user", "content": "hi"},
                {"type": "apiMessage", "message": "hello"}
            ],
            "streaming": true
        });
        let request: EngineRequest = serde_json::from_value(json).unwrap();
        assert!(request.streaming);
        assert_eq!(request.session().as_str(), "s1");

        let history = request.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[1].content, "hello");
    }

    #[test]
    fn test_missing_session_gets_fresh_id() {
        let request = EngineRequest::new(GraphDefinition::new(), "hi").with_session("  ");
        let a = request.session();
        let b = request.session();
        assert!(!a.as_str().is_empty());
        assert_ne!(a, b);
        assert!(request.history().is_empty());
    }

    #[test]
    fn test_error_response_shape() {
        let err = ChainflowError::init("model", "missing key");
        let value = serde_json::to_value(EngineResponse::from_error(&err)).unwrap();
        assert_eq!(value["errorKind"], "InitError");
        assert_eq!(value["nodeId"], "model");
        assert!(value["message"].as_str().unwrap().contains("missing key"));

        let err = ChainflowError::Cycle {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        let value = serde_json::to_value(EngineResponse::from_error(&err)).unwrap();
        assert_eq!(value["errorKind"], "CycleError");
        assert!(value.get("nodeId").is_none());
    }

    #[test]
    fn test_success_response_shape() {
        let response = EngineResponse::Success {
            output: NodeOutput::Text("done".into()),
        };
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            serde_json::json!({"output": "done"})
        );
    }
}
