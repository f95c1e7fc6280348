use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainflowError {
    // Validation errors (raised before any instantiation)
    #[error("Graph validation failed: {0}")]
    GraphValidation(String),

    #[error("Graph contains a cycle: {}", .cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },

    #[error("Type mismatch on edge {edge}: port accepts [{}], source provides [{}]", .accepted.join(", "), .provided.join(", "))]
    TypeMismatch {
        edge: String,
        accepted: Vec<String>,
        provided: Vec<String>,
    },

    #[error("Unknown node type: {0}")]
    UnknownType(String),

    // Execution errors
    #[error("Node {node_id} failed to initialize: {message}")]
    Init { node_id: String, message: String },

    #[error("Node {node_id} failed to run: {message}")]
    Run { node_id: String, message: String },

    #[error("Run cancelled")]
    Cancelled,

    // Adapter errors, wrapped into Init/Run by the executor
    #[error("{0}")]
    Node(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ChainflowError {
    /// Wire name reported as `errorKind` in engine responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::GraphValidation(_) => "GraphValidationError",
            Self::Cycle { .. } => "CycleError",
            Self::TypeMismatch { .. } => "TypeMismatchError",
            Self::UnknownType(_) => "UnknownTypeError",
            Self::Init { .. } => "InitError",
            Self::Run { .. } => "RunError",
            Self::Cancelled => "CancellationError",
            _ => "InternalError",
        }
    }

    /// The node the failure is attributed to, if any.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::Init { node_id, .. } | Self::Run { node_id, .. } => Some(node_id),
            _ => None,
        }
    }

    /// True for errors raised before any node was instantiated.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::GraphValidation(_)
                | Self::Cycle { .. }
                | Self::TypeMismatch { .. }
                | Self::UnknownType(_)
        )
    }

    pub fn init(node_id: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self::Init {
            node_id: node_id.into(),
            message: cause.to_string(),
        }
    }

    pub fn run(node_id: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self::Run {
            node_id: node_id.into(),
            message: cause.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ChainflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(
            ChainflowError::GraphValidation("x".into()).kind(),
            "GraphValidationError"
        );
        assert_eq!(
            ChainflowError::Cycle { cycle: vec![] }.kind(),
            "CycleError"
        );
        assert_eq!(ChainflowError::Cancelled.kind(), "CancellationError");
        assert_eq!(ChainflowError::Config("bad".into()).kind(), "InternalError");
    }

    #[test]
    fn test_cycle_message_names_path() {
        let err = ChainflowError::Cycle {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Graph contains a cycle: a -> b -> a");
    }

    #[test]
    fn test_node_id_only_for_execution_errors() {
        assert_eq!(ChainflowError::init("llm", "boom").node_id(), Some("llm"));
        assert_eq!(ChainflowError::run("chain", "boom").node_id(), Some("chain"));
        assert_eq!(ChainflowError::UnknownType("x".into()).node_id(), None);
        assert!(ChainflowError::UnknownType("x".into()).is_validation());
        assert!(!ChainflowError::Cancelled.is_validation());
    }
}
