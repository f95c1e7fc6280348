use tokio_util::sync::CancellationToken;

use crate::history::{ChatHistory, MemoryBindings};
use crate::stream::StreamSink;
use crate::types::{ChatMessage, EnvFlags, SessionId};

/// Per-request state. Created when a request arrives and dropped at run end.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub session_id: SessionId,
    /// Prior chat history, oldest first.
    pub history: Vec<ChatMessage>,
    pub sink: Option<StreamSink>,
    pub flags: EnvFlags,
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            history: Vec::new(),
            sink: None,
            flags: EnvFlags::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }

    pub fn with_sink(mut self, sink: StreamSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_flags(mut self, flags: EnvFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Passed to a node's `init`.
#[derive(Debug, Clone)]
pub struct InitContext {
    pub node_id: String,
    pub session_id: SessionId,
    /// Output port selected by the node's outgoing edges.
    pub output: Option<String>,
    pub flags: EnvFlags,
}

/// Passed to the terminal node's `run`.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub node_id: String,
    pub session_id: SessionId,
    pub memory: MemoryBindings,
    /// Present only for streaming runs.
    pub sink: Option<StreamSink>,
    pub flags: EnvFlags,
    pub cancel: CancellationToken,
}

impl RunContext {
    /// History bound to the memory node `node_id` for this run.
    pub fn history(&self, node_id: &str) -> Option<&ChatHistory> {
        self.memory.get(node_id)
    }
}
