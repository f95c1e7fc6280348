use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::json;

use chainflow_core::capability::{BASE_CHAT_MEMORY, BASE_MEMORY};
use chainflow_core::context::InitContext;
use chainflow_core::error::Result;
use chainflow_core::instance::{NodeInstance, ResolvedInputs};
use chainflow_core::traits::{ConversationalMemory, NodeType};
use chainflow_core::types::{InputPort, NodeSchema};

const DEFAULT_MEMORY_KEY: &str = "chat_history";

/// Conversation buffer. Holds no messages itself; the run context carries
/// the history bound to `node_id` for the current session.
#[derive(Debug, Clone)]
pub struct BufferMemory {
    node_id: String,
    memory_key: String,
    window: Option<usize>,
}

impl BufferMemory {
    pub fn new(node_id: impl Into<String>, memory_key: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            memory_key: memory_key.into(),
            window: None,
        }
    }

    /// Keep only the last `k` exchanges (2k messages).
    pub fn with_window(mut self, k: usize) -> Self {
        self.window = Some(k.saturating_mul(2));
        self
    }
}

impl ConversationalMemory for BufferMemory {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn memory_key(&self) -> &str {
        &self.memory_key
    }

    fn window(&self) -> Option<usize> {
        self.window
    }
}

pub struct BufferMemoryNode;

impl NodeType for BufferMemoryNode {
    fn schema(&self) -> NodeSchema {
        NodeSchema::new("bufferMemory", "Memory")
            .label("Buffer Memory")
            .description("Remembers the whole conversation of the current session")
            .capabilities(["BufferMemory", BASE_CHAT_MEMORY, BASE_MEMORY])
            .input(
                InputPort::param("memoryKey", "string")
                    .with_label("Memory Key")
                    .with_default(json!(DEFAULT_MEMORY_KEY)),
            )
            .stateful()
    }

    fn init(&self, inputs: ResolvedInputs, ctx: InitContext) -> BoxFuture<'_, Result<NodeInstance>> {
        Box::pin(async move {
            let key = inputs.str("memoryKey").unwrap_or(DEFAULT_MEMORY_KEY);
            let memory: Arc<dyn ConversationalMemory> = Arc::new(BufferMemory::new(ctx.node_id, key));
            Ok(NodeInstance::new(memory))
        })
    }
}

pub struct BufferWindowMemoryNode;

impl NodeType for BufferWindowMemoryNode {
    fn schema(&self) -> NodeSchema {
        NodeSchema::new("bufferWindowMemory", "Memory")
            .label("Buffer Window Memory")
            .description("Remembers the last k exchanges of the current session")
            .capabilities(["BufferWindowMemory", BASE_CHAT_MEMORY, BASE_MEMORY])
            .input(
                InputPort::param("memoryKey", "string")
                    .with_label("Memory Key")
                    .with_default(json!(DEFAULT_MEMORY_KEY)),
            )
            .input(
                InputPort::param("k", "number")
                    .with_label("Size")
                    .with_default(json!(4)),
            )
            .stateful()
    }

    fn init(&self, inputs: ResolvedInputs, ctx: InitContext) -> BoxFuture<'_, Result<NodeInstance>> {
        Box::pin(async move {
            let key = inputs.str("memoryKey").unwrap_or(DEFAULT_MEMORY_KEY);
            let k = inputs.usize("k").unwrap_or(4);
            let memory: Arc<dyn ConversationalMemory> =
                Arc::new(BufferMemory::new(ctx.node_id, key).with_window(k));
            Ok(NodeInstance::new(memory))
        })
    }
}
