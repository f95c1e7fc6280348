pub mod agent;
pub mod conversation;
pub mod retrieval_qa;

pub use agent::{ConversationalAgent, ConversationalAgentNode};
pub use conversation::{ConversationChain, ConversationChainNode};
pub use retrieval_qa::{RetrievalQaChain, RetrievalQaChainNode};

use std::any::Any;
use std::sync::Arc;

use chainflow_core::context::RunContext;
use chainflow_core::error::{ChainflowError, Result};
use chainflow_core::instance::NodeInstance;
use chainflow_core::traits::ConversationalMemory;
use chainflow_core::types::ChatMessage;

/// History bound to `memory` for this run, cut to the memory's window.
pub(crate) async fn bound_history(
    memory: Option<&Arc<dyn ConversationalMemory>>,
    ctx: &RunContext,
) -> Vec<ChatMessage> {
    let Some(memory) = memory else {
        return Vec::new();
    };
    match ctx.history(memory.node_id()) {
        Some(history) => history.recent(memory.window()).await,
        None => Vec::new(),
    }
}

/// Recover the chain object a node's `init` stored.
pub(crate) fn chain_instance<T: Any + Send + Sync>(
    instance: &NodeInstance,
    node_id: &str,
) -> Result<Arc<T>> {
    instance.get::<Arc<T>>().ok_or_else(|| {
        ChainflowError::Node(format!(
            "instance of '{}' is {}, not {}",
            node_id,
            instance.type_name(),
            std::any::type_name::<T>()
        ))
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use chainflow_core::context::{InitContext, RunContext};
    use chainflow_core::history::MemoryBindings;
    use chainflow_core::instance::{NodeInstance, ResolvedValue};
    use chainflow_core::stream::StreamSink;
    use chainflow_core::types::{EnvFlags, SessionId};
    use tokio_util::sync::CancellationToken;

    pub fn init_ctx(node_id: &str) -> InitContext {
        InitContext {
            node_id: node_id.into(),
            session_id: SessionId::from_string("s1"),
            output: None,
            flags: EnvFlags::default(),
        }
    }

    pub fn run_ctx(node_id: &str, memory: MemoryBindings, sink: Option<StreamSink>) -> RunContext {
        RunContext {
            node_id: node_id.into(),
            session_id: SessionId::from_string("s1"),
            memory,
            sink,
            flags: EnvFlags::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn upstream<T: std::any::Any + Send + Sync>(node_id: &str, value: T) -> ResolvedValue {
        ResolvedValue::Node {
            node_id: node_id.into(),
            instance: NodeInstance::new(value),
        }
    }
}
