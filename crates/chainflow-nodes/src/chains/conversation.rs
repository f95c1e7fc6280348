use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::json;
use tracing::info;

use chainflow_core::capability::{BASE_CHAIN, BASE_CHAT_MODEL, BASE_MEMORY};
use chainflow_core::context::{InitContext, RunContext};
use chainflow_core::error::Result;
use chainflow_core::instance::{NodeInstance, ResolvedInputs};
use chainflow_core::traits::{ChatModel, ConversationalMemory, NodeType};
use chainflow_core::types::{ChatMessage, InputPort, NodeOutput, NodeSchema};

use super::{bound_history, chain_instance};

pub const DEFAULT_SYSTEM_MESSAGE: &str = "The following is a friendly conversation between a \
human and an AI. The AI is talkative and provides lots of specific details from its context. If \
the AI does not know the answer to a question, it truthfully says it does not know.";

/// Chat model plus optional memory: system prompt, prior turns, then input.
pub struct ConversationChain {
    model: Arc<dyn ChatModel>,
    memory: Option<Arc<dyn ConversationalMemory>>,
    system_message: String,
}

impl ConversationChain {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self {
            model,
            memory: None,
            system_message: DEFAULT_SYSTEM_MESSAGE.to_string(),
        }
    }

    pub fn with_memory(mut self, memory: Arc<dyn ConversationalMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_system_message(mut self, message: impl Into<String>) -> Self {
        self.system_message = message.into();
        self
    }

    pub async fn call(&self, input: &str, ctx: &RunContext) -> Result<String> {
        let mut messages = vec![ChatMessage::system(&self.system_message)];
        messages.extend(bound_history(self.memory.as_ref(), ctx).await);
        messages.push(ChatMessage::user(input));
        if ctx.flags.verbose {
            info!(node_id = %ctx.node_id, messages = messages.len(), "Conversation prompt");
        }
        self.model.generate(messages, ctx.sink.clone()).await
    }
}

pub struct ConversationChainNode;

impl NodeType for ConversationChainNode {
    fn schema(&self) -> NodeSchema {
        NodeSchema::new("conversationChain", "Chains")
            .label("Conversation Chain")
            .description("Chat with a model, remembering earlier turns")
            .capabilities(["ConversationChain", BASE_CHAIN])
            .input(InputPort::node("model", [BASE_CHAT_MODEL]).with_label("Language Model"))
            .input(InputPort::node("memory", [BASE_MEMORY]).with_label("Memory").optional())
            .input(
                InputPort::param("systemMessage", "string")
                    .with_label("System Message")
                    .with_default(json!(DEFAULT_SYSTEM_MESSAGE)),
            )
            .executable()
    }

    fn init(&self, inputs: ResolvedInputs, _ctx: InitContext) -> BoxFuture<'_, Result<NodeInstance>> {
        Box::pin(async move {
            let model: Arc<dyn ChatModel> = inputs.require_node("model")?;
            let mut chain = ConversationChain::new(model);
            if let Some(memory) = inputs.node::<Arc<dyn ConversationalMemory>>("memory") {
                chain = chain.with_memory(memory);
            }
            if let Some(system) = inputs.str("systemMessage") {
                chain = chain.with_system_message(system);
            }
            Ok(NodeInstance::new(Arc::new(chain)))
        })
    }

    fn run(
        &self,
        instance: NodeInstance,
        input: String,
        ctx: RunContext,
    ) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let chain = chain_instance::<ConversationChain>(&instance, &ctx.node_id)?;
            Ok(NodeOutput::Text(chain.call(&input, &ctx).await?))
        })
    }
}
