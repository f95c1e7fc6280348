use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;

use chainflow_core::capability::{BASE_CHAT_MODEL, BASE_LANGUAGE_MODEL};
use chainflow_core::context::InitContext;
use chainflow_core::error::Result;
use chainflow_core::instance::{NodeInstance, ResolvedInputs};
use chainflow_core::stream::StreamSink;
use chainflow_core::traits::{ChatModel, NodeType};
use chainflow_core::types::{ChatMessage, InputPort, NodeSchema, Role};

use super::stream_words;

/// Offline chat model. Replays scripted responses in rotation, or echoes
/// the last user message when none are configured.
pub struct EchoChatModel {
    name: String,
    responses: Vec<String>,
    next: AtomicUsize,
}

impl EchoChatModel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            responses: Vec::new(),
            next: AtomicUsize::new(0),
        }
    }

    pub fn with_responses(mut self, responses: Vec<String>) -> Self {
        self.responses = responses;
        self
    }

    fn reply(&self, messages: &[ChatMessage]) -> String {
        if self.responses.is_empty() {
            return messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(|m| m.content.clone())
                .unwrap_or_default();
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.responses.len();
        self.responses[i].clone()
    }
}

impl ChatModel for EchoChatModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn generate(
        &self,
        messages: Vec<ChatMessage>,
        sink: Option<StreamSink>,
    ) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let text = self.reply(&messages);
            if let Some(sink) = &sink {
                stream_words(sink, &text).await?;
            }
            Ok(text)
        })
    }
}

/// `responses` accepts a JSON array of strings or newline-separated text.
fn parse_responses(inputs: &ResolvedInputs) -> Vec<String> {
    if let Some(serde_json::Value::Array(items)) = inputs.json("responses") {
        return items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
    }
    inputs
        .str("responses")
        .map(|s| {
            s.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub struct EchoChatModelNode;

impl NodeType for EchoChatModelNode {
    fn schema(&self) -> NodeSchema {
        NodeSchema::new("echoChatModel", "Chat Models")
            .label("Echo Chat Model")
            .description("Scripted or echoing chat model for offline flows and tests")
            .capabilities(["EchoChatModel", BASE_CHAT_MODEL, BASE_LANGUAGE_MODEL])
            .input(
                InputPort::param("responses", "json")
                    .with_label("Responses")
                    .optional(),
            )
    }

    fn init(&self, inputs: ResolvedInputs, ctx: InitContext) -> BoxFuture<'_, Result<NodeInstance>> {
        Box::pin(async move {
            let model: Arc<dyn ChatModel> =
                Arc::new(EchoChatModel::new(ctx.node_id).with_responses(parse_responses(&inputs)));
            Ok(NodeInstance::new(model))
        })
    }
}
