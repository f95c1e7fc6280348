use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use chainflow_core::capability::{BASE_CHAT_MODEL, BASE_LANGUAGE_MODEL};
use chainflow_core::context::InitContext;
use chainflow_core::error::{ChainflowError, Result};
use chainflow_core::instance::{NodeInstance, ResolvedInputs};
use chainflow_core::stream::StreamSink;
use chainflow_core::traits::{ChatModel, NodeType};
use chainflow_core::types::{ChatMessage, InputPort, NodeSchema};

use crate::streaming::{SseEvent, SseStream};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

/// Connection and sampling settings for an OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiSettings {
    pub model: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub timeout: Option<Duration>,
}

impl Default for OpenAiSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            base_url: OPENAI_BASE_URL.to_string(),
            api_key: None,
            temperature: Some(0.9),
            max_tokens: None,
            top_p: None,
            timeout: None,
        }
    }
}

impl OpenAiSettings {
    fn from_inputs(inputs: &ResolvedInputs, base_url_port: &str) -> Self {
        let defaults = Self::default();
        Self {
            model: inputs.str("modelName").unwrap_or(DEFAULT_MODEL).to_string(),
            base_url: inputs
                .str(base_url_port)
                .unwrap_or(OPENAI_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key: None,
            temperature: inputs
                .number("temperature")
                .map(|t| t as f32)
                .or(defaults.temperature),
            max_tokens: inputs.usize("maxTokens").map(|n| n as u32),
            top_p: inputs.number("topP").map(|p| p as f32),
            timeout: inputs.usize("timeout").map(|ms| Duration::from_millis(ms as u64)),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

/// Chat model backed by an OpenAI-compatible `/chat/completions` API.
pub struct OpenAiChatModel {
    name: String,
    http: Client,
    settings: OpenAiSettings,
}

impl OpenAiChatModel {
    pub fn new(name: impl Into<String>, settings: OpenAiSettings) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = settings.timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|e| ChainflowError::Node(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            name: name.into(),
            http,
            settings,
        })
    }

    pub fn settings(&self) -> &OpenAiSettings {
        &self.settings
    }

    fn request(&self, messages: &[ChatMessage], stream: bool) -> reqwest::RequestBuilder {
        let body = ChatRequest {
            model: &self.settings.model,
            messages: messages
                .iter()
                .map(|m| OaiMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
            top_p: self.settings.top_p,
            stream,
        };
        let mut req = self.http.post(self.settings.endpoint()).json(&body);
        if let Some(key) = &self.settings.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }
        req
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<OaiMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    stream: bool,
}

#[derive(Serialize)]
struct OaiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct Completion {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Text carried by one streamed completion event, if any.
fn parse_delta(event: &SseEvent) -> Option<String> {
    if event.is_done() {
        return None;
    }
    match serde_json::from_str::<StreamChunk>(&event.data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .filter(|t| !t.is_empty()),
        Err(e) => {
            warn!(data = %event.data, error = %e, "Failed to parse completion chunk");
            None
        }
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown".to_string());
    Err(ChainflowError::Node(format!("HTTP {}: {}", status, body)))
}

impl ChatModel for OpenAiChatModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn generate(
        &self,
        messages: Vec<ChatMessage>,
        sink: Option<StreamSink>,
    ) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            debug!(model = %self.settings.model, messages = messages.len(), streaming = sink.is_some(), "Chat completion");
            let response = self
                .request(&messages, sink.is_some())
                .send()
                .await
                .map_err(|e| ChainflowError::Node(e.to_string()))?;
            let response = check_status(response).await?;

            let Some(sink) = sink else {
                let completion: Completion = response
                    .json()
                    .await
                    .map_err(|e| ChainflowError::Node(e.to_string()))?;
                return Ok(completion
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.message.content)
                    .unwrap_or_default());
            };

            let mut events = SseStream::new(response.bytes_stream());
            let mut text = String::new();
            while let Some(event) = events.next().await {
                let event = event.map_err(ChainflowError::Node)?;
                if event.is_done() {
                    break;
                }
                if let Some(delta) = parse_delta(&event) {
                    sink.send_chunk(delta.clone()).await?;
                    text.push_str(&delta);
                }
            }
            Ok(text)
        })
    }
}

fn model_ports(schema: NodeSchema) -> NodeSchema {
    schema
        .input(
            InputPort::param("modelName", "string")
                .with_label("Model Name")
                .with_default(json!(DEFAULT_MODEL)),
        )
        .input(
            InputPort::param("temperature", "number")
                .with_label("Temperature")
                .with_default(json!(0.9)),
        )
        .input(InputPort::param("maxTokens", "number").with_label("Max Tokens").optional())
        .input(InputPort::param("topP", "number").with_label("Top Probability").optional())
        .input(InputPort::param("timeout", "number").with_label("Timeout (ms)").optional())
}

pub struct ChatOpenAiNode;

impl NodeType for ChatOpenAiNode {
    fn schema(&self) -> NodeSchema {
        model_ports(
            NodeSchema::new("chatOpenAI", "Chat Models")
                .label("ChatOpenAI")
                .description("Chat model served by the OpenAI API or a compatible endpoint")
                .capabilities(["ChatOpenAI", BASE_CHAT_MODEL, BASE_LANGUAGE_MODEL])
                .input(InputPort::param("apiKey", "password").with_label("API Key").optional()),
        )
        .input(InputPort::param("baseUrl", "string").with_label("Base URL").optional())
    }

    fn init(&self, inputs: ResolvedInputs, ctx: InitContext) -> BoxFuture<'_, Result<NodeInstance>> {
        Box::pin(async move {
            let mut settings = OpenAiSettings::from_inputs(&inputs, "baseUrl");
            settings.api_key = inputs
                .str("apiKey")
                .map(str::to_string)
                .or_else(|| std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()));
            if settings.api_key.is_none() {
                return Err(ChainflowError::Node(
                    "no API key: set apiKey or OPENAI_API_KEY".into(),
                ));
            }
            let model: Arc<dyn ChatModel> = Arc::new(OpenAiChatModel::new(ctx.node_id, settings)?);
            Ok(NodeInstance::new(model))
        })
    }
}

/// Self-hosted LocalAI server; same wire protocol, no key.
pub struct ChatLocalAiNode;

impl NodeType for ChatLocalAiNode {
    fn schema(&self) -> NodeSchema {
        model_ports(
            NodeSchema::new("chatLocalAI", "Chat Models")
                .label("ChatLocalAI")
                .description("Chat model served by a local LocalAI instance")
                .capabilities(["ChatLocalAI", BASE_CHAT_MODEL, BASE_LANGUAGE_MODEL])
                .input(InputPort::param("basePath", "string").with_label("Base Path")),
        )
    }

    fn init(&self, inputs: ResolvedInputs, ctx: InitContext) -> BoxFuture<'_, Result<NodeInstance>> {
        Box::pin(async move {
            let settings = OpenAiSettings::from_inputs(&inputs, "basePath");
            let model: Arc<dyn ChatModel> = Arc::new(OpenAiChatModel::new(ctx.node_id, settings)?);
            Ok(NodeInstance::new(model))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainflow_core::instance::ResolvedValue;

    #[test]
    fn test_parse_delta() {
        let event = SseEvent {
            event_type: None,
            data: r#"{"choices":[{"delta":{"content":"Hel"}}]}"#.into(),
        };
        assert_eq!(parse_delta(&event).as_deref(), Some("Hel"));

        let role_only = SseEvent {
            event_type: None,
            data: r#"{"choices":[{"delta":{"role":"assistant"}}]}"#.into(),
        };
        assert_eq!(parse_delta(&role_only), None);

        let done = SseEvent {
            event_type: None,
            data: "[DONE]".into(),
        };
        assert_eq!(parse_delta(&done), None);
    }

    #[test]
    fn test_settings_from_inputs() {
        let mut inputs = ResolvedInputs::new();
        inputs.insert("modelName", ResolvedValue::Literal(json!("llama-3")));
        inputs.insert("basePath", ResolvedValue::Literal(json!("http://localhost:8080/v1/")));
        inputs.insert("maxTokens", ResolvedValue::Literal(json!("256")));
        inputs.insert("temperature", ResolvedValue::Literal(json!("")));

        let settings = OpenAiSettings::from_inputs(&inputs, "basePath");
        assert_eq!(settings.model, "llama-3");
        assert_eq!(settings.endpoint(), "http://localhost:8080/v1/chat/completions");
        assert_eq!(settings.max_tokens, Some(256));
        assert_eq!(settings.temperature, Some(0.9));
        assert_eq!(settings.top_p, None);
    }

    #[test]
    fn test_request_body_shape() {
        let model = OpenAiChatModel::new("m", OpenAiSettings::default()).unwrap();
        let req = model
            .request(&[ChatMessage::user("hi")], true)
            .build()
            .unwrap();
        let body: serde_json::Value =
            serde_json::from_slice(req.body().unwrap().as_bytes().unwrap()).unwrap();
        assert_eq!(body["model"], "gpt-3.5-turbo");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["stream"], true);
        assert!(body.get("max_tokens").is_none());
    }
}
