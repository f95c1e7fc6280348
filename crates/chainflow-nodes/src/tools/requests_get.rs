use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use tracing::debug;

use chainflow_core::capability::TOOL;
use chainflow_core::context::InitContext;
use chainflow_core::error::{ChainflowError, Result};
use chainflow_core::instance::{NodeInstance, ResolvedInputs};
use chainflow_core::traits::{AgentTool, NodeType};
use chainflow_core::types::{InputPort, NodeSchema};

pub const DEFAULT_DESCRIPTION: &str = "A portal to the internet. Use this when you need to get \
specific content from a website. Input should be a url (i.e. https://www.google.com). The output \
will be the text response of the GET request.";

const MAX_OUTPUT_CHARS: usize = 2000;

/// HTTP GET tool. A configured URL overrides whatever the agent passes in.
pub struct RequestsGetTool {
    http: Client,
    url: Option<String>,
    description: String,
    headers: BTreeMap<String, String>,
}

impl RequestsGetTool {
    pub fn new(url: Option<String>, description: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ChainflowError::Node(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            url,
            description: description.unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string()),
            headers: BTreeMap::new(),
        })
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    fn target(&self, input: &str) -> Result<String> {
        match &self.url {
            Some(url) => Ok(url.clone()),
            None if !input.trim().is_empty() => Ok(input.trim().trim_matches('"').to_string()),
            None => Err(ChainflowError::Node("no URL given".into())),
        }
    }
}

fn truncate(text: String) -> String {
    match text.char_indices().nth(MAX_OUTPUT_CHARS) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text,
    }
}

impl AgentTool for RequestsGetTool {
    fn name(&self) -> &str {
        "requests_get"
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn call(&self, input: String) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let url = self.target(&input)?;
            debug!(url = %url, "GET request");

            let mut req = self.http.get(&url);
            for (k, v) in &self.headers {
                req = req.header(k.as_str(), v.as_str());
            }
            let resp = req
                .send()
                .await
                .map_err(|e| ChainflowError::Node(format!("Request failed: {}", e)))?;
            let body = resp
                .text()
                .await
                .map_err(|e| ChainflowError::Node(format!("Failed to read response body: {}", e)))?;
            Ok(truncate(body))
        })
    }
}

/// `headers` may arrive as a JSON object or JSON text; non-string values
/// are sent in their JSON form.
fn parse_headers(inputs: &ResolvedInputs) -> Result<BTreeMap<String, String>> {
    match inputs.json("headers") {
        None => Ok(BTreeMap::new()),
        Some(serde_json::Value::Object(map)) => Ok(map
            .into_iter()
            .map(|(k, v)| {
                let v = match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, v)
            })
            .collect()),
        Some(_) => Err(ChainflowError::Node("headers must be a JSON object".into())),
    }
}

pub struct RequestsGetNode;

impl NodeType for RequestsGetNode {
    fn schema(&self) -> NodeSchema {
        NodeSchema::new("requestsGet", "Tools")
            .label("Requests Get")
            .description("Execute HTTP GET requests")
            .capabilities(["RequestsGet", TOOL])
            .input(InputPort::param("url", "string").with_label("URL").optional())
            .input(
                InputPort::param("description", "string")
                    .with_label("Description")
                    .with_default(serde_json::json!(DEFAULT_DESCRIPTION)),
            )
            .input(InputPort::param("headers", "json").with_label("Headers").optional())
    }

    fn init(&self, inputs: ResolvedInputs, _ctx: InitContext) -> BoxFuture<'_, Result<NodeInstance>> {
        Box::pin(async move {
            let tool = RequestsGetTool::new(
                inputs.str("url").map(str::to_string),
                inputs.str("description").map(str::to_string),
            )?
            .with_headers(parse_headers(&inputs)?);
            let tool: Arc<dyn AgentTool> = Arc::new(tool);
            Ok(NodeInstance::new(tool))
        })
    }
}
