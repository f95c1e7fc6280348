use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::{debug, info, warn};

use chainflow_core::capability::{BASE_CHAIN, BASE_CHAT_MEMORY, BASE_LANGUAGE_MODEL, TOOL};
use chainflow_core::context::{InitContext, RunContext};
use chainflow_core::error::{ChainflowError, Result};
use chainflow_core::instance::{NodeInstance, ResolvedInputs};
use chainflow_core::traits::{AgentTool, ChatModel, ConversationalMemory, NodeType};
use chainflow_core::types::{ChatMessage, InputPort, NodeOutput, NodeSchema};

use super::{bound_history, chain_instance};
use crate::models::stream_words;

pub const MAX_ITERATIONS: usize = 5;
pub const STOPPED_MESSAGE: &str = "Agent stopped due to max iterations.";
const FINAL_ANSWER: &str = "Final Answer";

const DEFAULT_SYSTEM_MESSAGE: &str = "Assistant is a large language model trained to help with a \
wide range of tasks, from answering simple questions to providing in-depth explanations and \
discussions on a wide range of topics. Assistant can use tools to look up information it does not \
already know.";

const DEFAULT_HUMAN_MESSAGE: &str = "TOOLS\n------\nAssistant can ask the user to use tools to \
look up information that may be helpful in answering the user's original question. The tools \
the human can use are:\n\n{tools}\n\nRESPONSE FORMAT INSTRUCTIONS\n----------------------------\n\
Respond with a single JSON object and nothing else, in one of two shapes.\n\n\
To use a tool:\n{\"action\": \"<one of [{tool_names}]>\", \"action_input\": \"<input to the tool>\"}\n\n\
To reply to the human:\n{\"action\": \"Final Answer\", \"action_input\": \"<your response>\"}\n\n\
USER'S INPUT\n--------------------\n{input}";

const TOOL_RESPONSE: &str = "TOOL RESPONSE:\n---------------------\n{observation}\n\n\
USER'S INPUT\n--------------------\nOkay, so what is the response to my last comment? If using \
information obtained from the tools you must mention it explicitly without mentioning the tool \
names. Respond with a single JSON object as instructed.";

/// One parsed model turn.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentAction {
    pub action: String,
    #[serde(default, deserialize_with = "string_or_json")]
    pub action_input: String,
}

fn string_or_json<'de, D>(de: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(de)? {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    })
}

impl AgentAction {
    /// Parse a reply, tolerating markdown fences and surrounding prose.
    /// Anything without a JSON action is taken as the final answer.
    pub fn parse(reply: &str) -> Self {
        let candidate = match (reply.find('{'), reply.rfind('}')) {
            (Some(start), Some(end)) if start < end => &reply[start..=end],
            _ => reply,
        };
        serde_json::from_str::<AgentAction>(candidate).unwrap_or_else(|_| AgentAction {
            action: FINAL_ANSWER.to_string(),
            action_input: reply.trim().to_string(),
        })
    }

    pub fn is_final(&self) -> bool {
        self.action.eq_ignore_ascii_case(FINAL_ANSWER)
    }
}

/// Conversational ReAct-style agent driving tools through a JSON protocol.
pub struct ConversationalAgent {
    model: Arc<dyn ChatModel>,
    memory: Option<Arc<dyn ConversationalMemory>>,
    tools: Vec<Arc<dyn AgentTool>>,
    system_message: String,
    human_message: String,
    max_iterations: usize,
}

impl ConversationalAgent {
    pub fn new(model: Arc<dyn ChatModel>, tools: Vec<Arc<dyn AgentTool>>) -> Self {
        Self {
            model,
            memory: None,
            tools,
            system_message: DEFAULT_SYSTEM_MESSAGE.to_string(),
            human_message: DEFAULT_HUMAN_MESSAGE.to_string(),
            max_iterations: MAX_ITERATIONS,
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

    /// Template for the user turn; `{tools}`, `{tool_names}` and `{input}`
    /// are substituted.
    pub fn with_human_message(mut self, message: impl Into<String>) -> Self {
        self.human_message = message.into();
        self
    }

    fn render_input(&self, input: &str) -> String {
        let tools = self
            .tools
            .iter()
            .map(|t| format!("> {}: {}", t.name(), t.description()))
            .collect::<Vec<_>>()
            .join("\n");
        let names = self
            .tools
            .iter()
            .map(|t| t.name())
            .collect::<Vec<_>>()
            .join(", ");
        self.human_message
            .replace("{tools}", &tools)
            .replace("{tool_names}", &names)
            .replace("{input}", input)
    }

    async fn observe(&self, action: &AgentAction) -> String {
        let Some(tool) = self.tools.iter().find(|t| t.name() == action.action) else {
            return format!("{} is not a valid tool, try another one.", action.action);
        };
        match tool.call(action.action_input.clone()).await {
            Ok(output) => output,
            Err(e) => {
                warn!(tool = %action.action, error = %e, "Tool call failed");
                format!("Error: {}", e)
            }
        }
    }

    pub async fn call(&self, input: &str, ctx: &RunContext) -> Result<String> {
        let mut messages = vec![ChatMessage::system(&self.system_message)];
        messages.extend(bound_history(self.memory.as_ref(), ctx).await);
        messages.push(ChatMessage::user(self.render_input(input)));

        for step in 0..self.max_iterations {
            if ctx.cancel.is_cancelled() {
                return Err(ChainflowError::Cancelled);
            }
            let reply = self.model.generate(messages.clone(), None).await?;
            let action = AgentAction::parse(&reply);
            debug!(node_id = %ctx.node_id, step, action = %action.action, "Agent step");

            if action.is_final() {
                if let Some(sink) = &ctx.sink {
                    stream_words(sink, &action.action_input).await?;
                }
                return Ok(action.action_input);
            }

            let observation = self.observe(&action).await;
            if ctx.flags.verbose {
                info!(node_id = %ctx.node_id, tool = %action.action, observation = %observation, "Tool observation");
            }
            messages.push(ChatMessage::assistant(reply));
            messages.push(ChatMessage::user(TOOL_RESPONSE.replace("{observation}", &observation)));
        }

        if let Some(sink) = &ctx.sink {
            stream_words(sink, STOPPED_MESSAGE).await?;
        }
        Ok(STOPPED_MESSAGE.to_string())
    }
}

pub struct ConversationalAgentNode;

impl NodeType for ConversationalAgentNode {
    fn schema(&self) -> NodeSchema {
        NodeSchema::new("conversationalAgent", "Agents")
            .label("Conversational Agent")
            .description("Conversational agent that decides which tools to use")
            .capabilities(["AgentExecutor", BASE_CHAIN])
            .input(InputPort::node("tools", [TOOL]).with_label("Allowed Tools").list())
            .input(InputPort::node("model", [BASE_LANGUAGE_MODEL]).with_label("Language Model"))
            .input(InputPort::node("memory", [BASE_CHAT_MEMORY]).with_label("Memory"))
            .input(
                InputPort::param("systemMessage", "string")
                    .with_label("System Message")
                    .optional(),
            )
            .input(
                InputPort::param("humanMessage", "string")
                    .with_label("Human Message")
                    .optional(),
            )
            .executable()
    }

    fn init(&self, inputs: ResolvedInputs, _ctx: InitContext) -> BoxFuture<'_, Result<NodeInstance>> {
        Box::pin(async move {
            let model: Arc<dyn ChatModel> = inputs.require_node("model")?;
            let tools = inputs.nodes::<Arc<dyn AgentTool>>("tools");
            let mut agent = ConversationalAgent::new(model, tools);
            if let Some(memory) = inputs.node::<Arc<dyn ConversationalMemory>>("memory") {
                agent = agent.with_memory(memory);
            }
            if let Some(system) = inputs.str("systemMessage") {
                agent = agent.with_system_message(system);
            }
            if let Some(human) = inputs.str("humanMessage") {
                agent = agent.with_human_message(human);
            }
            Ok(NodeInstance::new(Arc::new(agent)))
        })
    }

    fn run(
        &self,
        instance: NodeInstance,
        input: String,
        ctx: RunContext,
    ) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let agent = chain_instance::<ConversationalAgent>(&instance, &ctx.node_id)?;
            Ok(NodeOutput::Text(agent.call(&input, &ctx).await?))
        })
    }
}
