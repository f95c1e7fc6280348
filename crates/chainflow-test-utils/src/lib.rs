//! Stub node types and fixtures shared by the chainflow test suites.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use chainflow_core::capability::{
    BASE_CHAIN, BASE_CHAT_MEMORY, BASE_CHAT_MODEL, BASE_LANGUAGE_MODEL, BASE_MEMORY, TEXT_SPLITTER,
};
use chainflow_core::context::{InitContext, RunContext};
use chainflow_core::error::{ChainflowError, Result};
use chainflow_core::instance::{NodeInstance, ResolvedInputs, ResolvedValue};
use chainflow_core::traits::NodeType;
use chainflow_core::types::{ChatMessage, InputPort, NodeOutput, NodeSchema, OutputPort};

/// What a stub instance was built from.
#[derive(Debug, Clone)]
pub struct StubInstance {
    pub node_id: String,
    pub session_id: String,
    /// `port=upstream` for node inputs and `port:literal` for literals, sorted.
    pub inputs: Vec<String>,
    /// Value of the init counter when this instance was built.
    pub serial: usize,
}

/// One observation of a bound history during a terminal run.
#[derive(Debug, Clone)]
pub struct HistorySighting {
    pub session_id: String,
    pub memory_node: String,
    pub messages: Vec<ChatMessage>,
}

/// Shared log of histories a stub terminal saw while running.
#[derive(Debug, Clone, Default)]
pub struct HistoryProbe {
    seen: Arc<Mutex<Vec<HistorySighting>>>,
}

impl HistoryProbe {
    pub fn sightings(&self) -> Vec<HistorySighting> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn record(&self, sighting: HistorySighting) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(sighting);
        }
    }
}

/// Configurable node type for engine tests.
///
/// Counts `init` calls, can fail or stall on demand, and when executable
/// answers `echo: <input>`, streaming one word per chunk.
pub struct StubNode {
    schema: NodeSchema,
    init_calls: Arc<AtomicUsize>,
    run_calls: Arc<AtomicUsize>,
    fail_init: Option<String>,
    fail_run: Option<String>,
    panic_on_run: bool,
    init_delay: Option<Duration>,
    run_delay: Option<Duration>,
    probe: HistoryProbe,
}

impl StubNode {
    pub fn new(name: &str, category: &str) -> Self {
        Self {
            schema: NodeSchema::new(name, category),
            init_calls: Arc::new(AtomicUsize::new(0)),
            run_calls: Arc::new(AtomicUsize::new(0)),
            fail_init: None,
            fail_run: None,
            panic_on_run: false,
            init_delay: None,
            run_delay: None,
            probe: HistoryProbe::default(),
        }
    }

    pub fn capabilities<const N: usize>(mut self, tags: [&str; N]) -> Self {
        self.schema = self.schema.capabilities(tags);
        self
    }

    pub fn input(mut self, port: InputPort) -> Self {
        self.schema = self.schema.input(port);
        self
    }

    pub fn output(mut self, port: OutputPort) -> Self {
        self.schema = self.schema.output(port);
        self
    }

    pub fn stateful(mut self) -> Self {
        self.schema = self.schema.stateful();
        self
    }

    pub fn executable(mut self) -> Self {
        self.schema = self.schema.executable();
        self
    }

    pub fn fail_init(mut self, message: &str) -> Self {
        self.fail_init = Some(message.to_string());
        self
    }

    pub fn fail_run(mut self, message: &str) -> Self {
        self.fail_run = Some(message.to_string());
        self
    }

    pub fn panic_on_run(mut self) -> Self {
        self.panic_on_run = true;
        self
    }

    pub fn init_delay(mut self, delay: Duration) -> Self {
        self.init_delay = Some(delay);
        self
    }

    pub fn run_delay(mut self, delay: Duration) -> Self {
        self.run_delay = Some(delay);
        self
    }

    /// Counter of `init` calls, shared with the registered type.
    pub fn init_counter(&self) -> Arc<AtomicUsize> {
        self.init_calls.clone()
    }

    pub fn run_counter(&self) -> Arc<AtomicUsize> {
        self.run_calls.clone()
    }

    pub fn probe(&self) -> HistoryProbe {
        self.probe.clone()
    }
}

fn describe_inputs(inputs: &ResolvedInputs, schema: &NodeSchema) -> Vec<String> {
    fn describe(port: &str, value: &ResolvedValue, out: &mut Vec<String>) {
        match value {
            ResolvedValue::Literal(v) => out.push(format!("{port}:{v}")),
            ResolvedValue::Node { node_id, .. } => out.push(format!("{port}={node_id}")),
            ResolvedValue::List(items) => items.iter().for_each(|item| describe(port, item, out)),
        }
    }

    let mut out = Vec::new();
    for port in &schema.inputs {
        if let Some(value) = inputs.get(&port.name) {
            describe(&port.name, value, &mut out);
        }
    }
    out.sort();
    out
}

impl NodeType for StubNode {
    fn schema(&self) -> NodeSchema {
        self.schema.clone()
    }

    fn init(&self, inputs: ResolvedInputs, ctx: InitContext) -> BoxFuture<'_, Result<NodeInstance>> {
        Box::pin(async move {
            if let Some(delay) = self.init_delay {
                tokio::time::sleep(delay).await;
            }
            let serial = self.init_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(message) = &self.fail_init {
                return Err(ChainflowError::Node(message.clone()));
            }
            Ok(NodeInstance::new(StubInstance {
                node_id: ctx.node_id,
                session_id: ctx.session_id.to_string(),
                inputs: describe_inputs(&inputs, &self.schema),
                serial,
            }))
        })
    }

    fn run(
        &self,
        _instance: NodeInstance,
        input: String,
        ctx: RunContext,
    ) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            self.run_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.run_delay {
                tokio::time::sleep(delay).await;
            }
            if self.panic_on_run {
                panic!("stub node panicked during run");
            }
            if let Some(message) = &self.fail_run {
                return Err(ChainflowError::Node(message.clone()));
            }

            let mut bound: Vec<_> = ctx.memory.iter().collect();
            bound.sort_by(|a, b| a.0.cmp(b.0));
            for (memory_node, history) in bound {
                self.probe.record(HistorySighting {
                    session_id: ctx.session_id.to_string(),
                    memory_node: memory_node.clone(),
                    messages: history.messages().await,
                });
            }

            let reply = format!("echo: {input}");
            if let Some(sink) = &ctx.sink {
                for word in reply.split_inclusive(' ') {
                    sink.send_chunk(word).await?;
                }
            }
            Ok(NodeOutput::Text(reply))
        })
    }
}

/// Chat model stub.
pub fn model_node() -> StubNode {
    StubNode::new("stubModel", "Chat Models").capabilities([BASE_CHAT_MODEL, BASE_LANGUAGE_MODEL])
}

/// Stateful conversational memory stub.
pub fn memory_node() -> StubNode {
    StubNode::new("stubMemory", "Memory")
        .capabilities([BASE_MEMORY, BASE_CHAT_MEMORY])
        .stateful()
}

/// Text splitter stub.
pub fn splitter_node() -> StubNode {
    StubNode::new("stubSplitter", "Text Splitters").capabilities([TEXT_SPLITTER])
}

/// Executable chain: required `model`, optional `memory`, optional `prefix` literal.
pub fn chain_node() -> StubNode {
    StubNode::new("stubChain", "Chains")
        .capabilities([BASE_CHAIN])
        .input(InputPort::node("model", [BASE_CHAT_MODEL]))
        .input(InputPort::node("memory", [BASE_CHAT_MEMORY]).optional())
        .input(InputPort::param("prefix", "string").optional())
        .executable()
}

/// A two-message conversation.
pub fn sample_history(tag: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::user(format!("hello from {tag}")),
        ChatMessage::assistant(format!("hi {tag}")),
    ]
}
