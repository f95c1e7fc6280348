use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chainflow_core::context::{ExecutionContext, InitContext, RunContext};
use chainflow_core::error::{ChainflowError, Result};
use chainflow_core::event::{EngineEvent, EventBus, RunState};
use chainflow_core::instance::{NodeInstance, ResolvedInputs, ResolvedValue};
use chainflow_core::types::{ChatMessage, NodeOutput, SessionId};

use crate::cache::{fingerprint, CacheKey, InstanceCache};
use crate::graph::{ExecutionPlan, Graph, NodeDefinition};
use crate::memory::MemoryBinder;
use crate::registry::TypeRegistry;

/// Timing of one node's instantiation.
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub node_id: String,
    /// Served from the instance cache.
    pub cached: bool,
    pub elapsed_ms: u64,
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub session_id: SessionId,
    pub terminal: String,
    pub output: NodeOutput,
    pub nodes: Vec<NodeReport>,
    /// Each bound memory node's history after the run.
    pub memory: BTreeMap<String, Vec<ChatMessage>>,
    pub elapsed_ms: u64,
}

/// Tracks a run through its state machine and publishes every transition.
pub struct RunTracker {
    run_id: String,
    state: RunState,
    events: Arc<EventBus>,
}

impl RunTracker {
    pub fn new(run_id: impl Into<String>, events: Arc<EventBus>) -> Self {
        let run_id = run_id.into();
        events.publish(EngineEvent::RunStateChanged {
            run_id: run_id.clone(),
            state: RunState::Pending,
        });
        Self {
            run_id,
            state: RunState::Pending,
            events,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn advance(&mut self, next: RunState) {
        if !self.state.can_transition_to(next) {
            warn!(run_id = %self.run_id, from = ?self.state, to = ?next, "Ignoring illegal run state transition");
            return;
        }
        debug!(run_id = %self.run_id, from = ?self.state, to = ?next, "Run state changed");
        self.state = next;
        self.events.publish(EngineEvent::RunStateChanged {
            run_id: self.run_id.clone(),
            state: next,
        });
    }

    /// Move to `Cancelled` or `Failed` and publish the failure.
    pub fn fail(&mut self, err: &ChainflowError) {
        let next = match err {
            ChainflowError::Cancelled if self.state.can_transition_to(RunState::Cancelled) => {
                RunState::Cancelled
            }
            _ => RunState::Failed,
        };
        self.advance(next);
        self.events.publish(EngineEvent::RunFailed {
            run_id: self.run_id.clone(),
            error_kind: err.kind().to_string(),
            node_id: err.node_id().map(String::from),
            message: err.to_string(),
        });
    }
}

enum Interrupted {
    Cancelled,
    TimedOut(Duration),
}

/// Drive `fut` to completion unless cancelled or past `timeout`.
async fn supervise<T>(
    timeout: Option<Duration>,
    cancel: &CancellationToken,
    fut: impl Future<Output = T>,
) -> std::result::Result<T, Interrupted> {
    let bounded = async move {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| Interrupted::TimedOut(limit)),
            None => Ok(fut.await),
        }
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Interrupted::Cancelled),
        result = bounded => result,
    }
}

/// Attribute a failure to `node_id` unless it already carries a node or is a cancellation.
fn attribute(
    node_id: &str,
    err: ChainflowError,
    wrap: fn(&str, ChainflowError) -> ChainflowError,
) -> ChainflowError {
    match err {
        ChainflowError::Cancelled | ChainflowError::Init { .. } | ChainflowError::Run { .. } => err,
        other => wrap(node_id, other),
    }
}

/// Instantiates a resolved graph through the cache, binds memory, and runs
/// the terminal node.
pub struct Executor {
    registry: Arc<TypeRegistry>,
    cache: Arc<InstanceCache>,
    node_timeout: Option<Duration>,
}

impl Executor {
    pub fn new(
        registry: Arc<TypeRegistry>,
        cache: Arc<InstanceCache>,
        node_timeout: Option<Duration>,
    ) -> Self {
        Self {
            registry,
            cache,
            node_timeout,
        }
    }

    /// Execute `plan` for one request. The tracker must be in `Instantiating`.
    pub async fn execute(
        &self,
        tracker: &mut RunTracker,
        graph: &Graph,
        plan: &ExecutionPlan,
        input: &str,
        ctx: &ExecutionContext,
    ) -> Result<RunReport> {
        let started = Instant::now();
        let mut produced: HashMap<String, NodeInstance> = HashMap::with_capacity(plan.order.len());
        let mut fingerprints: HashMap<&str, String> = HashMap::with_capacity(plan.order.len());
        let mut session_scoped: HashSet<&str> = HashSet::new();
        let mut reports = Vec::with_capacity(plan.order.len());

        for node_id in &plan.order {
            if ctx.cancel.is_cancelled() {
                return Err(ChainflowError::Cancelled);
            }
            let node = graph.node(node_id).ok_or_else(|| {
                ChainflowError::init(node_id, "node missing from resolved graph")
            })?;

            let inputs = gather_inputs(graph, node, &produced)?;
            let upstream: Vec<(String, String)> = graph
                .incoming(node_id)
                .map(|e| {
                    let fp = fingerprints.get(e.source.as_str()).cloned().unwrap_or_default();
                    (e.target_port.clone(), fp)
                })
                .collect();
            let fp = fingerprint(node, &upstream);

            // Anything built on a per-session instance is itself per-session.
            let scoped = node.schema.stateful
                || graph
                    .incoming(node_id)
                    .any(|e| session_scoped.contains(e.source.as_str()));
            let key = if scoped {
                session_scoped.insert(node_id.as_str());
                CacheKey::per_session(node_id.as_str(), fp.clone(), ctx.session_id.clone())
            } else {
                CacheKey::shared(node_id.as_str(), fp.clone())
            };

            let node_started = Instant::now();
            let (instance, created) = self.instantiate(node, inputs, key, ctx).await?;
            let elapsed_ms = node_started.elapsed().as_millis() as u64;
            debug!(
                run_id = %tracker.run_id(),
                node = %node_id,
                node_type = %node.type_name(),
                cached = !created,
                elapsed_ms,
                "Node ready"
            );
            tracker.events().publish(EngineEvent::NodeInstantiated {
                run_id: tracker.run_id().to_string(),
                node_id: node_id.clone(),
                cached: !created,
                elapsed_ms,
            });
            reports.push(NodeReport {
                node_id: node_id.clone(),
                cached: !created,
                elapsed_ms,
            });
            fingerprints.insert(node_id.as_str(), fp);
            produced.insert(node_id.clone(), instance);
        }

        let bindings = MemoryBinder::bind(graph, &plan.order, &ctx.history);
        for (node_id, history) in bindings.iter() {
            tracker.events().publish(EngineEvent::MemoryBound {
                run_id: tracker.run_id().to_string(),
                node_id: node_id.clone(),
                messages: history.len().await,
            });
        }

        if ctx.cancel.is_cancelled() {
            return Err(ChainflowError::Cancelled);
        }
        tracker.advance(RunState::Executing);

        let terminal = graph.node(&plan.terminal).ok_or_else(|| {
            ChainflowError::run(&plan.terminal, "terminal node missing from resolved graph")
        })?;
        let instance = produced.remove(&plan.terminal).ok_or_else(|| {
            ChainflowError::run(&plan.terminal, "terminal node was not instantiated")
        })?;
        let factory = self.registry.lookup(terminal.type_name())?.factory.clone();
        let run_ctx = RunContext {
            node_id: terminal.id.clone(),
            session_id: ctx.session_id.clone(),
            memory: bindings.clone(),
            sink: ctx.sink.clone(),
            flags: ctx.flags,
            cancel: ctx.cancel.clone(),
        };

        let output = match supervise(
            self.node_timeout,
            &ctx.cancel,
            factory.run(instance, input.to_string(), run_ctx),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => return Err(attribute(&terminal.id, err, |id, e| ChainflowError::run(id, e))),
            Err(Interrupted::Cancelled) => return Err(ChainflowError::Cancelled),
            Err(Interrupted::TimedOut(limit)) => {
                return Err(ChainflowError::run(
                    &terminal.id,
                    format!("timed out after {}s", limit.as_secs()),
                ))
            }
        };

        MemoryBinder::commit_user_turn(&bindings, input).await;
        let mut memory = BTreeMap::new();
        for (node_id, history) in bindings.iter() {
            memory.insert(node_id.clone(), history.messages().await);
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            run_id = %tracker.run_id(),
            session = %ctx.session_id,
            terminal = %terminal.id,
            nodes = reports.len(),
            elapsed_ms,
            "Run finished"
        );
        Ok(RunReport {
            run_id: tracker.run_id().to_string(),
            session_id: ctx.session_id.clone(),
            terminal: terminal.id.clone(),
            output,
            nodes: reports,
            memory,
            elapsed_ms,
        })
    }

    async fn instantiate(
        &self,
        node: &NodeDefinition,
        inputs: ResolvedInputs,
        key: CacheKey,
        ctx: &ExecutionContext,
    ) -> Result<(NodeInstance, bool)> {
        let factory = self.registry.lookup(node.type_name())?.factory.clone();
        let init_ctx = InitContext {
            node_id: node.id.clone(),
            session_id: ctx.session_id.clone(),
            output: node.selected_output.clone(),
            flags: ctx.flags,
        };
        let construct = || factory.init(inputs, init_ctx);

        match supervise(
            self.node_timeout,
            &ctx.cancel,
            self.cache.get_or_create(key, construct),
        )
        .await
        {
            Ok(Ok(pair)) => Ok(pair),
            Ok(Err(err)) => Err(attribute(&node.id, err, |id, e| ChainflowError::init(id, e))),
            Err(Interrupted::Cancelled) => Err(ChainflowError::Cancelled),
            Err(Interrupted::TimedOut(limit)) => Err(ChainflowError::init(
                &node.id,
                format!("timed out after {}s", limit.as_secs()),
            )),
        }
    }
}

/// Values for each declared input port of `node`: connected instances
/// (a list for list ports), else the literal, else the port default.
fn gather_inputs(
    graph: &Graph,
    node: &NodeDefinition,
    produced: &HashMap<String, NodeInstance>,
) -> Result<ResolvedInputs> {
    let mut inputs = ResolvedInputs::new();
    for port in &node.schema.inputs {
        let mut connected = Vec::new();
        for edge in graph.incoming_on(&node.id, &port.name) {
            let instance = produced.get(&edge.source).cloned().ok_or_else(|| {
                ChainflowError::init(
                    &node.id,
                    format!("upstream node '{}' was not instantiated", edge.source),
                )
            })?;
            connected.push(ResolvedValue::Node {
                node_id: edge.source.clone(),
                instance,
            });
        }

        if port.list && !connected.is_empty() {
            inputs.insert(&port.name, ResolvedValue::List(connected));
        } else if let Some(value) = connected.pop() {
            inputs.insert(&port.name, value);
        } else if let Some(literal) = node.params.get(&port.name).or(port.default.as_ref()) {
            inputs.insert(&port.name, ResolvedValue::Literal(literal.clone()));
        }
    }
    Ok(inputs)
}
