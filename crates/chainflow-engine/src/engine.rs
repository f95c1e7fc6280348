use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info};

use chainflow_core::config::EngineConfig;
use chainflow_core::context::ExecutionContext;
use chainflow_core::definition::GraphDefinition;
use chainflow_core::error::{ChainflowError, Result};
use chainflow_core::event::{EngineEvent, EventBus, RunState};
use chainflow_core::stream::{self, StreamReceiver};
use chainflow_core::types::EnvFlags;

use crate::cache::InstanceCache;
use crate::executor::{Executor, RunReport, RunTracker};
use crate::graph::{resolve, ExecutionPlan, Graph, GraphBuilder};
use crate::registry::TypeRegistry;
use crate::request::{EngineRequest, EngineResponse};

/// Entry point for executing graphs. Cheap to clone; clones share the
/// registry, the instance cache and the event bus.
#[derive(Clone)]
pub struct Engine {
    registry: Arc<TypeRegistry>,
    cache: Arc<InstanceCache>,
    events: Arc<EventBus>,
    config: EngineConfig,
}

/// A run in flight. Dropping the handle before the run finishes cancels it.
pub struct RunHandle {
    pub run_id: String,
    stream: Option<StreamReceiver>,
    task: JoinHandle<Result<RunReport>>,
    cancel: CancellationToken,
    guard: Option<DropGuard>,
}

impl RunHandle {
    /// Chunk stream for streaming requests. Ends with a `done` or error frame.
    pub fn take_stream(&mut self) -> Option<StreamReceiver> {
        self.stream.take()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the run. An untaken stream is dropped first, so a streaming
    /// run whose frames nobody reads ends as cancelled instead of blocking.
    /// Dropping the returned future before it resolves cancels the run.
    pub async fn join(mut self) -> Result<RunReport> {
        drop(self.stream.take());
        let joined = (&mut self.task).await;
        if let Some(guard) = self.guard.take() {
            guard.disarm();
        }
        joined.map_err(|e| ChainflowError::Node(format!("run task failed: {e}")))?
    }
}

impl Engine {
    pub fn new(registry: TypeRegistry, config: EngineConfig) -> Self {
        Self {
            registry: Arc::new(registry),
            cache: Arc::new(InstanceCache::new()),
            events: Arc::new(EventBus::default()),
            config,
        }
    }

    /// Publish events on a bus shared with other components.
    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &InstanceCache {
        &self.cache
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Build and resolve a definition without instantiating anything.
    pub fn validate(&self, definition: &GraphDefinition) -> Result<(Graph, ExecutionPlan)> {
        let graph = GraphBuilder::new(&self.registry).build(definition)?;
        let plan = resolve(&graph)?;
        Ok((graph, plan))
    }

    /// Execute a definition in the current task.
    pub async fn execute(
        &self,
        definition: &GraphDefinition,
        input: &str,
        ctx: ExecutionContext,
    ) -> Result<RunReport> {
        let run_id = uuid::Uuid::new_v4().to_string();
        self.execute_run(&run_id, definition, input, ctx).await
    }

    async fn execute_run(
        &self,
        run_id: &str,
        definition: &GraphDefinition,
        input: &str,
        ctx: ExecutionContext,
    ) -> Result<RunReport> {
        let mut tracker = RunTracker::new(run_id, self.events.clone());
        tracker.advance(RunState::Resolving);

        let (graph, plan) = match self.validate(definition) {
            Ok(resolved) => resolved,
            Err(e) => {
                info!(run_id, session_id = %ctx.session_id, error = %e, "Graph rejected");
                tracker.fail(&e);
                return Err(e);
            }
        };

        tracker.advance(RunState::Instantiating);
        let executor = Executor::new(
            self.registry.clone(),
            self.cache.clone(),
            self.config.node_timeout(),
        );
        match executor.execute(&mut tracker, &graph, &plan, input, &ctx).await {
            Ok(report) => {
                tracker.advance(RunState::Completed);
                self.events.publish(EngineEvent::RunCompleted {
                    run_id: run_id.to_string(),
                    elapsed_ms: report.elapsed_ms,
                });
                Ok(report)
            }
            Err(e) => {
                error!(
                    run_id,
                    session_id = %ctx.session_id,
                    kind = e.kind(),
                    node_id = e.node_id().unwrap_or("-"),
                    error = %e,
                    "Run failed"
                );
                tracker.fail(&e);
                Err(e)
            }
        }
    }

    /// Start a request on its own task.
    ///
    /// A panic inside the run is reported as an error and, for streaming
    /// requests, still terminates the stream with an error frame.
    pub fn spawn(&self, request: EngineRequest) -> RunHandle {
        self.spawn_with(request, CancellationToken::new())
    }

    pub fn spawn_with(&self, request: EngineRequest, cancel: CancellationToken) -> RunHandle {
        let run_id = uuid::Uuid::new_v4().to_string();
        let flags = EnvFlags {
            verbose: self.config.verbose || EnvFlags::from_env().verbose,
        };
        let session = request.session();
        let transient = request.transient_session || !request.has_session();
        let mut ctx = ExecutionContext::new(session.clone())
            .with_history(request.history())
            .with_flags(flags)
            .with_cancel(cancel.clone());

        let (sink, receiver) = if request.streaming {
            let (sink, receiver) = stream::channel(self.config.stream_buffer.max(1));
            ctx = ctx.with_sink(sink.clone());
            (Some(sink), Some(receiver.cancel_on_drop(cancel.clone())))
        } else {
            (None, None)
        };

        let engine = self.clone();
        let inner_run_id = run_id.clone();
        let inner = tokio::spawn(async move {
            engine
                .execute_run(&inner_run_id, &request.graph, &request.user_input, ctx)
                .await
        });

        let outer_run_id = run_id.clone();
        let events = self.events.clone();
        let cache = self.cache.clone();
        let task = tokio::spawn(async move {
            let result = match inner.await {
                Ok(result) => result,
                Err(e) => {
                    error!(run_id = %outer_run_id, error = %e, "Run task aborted");
                    let err = ChainflowError::Node(format!("run aborted: {e}"));
                    events.publish(EngineEvent::RunFailed {
                        run_id: outer_run_id.clone(),
                        error_kind: err.kind().to_string(),
                        node_id: None,
                        message: err.to_string(),
                    });
                    Err(err)
                }
            };
            if transient {
                let evicted = cache.evict_session(&session);
                debug!(run_id = %outer_run_id, session_id = %session, evicted, "Dropped transient session instances");
            }
            if let Some(sink) = sink {
                match &result {
                    Ok(_) => sink.finish().await,
                    Err(e) => sink.fail(e).await,
                }
            }
            result
        });

        RunHandle {
            run_id,
            stream: receiver,
            task,
            guard: Some(cancel.clone().drop_guard()),
            cancel,
        }
    }

    /// Run a request to completion and shape the response. The `streaming`
    /// flag is ignored; use [`Engine::spawn`] to consume chunks.
    pub async fn handle(&self, mut request: EngineRequest) -> EngineResponse {
        request.streaming = false;
        let result = self.spawn(request).join().await;
        EngineResponse::from_result(&result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use chainflow_core::stream::{concat_chunks, StreamEvent};
    use chainflow_test_utils::{chain_node, model_node};

    fn engine() -> Engine {
        let mut registry = TypeRegistry::new();
        registry.register(model_node());
        registry.register(chain_node());
        registry.register(chain_node_named("panicky").panic_on_run());
        registry.register(chain_node_named("slow").run_delay(Duration::from_secs(30)));
        Engine::new(registry, EngineConfig::default())
    }

    fn chain_node_named(name: &str) -> chainflow_test_utils::StubNode {
        use chainflow_core::types::InputPort;
        chainflow_test_utils::StubNode::new(name, "Chains")
            .input(InputPort::node("model", ["BaseChatModel"]))
            .executable()
    }

    fn graph(terminal_type: &str) -> GraphDefinition {
        GraphDefinition::new()
            .node("model", "stubModel")
            .node("chain", terminal_type)
            .edge("model", "chain", "model")
    }

    #[tokio::test]
    async fn test_handle_success() {
        let response = engine()
            .handle(EngineRequest::new(graph("stubChain"), "hi").with_session("s1"))
            .await;
        assert_eq!(
            response,
            EngineResponse::Success {
                output: "echo: hi".to_string().into()
            }
        );
    }

    #[tokio::test]
    async fn test_validation_failure_is_structured() {
        let response = engine()
            .handle(EngineRequest::new(graph("missingType"), "hi"))
            .await;
        match response {
            EngineResponse::Failure { error_kind, .. } => assert_eq!(error_kind, "UnknownTypeError"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let engine = engine();
        let response = engine
            .handle(EngineRequest::new(graph("panicky"), "hi"))
            .await;
        match response {
            EngineResponse::Failure { error_kind, .. } => assert_eq!(error_kind, "InternalError"),
            other => panic!("expected failure, got {other:?}"),
        }
        // The engine keeps serving.
        assert!(engine
            .handle(EngineRequest::new(graph("stubChain"), "again"))
            .await
            .is_success());
    }

    #[tokio::test]
    async fn test_streaming_frames() {
        let mut handle = engine().spawn(EngineRequest::new(graph("stubChain"), "one two").streaming());
        let frames = handle.take_stream().unwrap().collect().await;
        let report = handle.join().await.unwrap();

        assert_eq!(frames.last(), Some(&StreamEvent::done()));
        assert_eq!(concat_chunks(&frames), report.output.as_text());
        assert_eq!(concat_chunks(&frames), "echo: one two");
    }

    #[tokio::test]
    async fn test_streaming_panic_ends_with_error_frame() {
        let mut handle = engine().spawn(EngineRequest::new(graph("panicky"), "hi").streaming());
        let frames = handle.take_stream().unwrap().collect().await;
        assert!(matches!(frames.last(), Some(StreamEvent::Error { .. })));
        assert!(handle.join().await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_in_flight_run() {
        let engine = engine();
        let mut events = engine.events().subscribe();
        let handle = engine.spawn(EngineRequest::new(graph("slow"), "hi"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();

        let err = handle.join().await.unwrap_err();
        assert!(matches!(err, ChainflowError::Cancelled));

        let mut last_state = None;
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::RunStateChanged { state, .. } = event {
                last_state = Some(state);
            }
        }
        assert_eq!(last_state, Some(RunState::Cancelled));
    }

    fn slow_start_engine() -> (Engine, Arc<std::sync::atomic::AtomicUsize>) {
        let chain = chain_node().run_delay(Duration::from_millis(200));
        let runs = chain.run_counter();
        let mut registry = TypeRegistry::new();
        registry.register(model_node().init_delay(Duration::from_millis(100)));
        registry.register(chain);
        (Engine::new(registry, EngineConfig::default()), runs)
    }

    #[tokio::test]
    async fn test_dropped_handle_cancels_run() {
        let (engine, runs) = slow_start_engine();
        let handle = engine.spawn(EngineRequest::new(graph("stubChain"), "hi"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(handle);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(engine.cache().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_stream_cancels_run() {
        let (engine, runs) = slow_start_engine();
        let mut handle = engine.spawn(EngineRequest::new(graph("stubChain"), "hi").streaming());
        let stream = handle.take_stream().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(stream);

        let err = handle.join().await.unwrap_err();
        assert!(matches!(err, ChainflowError::Cancelled));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_finished_join_does_not_cancel() {
        let handle = engine().spawn(EngineRequest::new(graph("stubChain"), "hi"));
        let token = handle.cancel_token();
        handle.join().await.unwrap();
        assert!(!token.is_cancelled());
    }
}
