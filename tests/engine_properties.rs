use std::sync::atomic::Ordering;
use std::time::Duration;

use chainflow_core::config::EngineConfig;
use chainflow_core::context::ExecutionContext;
use chainflow_core::error::ChainflowError;
use chainflow_core::stream::concat_chunks;
use chainflow_core::types::{ChatMessage, InputPort, NodeOutput, Role, SessionId};
use chainflow_engine::{Engine, EngineRequest, EngineResponse, GraphDefinition, TypeRegistry};
use chainflow_test_utils::{
    chain_node, memory_node, model_node, sample_history, splitter_node, StubNode,
};

fn chat_graph() -> GraphDefinition {
    GraphDefinition::new()
        .node("model", "stubModel")
        .node("memory", "stubMemory")
        .node("chain", "stubChain")
        .edge("model", "chain", "model")
        .edge("memory", "chain", "memory")
}

fn contents(messages: &[ChatMessage]) -> Vec<(Role, String)> {
    messages.iter().map(|m| (m.role, m.content.clone())).collect()
}

fn engine_with(nodes: Vec<StubNode>) -> Engine {
    let mut registry = TypeRegistry::new();
    for node in nodes {
        registry.register(node);
    }
    Engine::new(registry, EngineConfig::default())
}

#[tokio::test]
async fn every_edge_runs_source_before_target() {
    let engine = engine_with(vec![model_node(), memory_node(), chain_node()]);
    // Declared consumer-first to make sure order comes from the edges.
    let graph = GraphDefinition::new()
        .node("chain", "stubChain")
        .node("memory", "stubMemory")
        .node("model", "stubModel")
        .edge("model", "chain", "model")
        .edge("memory", "chain", "memory");

    let (_, plan) = engine.validate(&graph).unwrap();
    let pos = |id: &str| plan.order.iter().position(|n| n == id).unwrap();
    for edge in &graph.edges {
        assert!(pos(&edge.source) < pos(&edge.target), "{} before {}", edge.source, edge.target);
    }
    assert_eq!(plan.terminal, "chain");

    // Unchanged graph, unchanged order.
    let (_, again) = engine.validate(&graph).unwrap();
    assert_eq!(plan.order, again.order);
}

#[tokio::test]
async fn two_node_cycle_is_rejected_before_instantiation() {
    let looping = StubNode::new("loop", "Chains")
        .capabilities(["Loop"])
        .input(InputPort::node("prev", ["Loop"]))
        .executable();
    let inits = looping.init_counter();
    let engine = engine_with(vec![looping]);
    let graph = GraphDefinition::new()
        .node("A", "loop")
        .node("B", "loop")
        .edge("A", "B", "prev")
        .edge("B", "A", "prev");

    let err = engine
        .execute(&graph, "x", ExecutionContext::new(SessionId::new()))
        .await
        .unwrap_err();
    match err {
        ChainflowError::Cycle { cycle } => {
            assert!(cycle.contains(&"A".to_string()));
            assert!(cycle.contains(&"B".to_string()));
        }
        other => panic!("expected cycle, got {other:?}"),
    }
    assert_eq!(inits.load(Ordering::SeqCst), 0);
    assert!(engine.cache().is_empty());
}

#[tokio::test]
async fn retriever_port_rejects_text_splitter() {
    let qa = StubNode::new("stubQa", "Chains")
        .capabilities(["BaseChain"])
        .input(InputPort::node("retriever", ["Retriever"]))
        .executable();
    let qa_inits = qa.init_counter();
    let splitter = splitter_node();
    let splitter_inits = splitter.init_counter();
    let engine = engine_with(vec![qa, splitter]);
    let graph = GraphDefinition::new()
        .node("splitter", "stubSplitter")
        .node("qa", "stubQa")
        .edge("splitter", "qa", "retriever");

    let response = engine.handle(EngineRequest::new(graph, "q")).await;
    match response {
        EngineResponse::Failure { error_kind, .. } => assert_eq!(error_kind, "TypeMismatchError"),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(qa_inits.load(Ordering::SeqCst), 0);
    assert_eq!(splitter_inits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn repeated_runs_reuse_stateless_instances_but_rebind_history() {
    let model = model_node();
    let model_inits = model.init_counter();
    let chain = chain_node();
    let probe = chain.probe();
    let engine = engine_with(vec![model, memory_node(), chain]);

    let first = EngineRequest::new(chat_graph(), "one")
        .with_session("s1")
        .with_history(sample_history("first"));
    let second = EngineRequest::new(chat_graph(), "two")
        .with_session("s1")
        .with_history(vec![ChatMessage::user("only one")]);

    assert!(engine.handle(first).await.is_success());
    assert!(engine.handle(second).await.is_success());
    assert_eq!(model_inits.load(Ordering::SeqCst), 1);

    let seen = probe.sightings();
    assert_eq!(seen.len(), 2);
    assert_eq!(contents(&seen[0].messages), contents(&sample_history("first")));
    assert_eq!(seen[1].messages.len(), 1);
    assert_eq!(seen[1].messages[0].content, "only one");
}

#[tokio::test]
async fn bound_history_grows_by_the_user_turn() {
    let chain = chain_node();
    let probe = chain.probe();
    let engine = engine_with(vec![model_node(), memory_node(), chain]);
    let request = EngineRequest::new(chat_graph(), "bye")
        .with_session("s1")
        .with_history(vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")]);

    let report = engine.spawn(request).join().await.unwrap();

    // Before run: the prior history as supplied.
    let seen = probe.sightings();
    assert_eq!(seen[0].messages.len(), 2);

    // After run: the new user turn is appended.
    let after = &report.memory["memory"];
    assert_eq!(after.len(), 3);
    assert_eq!(after[2].role, Role::User);
    assert_eq!(after[2].content, "bye");
}

#[tokio::test]
async fn streamed_chunks_concatenate_to_full_output() {
    let engine = engine_with(vec![model_node(), memory_node(), chain_node()]);
    let input = "the quick brown fox";

    let full = match engine
        .handle(EngineRequest::new(chat_graph(), input).with_session("s1"))
        .await
    {
        EngineResponse::Success { output } => output,
        other => panic!("expected success, got {other:?}"),
    };

    let mut handle = engine.spawn(EngineRequest::new(chat_graph(), input).with_session("s1").streaming());
    let frames = handle.take_stream().unwrap().collect().await;
    handle.join().await.unwrap();

    assert_eq!(NodeOutput::Text(concat_chunks(&frames)), full);
    assert!(frames.last().unwrap().is_terminal());
}

#[tokio::test]
async fn init_failure_stops_later_nodes_and_names_the_node() {
    let model = model_node().fail_init("no credentials");
    let memory = memory_node();
    let memory_inits = memory.init_counter();
    let chain = chain_node();
    let chain_inits = chain.init_counter();
    let engine = engine_with(vec![model, memory, chain]);

    let (_, plan) = engine.validate(&chat_graph()).unwrap();
    assert_eq!(plan.order[0], "model");

    let response = engine.handle(EngineRequest::new(chat_graph(), "x")).await;
    match response {
        EngineResponse::Failure {
            error_kind,
            node_id,
            message,
        } => {
            assert_eq!(error_kind, "InitError");
            assert_eq!(node_id.as_deref(), Some("model"));
            assert!(message.contains("no credentials"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(memory_inits.load(Ordering::SeqCst), 0);
    assert_eq!(chain_inits.load(Ordering::SeqCst), 0);
    assert!(engine.cache().is_empty());
}

#[tokio::test]
async fn sessions_never_see_each_others_history() {
    let chain = chain_node();
    let probe = chain.probe();
    let engine = engine_with(vec![model_node(), memory_node(), chain]);

    let a = engine.spawn(
        EngineRequest::new(chat_graph(), "from a")
            .with_session("a")
            .with_history(sample_history("a")),
    );
    let b = engine.spawn(
        EngineRequest::new(chat_graph(), "from b")
            .with_session("b")
            .with_history(sample_history("b")),
    );
    let (a, b) = tokio::join!(a.join(), b.join());
    let (a, b) = (a.unwrap(), b.unwrap());

    for sighting in probe.sightings() {
        let tag = sighting.session_id.as_str();
        assert_eq!(contents(&sighting.messages), contents(&sample_history(tag)));
    }
    assert!(a.memory["memory"].iter().all(|m| !m.content.contains(" b")));
    assert!(b.memory["memory"].iter().all(|m| !m.content.contains(" a")));
}

#[tokio::test]
async fn concurrent_runs_share_one_model_construction() {
    let model = model_node().init_delay(Duration::from_millis(50));
    let model_inits = model.init_counter();
    let engine = engine_with(vec![model, memory_node(), chain_node()]);

    let runs: Vec<_> = (0..4)
        .map(|i| engine.spawn(EngineRequest::new(chat_graph(), "x").with_session(format!("s{i}"))))
        .collect();
    for run in runs {
        run.join().await.unwrap();
    }
    assert_eq!(model_inits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn run_failure_reports_terminal_and_keeps_process_alive() {
    let engine = engine_with(vec![model_node(), memory_node(), chain_node().fail_run("quota exceeded")]);

    for _ in 0..2 {
        let response = engine.handle(EngineRequest::new(chat_graph(), "x")).await;
        match response {
            EngineResponse::Failure {
                error_kind,
                node_id,
                ..
            } => {
                assert_eq!(error_kind, "RunError");
                assert_eq!(node_id.as_deref(), Some("chain"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn sessionless_requests_do_not_grow_the_cache() {
    let engine = engine_with(vec![model_node(), memory_node(), chain_node()]);
    for _ in 0..100 {
        assert!(engine.handle(EngineRequest::new(chat_graph(), "x")).await.is_success());
    }
    // Only the shared model survives; per-session memory and chain are dropped.
    assert_eq!(engine.cache().len(), 1);
}

#[tokio::test]
async fn editing_a_node_replaces_its_cached_instance() {
    let engine = engine_with(vec![model_node(), memory_node(), chain_node()]);
    let edited = || {
        let mut graph = chat_graph();
        graph.nodes[2] = graph.nodes[2].clone().param("prefix", serde_json::json!("A: "));
        graph
    };

    engine.handle(EngineRequest::new(chat_graph(), "x").with_session("s1")).await;
    assert_eq!(engine.cache().len(), 3);
    engine.handle(EngineRequest::new(edited(), "x").with_session("s1")).await;
    // The chain was rebuilt and its old instance dropped.
    assert_eq!(engine.cache().len(), 3);
}
