use std::sync::Arc;

use serde_json::json;

use chainflow_core::config::EngineConfig;
use chainflow_core::stream::concat_chunks;
use chainflow_core::traits::HistoryStore;
use chainflow_core::types::{NodeOutput, Role, SessionId};
use chainflow_engine::{Engine, EngineRequest, EngineResponse, GraphDefinition, RawNode, SessionRunner};
use chainflow_memory::SqliteHistoryStore;
use chainflow_nodes::builtin_registry;

fn engine() -> Engine {
    Engine::new(builtin_registry(), EngineConfig::default())
}

fn conversation_graph() -> GraphDefinition {
    GraphDefinition::new()
        .node("model", "echoChatModel")
        .node("memory", "bufferMemory")
        .node("chain", "conversationChain")
        .edge("model", "chain", "model")
        .edge("memory", "chain", "memory")
}

fn qa_graph() -> GraphDefinition {
    GraphDefinition::new()
        .with_node(RawNode::new("embeddings", "hashingEmbeddings").param("dimensions", json!(256)))
        .with_node(
            RawNode::new("splitter", "characterTextSplitter")
                .param("separator", json!("\n"))
                .param("chunkSize", json!(40))
                .param("chunkOverlap", json!(0)),
        )
        .with_node(
            RawNode::new("store", "inMemoryVectorStore")
                .param("text", json!("Paris is the capital of France.\nPenguins live in Antarctica."))
                .param("topK", json!(1)),
        )
        .node("model", "echoChatModel")
        .node("qa", "retrievalQAChain")
        .edge("embeddings", "store", "embeddings")
        .edge("splitter", "store", "textSplitter")
        .edge("store", "qa", "vectorStoreRetriever")
        .edge("model", "qa", "model")
}

#[tokio::test]
async fn conversation_chain_answers_and_tracks_memory() {
    let engine = engine();
    let request = EngineRequest::new(conversation_graph(), "good morning").with_session("s1");

    let report = engine.spawn(request).join().await.unwrap();
    assert_eq!(report.output, NodeOutput::Text("good morning".into()));
    assert_eq!(report.terminal, "chain");

    let memory = &report.memory["memory"];
    assert_eq!(memory.len(), 1);
    assert_eq!(memory[0].role, Role::User);
}

#[tokio::test]
async fn conversation_chain_streams_the_same_text() {
    let engine = engine();
    let input = "tell me something nice";

    let full = match engine
        .handle(EngineRequest::new(conversation_graph(), input))
        .await
    {
        EngineResponse::Success { output } => output.as_text(),
        other => panic!("expected success, got {other:?}"),
    };

    let mut handle = engine.spawn(EngineRequest::new(conversation_graph(), input).streaming());
    let frames = handle.take_stream().unwrap().collect().await;
    handle.join().await.unwrap();
    assert_eq!(concat_chunks(&frames), full);
}

#[tokio::test]
async fn history_persists_across_requests() {
    let store = Arc::new(SqliteHistoryStore::in_memory().unwrap());
    let runner = SessionRunner::new(engine(), store.clone());
    let session = SessionId::from_string("persisted");

    for input in ["first", "second"] {
        let request = EngineRequest::new(conversation_graph(), input).with_session("persisted");
        let (_, response) = runner.handle(request).await;
        assert!(response.is_success());
    }

    let stored = store.load_history(&session, 10).await.unwrap();
    let contents: Vec<&str> = stored.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["first", "first", "second", "second"]);

    // The third request is bound the four stored messages plus its own turn.
    let (_, request) = runner
        .prepare(EngineRequest::new(conversation_graph(), "third").with_session("persisted"))
        .await
        .unwrap();
    let report = runner.engine().spawn(request).join().await.unwrap();
    assert_eq!(report.memory["memory"].len(), 5);
}

#[tokio::test]
async fn retrieval_qa_stuffs_the_closest_chunk() {
    let engine = engine();
    let (_, plan) = engine.validate(&qa_graph()).unwrap();
    assert_eq!(plan.terminal, "qa");

    let response = engine
        .handle(EngineRequest::new(qa_graph(), "Which city is the capital of France?"))
        .await;
    let output = match response {
        EngineResponse::Success { output } => output.as_text(),
        other => panic!("expected success, got {other:?}"),
    };
    // The echo model hands back the prompt it was given.
    assert!(output.contains("Paris is the capital of France."));
    assert!(!output.contains("Penguins"));
    assert!(output.ends_with("Question: Which city is the capital of France?\nHelpful Answer:"));
}

#[tokio::test]
async fn retrieval_qa_reuses_the_index() {
    let engine = engine();
    for _ in 0..2 {
        let report = engine
            .spawn(EngineRequest::new(qa_graph(), "capital of France"))
            .join()
            .await
            .unwrap();
        assert!(report.output.as_text().contains("Paris"));
    }
    let report = engine
        .spawn(EngineRequest::new(qa_graph(), "capital of France"))
        .join()
        .await
        .unwrap();
    assert!(report.nodes.iter().all(|n| n.cached));
}

#[tokio::test]
async fn agent_uses_read_file_then_answers() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("notes.txt"), "buy milk").unwrap();

    let graph = GraphDefinition::new()
        .with_node(RawNode::new("model", "echoChatModel").param(
            "responses",
            json!([
                r#"{"action": "read_file", "action_input": "notes.txt"}"#,
                r#"{"action": "Final Answer", "action_input": "You need to buy milk."}"#
            ]),
        ))
        .with_node(
            RawNode::new("reader", "readFile")
                .param("basePath", json!(dir.path().to_string_lossy())),
        )
        .node("memory", "bufferMemory")
        .node("agent", "conversationalAgent")
        .edge("model", "agent", "model")
        .edge("reader", "agent", "tools")
        .edge("memory", "agent", "memory");

    let mut handle = engine().spawn(EngineRequest::new(graph, "what is on my list?").streaming());
    let frames = handle.take_stream().unwrap().collect().await;
    let report = handle.join().await.unwrap();

    assert_eq!(report.output.as_text(), "You need to buy milk.");
    assert_eq!(concat_chunks(&frames), "You need to buy milk.");
}

#[tokio::test]
async fn agent_requires_memory() {
    let graph = GraphDefinition::new()
        .node("model", "echoChatModel")
        .node("reader", "readFile")
        .node("agent", "conversationalAgent")
        .edge("model", "agent", "model")
        .edge("reader", "agent", "tools");

    let err = engine().validate(&graph).unwrap_err();
    assert_eq!(err.kind(), "GraphValidationError");
}

#[tokio::test]
async fn missing_openai_key_is_an_init_error() {
    std::env::remove_var("OPENAI_API_KEY");
    let graph = GraphDefinition::new()
        .node("model", "chatOpenAI")
        .node("chain", "conversationChain")
        .edge("model", "chain", "model");

    let response = engine().handle(EngineRequest::new(graph, "hi")).await;
    match response {
        EngineResponse::Failure {
            error_kind,
            node_id,
            ..
        } => {
            assert_eq!(error_kind, "InitError");
            assert_eq!(node_id.as_deref(), Some("model"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
}
