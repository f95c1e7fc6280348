use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::debug;

use chainflow_core::capability::{
    BASE_RETRIEVER, EMBEDDINGS, TEXT_SPLITTER, VECTOR_STORE, VECTOR_STORE_RETRIEVER,
};
use chainflow_core::context::InitContext;
use chainflow_core::error::Result;
use chainflow_core::instance::{NodeInstance, ResolvedInputs};
use chainflow_core::traits::{Embeddings, NodeType, Retriever, TextSplitter, VectorStore};
use chainflow_core::types::{Document, InputPort, NodeSchema, OutputPort};

use crate::embeddings::cosine_similarity;

/// Brute-force cosine-similarity store held in memory.
pub struct InMemoryVectorStore {
    embeddings: Arc<dyn Embeddings>,
    entries: RwLock<Vec<(Document, Vec<f32>)>>,
    top_k: usize,
}

impl InMemoryVectorStore {
    pub fn new(embeddings: Arc<dyn Embeddings>, top_k: usize) -> Self {
        Self {
            embeddings,
            entries: RwLock::new(Vec::new()),
            top_k: top_k.max(1),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl VectorStore for InMemoryVectorStore {
    fn add_documents(&self, docs: Vec<Document>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let texts: Vec<String> = docs.iter().map(|d| d.page_content.clone()).collect();
            let vectors = self.embeddings.embed_documents(&texts).await?;
            let mut entries = self.entries.write().await;
            entries.extend(docs.into_iter().zip(vectors));
            Ok(())
        })
    }

    fn similarity_search(&self, query: &str, k: usize) -> BoxFuture<'_, Result<Vec<Document>>> {
        let query = query.to_string();
        Box::pin(async move {
            let target = self.embeddings.embed_query(&query).await?;
            let entries = self.entries.read().await;
            let mut scored: Vec<(f32, &Document)> = entries
                .iter()
                .map(|(doc, vector)| (cosine_similarity(&target, vector), doc))
                .collect();
            scored.sort_by(|a, b| b.0.total_cmp(&a.0));
            Ok(scored.into_iter().take(k).map(|(_, d)| d.clone()).collect())
        })
    }

    fn top_k(&self) -> usize {
        self.top_k
    }
}

/// Retriever over a vector store, returning the store's `top_k` matches.
pub struct StoreRetriever {
    pub name: String,
    pub description: String,
    store: Arc<dyn VectorStore>,
}

impl StoreRetriever {
    pub fn new(store: Arc<dyn VectorStore>) -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            store,
        }
    }

    pub fn named(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.name = name.into();
        self.description = description.into();
        self
    }
}

impl Retriever for StoreRetriever {
    fn retrieve(&self, query: &str) -> BoxFuture<'_, Result<Vec<Document>>> {
        let query = query.to_string();
        Box::pin(async move {
            let k = self.store.top_k();
            self.store.similarity_search(&query, k).await
        })
    }
}

pub struct InMemoryVectorStoreNode;

impl NodeType for InMemoryVectorStoreNode {
    fn schema(&self) -> NodeSchema {
        NodeSchema::new("inMemoryVectorStore", "Vector Stores")
            .label("In-Memory Vector Store")
            .description("Indexes a text corpus in memory and searches it by similarity")
            .capabilities(["InMemoryVectorStore", VECTOR_STORE])
            .input(InputPort::node("embeddings", [EMBEDDINGS]))
            .input(InputPort::node("textSplitter", [TEXT_SPLITTER]).optional())
            .input(InputPort::param("text", "string").with_label("Text").optional())
            .input(
                InputPort::param("topK", "number")
                    .with_label("Top K")
                    .with_default(json!(4)),
            )
            .output(OutputPort::new(
                "retriever",
                ["InMemoryVectorStoreRetriever", VECTOR_STORE_RETRIEVER, BASE_RETRIEVER],
            ))
            .output(OutputPort::new("vectorStore", ["InMemoryVectorStore", VECTOR_STORE]))
    }

    fn init(&self, inputs: ResolvedInputs, ctx: InitContext) -> BoxFuture<'_, Result<NodeInstance>> {
        Box::pin(async move {
            let embeddings: Arc<dyn Embeddings> = inputs.require_node("embeddings")?;
            let top_k = inputs.usize("topK").unwrap_or(4);
            let store = Arc::new(InMemoryVectorStore::new(embeddings, top_k));

            if let Some(text) = inputs.str("text") {
                let source = Document::new(text);
                let docs = match inputs.node::<Arc<dyn TextSplitter>>("textSplitter") {
                    Some(splitter) => splitter.split_documents(&[source]),
                    None => vec![source],
                };
                let docs: Vec<Document> = docs
                    .into_iter()
                    .enumerate()
                    .map(|(i, mut doc)| {
                        doc.metadata.insert("source".into(), json!(ctx.node_id));
                        doc.metadata.insert("chunk".into(), json!(i));
                        doc
                    })
                    .collect();
                debug!(node_id = %ctx.node_id, documents = docs.len(), "Indexing documents");
                store.add_documents(docs).await?;
            }

            match ctx.output.as_deref() {
                Some("vectorStore") => {
                    let store: Arc<dyn VectorStore> = store;
                    Ok(NodeInstance::new(store))
                }
                _ => {
                    let retriever: Arc<dyn Retriever> = Arc::new(StoreRetriever::new(store));
                    Ok(NodeInstance::new(retriever))
                }
            }
        })
    }
}

pub struct VectorStoreRetrieverNode;

impl NodeType for VectorStoreRetrieverNode {
    fn schema(&self) -> NodeSchema {
        NodeSchema::new("vectorStoreRetriever", "Retrievers")
            .label("Vector Store Retriever")
            .description("Exposes a vector store as a named retriever")
            .capabilities([VECTOR_STORE_RETRIEVER, BASE_RETRIEVER])
            .input(InputPort::node("vectorStore", [VECTOR_STORE]))
            .input(InputPort::param("name", "string").with_label("Retriever Name").optional())
            .input(
                InputPort::param("description", "string")
                    .with_label("Retriever Description")
                    .optional(),
            )
    }

    fn init(&self, inputs: ResolvedInputs, _ctx: InitContext) -> BoxFuture<'_, Result<NodeInstance>> {
        Box::pin(async move {
            let store: Arc<dyn VectorStore> = inputs.require_node("vectorStore")?;
            let retriever: Arc<dyn Retriever> = Arc::new(StoreRetriever::new(store).named(
                inputs.str("name").unwrap_or_default(),
                inputs.str("description").unwrap_or_default(),
            ));
            Ok(NodeInstance::new(retriever))
        })
    }
}
