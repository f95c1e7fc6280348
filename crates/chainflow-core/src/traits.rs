use futures::future::BoxFuture;

use crate::context::{InitContext, RunContext};
use crate::error::{ChainflowError, Result};
use crate::instance::{NodeInstance, ResolvedInputs};
use crate::stream::StreamSink;
use crate::types::{ChatMessage, Document, NodeOutput, NodeSchema, SessionId};

/// Node type: factory plus static schema, registered once at startup.
pub trait NodeType: Send + Sync + 'static {
    /// Ports, capability tags, and behaviour flags.
    fn schema(&self) -> NodeSchema;

    /// Construct an instance from resolved upstream values and literals.
    fn init(
        &self,
        inputs: ResolvedInputs,
        ctx: InitContext,
    ) -> BoxFuture<'_, Result<NodeInstance>>;

    /// Produce the caller-visible output. Only executable types override this.
    fn run(
        &self,
        instance: NodeInstance,
        input: String,
        ctx: RunContext,
    ) -> BoxFuture<'_, Result<NodeOutput>> {
        let _ = (instance, input);
        Box::pin(async move {
            Err(ChainflowError::Node(format!(
                "node type behind '{}' is not executable",
                ctx.node_id
            )))
        })
    }
}

/// Chat model: turns a message list into a reply.
pub trait ChatModel: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Generate a reply. With a sink, the reply is also emitted as chunks
    /// whose concatenation equals the returned text.
    fn generate(
        &self,
        messages: Vec<ChatMessage>,
        sink: Option<StreamSink>,
    ) -> BoxFuture<'_, Result<String>>;
}

/// Conversational memory: configuration only; the history itself is bound
/// per run and looked up by `node_id` in the run context.
pub trait ConversationalMemory: Send + Sync + 'static {
    fn node_id(&self) -> &str;

    fn memory_key(&self) -> &str;

    /// How many recent messages a consumer should render (`None` = all).
    fn window(&self) -> Option<usize> {
        None
    }
}

/// Retriever: fetch documents relevant to a query.
pub trait Retriever: Send + Sync + 'static {
    fn retrieve(&self, query: &str) -> BoxFuture<'_, Result<Vec<Document>>>;
}

/// Vector store: similarity search over embedded documents.
pub trait VectorStore: Send + Sync + 'static {
    fn add_documents(&self, docs: Vec<Document>) -> BoxFuture<'_, Result<()>>;

    fn similarity_search(&self, query: &str, k: usize) -> BoxFuture<'_, Result<Vec<Document>>>;

    /// Default result count when used as a retriever.
    fn top_k(&self) -> usize {
        4
    }
}

/// Text splitter: chunk text for indexing.
pub trait TextSplitter: Send + Sync + 'static {
    fn split_text(&self, text: &str) -> Vec<String>;

    fn split_documents(&self, docs: &[Document]) -> Vec<Document> {
        docs.iter()
            .flat_map(|doc| {
                self.split_text(&doc.page_content)
                    .into_iter()
                    .map(|chunk| Document {
                        page_content: chunk,
                        metadata: doc.metadata.clone(),
                    })
            })
            .collect()
    }
}

/// Embeddings: text to vectors.
pub trait Embeddings: Send + Sync + 'static {
    fn embed_documents(&self, texts: &[String]) -> BoxFuture<'_, Result<Vec<Vec<f32>>>>;

    fn embed_query(&self, text: &str) -> BoxFuture<'_, Result<Vec<f32>>>;
}

/// Tool an agent may call.
pub trait AgentTool: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn call(&self, input: String) -> BoxFuture<'_, Result<String>>;
}

/// History store: persists chat history between requests.
pub trait HistoryStore: Send + Sync + 'static {
    fn append_messages(&self, sid: &SessionId, msgs: &[ChatMessage]) -> BoxFuture<'_, Result<()>>;

    /// Load the most recent `limit` messages, oldest first.
    fn load_history(&self, sid: &SessionId, limit: usize) -> BoxFuture<'_, Result<Vec<ChatMessage>>>;

    fn clear(&self, sid: &SessionId) -> BoxFuture<'_, Result<()>>;
}
