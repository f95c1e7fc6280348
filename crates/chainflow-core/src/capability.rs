//! Capability tag names shared by node types.
//!
//! Edges are typed by plain string-set membership: a target port accepting
//! `BaseRetriever` can be fed by any node whose tags contain that name.

pub const BASE_LANGUAGE_MODEL: &str = "BaseLanguageModel";
pub const BASE_CHAT_MODEL: &str = "BaseChatModel";
pub const BASE_MEMORY: &str = "BaseMemory";
/// Marks nodes whose session history is rebound before every run.
pub const BASE_CHAT_MEMORY: &str = "BaseChatMemory";
pub const BASE_RETRIEVER: &str = "BaseRetriever";
pub const VECTOR_STORE: &str = "VectorStore";
pub const VECTOR_STORE_RETRIEVER: &str = "VectorStoreRetriever";
pub const TEXT_SPLITTER: &str = "TextSplitter";
pub const EMBEDDINGS: &str = "Embeddings";
pub const TOOL: &str = "Tool";
pub const BASE_CHAIN: &str = "BaseChain";
pub const AGENT_EXECUTOR: &str = "AgentExecutor";
