pub mod chains;
pub mod embeddings;
pub mod memory;
pub mod models;
pub mod splitter;
pub mod streaming;
pub mod tools;
pub mod vectorstore;

use chainflow_engine::TypeRegistry;

/// Register every built-in node type.
pub fn register_builtins(registry: &mut TypeRegistry) {
    registry.register(memory::BufferMemoryNode);
    registry.register(memory::BufferWindowMemoryNode);
    registry.register(splitter::CharacterTextSplitterNode);
    registry.register(embeddings::HashingEmbeddingsNode);
    registry.register(vectorstore::InMemoryVectorStoreNode);
    registry.register(vectorstore::VectorStoreRetrieverNode);
    registry.register(models::EchoChatModelNode);
    registry.register(models::ChatOpenAiNode);
    registry.register(models::ChatLocalAiNode);
    registry.register(tools::ReadFileNode);
    registry.register(tools::RequestsGetNode);
    registry.register(chains::ConversationChainNode);
    registry.register(chains::RetrievalQaChainNode);
    registry.register(chains::ConversationalAgentNode);
}

/// A registry holding only the built-in node types.
pub fn builtin_registry() -> TypeRegistry {
    let mut registry = TypeRegistry::new();
    register_builtins(&mut registry);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let registry = builtin_registry();
        assert_eq!(registry.len(), 14);
        for name in ["bufferMemory", "inMemoryVectorStore", "conversationalAgent", "chatLocalAI"] {
            assert!(registry.contains(name), "missing {name}");
        }
        let executable: Vec<&str> = registry
            .schemas()
            .into_iter()
            .filter(|s| s.executable)
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(
            executable,
            vec!["conversationChain", "conversationalAgent", "retrievalQAChain"]
        );
    }
}
