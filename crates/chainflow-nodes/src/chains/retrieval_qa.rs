use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, info};

use chainflow_core::capability::{BASE_CHAIN, BASE_LANGUAGE_MODEL, BASE_RETRIEVER};
use chainflow_core::context::{InitContext, RunContext};
use chainflow_core::error::Result;
use chainflow_core::instance::{NodeInstance, ResolvedInputs};
use chainflow_core::traits::{ChatModel, NodeType, Retriever};
use chainflow_core::types::{ChatMessage, Document, InputPort, NodeOutput, NodeSchema};

use super::chain_instance;

const QA_PROMPT: &str = "Use the following pieces of context to answer the question at the end. \
If you don't know the answer, just say that you don't know, don't try to make up an answer.";

/// Answers a question from documents fetched by a retriever ("stuff" strategy).
pub struct RetrievalQaChain {
    model: Arc<dyn ChatModel>,
    retriever: Arc<dyn Retriever>,
}

impl RetrievalQaChain {
    pub fn new(model: Arc<dyn ChatModel>, retriever: Arc<dyn Retriever>) -> Self {
        Self { model, retriever }
    }

    pub fn prompt(question: &str, docs: &[Document]) -> String {
        let context = docs
            .iter()
            .map(|d| d.page_content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        format!("{QA_PROMPT}\n\n{context}\n\nQuestion: {question}\nHelpful Answer:")
    }

    pub async fn call(&self, question: &str, ctx: &RunContext) -> Result<String> {
        let docs = self.retriever.retrieve(question).await?;
        debug!(node_id = %ctx.node_id, documents = docs.len(), "Retrieved context");
        let prompt = Self::prompt(question, &docs);
        if ctx.flags.verbose {
            info!(node_id = %ctx.node_id, prompt = %prompt, "Retrieval QA prompt");
        }
        self.model
            .generate(vec![ChatMessage::user(prompt)], ctx.sink.clone())
            .await
    }
}

pub struct RetrievalQaChainNode;

impl NodeType for RetrievalQaChainNode {
    fn schema(&self) -> NodeSchema {
        NodeSchema::new("retrievalQAChain", "Chains")
            .label("Retrieval QA Chain")
            .description("Answer questions from retrieved documents")
            .capabilities(["RetrievalQAChain", BASE_CHAIN])
            .input(InputPort::node("model", [BASE_LANGUAGE_MODEL]).with_label("Language Model"))
            .input(
                InputPort::node("vectorStoreRetriever", [BASE_RETRIEVER])
                    .with_label("Vector Store Retriever"),
            )
            .executable()
    }

    fn init(&self, inputs: ResolvedInputs, _ctx: InitContext) -> BoxFuture<'_, Result<NodeInstance>> {
        Box::pin(async move {
            let model: Arc<dyn ChatModel> = inputs.require_node("model")?;
            let retriever: Arc<dyn Retriever> = inputs.require_node("vectorStoreRetriever")?;
            Ok(NodeInstance::new(Arc::new(RetrievalQaChain::new(model, retriever))))
        })
    }

    fn run(
        &self,
        instance: NodeInstance,
        input: String,
        ctx: RunContext,
    ) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let chain = chain_instance::<RetrievalQaChain>(&instance, &ctx.node_id)?;
            Ok(NodeOutput::Text(chain.call(&input, &ctx).await?))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chains::testing::{init_ctx, run_ctx, upstream};
    use crate::models::EchoChatModel;
    use chainflow_core::error::ChainflowError;
    use chainflow_core::history::MemoryBindings;

    struct FixedRetriever(Vec<Document>);

    impl Retriever for FixedRetriever {
        fn retrieve(&self, _query: &str) -> BoxFuture<'_, Result<Vec<Document>>> {
            let docs = self.0.clone();
            Box::pin(async move { Ok(docs) })
        }
    }

    struct FailingRetriever;

    impl Retriever for FailingRetriever {
        fn retrieve(&self, _query: &str) -> BoxFuture<'_, Result<Vec<Document>>> {
            Box::pin(async { Err(ChainflowError::Node("index offline".into())) })
        }
    }

    #[test]
    fn test_prompt_stuffs_documents() {
        let prompt = RetrievalQaChain::prompt(
            "Who?",
            &[Document::new("Alice wrote it."), Document::new("Bob read it.")],
        );
        assert!(prompt.contains("Alice wrote it.\n\nBob read it."));
        assert!(prompt.ends_with("Question: Who?\nHelpful Answer:"));
    }

    #[tokio::test]
    async fn test_answers_with_context() {
        // The echo model returns the prompt it was sent.
        let model: Arc<dyn ChatModel> = Arc::new(EchoChatModel::new("echo"));
        let retriever: Arc<dyn Retriever> =
            Arc::new(FixedRetriever(vec![Document::new("The sky is blue.")]));
        let mut inputs = ResolvedInputs::new();
        inputs.insert("model", upstream("model", model));
        inputs.insert("vectorStoreRetriever", upstream("retriever", retriever));
        let instance = RetrievalQaChainNode.init(inputs, init_ctx("qa")).await.unwrap();

        let output = RetrievalQaChainNode
            .run(instance, "What colour is the sky?".into(), run_ctx("qa", MemoryBindings::new(), None))
            .await
            .unwrap();
        assert!(output.as_text().contains("The sky is blue."));
    }

    #[tokio::test]
    async fn test_retriever_error_propagates() {
        let model: Arc<dyn ChatModel> = Arc::new(EchoChatModel::new("echo"));
        let chain = RetrievalQaChain::new(model, Arc::new(FailingRetriever));
        let err = chain
            .call("q", &run_ctx("qa", MemoryBindings::new(), None))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("index offline"));
    }
}
