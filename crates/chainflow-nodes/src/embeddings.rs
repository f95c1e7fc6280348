use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::json;

use chainflow_core::capability::EMBEDDINGS;
use chainflow_core::context::InitContext;
use chainflow_core::error::{ChainflowError, Result};
use chainflow_core::instance::{NodeInstance, ResolvedInputs};
use chainflow_core::traits::{Embeddings, NodeType};
use chainflow_core::types::{InputPort, NodeSchema};

/// Deterministic bag-of-words embeddings: each lowercase word is hashed
/// into one of `dimensions` buckets and the counts are L2-normalized.
#[derive(Debug, Clone)]
pub struct HashingEmbeddings {
    dimensions: usize,
}

impl HashingEmbeddings {
    pub fn new(dimensions: usize) -> Result<Self> {
        if dimensions == 0 {
            return Err(ChainflowError::Node("dimensions must be positive".into()));
        }
        Ok(Self { dimensions })
    }

    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let bucket = (fnv1a(&word.to_lowercase()) % self.dimensions as u64) as usize;
            vector[bucket] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

fn fnv1a(text: &str) -> u64 {
    text.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ byte as u64).wrapping_mul(0x0100_0000_01b3)
    })
}

/// Cosine similarity of two vectors of equal length.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

impl Embeddings for HashingEmbeddings {
    fn embed_documents(&self, texts: &[String]) -> BoxFuture<'_, Result<Vec<Vec<f32>>>> {
        let vectors = texts.iter().map(|t| self.embed(t)).collect();
        Box::pin(async move { Ok(vectors) })
    }

    fn embed_query(&self, text: &str) -> BoxFuture<'_, Result<Vec<f32>>> {
        let vector = self.embed(text);
        Box::pin(async move { Ok(vector) })
    }
}

pub struct HashingEmbeddingsNode;

impl NodeType for HashingEmbeddingsNode {
    fn schema(&self) -> NodeSchema {
        NodeSchema::new("hashingEmbeddings", "Embeddings")
            .label("Hashing Embeddings")
            .description("Local word-hashing embeddings, no external service")
            .capabilities(["HashingEmbeddings", EMBEDDINGS])
            .input(
                InputPort::param("dimensions", "number")
                    .with_label("Dimensions")
                    .with_default(json!(256)),
            )
    }

    fn init(&self, inputs: ResolvedInputs, _ctx: InitContext) -> BoxFuture<'_, Result<NodeInstance>> {
        Box::pin(async move {
            let dimensions = inputs.usize("dimensions").unwrap_or(256);
            let embeddings: Arc<dyn Embeddings> = Arc::new(HashingEmbeddings::new(dimensions)?);
            Ok(NodeInstance::new(embeddings))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_text_same_vector() {
        let embeddings = HashingEmbeddings::new(64).unwrap();
        assert_eq!(embeddings.embed("Rust is fast"), embeddings.embed("rust IS fast"));
    }

    #[test]
    fn test_related_text_scores_higher() {
        let embeddings = HashingEmbeddings::new(256).unwrap();
        let query = embeddings.embed("how fast is rust");
        let close = embeddings.embed("rust is a fast language");
        let far = embeddings.embed("bananas grow in warm climates");
        assert!(cosine_similarity(&query, &close) > cosine_similarity(&query, &far));
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let embeddings = HashingEmbeddings::new(8).unwrap();
        let v = embeddings.embed("  ... ");
        assert!(v.iter().all(|x| *x == 0.0));
        assert_eq!(cosine_similarity(&v, &v), 0.0);
    }
}
