use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::json;
use tracing::warn;

use chainflow_core::capability::TEXT_SPLITTER;
use chainflow_core::context::InitContext;
use chainflow_core::error::{ChainflowError, Result};
use chainflow_core::instance::{NodeInstance, ResolvedInputs};
use chainflow_core::traits::{NodeType, TextSplitter};
use chainflow_core::types::{InputPort, NodeSchema};

/// Splits on one separator, then packs the pieces into chunks of at most
/// `chunk_size` characters that overlap by up to `chunk_overlap`.
#[derive(Debug, Clone)]
pub struct CharacterTextSplitter {
    separator: String,
    chunk_size: usize,
    chunk_overlap: usize,
}

impl CharacterTextSplitter {
    pub fn new(separator: impl Into<String>, chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        if chunk_overlap > chunk_size {
            return Err(ChainflowError::Node(format!(
                "chunk overlap ({chunk_overlap}) is larger than chunk size ({chunk_size})"
            )));
        }
        Ok(Self {
            separator: separator.into(),
            chunk_size,
            chunk_overlap,
        })
    }

    fn merge(&self, splits: &[&str]) -> Vec<String> {
        let sep_len = self.separator.chars().count();
        let mut chunks = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut total = 0usize;

        for &piece in splits {
            let len = piece.chars().count();
            let joiner = if current.is_empty() { 0 } else { sep_len };
            if total + len + joiner > self.chunk_size {
                if total > self.chunk_size {
                    warn!(size = total, limit = self.chunk_size, "Created a chunk larger than the chunk size");
                }
                if !current.is_empty() {
                    self.push_chunk(&current, &mut chunks);
                    while total > self.chunk_overlap
                        || (total > 0
                            && total + len + if current.is_empty() { 0 } else { sep_len }
                                > self.chunk_size)
                    {
                        let first = current.remove(0);
                        total -= first.chars().count() + if current.is_empty() { 0 } else { sep_len };
                    }
                }
            }
            total += len + if current.is_empty() { 0 } else { sep_len };
            current.push(piece);
        }
        self.push_chunk(&current, &mut chunks);
        chunks
    }

    fn push_chunk(&self, pieces: &[&str], chunks: &mut Vec<String>) {
        let chunk = pieces.join(&self.separator);
        let chunk = chunk.trim();
        if !chunk.is_empty() {
            chunks.push(chunk.to_string());
        }
    }
}

impl TextSplitter for CharacterTextSplitter {
    fn split_text(&self, text: &str) -> Vec<String> {
        let splits: Vec<&str> = if self.separator.is_empty() {
            text.char_indices()
                .map(|(i, c)| &text[i..i + c.len_utf8()])
                .collect()
        } else {
            text.split(self.separator.as_str())
                .filter(|s| !s.is_empty())
                .collect()
        };
        self.merge(&splits)
    }
}

pub struct CharacterTextSplitterNode;

impl NodeType for CharacterTextSplitterNode {
    fn schema(&self) -> NodeSchema {
        NodeSchema::new("characterTextSplitter", "Text Splitters")
            .label("Character Text Splitter")
            .description("Splits text on a single separator (\"\\n\\n\" by default)")
            .capabilities(["CharacterTextSplitter", TEXT_SPLITTER])
            .input(InputPort::param("separator", "string").optional())
            .input(
                InputPort::param("chunkSize", "number")
                    .with_label("Chunk Size")
                    .with_default(json!(1000)),
            )
            .input(
                InputPort::param("chunkOverlap", "number")
                    .with_label("Chunk Overlap")
                    .optional(),
            )
    }

    fn init(&self, inputs: ResolvedInputs, _ctx: InitContext) -> BoxFuture<'_, Result<NodeInstance>> {
        Box::pin(async move {
            let separator = inputs.str("separator").unwrap_or("\n\n");
            let chunk_size = inputs.usize("chunkSize").unwrap_or(1000);
            let chunk_overlap = inputs.usize("chunkOverlap").unwrap_or(200.min(chunk_size));
            let splitter: Arc<dyn TextSplitter> =
                Arc::new(CharacterTextSplitter::new(separator, chunk_size, chunk_overlap)?);
            Ok(NodeInstance::new(splitter))
        })
    }
}
