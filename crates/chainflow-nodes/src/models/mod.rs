pub mod echo;
pub mod openai;

pub use echo::{EchoChatModel, EchoChatModelNode};
pub use openai::{ChatLocalAiNode, ChatOpenAiNode, OpenAiChatModel, OpenAiSettings};

use chainflow_core::error::Result;
use chainflow_core::stream::StreamSink;

/// Emit `text` as word-sized chunks, whitespace kept with the preceding word.
pub async fn stream_words(sink: &StreamSink, text: &str) -> Result<()> {
    for piece in text.split_inclusive(' ') {
        sink.send_chunk(piece).await?;
    }
    Ok(())
}
