use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::{ChainflowError, Result};

/// One frame of a streamed run, in delivery order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamEvent {
    /// An incremental piece of the terminal output.
    Chunk { chunk: String },
    /// Completion marker; nothing follows it.
    Done { done: bool },
    /// Error marker; nothing follows it.
    Error {
        #[serde(rename = "errorKind")]
        error_kind: String,
        #[serde(rename = "nodeId", default, skip_serializing_if = "Option::is_none")]
        node_id: Option<String>,
        message: String,
    },
}

impl StreamEvent {
    pub fn chunk(text: impl Into<String>) -> Self {
        Self::Chunk { chunk: text.into() }
    }

    pub fn done() -> Self {
        Self::Done { done: true }
    }

    pub fn error(err: &ChainflowError) -> Self {
        Self::Error {
            error_kind: err.kind().to_string(),
            node_id: err.node_id().map(str::to_string),
            message: err.to_string(),
        }
    }

    /// Whether this frame ends the stream.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Chunk { .. })
    }
}

/// Producer half of a streaming channel, handed to the terminal node.
///
/// Delivery is ordered. Once the receiver is gone every send fails with
/// `Cancelled`, which lets a node stop producing early.
#[derive(Debug, Clone)]
pub struct StreamSink {
    tx: mpsc::Sender<StreamEvent>,
}

impl StreamSink {
    /// Emit a chunk. Empty chunks are dropped.
    pub async fn send_chunk(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        if text.is_empty() {
            return Ok(());
        }
        self.tx
            .send(StreamEvent::chunk(text))
            .await
            .map_err(|_| ChainflowError::Cancelled)
    }

    /// Emit the completion marker and release the handle.
    pub async fn finish(self) {
        let _ = self.tx.send(StreamEvent::done()).await;
    }

    /// Emit the error marker and release the handle.
    pub async fn fail(self, err: &ChainflowError) {
        let _ = self.tx.send(StreamEvent::error(err)).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half of a streaming channel.
///
/// When tied to a run with [`StreamReceiver::cancel_on_drop`], dropping the
/// receiver before a terminal frame arrives cancels that run.
#[derive(Debug)]
pub struct StreamReceiver {
    rx: mpsc::Receiver<StreamEvent>,
    guard: Option<DropGuard>,
}

impl StreamReceiver {
    pub fn cancel_on_drop(mut self, cancel: CancellationToken) -> Self {
        self.guard = Some(cancel.drop_guard());
        self
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        let event = self.rx.recv().await;
        self.observe(event.as_ref());
        event
    }

    /// Drain the stream until a terminal marker, returning every frame.
    pub async fn collect(mut self) -> Vec<StreamEvent> {
        let mut frames = Vec::new();
        while let Some(event) = self.recv().await {
            let terminal = event.is_terminal();
            frames.push(event);
            if terminal {
                break;
            }
        }
        frames
    }

    // The run is over once a terminal frame is seen; nothing left to cancel.
    fn observe(&mut self, event: Option<&StreamEvent>) {
        if event.map_or(true, StreamEvent::is_terminal) {
            if let Some(guard) = self.guard.take() {
                guard.disarm();
            }
        }
    }
}

impl Stream for StreamReceiver {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        let polled = self.rx.poll_recv(cx);
        if let Poll::Ready(event) = &polled {
            self.observe(event.as_ref());
        }
        polled
    }
}

/// Create a bounded single-producer/single-consumer streaming channel.
pub fn channel(buffer: usize) -> (StreamSink, StreamReceiver) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (StreamSink { tx }, StreamReceiver { rx, guard: None })
}

/// Concatenate the chunk frames of a stream.
pub fn concat_chunks(frames: &[StreamEvent]) -> String {
    frames
        .iter()
        .filter_map(|f| match f {
            StreamEvent::Chunk { chunk } => Some(chunk.as_str()),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ordered_delivery_and_done_marker() {
        let (sink, rx) = channel(8);
        tokio::spawn(async move {
            sink.send_chunk("Hel").await.unwrap();
            sink.send_chunk("").await.unwrap();
            sink.send_chunk("lo").await.unwrap();
            sink.finish().await;
        });

        let frames = rx.collect().await;
        assert_eq!(frames.len(), 3);
        assert_eq!(concat_chunks(&frames), "Hello");
        assert_eq!(frames.last(), Some(&StreamEvent::done()));
    }

    #[tokio::test]
    async fn test_send_after_receiver_dropped_is_cancelled() {
        let (sink, rx) = channel(1);
        drop(rx);
        let err = sink.send_chunk("x").await.unwrap_err();
        assert!(matches!(err, ChainflowError::Cancelled));
    }

    #[tokio::test]
    async fn test_dropping_receiver_early_cancels() {
        let cancel = CancellationToken::new();
        let (sink, rx) = channel(4);
        let rx = rx.cancel_on_drop(cancel.clone());
        sink.send_chunk("partial").await.unwrap();
        drop(rx);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_terminal_frame_releases_cancellation() {
        let cancel = CancellationToken::new();
        let (sink, rx) = channel(4);
        let rx = rx.cancel_on_drop(cancel.clone());
        sink.send_chunk("all").await.unwrap();
        sink.finish().await;

        let frames = rx.collect().await;
        assert_eq!(frames.len(), 2);
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_receiver_as_stream() {
        use futures::StreamExt;

        let (sink, mut rx) = channel(4);
        tokio::spawn(async move {
            sink.send_chunk("a").await.unwrap();
            sink.send_chunk("b").await.unwrap();
            sink.finish().await;
        });
        let mut frames = Vec::new();
        while let Some(frame) = rx.next().await {
            frames.push(frame);
        }
        assert_eq!(concat_chunks(&frames), "ab");
        assert_eq!(frames.last(), Some(&StreamEvent::done()));
    }

    #[test]
    fn test_wire_shape() {
        let chunk = serde_json::to_value(StreamEvent::chunk("a")).unwrap();
        assert_eq!(chunk, serde_json::json!({"chunk": "a"}));
        let done = serde_json::to_value(StreamEvent::done()).unwrap();
        assert_eq!(done, serde_json::json!({"done": true}));
        let err = serde_json::to_value(StreamEvent::error(&ChainflowError::run("llm", "boom")))
            .unwrap();
        assert_eq!(err["errorKind"], "RunError");
        assert_eq!(err["nodeId"], "llm");
    }
}
