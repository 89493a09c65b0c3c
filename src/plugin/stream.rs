//! Streaming chat output.
//!
//! A [`ChunkSink`] is handed to the plugin; the caller holds the matching
//! [`ChatStream`]. Chunks arrive in the order they were sent and the stream
//! ends with exactly one terminal event, after which the sink rejects
//! further chunks.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

use super::{ChatChunk, ErrorInfo, PluginError, PluginResult};

/// Default number of chunks buffered between plugin and consumer.
pub const DEFAULT_STREAM_BUFFER: usize = 32;

/// An event on a chat stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChatEvent {
    /// A partial completion.
    Chunk(ChatChunk),
    /// Generation finished successfully.
    Done,
    /// Generation failed.
    Error(ErrorInfo),
}

impl ChatEvent {
    /// Check if this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Chunk(_))
    }
}

#[derive(Debug)]
struct SinkState {
    tx: Option<mpsc::Sender<ChatEvent>>,
    next_index: usize,
}

/// Producer side of a chat stream.
#[derive(Debug, Clone)]
pub struct ChunkSink {
    state: Arc<Mutex<SinkState>>,
}

impl ChunkSink {
    /// Send the next chunk.
    pub async fn send(&self, delta: impl Into<String>) -> PluginResult<()> {
        let mut state = self.state.lock().await;
        let index = state.next_index;
        let tx = state
            .tx
            .as_ref()
            .ok_or_else(|| PluginError::RuntimeFailure("chat stream already finished".into()))?;
        tx.send(ChatEvent::Chunk(ChatChunk { index, delta: delta.into() }))
            .await
            .map_err(|_| PluginError::RuntimeFailure("chat stream consumer went away".into()))?;
        state.next_index += 1;
        Ok(())
    }

    /// Number of chunks sent so far.
    pub async fn sent(&self) -> usize {
        self.state.lock().await.next_index
    }

    /// Check if the terminal event has been sent.
    pub async fn is_finished(&self) -> bool {
        self.state.lock().await.tx.is_none()
    }

    /// Send the terminal event. Returns `false` if the stream was already finished.
    pub async fn finish(&self, outcome: Result<(), ErrorInfo>) -> bool {
        let mut state = self.state.lock().await;
        let Some(tx) = state.tx.take() else {
            return false;
        };
        let event = match outcome {
            Ok(()) => ChatEvent::Done,
            Err(info) => ChatEvent::Error(info),
        };
        // A vanished consumer is not an error for the producer.
        let _ = tx.send(event).await;
        true
    }
}

/// Consumer side of a chat stream.
#[derive(Debug)]
pub struct ChatStream {
    rx: mpsc::Receiver<ChatEvent>,
    done: bool,
}

impl ChatStream {
    /// Receive the next event; `None` after the terminal event.
    pub async fn next_event(&mut self) -> Option<ChatEvent> {
        if self.done {
            return None;
        }
        let event = self.rx.recv().await;
        self.done = event.as_ref().map_or(true, ChatEvent::is_terminal);
        event
    }

    /// Drain the stream, concatenating chunk text.
    pub async fn collect_text(mut self) -> PluginResult<String> {
        let mut text = String::new();
        while let Some(event) = self.next_event().await {
            match event {
                ChatEvent::Chunk(chunk) => text.push_str(&chunk.delta),
                ChatEvent::Done => return Ok(text),
                ChatEvent::Error(info) => return Err(info.into()),
            }
        }
        Err(PluginError::RuntimeFailure("chat stream ended without a terminal event".into()))
    }
}

impl futures::Stream for ChatStream {
    type Item = ChatEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(event) => {
                self.done = event.as_ref().map_or(true, ChatEvent::is_terminal);
                Poll::Ready(event)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Create a connected sink and stream.
pub fn chat_channel(buffer: usize) -> (ChunkSink, ChatStream) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let sink = ChunkSink { state: Arc::new(Mutex::new(SinkState { tx: Some(tx), next_index: 0 })) };
    (sink, ChatStream { rx, done: false })
}
