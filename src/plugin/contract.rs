//! Capability contracts implemented by plugins.
//!
//! Every plugin implements [`Plugin`]; capability providers additionally
//! implement [`Embedder`], [`Reranker`] or [`ChatModel`] and expose them
//! through the `as_*` accessors. Every entry point receives a
//! [`CallContext`] carrying its deadline and cancellation signal.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{
    Capability, ChatRequest, ChatResponse, ChunkSink, PluginError, PluginInfo, PluginResult,
    RerankDocument, RerankResult, ResolvedConfig,
};

/// Deadline and cancellation signal for one call.
#[derive(Debug, Clone)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl CallContext {
    /// Create a context that expires after `timeout`.
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self { deadline: Some(Instant::now() + timeout), cancel }
    }

    /// A context with no deadline and its own token.
    pub fn background() -> Self {
        Self { deadline: None, cancel: CancellationToken::new() }
    }

    /// When the call must finish.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Check if the call was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until the call is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// The cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Base contract of every plugin instance.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Identity of the running instance.
    fn metadata(&self) -> PluginInfo;

    /// Initialize with resolved configuration.
    async fn initialize(&self, config: &ResolvedConfig, ctx: &CallContext) -> PluginResult<()>;

    /// Plugin-specific config checks, run after schema validation.
    fn validate_config(&self, _config: &ResolvedConfig) -> PluginResult<()> {
        Ok(())
    }

    /// Check if the instance can serve calls.
    fn ready(&self) -> bool;

    /// Apply a freshly resolved configuration.
    async fn reload_config(&self, config: &ResolvedConfig, ctx: &CallContext) -> PluginResult<()> {
        self.initialize(config, ctx).await
    }

    /// Release resources. Called at most once per instance by the runtime.
    async fn cleanup(&self, ctx: &CallContext) -> PluginResult<()>;

    /// Whether concurrent capability calls are allowed.
    fn reentrant(&self) -> bool {
        true
    }

    fn as_embedder(&self) -> Option<&dyn Embedder> {
        None
    }

    fn as_reranker(&self) -> Option<&dyn Reranker> {
        None
    }

    fn as_chat(&self) -> Option<&dyn ChatModel> {
        None
    }

    /// Check if the instance implements a capability contract.
    fn provides(&self, capability: Capability) -> bool {
        match capability {
            Capability::Embedding => self.as_embedder().is_some(),
            Capability::Rerank => self.as_reranker().is_some(),
            Capability::Chat => self.as_chat().is_some(),
            Capability::Tts | Capability::Stt | Capability::Image => false,
        }
    }
}

/// Text embedding.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed one text.
    async fn embed(&self, text: &str, ctx: &CallContext) -> PluginResult<Vec<f32>>;

    /// Embed several texts, one vector per text in input order.
    async fn embed_batch(&self, texts: &[String], ctx: &CallContext) -> PluginResult<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            if ctx.is_cancelled() {
                return Err(PluginError::Cancelled("embed_batch".into()));
            }
            vectors.push(self.embed(text, ctx).await?);
        }
        Ok(vectors)
    }

    /// Length of every vector this embedder returns.
    fn dimensions(&self) -> usize;
}

/// Result reranking.
#[async_trait]
pub trait Reranker: Send + Sync {
    /// Score documents against a query.
    async fn rerank(
        &self,
        query: &str,
        documents: &[RerankDocument],
        ctx: &CallContext,
    ) -> PluginResult<Vec<RerankResult>>;
}

/// Chat completion.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Single-shot completion.
    async fn chat(&self, request: &ChatRequest, ctx: &CallContext) -> PluginResult<ChatResponse>;

    /// Streamed completion. Chunks go to `sink` in generation order; the
    /// runtime sends the terminal event when this returns.
    async fn chat_stream(
        &self,
        request: &ChatRequest,
        sink: &ChunkSink,
        ctx: &CallContext,
    ) -> PluginResult<()> {
        let response = self.chat(request, ctx).await?;
        sink.send(response.content().unwrap_or_default()).await
    }
}

/// A typed capability call.
#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityRequest {
    Embed { text: String },
    EmbedBatch { texts: Vec<String> },
    Rerank { query: String, documents: Vec<RerankDocument> },
    Chat(ChatRequest),
}

#[derive(Deserialize)]
struct EmbedPayload {
    text: Option<String>,
    texts: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct RerankPayload {
    query: String,
    documents: Vec<RerankDocument>,
}

impl CapabilityRequest {
    /// Capability this request targets.
    pub fn capability(&self) -> Capability {
        match self {
            Self::Embed { .. } | Self::EmbedBatch { .. } => Capability::Embedding,
            Self::Rerank { .. } => Capability::Rerank,
            Self::Chat(_) => Capability::Chat,
        }
    }

    /// Parse an opaque payload for `capability`.
    ///
    /// Embedding takes `{"text"}` or `{"texts"}`, rerank takes
    /// `{"query", "documents"}`, chat takes a [`ChatRequest`].
    pub fn from_payload(capability: Capability, payload: Value) -> PluginResult<Self> {
        let invalid = |e: serde_json::Error| PluginError::validation("payload", e.to_string());
        match capability {
            Capability::Embedding => {
                let p: EmbedPayload = serde_json::from_value(payload).map_err(invalid)?;
                match (p.text, p.texts) {
                    (Some(text), None) => Ok(Self::Embed { text }),
                    (None, Some(texts)) => Ok(Self::EmbedBatch { texts }),
                    _ => Err(PluginError::validation(
                        "payload",
                        "embedding payload needs exactly one of 'text' or 'texts'",
                    )),
                }
            }
            Capability::Rerank => {
                let p: RerankPayload = serde_json::from_value(payload).map_err(invalid)?;
                Ok(Self::Rerank { query: p.query, documents: p.documents })
            }
            Capability::Chat => Ok(Self::Chat(serde_json::from_value(payload).map_err(invalid)?)),
            other => Err(PluginError::Unsupported {
                plugin: String::new(),
                capability: other.to_string(),
            }),
        }
    }
}

/// Result of a capability call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CapabilityResponse {
    Embedding { vector: Vec<f32>, dimensions: usize },
    Embeddings { vectors: Vec<Vec<f32>>, dimensions: usize },
    Rerank { results: Vec<RerankResult> },
    Chat(ChatResponse),
}

impl CapabilityResponse {
    /// Opaque payload form.
    pub fn to_payload(&self) -> PluginResult<Value> {
        serde_json::to_value(self).map_err(|e| PluginError::RuntimeFailure(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_embedding_payloads() {
        let single = CapabilityRequest::from_payload(Capability::Embedding, json!({"text": "hello"}));
        assert_eq!(single.unwrap(), CapabilityRequest::Embed { text: "hello".into() });

        let batch = CapabilityRequest::from_payload(Capability::Embedding, json!({"texts": ["a", "b"]}));
        assert_eq!(batch.unwrap().capability(), Capability::Embedding);

        let neither = CapabilityRequest::from_payload(Capability::Embedding, json!({}));
        assert!(matches!(neither, Err(PluginError::Validation { .. })));
    }

    #[test]
    fn test_rerank_payload() {
        let req = CapabilityRequest::from_payload(
            Capability::Rerank,
            json!({"query": "q", "documents": [{"id": 1, "content": "doc"}]}),
        )
        .unwrap();
        match req {
            CapabilityRequest::Rerank { query, documents } => {
                assert_eq!(query, "q");
                assert_eq!(documents[0].id, 1);
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn test_reserved_capability_unsupported() {
        let err = CapabilityRequest::from_payload(Capability::Tts, json!({})).unwrap_err();
        assert!(matches!(err, PluginError::Unsupported { .. }));
    }

    #[test]
    fn test_response_payload_shape() {
        let payload = CapabilityResponse::Embedding { vector: vec![0.5, 0.25], dimensions: 2 }
            .to_payload()
            .unwrap();
        assert_eq!(payload, json!({"vector": [0.5, 0.25], "dimensions": 2}));
    }

    #[tokio::test]
    async fn test_call_context_cancellation() {
        let ctx = CallContext::new(Duration::from_secs(5), CancellationToken::new());
        assert!(ctx.remaining().unwrap() <= Duration::from_secs(5));
        assert!(!ctx.is_cancelled());
        ctx.token().cancel();
        ctx.cancelled().await;
        assert!(ctx.is_cancelled());
        assert!(CallContext::background().deadline().is_none());
    }
}
