//! In-process plugin used by unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    CallContext, Capability, ChatMessage, ChatChoice, ChatModel, ChatRequest, ChatResponse,
    ChatUsage, Embedder, Plugin, PluginError, PluginInfo, PluginResult, ResolvedConfig,
};

#[derive(Debug)]
pub struct StubPlugin {
    id: String,
    pub init_calls: AtomicUsize,
    pub cleanup_calls: AtomicUsize,
    pub chat_delay: Duration,
    pub init_delay: Duration,
    pub fail_init: bool,
    pub reentrant: bool,
    ready: AtomicBool,
}

impl StubPlugin {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            init_calls: AtomicUsize::new(0),
            cleanup_calls: AtomicUsize::new(0),
            chat_delay: Duration::ZERO,
            init_delay: Duration::ZERO,
            fail_init: false,
            reentrant: true,
            ready: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Plugin for StubPlugin {
    fn metadata(&self) -> PluginInfo {
        PluginInfo {
            id: self.id.clone(),
            name: self.id.clone(),
            version: "1.0.0".into(),
            provider: Some("stub".into()),
            capabilities: vec![Capability::Embedding, Capability::Chat],
        }
    }

    async fn initialize(&self, _config: &ResolvedConfig, _ctx: &CallContext) -> PluginResult<()> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.init_delay).await;
        if self.fail_init {
            return Err(PluginError::RuntimeFailure("stub init failure".into()));
        }
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn cleanup(&self, _ctx: &CallContext) -> PluginResult<()> {
        self.cleanup_calls.fetch_add(1, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn reentrant(&self) -> bool {
        self.reentrant
    }

    fn as_embedder(&self) -> Option<&dyn Embedder> {
        Some(self)
    }

    fn as_chat(&self) -> Option<&dyn ChatModel> {
        Some(self)
    }
}

#[async_trait]
impl Embedder for StubPlugin {
    async fn embed(&self, text: &str, _ctx: &CallContext) -> PluginResult<Vec<f32>> {
        Ok(vec![text.len() as f32, 0.0, 1.0])
    }

    fn dimensions(&self) -> usize {
        3
    }
}

#[async_trait]
impl ChatModel for StubPlugin {
    async fn chat(&self, request: &ChatRequest, ctx: &CallContext) -> PluginResult<ChatResponse> {
        tokio::select! {
            () = tokio::time::sleep(self.chat_delay) => {}
            () = ctx.cancelled() => return Err(PluginError::Cancelled(self.id.clone())),
        }
        let last = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
        Ok(ChatResponse {
            id: "stub".into(),
            model: request.model.clone(),
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage::assistant(format!("echo: {last}")),
                finish_reason: "stop".into(),
            }],
            usage: ChatUsage::default(),
        })
    }
}
