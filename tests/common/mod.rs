//! Shared fixtures for integration tests: mock providers registered on a
//! builtin host, and helpers that write signed packages.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use caphost::plugin::{
    signing, BuiltinHost, CallContext, Capability, ChatChoice, ChatMessage, ChatModel,
    ChatRequest, ChatResponse, ChatUsage, ChunkSink, ConfigResolver, Embedder, EnvSource,
    ManagerOptions, MemoryAdminStore, PackageBuilder, PackageReader, Plugin, PluginError,
    PluginInfo, PluginManager, PluginManifest, PluginResult, ReaderOptions, RerankDocument,
    RerankResult, Reranker, ResolvedConfig, TrustedKeys,
};
use ed25519_dalek::SigningKey;
use serde_json::{json, Map, Value};
use tempfile::TempDir;

/// Entrypoint of a well-behaved provider.
pub const MOCK: &str = "mock";
/// Entrypoint whose chat calls take ten seconds unless cancelled.
pub const SLOW_CHAT: &str = "slow-chat";
/// Entrypoint whose chat calls take 200ms unless cancelled.
pub const STEADY_CHAT: &str = "steady-chat";
/// Entrypoint whose initialize always fails.
pub const FAILING_INIT: &str = "failing-init";
/// Entrypoint whose initialize outlasts any test init timeout.
pub const SLOW_INIT: &str = "slow-init";

/// Calls observed across every instance a harness created.
#[derive(Debug, Default)]
pub struct Counters {
    pub inits: AtomicUsize,
    pub cleanups: AtomicUsize,
}

impl Counters {
    pub fn inits(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }
}

/// Embedding, rerank and chat provider with scripted behaviour.
pub struct MockProvider {
    manifest: PluginManifest,
    counters: Arc<Counters>,
    dimensions: AtomicUsize,
    chat_delay: Duration,
    init_delay: Duration,
    fail_init: bool,
    ready: AtomicBool,
}

impl MockProvider {
    fn new(manifest: &PluginManifest, counters: Arc<Counters>) -> Self {
        let target = manifest.entrypoint.target.as_deref().unwrap_or_default();
        Self {
            manifest: manifest.clone(),
            counters,
            dimensions: AtomicUsize::new(0),
            chat_delay: match target {
                SLOW_CHAT => Duration::from_secs(10),
                STEADY_CHAT => Duration::from_millis(200),
                _ => Duration::ZERO,
            },
            init_delay: if target == SLOW_INIT { Duration::from_secs(30) } else { Duration::ZERO },
            fail_init: target == FAILING_INIT,
            ready: AtomicBool::new(false),
        }
    }

    fn reply(&self, request: &ChatRequest) -> String {
        let last = request.messages.last().map(|m| m.content.as_str()).unwrap_or_default();
        format!("{} says: {last}", self.manifest.id)
    }
}

#[async_trait]
impl Plugin for MockProvider {
    fn metadata(&self) -> PluginInfo {
        self.manifest.info()
    }

    async fn initialize(&self, config: &ResolvedConfig, _ctx: &CallContext) -> PluginResult<()> {
        self.counters.inits.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.init_delay).await;
        if self.fail_init {
            return Err(PluginError::RuntimeFailure("provider refused to start".into()));
        }
        let dimensions = config.get_i64("dimensions").unwrap_or(8);
        self.dimensions.store(dimensions as usize, Ordering::SeqCst);
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn validate_config(&self, config: &ResolvedConfig) -> PluginResult<()> {
        match config.get_str("api_key") {
            Some(key) if key.starts_with("sk-") || key.is_empty() => Ok(()),
            Some(_) => Err(PluginError::validation("api_key", "must start with 'sk-'")),
            None => Ok(()),
        }
    }

    fn ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn cleanup(&self, _ctx: &CallContext) -> PluginResult<()> {
        self.counters.cleanups.fetch_add(1, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn reentrant(&self) -> bool {
        self.manifest.reentrant
    }

    fn as_embedder(&self) -> Option<&dyn Embedder> {
        self.manifest.has_capability(Capability::Embedding).then_some(self as &dyn Embedder)
    }

    fn as_reranker(&self) -> Option<&dyn Reranker> {
        self.manifest.has_capability(Capability::Rerank).then_some(self as &dyn Reranker)
    }

    fn as_chat(&self) -> Option<&dyn ChatModel> {
        self.manifest.has_capability(Capability::Chat).then_some(self as &dyn ChatModel)
    }
}

#[async_trait]
impl Embedder for MockProvider {
    async fn embed(&self, text: &str, _ctx: &CallContext) -> PluginResult<Vec<f32>> {
        let dims = self.dimensions();
        Ok((0..dims).map(|i| ((text.len() + i) % 7) as f32 / 7.0).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Reranker for MockProvider {
    async fn rerank(
        &self,
        query: &str,
        documents: &[RerankDocument],
        _ctx: &CallContext,
    ) -> PluginResult<Vec<RerankResult>> {
        let terms: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
        Ok(documents
            .iter()
            .map(|doc| {
                let content = doc.content.to_lowercase();
                let hits = terms.iter().filter(|t| content.contains(t.as_str())).count();
                RerankResult { document: doc.clone(), score: hits as f64, rank: 0 }
            })
            .collect())
    }
}

#[async_trait]
impl ChatModel for MockProvider {
    async fn chat(&self, request: &ChatRequest, ctx: &CallContext) -> PluginResult<ChatResponse> {
        tokio::select! {
            () = tokio::time::sleep(self.chat_delay) => {}
            () = ctx.cancelled() => return Err(PluginError::Cancelled(self.manifest.id.clone())),
        }
        Ok(ChatResponse {
            id: format!("{}-reply", self.manifest.id),
            model: request.model.clone(),
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage::assistant(self.reply(request)),
                finish_reason: "stop".into(),
            }],
            usage: ChatUsage::default(),
        })
    }

    async fn chat_stream(
        &self,
        request: &ChatRequest,
        sink: &ChunkSink,
        ctx: &CallContext,
    ) -> PluginResult<()> {
        tokio::select! {
            () = tokio::time::sleep(self.chat_delay) => {}
            () = ctx.cancelled() => return Err(PluginError::Cancelled(self.manifest.id.clone())),
        }
        let reply = self.reply(request);
        for (i, word) in reply.split(' ').enumerate() {
            if ctx.is_cancelled() {
                return Err(PluginError::Cancelled(self.manifest.id.clone()));
            }
            let delta = if i == 0 { word.to_string() } else { format!(" {word}") };
            sink.send(delta).await?;
        }
        Ok(())
    }
}

/// Temporary plugins directory, signing key and builtin host.
pub struct Harness {
    pub dir: TempDir,
    pub key: SigningKey,
    pub counters: Arc<Counters>,
    pub host: Arc<BuiltinHost>,
}

impl Harness {
    pub fn new() -> Self {
        let counters = Arc::new(Counters::default());
        let host = BuiltinHost::new();
        for target in [MOCK, SLOW_CHAT, STEADY_CHAT, FAILING_INIT, SLOW_INIT] {
            let counters = Arc::clone(&counters);
            host.register(target, move |manifest: &PluginManifest, _: &Path| {
                Ok(Box::new(MockProvider::new(manifest, Arc::clone(&counters))) as Box<dyn Plugin>)
            });
        }
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("plugins")).unwrap();
        Self { dir, key: signing::generate_signing_key(), counters, host: Arc::new(host) }
    }

    pub fn plugins_dir(&self) -> PathBuf {
        self.dir.path().join("plugins")
    }

    pub fn trusted_keys(&self) -> TrustedKeys {
        let mut keys = TrustedKeys::new();
        keys.add(self.key.verifying_key());
        keys
    }

    pub fn reader_options(&self) -> ReaderOptions {
        ReaderOptions {
            require_signatures: true,
            trusted_keys: self.trusted_keys(),
            scratch_dir: self.dir.path().join("scratch"),
            ..ReaderOptions::default()
        }
    }

    pub fn options(&self) -> ManagerOptions {
        ManagerOptions {
            plugins_dir: self.plugins_dir(),
            init_timeout: Duration::from_secs(2),
            call_timeout: Duration::from_secs(30),
            ..ManagerOptions::default()
        }
    }

    pub fn manager(&self) -> PluginManager {
        self.manager_with(self.options(), EnvSource::Fixed(BTreeMap::new()), BTreeMap::new())
    }

    pub fn manager_with(
        &self,
        options: ManagerOptions,
        env: EnvSource,
        file_settings: BTreeMap<String, Map<String, Value>>,
    ) -> PluginManager {
        let resolver = ConfigResolver::new(Arc::new(MemoryAdminStore::new()), env)
            .with_file_settings(file_settings);
        PluginManager::new(
            options,
            PackageReader::new(self.reader_options()),
            resolver,
            Arc::clone(&self.host) as Arc<dyn caphost::plugin::PluginHost>,
        )
    }

    /// Write a signed package into the plugins directory.
    pub fn package(&self, manifest: PluginManifest) -> PathBuf {
        self.write(PackageBuilder::new(manifest), Some(&self.key))
    }

    /// Write a package built by `builder` into the plugins directory.
    pub fn write(&self, builder: PackageBuilder, key: Option<&SigningKey>) -> PathBuf {
        let manifest = builder.seal(None).unwrap();
        let path = self.plugins_dir().join(format!("{}-{}.xpkg", manifest.id, manifest.version));
        builder.write(&path, key).unwrap();
        path
    }
}

/// Manifest with the given capabilities served by `target`.
pub fn manifest(id: &str, version: &str, target: &str, capabilities: Value) -> PluginManifest {
    serde_json::from_value(json!({
        "id": id,
        "name": id,
        "version": version,
        "provider": id,
        "capabilities": capabilities,
        "entrypoint": {"kind": "builtin", "target": target},
        "config_schema": {
            "type": "object",
            "properties": {
                "api_key": {"type": "string", "default": ""},
                "dimensions": {"type": "integer", "default": 8, "minimum": 1, "maximum": 4096}
            }
        }
    }))
    .unwrap()
}

/// The DashScope-style provider: embedding and chat.
pub fn dashscope(version: &str) -> PluginManifest {
    manifest(
        "dashscope",
        version,
        MOCK,
        json!([
            {"type": "embedding", "models": ["text-embedding-v2"]},
            {"type": "chat", "models": ["qwen-turbo", "qwen-max"]}
        ]),
    )
}

/// Chat request with one user message and the plugin's default model.
pub fn chat(text: &str) -> ChatRequest {
    ChatRequest { messages: vec![ChatMessage::user(text)], ..ChatRequest::default() }
}
