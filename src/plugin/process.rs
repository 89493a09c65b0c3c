//! Out-of-process plugins.
//!
//! [`ProcessHost`] starts the package's executable with a cleared
//! environment inside its scratch directory and talks newline-delimited
//! JSON-RPC 2.0 over the child's stdio. Requests are multiplexed: a reader
//! task routes responses to waiting callers by id and `chat/chunk`
//! notifications to the sink of the streaming call they belong to.

use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex};

use super::{
    CallContext, Capability, ChatModel, ChatRequest, ChatResponse, ChunkSink, Embedder, Plugin,
    PluginError, PluginHost, PluginInfo, PluginManifest, PluginResult, RerankDocument,
    RerankResult, Reranker, ResolvedConfig, ValidatedPackage,
};
use crate::rpc::protocol::{JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, RequestId};

/// Methods a plugin process must answer.
pub mod wire {
    pub const INITIALIZE: &str = "initialize";
    pub const CLEANUP: &str = "cleanup";
    pub const EMBED: &str = "embed";
    pub const EMBED_BATCH: &str = "embed_batch";
    pub const RERANK: &str = "rerank";
    pub const CHAT: &str = "chat";
    pub const CHAT_STREAM: &str = "chat_stream";
    /// Notification sent by the plugin for each streamed delta.
    pub const CHAT_CHUNK: &str = "chat/chunk";
}

/// Grace period for a plugin process to exit after `cleanup`.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Host that runs each plugin as a child process.
#[derive(Debug, Clone, Default)]
pub struct ProcessHost {
    env: BTreeMap<String, String>,
}

impl ProcessHost {
    /// Create a host that passes no environment to plugins.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pass one variable to every plugin process.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
impl PluginHost for ProcessHost {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn instantiate(&self, package: &ValidatedPackage) -> PluginResult<Box<dyn Plugin>> {
        let manifest = package.manifest();
        let binary = package.payload_path(&manifest.entrypoint_target());
        if !binary.is_file() {
            return Err(PluginError::InitFailure {
                plugin: manifest.id.clone(),
                message: format!("entrypoint {} not found in payload", binary.display()),
            });
        }

        let mut child = Command::new(&binary)
            .current_dir(package.scratch_path())
            .env_clear()
            .envs(&self.env)
            .env("CAPHOST_PLUGIN_ID", &manifest.id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PluginError::InitFailure {
                plugin: manifest.id.clone(),
                message: format!("failed to start {}: {e}", binary.display()),
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(PluginError::InitFailure {
                plugin: manifest.id.clone(),
                message: "plugin process has no stdio".to_string(),
            });
        };

        if let Some(stderr) = child.stderr.take() {
            let id = manifest.id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(plugin_id = %id, "{line}");
                }
            });
        }

        tracing::info!(plugin_id = %manifest.id, pid = child.id(), "started plugin process");

        let conn = Connection::start(manifest.id.clone(), stdin, stdout);
        Ok(Box::new(ProcessPlugin {
            manifest: manifest.clone(),
            conn,
            child: Mutex::new(Some(child)),
            ready: AtomicBool::new(false),
            dimensions: AtomicUsize::new(0),
            _scratch: package.scratch_handle(),
        }))
    }
}

type Pending = parking_lot::Mutex<HashMap<i64, oneshot::Sender<JsonRpcResponse>>>;

/// Request/response multiplexer over one child's stdio.
struct Connection {
    plugin_id: String,
    writer: Mutex<ChildStdin>,
    next_id: AtomicI64,
    pending: Arc<Pending>,
    streams: Arc<parking_lot::Mutex<HashMap<i64, ChunkSink>>>,
    closed: Arc<AtomicBool>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChunkNotification {
    request_id: i64,
    delta: String,
}

impl Connection {
    fn start(plugin_id: String, stdin: ChildStdin, stdout: ChildStdout) -> Arc<Self> {
        let conn = Arc::new(Self {
            plugin_id,
            writer: Mutex::new(stdin),
            next_id: AtomicI64::new(1),
            pending: Arc::default(),
            streams: Arc::default(),
            closed: Arc::new(AtomicBool::new(false)),
        });

        let pending = Arc::clone(&conn.pending);
        let streams = Arc::clone(&conn.streams);
        let closed = Arc::clone(&conn.closed);
        let id = conn.plugin_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => route(&id, &line, &pending, &streams).await,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(plugin_id = %id, error = %e, "plugin stdout read failed");
                        break;
                    }
                }
            }
            closed.store(true, Ordering::Release);
            // Dropping the senders fails every waiting call.
            pending.lock().clear();
            tracing::debug!(plugin_id = %id, "plugin process closed its output");
        });

        conn
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        ctx: &CallContext,
    ) -> PluginResult<T> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.request_with_id(id, method, params, ctx).await
    }

    async fn request_with_id<T: DeserializeOwned>(
        &self,
        id: i64,
        method: &str,
        params: Value,
        ctx: &CallContext,
    ) -> PluginResult<T> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.exited());
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let request = JsonRpcRequest::new(id, method, Some(params));
        if let Err(e) = self.write(&request).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        let deadline = ctx.remaining().unwrap_or(Duration::MAX);
        let response = tokio::select! {
            r = rx => r.map_err(|_| self.exited()),
            () = ctx.cancelled() => Err(PluginError::Cancelled(self.plugin_id.clone())),
            () = tokio::time::sleep(deadline) => {
                Err(PluginError::CallTimeout(self.plugin_id.clone(), deadline))
            }
        };

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                self.pending.lock().remove(&id);
                return Err(e);
            }
        };

        response.into_result().map_err(|e| e.into_plugin_error())
    }

    async fn write(&self, request: &JsonRpcRequest) -> PluginResult<()> {
        let mut line = serde_json::to_string(request)
            .map_err(|e| PluginError::RuntimeFailure(format!("Failed to encode request: {e}")))?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    fn exited(&self) -> PluginError {
        PluginError::RuntimeFailure(format!("plugin process '{}' exited", self.plugin_id))
    }
}

async fn route(
    plugin_id: &str,
    line: &str,
    pending: &Pending,
    streams: &parking_lot::Mutex<HashMap<i64, ChunkSink>>,
) {
    match JsonRpcMessage::parse(line) {
        Ok(JsonRpcMessage::Response(response)) => {
            let RequestId::Number(id) = response.id else {
                tracing::warn!(plugin_id, "response with non-numeric id");
                return;
            };
            if let Some(tx) = pending.lock().remove(&id) {
                let _ = tx.send(response);
            }
        }
        Ok(JsonRpcMessage::Notification(note)) if note.method == wire::CHAT_CHUNK => {
            let chunk = note.params.and_then(|p| serde_json::from_value::<ChunkNotification>(p).ok());
            let Some(chunk) = chunk else {
                tracing::warn!(plugin_id, "malformed chat/chunk notification");
                return;
            };
            let sink = streams.lock().get(&chunk.request_id).cloned();
            if let Some(sink) = sink {
                if let Err(e) = sink.send(chunk.delta).await {
                    tracing::debug!(plugin_id, error = %e, "dropping chunk");
                }
            }
        }
        Ok(other) => tracing::debug!(plugin_id, message = ?other, "ignoring plugin message"),
        Err(e) => tracing::warn!(plugin_id, error = %e, "unparseable plugin output"),
    }
}

#[derive(Deserialize, Default)]
struct InitializeResult {
    #[serde(default)]
    dimensions: Option<usize>,
}

/// Plugin instance backed by a child process.
pub struct ProcessPlugin {
    manifest: PluginManifest,
    conn: Arc<Connection>,
    child: Mutex<Option<Child>>,
    ready: AtomicBool,
    dimensions: AtomicUsize,
    _scratch: Arc<TempDir>,
}

impl std::fmt::Debug for ProcessPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessPlugin")
            .field("id", &self.manifest.id)
            .field("ready", &self.ready.load(Ordering::Relaxed))
            .finish()
    }
}

#[async_trait]
impl Plugin for ProcessPlugin {
    fn metadata(&self) -> PluginInfo {
        self.manifest.info()
    }

    async fn initialize(&self, config: &ResolvedConfig, ctx: &CallContext) -> PluginResult<()> {
        let params = json!({ "pluginId": self.manifest.id, "config": config.settings() });
        let result: Option<InitializeResult> =
            self.conn.request(wire::INITIALIZE, params, ctx).await?;
        let dimensions = result.unwrap_or_default().dimensions.unwrap_or(0);
        if dimensions == 0 && self.manifest.has_capability(Capability::Embedding) {
            return Err(PluginError::InitFailure {
                plugin: self.manifest.id.clone(),
                message: "embedding plugin reported no dimensions".into(),
            });
        }
        self.dimensions.store(dimensions, Ordering::Release);
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    fn ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    async fn cleanup(&self, ctx: &CallContext) -> PluginResult<()> {
        self.ready.store(false, Ordering::Release);
        let outcome: PluginResult<Value> = self.conn.request(wire::CLEANUP, json!({}), ctx).await;

        let Some(mut child) = self.child.lock().await.take() else {
            return outcome.map(|_| ());
        };
        // Closing stdin tells a well-behaved plugin to exit.
        let _ = self.conn.writer.lock().await.shutdown().await;
        match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(plugin_id = %self.manifest.id, %status, "plugin process exited");
            }
            _ => {
                tracing::warn!(plugin_id = %self.manifest.id, "killing plugin process");
                child.kill().await?;
            }
        }
        outcome.map(|_| ())
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
impl Embedder for ProcessPlugin {
    async fn embed(&self, text: &str, ctx: &CallContext) -> PluginResult<Vec<f32>> {
        self.conn.request(wire::EMBED, json!({ "text": text }), ctx).await
    }

    async fn embed_batch(&self, texts: &[String], ctx: &CallContext) -> PluginResult<Vec<Vec<f32>>> {
        self.conn.request(wire::EMBED_BATCH, json!({ "texts": texts }), ctx).await
    }

    fn dimensions(&self) -> usize {
        self.dimensions.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Reranker for ProcessPlugin {
    async fn rerank(
        &self,
        query: &str,
        documents: &[RerankDocument],
        ctx: &CallContext,
    ) -> PluginResult<Vec<RerankResult>> {
        self.conn.request(wire::RERANK, json!({ "query": query, "documents": documents }), ctx).await
    }
}

#[async_trait]
impl ChatModel for ProcessPlugin {
    async fn chat(&self, request: &ChatRequest, ctx: &CallContext) -> PluginResult<ChatResponse> {
        let params = serde_json::to_value(request)
            .map_err(|e| PluginError::validation("request", e.to_string()))?;
        self.conn.request(wire::CHAT, params, ctx).await
    }

    async fn chat_stream(
        &self,
        request: &ChatRequest,
        sink: &ChunkSink,
        ctx: &CallContext,
    ) -> PluginResult<()> {
        let params = serde_json::to_value(request)
            .map_err(|e| PluginError::validation("request", e.to_string()))?;
        let id = self.conn.next_id.fetch_add(1, Ordering::SeqCst);
        self.conn.streams.lock().insert(id, sink.clone());
        let outcome: PluginResult<Value> =
            self.conn.request_with_id(id, wire::CHAT_STREAM, params, ctx).await;
        self.conn.streams.lock().remove(&id);
        outcome.map(|_| ())
    }
}
