//! JSON-RPC server exposing [`PluginManager`] operations.
//!
//! Each connection reads one request per line and handles requests
//! concurrently; responses and notifications share one ordered writer.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::protocol::{
    methods, ChatChunkParams, ChatStreamParams, DiscoverParams, DispatchParams, DispatchResult,
    IdParams, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    ListParams, ListResult, LoadParams, ReloadConfigParams, RequestId, UpgradeParams,
};
use crate::plugin::{ChatEvent, PluginManager};

/// Lines buffered for the writer before handlers wait.
const OUTBOUND_BUFFER: usize = 64;

type RpcResult = Result<Value, JsonRpcError>;

/// Serves the `plugin/*` methods over line-delimited streams.
#[derive(Debug, Clone)]
pub struct RpcServer {
    manager: Arc<PluginManager>,
}

impl RpcServer {
    /// Create a server over a manager.
    pub fn new(manager: Arc<PluginManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<PluginManager> {
        &self.manager
    }

    /// Serve stdin/stdout until EOF or `shutdown`.
    pub async fn serve_stdio(&self, shutdown: CancellationToken) -> std::io::Result<()> {
        self.serve(tokio::io::stdin(), tokio::io::stdout(), shutdown).await
    }

    /// Accept TCP connections on `addr` until `shutdown`.
    pub async fn listen(&self, addr: &str, shutdown: CancellationToken) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "RPC server listening");
        self.accept(listener, shutdown).await
    }

    /// Accept connections on a bound listener until `shutdown`.
    pub async fn accept(&self, listener: TcpListener, shutdown: CancellationToken) -> std::io::Result<()> {
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    tracing::debug!(%peer, "RPC connection opened");
                    let server = self.clone();
                    let token = shutdown.child_token();
                    connections.spawn(async move {
                        let (reader, writer) = stream.into_split();
                        if let Err(e) = server.serve(reader, writer, token).await {
                            tracing::warn!(%peer, error = %e, "RPC connection failed");
                        }
                        tracing::debug!(%peer, "RPC connection closed");
                    });
                }
            }
        }
        connections.shutdown().await;
        Ok(())
    }

    /// Serve one connection until EOF or `shutdown`.
    ///
    /// Requests in flight at EOF still get their responses.
    pub async fn serve<R, W>(&self, reader: R, writer: W, shutdown: CancellationToken) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
        let writer_task = tokio::spawn(write_lines(writer, rx));

        let mut lines = BufReader::new(reader).lines();
        let mut handlers = JoinSet::new();

        loop {
            let line = tokio::select! {
                () = shutdown.cancelled() => break,
                line = lines.next_line() => line?,
            };
            let Some(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }

            match JsonRpcMessage::parse(&line) {
                Ok(JsonRpcMessage::Request(request)) => {
                    let server = self.clone();
                    let tx = tx.clone();
                    handlers.spawn(async move {
                        let response = server.handle(request, &tx).await;
                        send(&tx, &response).await;
                    });
                }
                Ok(JsonRpcMessage::Notification(note)) => {
                    tracing::debug!(method = %note.method, "ignoring client notification");
                }
                Ok(JsonRpcMessage::Response(_)) => {
                    tracing::debug!("ignoring client response");
                }
                Err(error) => {
                    send(&tx, &JsonRpcResponse::failure(RequestId::Null, error)).await;
                }
            }
        }

        while handlers.join_next().await.is_some() {}
        drop(tx);
        writer_task.await.map_err(std::io::Error::other)?
    }

    /// Handle one request. Notifications it produces go to `out`.
    pub async fn handle(&self, request: JsonRpcRequest, out: &mpsc::Sender<String>) -> JsonRpcResponse {
        let id = request.id.clone();
        tracing::debug!(method = %request.method, "RPC request");

        match self.route(&request, out).await {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(error) => JsonRpcResponse::failure(id, error),
        }
    }

    async fn route(&self, request: &JsonRpcRequest, out: &mpsc::Sender<String>) -> RpcResult {
        match request.method.as_str() {
            methods::DISCOVER => {
                let p: DiscoverParams = params_or_default(request)?;
                to_value(self.manager.discover(p.dir.as_deref()).await)
            }
            methods::LOAD => {
                let p: LoadParams = request.parse_params()?;
                to_value(self.manager.load(&p.path, p.config).await)
            }
            methods::UNLOAD => {
                let p: IdParams = request.parse_params()?;
                to_value(self.manager.unload(&p.id).await)
            }
            methods::ENABLE => {
                let p: IdParams = request.parse_params()?;
                to_value(self.manager.enable(&p.id).await)
            }
            methods::DISABLE => {
                let p: IdParams = request.parse_params()?;
                to_value(self.manager.disable(&p.id).await)
            }
            methods::RELOAD_CONFIG => {
                let p: ReloadConfigParams = request.parse_params()?;
                to_value(self.manager.reload_config(&p.id, p.settings).await)
            }
            methods::UPGRADE => {
                let p: UpgradeParams = request.parse_params()?;
                to_value(self.manager.upgrade(&p.id, &p.path).await)
            }
            methods::GET => {
                let p: IdParams = request.parse_params()?;
                to_value(self.manager.get(&p.id))
            }
            methods::LIST => self.list(request),
            methods::DISPATCH => self.dispatch(request).await,
            methods::CHAT_STREAM => self.chat_stream(request, out).await,
            other => Err(JsonRpcError::method_not_found(other)),
        }
    }

    fn list(&self, request: &JsonRpcRequest) -> RpcResult {
        let p: ListParams = params_or_default(request)?;
        let plugins = match (p.capability, p.provider) {
            (Some(capability), Some(provider)) => self
                .manager
                .list_by_capability(capability)
                .into_iter()
                .filter(|s| s.provider == provider)
                .collect(),
            (Some(capability), None) => self.manager.list_by_capability(capability),
            (None, Some(provider)) => self.manager.list_by_provider(&provider),
            (None, None) => self.manager.list(),
        };
        to_value(Ok(ListResult { plugins }))
    }

    async fn dispatch(&self, request: &JsonRpcRequest) -> RpcResult {
        let p: DispatchParams = request.parse_params()?;
        let payload = self.manager.dispatch(&p.id, p.capability, p.payload).await;
        to_value(payload.map(|payload| DispatchResult { payload }))
    }

    async fn chat_stream(&self, request: &JsonRpcRequest, out: &mpsc::Sender<String>) -> RpcResult {
        let p: ChatStreamParams = request.parse_params()?;
        let mut stream = self.manager.dispatch_stream(&p.id, p.request).await?;

        let mut chunks = 0usize;
        let mut text = String::new();
        while let Some(event) = stream.next_event().await {
            match &event {
                ChatEvent::Chunk(chunk) => {
                    chunks += 1;
                    text.push_str(&chunk.delta);
                }
                ChatEvent::Done => {}
                ChatEvent::Error(info) => {
                    let error = JsonRpcError::from(info.clone());
                    notify(out, &request.id, event).await;
                    return Err(error);
                }
            }
            notify(out, &request.id, event).await;
        }
        Ok(json!({ "chunks": chunks, "text": text }))
    }
}

fn params_or_default<T: DeserializeOwned + Default>(request: &JsonRpcRequest) -> Result<T, JsonRpcError> {
    match &request.params {
        None | Some(Value::Null) => Ok(T::default()),
        Some(_) => request.parse_params(),
    }
}

fn to_value<T: Serialize>(result: crate::plugin::PluginResult<T>) -> RpcResult {
    let value = result.map_err(JsonRpcError::from)?;
    serde_json::to_value(value).map_err(|e| JsonRpcError::internal(e.to_string()))
}

async fn notify(out: &mpsc::Sender<String>, request_id: &RequestId, event: ChatEvent) {
    let params = ChatChunkParams { request_id: request_id.clone(), event };
    match serde_json::to_value(params) {
        Ok(params) => send(out, &JsonRpcNotification::new(methods::CHAT_CHUNK, Some(params))).await,
        Err(e) => tracing::warn!(error = %e, "could not encode chat chunk"),
    }
}

async fn send<T: Serialize>(out: &mpsc::Sender<String>, message: &T) {
    match serde_json::to_string(message) {
        Ok(line) => {
            if out.send(line).await.is_err() {
                tracing::debug!("RPC writer closed, dropping message");
            }
        }
        Err(e) => tracing::warn!(error = %e, "could not encode RPC message"),
    }
}

async fn write_lines<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut rx: mpsc::Receiver<String>,
) -> std::io::Result<()> {
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}
