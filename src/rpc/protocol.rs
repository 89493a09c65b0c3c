//! JSON-RPC 2.0 message types and the `plugin/*` method surface.
//!
//! Messages are exchanged one JSON object per line. The same framing is used
//! between an RPC client and the host, and between the host and
//! out-of-process plugins.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::plugin::{
    Capability, ChatEvent, ChatRequest, ErrorInfo, ErrorKind, PluginError, PluginSnapshot,
};

/// JSON-RPC version string.
pub const JSONRPC_VERSION: &str = "2.0";

/// Method names served by the host.
pub mod methods {
    pub const DISCOVER: &str = "plugin/discover";
    pub const LOAD: &str = "plugin/load";
    pub const UNLOAD: &str = "plugin/unload";
    pub const ENABLE: &str = "plugin/enable";
    pub const DISABLE: &str = "plugin/disable";
    pub const RELOAD_CONFIG: &str = "plugin/reloadConfig";
    pub const UPGRADE: &str = "plugin/upgrade";
    pub const GET: &str = "plugin/get";
    pub const LIST: &str = "plugin/list";
    pub const DISPATCH: &str = "plugin/dispatch";
    pub const CHAT_STREAM: &str = "plugin/chatStream";
    /// Notification carrying one chat stream event.
    pub const CHAT_CHUNK: &str = "plugin/chatChunk";
}

/// Standard JSON-RPC error codes.
pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Base of the plugin error range. Each [`ErrorKind`](crate::plugin::ErrorKind)
    /// has its own code below it.
    pub const PLUGIN_ERROR_BASE: i32 = -32000;
}

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,
    /// Request ID
    pub id: RequestId,
    /// Method name
    pub method: String,
    /// Parameters (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self { jsonrpc: JSONRPC_VERSION.to_string(), id: id.into(), method: method.into(), params }
    }

    /// Deserialize the params, treating absent params as `null`.
    pub fn parse_params<T: for<'de> Deserialize<'de>>(&self) -> Result<T, JsonRpcError> {
        let params = self.params.clone().unwrap_or(Value::Null);
        serde_json::from_value(params).map_err(|e| JsonRpcError::invalid_params(e.to_string()))
    }
}

/// JSON-RPC request ID (can be string, number or null).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric ID
    Number(i64),
    /// String ID
    String(String),
    /// Null ID (only in responses to unparseable requests)
    Null,
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version
    pub jsonrpc: String,
    /// Request ID
    pub id: RequestId,
    /// Result (if successful)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error (if failed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Successful response.
    pub fn success(id: RequestId, result: Value) -> Self {
        Self { jsonrpc: JSONRPC_VERSION.to_string(), id, result: Some(result), error: None }
    }

    /// Error response.
    pub fn failure(id: RequestId, error: JsonRpcError) -> Self {
        Self { jsonrpc: JSONRPC_VERSION.to_string(), id, result: None, error: Some(error) }
    }

    /// Check if the response is successful.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Get the result value.
    pub fn into_result<T: for<'de> Deserialize<'de>>(self) -> Result<T, JsonRpcError> {
        if let Some(error) = self.error {
            return Err(error);
        }

        let result = self.result.unwrap_or(Value::Null);
        serde_json::from_value(result)
            .map_err(|e| JsonRpcError::internal(format!("Failed to parse result: {e}")))
    }
}

/// JSON-RPC 2.0 error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code
    pub code: i32,
    /// Error message
    pub message: String,
    /// Additional data; `{kind, message}` for plugin errors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), data: None }
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(codes::PARSE_ERROR, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_REQUEST, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, message)
    }

    /// Structured plugin error carried in `data`, if any.
    pub fn error_info(&self) -> Option<ErrorInfo> {
        self.data.clone().and_then(|d| serde_json::from_value(d).ok())
    }

    /// Convert back into a [`PluginError`].
    pub fn into_plugin_error(self) -> PluginError {
        match self.error_info() {
            Some(info) => info.into(),
            None => PluginError::RuntimeFailure(self.message),
        }
    }
}

impl From<ErrorInfo> for JsonRpcError {
    fn from(info: ErrorInfo) -> Self {
        Self {
            code: plugin_error_code(info.kind),
            message: info.message.clone(),
            data: serde_json::to_value(&info).ok(),
        }
    }
}

impl From<&PluginError> for JsonRpcError {
    fn from(err: &PluginError) -> Self {
        Self::from(err.info())
    }
}

impl From<PluginError> for JsonRpcError {
    fn from(err: PluginError) -> Self {
        Self::from(&err)
    }
}

/// JSON-RPC code for a plugin error kind.
pub fn plugin_error_code(kind: ErrorKind) -> i32 {
    let offset = match kind {
        ErrorKind::MalformedPackage => 1,
        ErrorKind::InvalidManifest => 2,
        ErrorKind::IntegrityError => 3,
        ErrorKind::DependencyError => 4,
        ErrorKind::ValidationError => 5,
        ErrorKind::InitTimeout => 6,
        ErrorKind::InitFailure => 7,
        ErrorKind::InvalidTransition => 8,
        ErrorKind::NotReady => 9,
        ErrorKind::CallTimeout => 10,
        ErrorKind::RuntimeFailure => 11,
        ErrorKind::NotFound => 12,
        ErrorKind::AlreadyLoaded => 13,
        ErrorKind::Unsupported => 14,
        ErrorKind::Cancelled => 15,
        ErrorKind::Io => 16,
        ErrorKind::Config => 17,
    };
    codes::PLUGIN_ERROR_BASE - offset
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for JsonRpcError {}

/// JSON-RPC 2.0 notification (no response expected).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// JSON-RPC version
    pub jsonrpc: String,
    /// Method name
    pub method: String,
    /// Parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Create a notification.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self { jsonrpc: JSONRPC_VERSION.to_string(), method: method.into(), params }
    }
}

/// Any message that can arrive on a line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
}

impl JsonRpcMessage {
    /// Parse one line.
    pub fn parse(line: &str) -> Result<Self, JsonRpcError> {
        let value: Value =
            serde_json::from_str(line).map_err(|e| JsonRpcError::parse_error(e.to_string()))?;
        if value.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Err(JsonRpcError::invalid_request("jsonrpc must be \"2.0\""));
        }
        serde_json::from_value(value).map_err(|e| JsonRpcError::invalid_request(e.to_string()))
    }
}

// ============================================================================
// plugin/* method payloads
// ============================================================================

/// `plugin/discover` params.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoverParams {
    /// Directory to scan; the configured plugins directory when absent.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

/// `plugin/load` params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadParams {
    pub path: PathBuf,
    /// Explicit settings, written to the admin store before loading.
    #[serde(default)]
    pub config: Option<Map<String, Value>>,
}

/// Params naming one plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdParams {
    pub id: String,
}

/// `plugin/reloadConfig` params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReloadConfigParams {
    pub id: String,
    /// New admin settings; the stored ones are kept when absent.
    #[serde(default)]
    pub settings: Option<Map<String, Value>>,
}

/// `plugin/upgrade` params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeParams {
    pub id: String,
    pub path: PathBuf,
}

/// `plugin/list` params.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListParams {
    /// Only ACTIVE plugins with this capability.
    #[serde(default)]
    pub capability: Option<Capability>,
    /// Plugins shipped by this provider, in any state unless `capability` is set too.
    #[serde(default)]
    pub provider: Option<String>,
}

/// `plugin/dispatch` params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchParams {
    pub id: String,
    pub capability: Capability,
    #[serde(default)]
    pub payload: Value,
}

/// `plugin/dispatch` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchResult {
    pub payload: Value,
}

/// `plugin/chatStream` params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatStreamParams {
    pub id: String,
    pub request: ChatRequest,
}

/// `plugin/chatChunk` notification params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatChunkParams {
    /// Id of the `plugin/chatStream` request this event belongs to.
    pub request_id: RequestId,
    pub event: ChatEvent,
}

/// `plugin/list` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResult {
    pub plugins: Vec<PluginSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_request() {
        let msg = JsonRpcMessage::parse(
            r#"{"jsonrpc":"2.0","id":7,"method":"plugin/get","params":{"id":"dashscope"}}"#,
        )
        .unwrap();
        match msg {
            JsonRpcMessage::Request(req) => {
                assert_eq!(req.id, RequestId::Number(7));
                let params: IdParams = req.parse_params().unwrap();
                assert_eq!(params.id, "dashscope");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_parse_notification_and_response() {
        let note =
            JsonRpcMessage::parse(r#"{"jsonrpc":"2.0","method":"chat/chunk","params":{}}"#).unwrap();
        assert!(matches!(note, JsonRpcMessage::Notification(_)));

        let resp = JsonRpcMessage::parse(r#"{"jsonrpc":"2.0","id":"a","result":[1,2]}"#).unwrap();
        assert!(matches!(resp, JsonRpcMessage::Response(_)));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(JsonRpcMessage::parse("{not json").unwrap_err().code, codes::PARSE_ERROR);
        assert_eq!(
            JsonRpcMessage::parse(r#"{"jsonrpc":"1.0","id":1,"method":"x"}"#).unwrap_err().code,
            codes::INVALID_REQUEST
        );
    }

    #[test]
    fn test_plugin_error_mapping() {
        let err = JsonRpcError::from(PluginError::NotFound("qwen".into()));
        assert_eq!(err.code, plugin_error_code(ErrorKind::NotFound));
        assert_eq!(err.data.as_ref().unwrap()["kind"], "NotFound");

        let back = err.into_plugin_error();
        assert_eq!(back.kind(), ErrorKind::NotFound);
        assert!(back.to_string().contains("qwen"));
    }

    #[test]
    fn test_null_id_response() {
        let resp = JsonRpcResponse::failure(RequestId::Null, JsonRpcError::parse_error("bad"));
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["id"], Value::Null);
        assert_eq!(json["error"]["code"], codes::PARSE_ERROR);
    }

    #[test]
    fn test_into_result() {
        let resp = JsonRpcResponse::success(1.into(), json!({"payload": {"vector": [1.0]}}));
        let result: DispatchResult = resp.into_result().unwrap();
        assert_eq!(result.payload["vector"][0], 1.0);
    }
}
