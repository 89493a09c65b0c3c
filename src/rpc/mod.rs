//! JSON-RPC 2.0 control surface.
//!
//! Exposes the plugin manager as `plugin/*` methods over newline-delimited
//! JSON, on stdio or TCP. Chat streams are delivered as `plugin/chatChunk`
//! notifications followed by the final response.

pub mod protocol;
mod server;

pub use protocol::{
    codes, methods, plugin_error_code, JsonRpcError, JsonRpcMessage, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, RequestId, JSONRPC_VERSION,
};
pub use server::RpcServer;
