//! JSON-RPC 2.0 envelope types and a minimal OpenRPC document model.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The protocol version stamped on every request.
pub const JSONRPC_VERSION: &str = "2.0";

/// An outbound JSON-RPC request as handed to the request handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
    pub id: u64,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: Value, id: u64) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id,
        }
    }
}

/// A JSON-RPC response envelope. Exactly one of `result`/`error` is set by
/// conforming servers; the engine tolerates bare values as well.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

/// The error member of a JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// ---------------------------------------------------------------------------
// OpenRPC (method discovery)
// ---------------------------------------------------------------------------

/// The subset of an OpenRPC document the engine cares about: the method
/// list returned by `rpc.discover`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRpcDocument {
    #[serde(default)]
    pub openrpc: String,
    #[serde(default)]
    pub methods: Vec<OpenRpcMethod>,
}

impl OpenRpcDocument {
    /// Names of all declared methods.
    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.iter().map(|m| m.name.as_str())
    }
}

/// A method entry within an OpenRPC document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRpcMethod {
    pub name: String,
}
