//! JSON-RPC 2.0 message shapes for the LSP conversation.
//!
//! Results stay `serde_json::Value` at this layer; projecting them onto
//! typed symbol or location records is the caller's concern.

use std::path::Path;

use serde::Deserialize;
use serde_json::{json, Value};

/// Unique identifier for client-to-server requests.
pub type RequestId = u64;

/// LSP lifecycle methods.
pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED: &str = "initialized";
pub const METHOD_SHUTDOWN: &str = "shutdown";
pub const METHOD_EXIT: &str = "exit";

/// Query methods issued through the facade's convenience wrappers.
pub const METHOD_DEFINITION: &str = "textDocument/definition";
pub const METHOD_REFERENCES: &str = "textDocument/references";
pub const METHOD_DOCUMENT_SYMBOL: &str = "textDocument/documentSymbol";
pub const METHOD_WORKSPACE_SYMBOL: &str = "workspace/symbol";
pub const METHOD_HOVER: &str = "textDocument/hover";

/// Document synchronization notifications.
pub const METHOD_DID_OPEN: &str = "textDocument/didOpen";
pub const METHOD_DID_CLOSE: &str = "textDocument/didClose";

/// Server-to-client traffic we acknowledge but do not act on.
const IGNORED_SERVER_METHODS: &[&str] = &[
    "window/logMessage",
    "$/progress",
    "textDocument/publishDiagnostics",
];

pub(crate) fn is_ignored_server_method(method: &str) -> bool {
    IGNORED_SERVER_METHODS.contains(&method)
}

/// Builds a client-to-server request envelope.
pub(crate) fn request(id: RequestId, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

/// Builds a notification envelope (no `id`, no reply expected).
pub(crate) fn notification(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    })
}

/// Builds the empty-result reply we return for server-to-client requests,
/// echoing the server's own id so it is not left blocked.
pub(crate) fn empty_response(id: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": Value::Null,
    })
}

/// Error member of a JSON-RPC response envelope.
#[derive(Debug, Deserialize)]
pub(crate) struct RpcError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

/// A message read off a server's stdout, classified.
#[derive(Debug)]
pub(crate) enum Incoming {
    /// Reply to one of our requests.
    Response {
        id: RequestId,
        result: Option<Value>,
        error: Option<RpcError>,
    },
    /// Server-initiated request carrying its own id; must be answered.
    ServerRequest { id: Value, method: String },
    /// Server-initiated notification.
    Notification { method: String },
}

/// Classifies a decoded JSON value. Returns `None` for shapes that are not
/// JSON-RPC at all.
pub(crate) fn decode_message(value: Value) -> Option<Incoming> {
    let has_id = value.get("id").is_some();
    let method = value
        .get("method")
        .and_then(Value::as_str)
        .map(str::to_owned);

    match (has_id, method) {
        (true, Some(method)) => {
            let id = value.get("id").cloned().unwrap_or(Value::Null);
            Some(Incoming::ServerRequest { id, method })
        }
        (false, Some(method)) => Some(Incoming::Notification { method }),
        (true, None) => {
            let id = parse_request_id(value.get("id")?)?;
            let result = value.get("result").cloned();
            let error = value
                .get("error")
                .cloned()
                .and_then(|raw| serde_json::from_value(raw).ok());
            Some(Incoming::Response { id, result, error })
        }
        (false, None) => None,
    }
}

fn parse_request_id(value: &Value) -> Option<RequestId> {
    if let Some(num) = value.as_u64() {
        return Some(num);
    }
    value.as_str().and_then(|s| s.parse::<RequestId>().ok())
}

/// Parameters for the `initialize` handshake.
///
/// `processId` is deliberately null: the supervisor does not want servers
/// exiting when an unrelated parent pid disappears. The capability object
/// declares interest in the navigation requests the facade issues.
pub(crate) fn initialize_params(workspace_root: &Path) -> Value {
    json!({
        "processId": Value::Null,
        "rootUri": file_uri(workspace_root),
        "capabilities": {
            "textDocument": {
                "definition": { "dynamicRegistration": false },
                "references": { "dynamicRegistration": false },
                "documentSymbol": { "dynamicRegistration": false },
                "hover": { "dynamicRegistration": false },
            },
            "workspace": {
                "symbol": { "dynamicRegistration": false },
            },
        },
    })
}

/// `file://` URI for a workspace path.
pub(crate) fn file_uri(path: &Path) -> String {
    format!("file://{}", path.display())
}
