/// Request payloads sent during the smoke check, and classification of
/// whatever comes back on the primary stream.
use serde_json::{json, Value};

/// Protocol version advertised in the initialize handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// The `initialize` handshake request.
pub fn initialize_request(id: u64) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "initialize",
        "params": {
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {
                "tools": {}
            },
            "clientInfo": {
                "name": "stdio-probe",
                "version": env!("CARGO_PKG_VERSION"),
            }
        }
    })
}

/// The `tools/list` request.
pub fn tools_list_request(id: u64) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/list"
    })
}

/// What a primary-stream line turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Decodable JSON-RPC response carrying a `result`.
    Result { id: Option<u64>, body: Value },
    /// Decodable JSON-RPC response carrying an `error`.
    Error { id: Option<u64>, body: Value },
    /// Decodable JSON that is neither (e.g. a server-initiated notification).
    Other(Value),
    /// Primary output that is not JSON at all.
    NonJson(String),
}

impl Reply {
    /// True for the two response shapes that answer a request.
    pub fn is_response(&self) -> bool {
        matches!(self, Reply::Result { .. } | Reply::Error { .. })
    }
}

/// Decode one primary-stream line. Non-JSON text is preserved verbatim so
/// the caller can surface it and keep polling.
pub fn classify(line: &str) -> Reply {
    match serde_json::from_str::<Value>(line) {
        Ok(body) => {
            let id = body.get("id").and_then(Value::as_u64);
            if body.get("result").is_some() {
                Reply::Result { id, body }
            } else if body.get("error").is_some() {
                Reply::Error { id, body }
            } else {
                Reply::Other(body)
            }
        }
        Err(_) => Reply::NonJson(line.to_string()),
    }
}
