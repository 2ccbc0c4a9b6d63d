//! Shared types for the federation core.
//!
//! JSON-RPC 2.0 wire messages spoken to downstream servers, the normalized
//! capability model, and the invocation request/result pair.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::errors::{ErrorKind, GatewayError};

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// Payload of the `initialize` response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InitializeResult {
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// Protocol revision announced during the handshake.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

// ─── Error Codes ─────────────────────────────────────────────────────────────

/// Well-known JSON-RPC codes plus the gateway's own range.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Backend unreachable or disconnected.
    pub const CONNECTION_ERROR: i64 = -32010;
    /// Backend sent a malformed reply.
    pub const PROTOCOL_ERROR: i64 = -32011;
    /// Deadline exceeded.
    pub const TIMEOUT: i64 = -32012;
    /// Unknown capability.
    pub const NOT_FOUND: i64 = -32013;
    /// Namespace collision.
    pub const CONFLICT: i64 = -32014;
    /// A tool reported `isError: true`.
    pub const TOOL_ERROR: i64 = -32015;
}

// ─── Capabilities ────────────────────────────────────────────────────────────

/// The three capability shapes a protocol server can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Tool,
    Prompt,
    Resource,
}

impl CapabilityKind {
    /// Label used in logs and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tool => "tool",
            Self::Prompt => "prompt",
            Self::Resource => "resource",
        }
    }
}

/// Where a capability comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Backend,
    WrappedApi,
}

/// Normalized representation of one tool, prompt, or resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilityDescriptor {
    pub kind: CapabilityKind,
    /// Globally unique name (per kind), assigned by the registry.
    pub qualified_name: String,
    /// Name (or URI, for resources) as the owner exposes it.
    pub raw_name: String,
    pub owner_id: String,
    pub description: String,
    pub schema: serde_json::Value,
    pub origin: Origin,
    /// Side-effect-free capabilities may be retried on transient failure.
    pub read_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl CapabilityDescriptor {
    /// Create a descriptor whose qualified name is, for now, its raw name.
    pub fn new(kind: CapabilityKind, raw_name: &str, owner_id: &str, origin: Origin) -> Self {
        Self {
            kind,
            qualified_name: raw_name.to_string(),
            raw_name: raw_name.to_string(),
            owner_id: owner_id.to_string(),
            description: String::new(),
            schema: serde_json::json!({ "type": "object", "properties": {} }),
            origin,
            read_only: kind != CapabilityKind::Tool,
            mime_type: None,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_mime_type(mut self, mime_type: Option<String>) -> Self {
        self.mime_type = mime_type;
        self
    }
}

/// Listing row handed to transports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogEntry {
    pub qualified_name: String,
    pub description: String,
    pub schema: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl From<&CapabilityDescriptor> for CatalogEntry {
    fn from(d: &CapabilityDescriptor) -> Self {
        Self {
            qualified_name: d.qualified_name.clone(),
            description: d.description.clone(),
            schema: d.schema.clone(),
            mime_type: d.mime_type.clone(),
        }
    }
}

/// Content returned by `read_resource`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceContent {
    pub uri: String,
    pub mime_type: Option<String>,
    /// Text content, or base64 for binary blobs.
    pub content: String,
    pub is_blob: bool,
}

// ─── Sessions ────────────────────────────────────────────────────────────────

/// Downstream transport kind, chosen at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Http,
}

/// Backend session connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    Degraded,
    /// Reconnect attempts exhausted. Terminal.
    Failed,
}

impl SessionState {
    /// Whether calls may be routed to the session.
    pub fn accepts_calls(&self) -> bool {
        matches!(self, Self::Ready | Self::Degraded)
    }
}

// ─── Invocation ──────────────────────────────────────────────────────────────

/// A single capability invocation.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub kind: CapabilityKind,
    pub qualified_name: String,
    pub arguments: serde_json::Value,
    pub request_id: String,
    pub deadline: Instant,
}

impl InvocationRequest {
    /// Create a request with a fresh id and an absolute deadline.
    pub fn new(
        kind: CapabilityKind,
        qualified_name: &str,
        arguments: serde_json::Value,
        deadline: Instant,
    ) -> Self {
        Self {
            kind,
            qualified_name: qualified_name.to_string(),
            arguments,
            request_id: uuid::Uuid::new_v4().to_string(),
            deadline,
        }
    }

    /// Create a request whose deadline is `timeout` from now.
    pub fn with_timeout(
        kind: CapabilityKind,
        qualified_name: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> Self {
        Self::new(kind, qualified_name, arguments, Instant::now() + timeout)
    }
}

/// Terminal outcome of a dispatch.
#[derive(Debug, Clone)]
pub enum Outcome {
    Succeeded(serde_json::Value),
    Failed(GatewayError),
}

/// Result of an invocation, tagged for observability.
#[derive(Debug, Clone)]
pub struct InvocationResult {
    pub request_id: String,
    pub qualified_name: String,
    pub outcome: Outcome,
    /// Attempts that reached execution (0 if the request never got that far).
    pub attempts: u32,
    pub latency: Duration,
}

impl InvocationResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Succeeded(_))
    }

    /// The payload, if the invocation succeeded.
    pub fn payload(&self) -> Option<&serde_json::Value> {
        match &self.outcome {
            Outcome::Succeeded(v) => Some(v),
            Outcome::Failed(_) => None,
        }
    }

    /// The error, if the invocation failed.
    pub fn error(&self) -> Option<&GatewayError> {
        match &self.outcome {
            Outcome::Succeeded(_) => None,
            Outcome::Failed(e) => Some(e),
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error().map(GatewayError::kind)
    }

    pub fn into_result(self) -> Result<serde_json::Value, GatewayError> {
        match self.outcome {
            Outcome::Succeeded(v) => Ok(v),
            Outcome::Failed(e) => Err(e),
        }
    }

    /// JSON view for transports and admin surfaces.
    pub fn to_json(&self) -> serde_json::Value {
        let mut out = serde_json::json!({
            "request_id": self.request_id,
            "qualified_name": self.qualified_name,
            "success": self.is_success(),
            "attempts": self.attempts,
            "latency_ms": self.latency.as_millis() as u64,
        });
        match &self.outcome {
            Outcome::Succeeded(v) => out["result"] = v.clone(),
            Outcome::Failed(e) => {
                out["error"] = serde_json::json!({
                    "kind": e.kind(),
                    "code": e.error_object().code,
                    "message": e.to_string(),
                });
            }
        }
        out
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_rpc_request_serialization() {
        let req = JsonRpcRequest::new(1, "initialize", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"method\":\"initialize\""));
        // params should be omitted when None
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_json_rpc_error_response() {
        let json = r#"{
            "jsonrpc": "2.0",
            "id": 2,
            "error": {"code": -32601, "message": "Method not found"}
        }"#;
        let resp: JsonRpcResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.id, Some(2));
        assert_eq!(resp.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_initialize_result_aliases() {
        let json = r#"{"capabilities": {"tools": {}}, "serverInfo": {"name": "notes", "version": "1.0"}}"#;
        let init: InitializeResult = serde_json::from_str(json).unwrap();
        assert_eq!(init.server_info.unwrap().name.as_deref(), Some("notes"));
        assert!(init.capabilities.get("tools").is_some());
    }

    #[test]
    fn test_descriptor_defaults() {
        let tool = CapabilityDescriptor::new(CapabilityKind::Tool, "search", "a", Origin::Backend);
        assert_eq!(tool.qualified_name, "search");
        assert!(!tool.read_only, "tools are side-effecting unless marked");

        let prompt =
            CapabilityDescriptor::new(CapabilityKind::Prompt, "greet", "a", Origin::Backend);
        assert!(prompt.read_only);
    }

    #[test]
    fn test_failed_result_json() {
        let result = InvocationResult {
            request_id: "r1".into(),
            qualified_name: "a:search".into(),
            outcome: Outcome::Failed(GatewayError::Timeout {
                target: "a".into(),
                elapsed_ms: 2000,
            }),
            attempts: 1,
            latency: Duration::from_millis(2000),
        };
        let json = result.to_json();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["kind"], "timeout");
        assert_eq!(json["attempts"], 1);
        assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
    }
}
