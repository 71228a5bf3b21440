//! Shared types for the tool-server client.
//!
//! JSON-RPC 2.0 envelopes, MCP protocol payloads, and the server/pool
//! configuration sections.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::inference::types::ModelTier;

/// JSON-RPC protocol version sent on every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision announced during `initialize`.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// Outbound JSON-RPC 2.0 message. A request without an `id` is a notification.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: Some(id),
            method: method.to_string(),
            params,
        }
    }

    /// Create a notification (no id, no response expected).
    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: None,
            method: method.to_string(),
            params,
        }
    }
}

/// Any inbound JSON-RPC message before classification.
///
/// Responses carry `id` plus `result` or `error`; server-initiated requests
/// carry `id` plus `method`; notifications carry only `method`.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

/// Classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageKind {
    /// Response to one of our requests.
    Response { id: u64 },
    /// The server is asking us something.
    ServerRequest { id: Value, method: String },
    /// Fire-and-forget message from the server.
    Notification { method: String },
    /// Valid JSON, but not a JSON-RPC shape we understand.
    Invalid,
}

impl InboundMessage {
    /// Decide what kind of message this is.
    pub fn kind(&self) -> MessageKind {
        match (&self.id, &self.method) {
            (Some(id), Some(method)) => MessageKind::ServerRequest {
                id: id.clone(),
                method: method.clone(),
            },
            (Some(id), None) => match numeric_id(id) {
                Some(id) => MessageKind::Response { id },
                None => MessageKind::Invalid,
            },
            (None, Some(method)) => MessageKind::Notification {
                method: method.clone(),
            },
            (None, None) => MessageKind::Invalid,
        }
    }
}

/// Request ids are numeric on the way out; some servers echo them as strings.
fn numeric_id(id: &Value) -> Option<u64> {
    match id {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// Whether a tool may run without an explicit approval round trip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyClass {
    /// Runs immediately.
    #[default]
    Auto,
    /// Needs approval before `tools/call` is sent.
    Confirm,
}

/// MCP behavioural hints attached to a tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolAnnotations {
    #[serde(default, alias = "readOnlyHint")]
    pub read_only_hint: Option<bool>,
    #[serde(default, alias = "destructiveHint")]
    pub destructive_hint: Option<bool>,
}

/// Tool definition as advertised by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "inputSchema", alias = "parameters")]
    pub input_schema: Value,
    #[serde(default)]
    pub safety: Option<SafetyClass>,
    #[serde(default, alias = "confirmationRequired")]
    pub confirmation_required: bool,
    #[serde(default, alias = "preferredTier", alias = "tier")]
    pub preferred_tier: Option<ModelTier>,
    #[serde(default)]
    pub annotations: Option<ToolAnnotations>,
}

/// `tools/list` response page.
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<McpToolDefinition>,
    #[serde(default, alias = "nextCursor")]
    pub next_cursor: Option<String>,
}

/// MCP initialize response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// `tools/call` result payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<Value>,
    #[serde(default, alias = "isError")]
    pub is_error: bool,
    #[serde(default, alias = "structuredContent")]
    pub structured_content: Option<Value>,
}

impl CallToolResult {
    /// Render the content blocks as plain text for the model.
    ///
    /// Text blocks are joined with newlines; other block types become a
    /// short placeholder. Falls back to the structured payload when there
    /// is no content at all.
    pub fn text(&self) -> String {
        let parts: Vec<String> = self
            .content
            .iter()
            .map(|block| match block.get("text").and_then(Value::as_str) {
                Some(text) => text.to_string(),
                None => {
                    let kind = block.get("type").and_then(Value::as_str).unwrap_or("unknown");
                    format!("[{kind} content]")
                }
            })
            .collect();

        if parts.is_empty() {
            return self
                .structured_content
                .as_ref()
                .map(Value::to_string)
                .unwrap_or_default();
        }
        parts.join("\n")
    }
}

// ─── Configuration ───────────────────────────────────────────────────────────

/// One tool server entry from the `servers` config section.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Per-server working directory (overrides the global working_dir).
    #[serde(default)]
    pub cwd: Option<String>,
    /// Notification the server emits once it can answer `tools/list`.
    /// When unset, the handshake goes straight to `tools/list` with the
    /// readiness timeout.
    #[serde(default)]
    pub ready_notification: Option<String>,
    /// Safety class for tools that do not declare one.
    #[serde(default)]
    pub default_safety: Option<SafetyClass>,
    /// Model tier for tools that do not declare one.
    #[serde(default)]
    pub default_tier: Option<ModelTier>,
    /// Per-tool overrides, keyed by tool name.
    #[serde(default)]
    pub tools: HashMap<String, ToolOverride>,
}

/// Operator override for one advertised tool.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolOverride {
    #[serde(default)]
    pub safety: Option<SafetyClass>,
    #[serde(default)]
    pub tier: Option<ModelTier>,
}

/// Top-level tool servers configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpServersConfig {
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
}

/// Timeouts and recovery knobs for the process pool.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolSettings {
    /// Per-call transport timeout.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Bound on the readiness wait during the handshake.
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    /// How long a server that advertised no tools stays disabled.
    #[serde(default = "default_disable_secs")]
    pub disable_secs: u64,
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

fn default_ready_timeout_ms() -> u64 {
    300_000
}

fn default_disable_secs() -> u64 {
    60
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
            ready_timeout_ms: default_ready_timeout_ms(),
            disable_secs: default_disable_secs(),
        }
    }
}

impl PoolSettings {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn disable_for(&self) -> Duration {
        Duration::from_secs(self.disable_secs)
    }
}

// ─── Standard JSON-RPC Error Codes ───────────────────────────────────────────

/// Well-known JSON-RPC error codes.
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
}

// ─── Tests ───────────────────────────────────────────────────────────────────
