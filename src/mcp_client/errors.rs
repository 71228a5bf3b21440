//! Tool-server client error types.

use thiserror::Error;

/// Errors that can occur while supervising or calling tool servers.
#[derive(Debug, Clone, Error)]
pub enum McpError {
    /// A server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// The initialize / initialized / tools-list sequence did not complete.
    #[error("server '{name}' handshake failed: {reason}")]
    HandshakeFailed {
        name: String,
        reason: String,
    },

    /// The handshake completed but the server exports nothing callable.
    #[error("server '{name}' advertised no tools")]
    NoToolsAdvertised {
        name: String,
    },

    /// No response arrived within the per-call timeout.
    #[error("'{method}' on server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// The byte stream to the server ended; every pending call fails with this.
    #[error("transport to server '{server}' closed")]
    TransportClosed {
        server: String,
    },

    /// I/O or encoding failure while writing to the server.
    #[error("transport error for server '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Tool not found in the aggregated registry.
    #[error("unknown tool: '{name}'")]
    UnknownTool {
        name: String,
    },

    /// Server name not present in the pool configuration.
    #[error("unknown server: '{name}'")]
    UnknownServer {
        name: String,
    },

    /// Tool call arguments failed schema validation.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments {
        tool: String,
        reason: String,
    },

    /// The tool ran and reported a failure.
    #[error("tool '{tool}' failed: {message}")]
    ToolExecutionFailed {
        tool: String,
        message: String,
    },

    /// The server is temporarily disabled after advertising no tools.
    #[error("server '{name}' is disabled for another {remaining_secs}s")]
    ServerDisabled {
        name: String,
        remaining_secs: u64,
    },

    /// Configuration error (missing servers, bad config file).
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },
}

impl McpError {
    /// True for per-call timeouts, which leave the process usable.
    pub fn is_timeout(&self) -> bool {
        matches!(self, McpError::Timeout { .. })
    }

    /// True when the process behind the transport is gone.
    pub fn is_transport_closed(&self) -> bool {
        matches!(self, McpError::TransportClosed { .. })
    }
}
