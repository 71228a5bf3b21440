//! MCP Client: tool-server supervision over stdio JSON-RPC.
//!
//! This module handles:
//! - Spawning tool-server child processes and the MCP handshake
//! - JSON-RPC 2.0 request/response demultiplexing over process stdio
//! - One-call-at-a-time access per server, with respawn after a crash
//! - Tool discovery, descriptor registration, and argument validation
//!
//! The plan engine reaches tool servers only through [`ProcessPool`].

pub mod errors;
pub mod lifecycle;
pub mod pool;
pub mod registry;
pub mod schema;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use errors::McpError;
pub use lifecycle::{CommandLauncher, Launcher, ManagedProcess, ProcessState};
pub use pool::{ProcessPool, ServerHealth};
pub use registry::{ToolDescriptor, ToolRegistry};
pub use types::{CallToolResult, McpServersConfig, PoolSettings, SafetyClass, ServerConfig};
