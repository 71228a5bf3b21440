//! ToolRelay: tool-server supervision and an iterative plan engine.
//!
//! - [`mcp_client`]: spawns MCP tool servers, runs the handshake, and
//!   routes tool calls through a shared process pool
//! - [`inference`]: tiered model backend with a fallback chain
//! - [`agent_core`]: plan engine, tool selector, approval, and sink
//! - [`relay`]: wires one pool to every request

pub mod agent_core;
pub mod config;
pub mod inference;
pub mod logging;
pub mod mcp_client;
pub mod relay;

#[cfg(test)]
mod test_support;

pub use config::RelayConfig;
pub use relay::{Relay, RequestHandle};

/// Return the platform-standard data directory for ToolRelay.
///
/// - macOS: `~/Library/Application Support/toolrelay/`
/// - Windows: `{FOLDERID_RoamingAppData}\toolrelay\`
/// - Linux: `$XDG_DATA_HOME/toolrelay/` (fallback `~/.local/share/toolrelay/`)
///
/// Falls back to `~/.toolrelay/` only if none of the above can be resolved.
pub(crate) fn data_dir() -> std::path::PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("toolrelay");
    }
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".toolrelay")
}
