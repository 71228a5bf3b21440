//! Relay configuration, loaded from one YAML file.
//!
//! ```yaml
//! models:
//!   fast_model: qwen-small
//!   full_model: qwen-large
//!   fallback_chain: [qwen-small]
//!   models:
//!     qwen-small: { base_url: "http://localhost:11434/v1" }
//!     qwen-large: { base_url: "${LARGE_MODEL_URL:-http://localhost:8080/v1}" }
//! servers:
//!   filesystem:
//!     command: node
//!     args: ["~/tools/fs-server/index.js"]
//! enabled_tools: [read_file, list_dir]
//! engine:
//!   max_iterations: 10
//! ```
//!
//! `${VAR}` and `${VAR:-default}` are interpolated before parsing, and a
//! leading `~` in a default expands to the home directory.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::agent_core::EngineConfig;
use crate::inference::ModelsConfig;
use crate::logging::LoggingConfig;
use crate::mcp_client::{McpServersConfig, PoolSettings, ServerConfig};

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "TOOLRELAY_CONFIG";

/// File name looked for while walking up from the working directory.
pub const CONFIG_FILE_NAME: &str = "toolrelay.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no config file found (searched: {})", searched.join(", "))]
    NotFound { searched: Vec<String> },

    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    pub models: ModelsConfig,
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
    /// When set, only these servers are started.
    #[serde(default)]
    pub enabled_servers: Option<Vec<String>>,
    /// When set, only these tools are registered.
    #[serde(default)]
    pub enabled_tools: Option<Vec<String>>,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Working directory for servers without their own `cwd`.
    #[serde(default)]
    pub working_dir: Option<String>,
    /// How long a confirmation may wait for an answer.
    #[serde(default = "default_approval_timeout_secs")]
    pub approval_timeout_secs: u64,
}

fn default_approval_timeout_secs() -> u64 {
    300
}

impl RelayConfig {
    /// Read, interpolate, parse, and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let config = Self::from_yaml(&raw).map_err(|e| match e {
            ConfigError::Parse { reason, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                reason,
            },
            other => other,
        })?;
        tracing::debug!(path = %path.display(), servers = config.servers.len(), "config loaded");
        Ok(config)
    }

    /// Parse config text. Environment variables are interpolated first.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let interpolated = interpolate_env_vars(raw);
        let config: RelayConfig = serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::Parse {
            path: "<inline>".into(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.models.validate().map_err(|e| ConfigError::Invalid {
            reason: e.to_string(),
        })?;
        if let Some((name, _)) = self.servers.iter().find(|(_, s)| s.command.trim().is_empty()) {
            return Err(ConfigError::Invalid {
                reason: format!("server '{name}' has an empty command"),
            });
        }
        if self.engine.max_iterations == 0 {
            return Err(ConfigError::Invalid {
                reason: "engine.max_iterations must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// Servers to start, after the `enabled_servers` allowlist.
    pub fn servers_config(&self) -> McpServersConfig {
        let mut servers = self.servers.clone();
        if let Some(enabled) = self.enabled_servers.as_ref().filter(|e| !e.is_empty()) {
            let allow: HashSet<&str> = enabled.iter().map(String::as_str).collect();
            let before = servers.len();
            servers.retain(|name, _| allow.contains(name.as_str()));
            tracing::info!(before, after = servers.len(), "filtered servers by enabled_servers allowlist");
        }
        McpServersConfig { servers }
    }

    /// The `enabled_tools` allowlist, if one is set and non-empty.
    pub fn enabled_tool_set(&self) -> Option<HashSet<String>> {
        self.enabled_tools
            .as_ref()
            .filter(|t| !t.is_empty())
            .map(|t| t.iter().cloned().collect())
    }

    pub fn working_dir(&self) -> Option<PathBuf> {
        self.working_dir.as_deref().map(|d| PathBuf::from(expand_tilde(d)))
    }
}

/// Locate the config file.
///
/// Resolution order:
/// 1. `explicit` (a `--config` flag); it must exist.
/// 2. The `TOOLRELAY_CONFIG` environment variable.
/// 3. `toolrelay.yaml` in `start` or any parent directory.
/// 4. `<config_dir>/toolrelay/config.yaml`.
pub fn find_config_path(explicit: Option<&Path>, start: &Path) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(ConfigError::NotFound {
            searched: vec![path.display().to_string()],
        });
    }

    let mut searched = Vec::new();

    if let Ok(value) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&value));
        if candidate.is_file() {
            return Ok(candidate);
        }
        searched.push(candidate.display().to_string());
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }
    searched.push(format!("{CONFIG_FILE_NAME} in {} and parents", start.display()));

    if let Some(config_dir) = dirs::config_dir() {
        let candidate = config_dir.join("toolrelay").join("config.yaml");
        if candidate.is_file() {
            return Ok(candidate);
        }
        searched.push(candidate.display().to_string());
    }

    Err(ConfigError::NotFound { searched })
}

/// Replace `${VAR}` and `${VAR:-default}` with environment values.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Unset variables without a default become empty strings.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}
