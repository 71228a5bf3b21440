//! Tool registry: aggregates tool descriptors across all tool servers.
//!
//! Provides:
//! - Lookup by tool name and owning server
//! - First-registration-wins deduplication across servers
//! - Argument validation against the registered schema
//! - Compact catalogs for classification and planning prompts

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use super::errors::McpError;
use super::schema;
use super::types::{McpToolDefinition, SafetyClass, ServerConfig};
use crate::inference::types::ModelTier;

/// Longest "use when" hint placed in a catalog line.
const USE_WHEN_MAX_CHARS: usize = 160;

// ─── ToolDescriptor ──────────────────────────────────────────────────────────

/// A callable tool as the selector and engine see it.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameter_schema: Value,
    pub safety: SafetyClass,
    pub preferred_tier: ModelTier,
}

impl ToolDescriptor {
    /// Build a descriptor from an advertised definition.
    ///
    /// Precedence for safety: operator override, explicit `safety`,
    /// `confirmationRequired`, a `destructiveHint` annotation, the server
    /// default, then `auto`. Tier: override, advertised tier, server default,
    /// then `fast`.
    pub fn from_definition(def: &McpToolDefinition, config: &ServerConfig) -> Self {
        let overrides = config.tools.get(&def.name);

        let destructive = def
            .annotations
            .as_ref()
            .and_then(|a| a.destructive_hint)
            .unwrap_or(false);

        let safety = overrides
            .and_then(|o| o.safety)
            .or(def.safety)
            .or_else(|| def.confirmation_required.then_some(SafetyClass::Confirm))
            .or_else(|| destructive.then_some(SafetyClass::Confirm))
            .or(config.default_safety)
            .unwrap_or_default();

        let preferred_tier = overrides
            .and_then(|o| o.tier)
            .or(def.preferred_tier)
            .or(config.default_tier)
            .unwrap_or_default();

        Self {
            name: def.name.clone(),
            description: def.description.clone(),
            parameter_schema: def.input_schema.clone(),
            safety,
            preferred_tier,
        }
    }

    /// One-line guidance: the first sentence of the description.
    pub fn use_when(&self) -> String {
        let first_line = self.description.lines().next().unwrap_or_default().trim();
        let sentence = match first_line.find(". ") {
            Some(idx) => &first_line[..=idx],
            None => first_line,
        };
        if sentence.chars().count() > USE_WHEN_MAX_CHARS {
            let truncated: String = sentence.chars().take(USE_WHEN_MAX_CHARS).collect();
            format!("{truncated}…")
        } else {
            sentence.to_string()
        }
    }
}

// ─── ToolRegistry ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct RegisteredTool {
    server: String,
    descriptor: ToolDescriptor,
}

/// Aggregated tool registry across all tool servers.
///
/// Names are unique across the whole registry. When two servers export the
/// same name, the first registration is kept and the collision is logged.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    /// `tool_name → (server_name, descriptor)`, ordered for stable catalogs.
    tools: BTreeMap<String, RegisteredTool>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a server's tools. Returns how many were accepted.
    ///
    /// Re-registering the same server replaces its entries; a name already
    /// owned by a different server is skipped.
    pub fn register_server_tools(&mut self, server_name: &str, tools: Vec<ToolDescriptor>) -> usize {
        let mut accepted = 0;
        for descriptor in tools {
            if let Some(existing) = self.tools.get(&descriptor.name) {
                if existing.server != server_name {
                    tracing::warn!(
                        tool = %descriptor.name,
                        kept_server = %existing.server,
                        dropped_server = server_name,
                        "tool name collision, keeping first registration"
                    );
                    continue;
                }
            }
            self.tools.insert(
                descriptor.name.clone(),
                RegisteredTool {
                    server: server_name.to_string(),
                    descriptor,
                },
            );
            accepted += 1;
        }
        accepted
    }

    /// Remove all tools belonging to a server.
    pub fn unregister_server(&mut self, server_name: &str) {
        self.tools.retain(|_, entry| entry.server != server_name);
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name).map(|entry| &entry.descriptor)
    }

    /// Get the server name that owns a tool.
    pub fn server_for(&self, tool_name: &str) -> Option<&str> {
        self.tools.get(tool_name).map(|entry| entry.server.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Whether a tool needs an approval round trip before it runs.
    pub fn requires_confirmation(&self, tool_name: &str) -> bool {
        self.get(tool_name)
            .is_some_and(|d| d.safety == SafetyClass::Confirm)
    }

    /// All descriptors in name order.
    pub fn descriptors(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.values().map(|entry| &entry.descriptor)
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Number of tools owned by a server.
    pub fn tools_for_server(&self, server_name: &str) -> usize {
        self.tools.values().filter(|e| e.server == server_name).count()
    }

    /// Unique server names, sorted.
    pub fn server_names(&self) -> Vec<String> {
        let names: BTreeSet<&str> = self.tools.values().map(|e| e.server.as_str()).collect();
        names.into_iter().map(str::to_string).collect()
    }

    /// Validate a tool call's arguments against the registered schema.
    pub fn validate_tool_call(&self, tool_name: &str, arguments: &Value) -> Result<(), McpError> {
        let descriptor = self.get(tool_name).ok_or_else(|| McpError::UnknownTool {
            name: tool_name.to_string(),
        })?;

        schema::validate_arguments(&descriptor.parameter_schema, arguments).map_err(|violation| {
            McpError::InvalidArguments {
                tool: tool_name.to_string(),
                reason: violation.to_string(),
            }
        })
    }

    /// Compact catalog for tool classification: `- name: use when …` per line.
    pub fn catalog(&self) -> String {
        self.descriptors()
            .map(|d| {
                let hint = d.use_when();
                if hint.is_empty() {
                    format!("- {}", d.name)
                } else {
                    format!("- {}: {hint}", d.name)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Short capability summary for the planning prompt.
    ///
    /// Lists servers with tool counts and which of them act only after
    /// approval.
    pub fn capability_summary(&self) -> String {
        if self.is_empty() {
            return "No tools are currently available.".to_string();
        }

        let server_names = self.server_names();
        let server_parts: Vec<String> = server_names
            .iter()
            .map(|name| format!("{name} ({})", self.tools_for_server(name)))
            .collect();

        let mut summary = format!(
            "Available capabilities ({} tools across {} servers): {}.",
            self.len(),
            server_names.len(),
            server_parts.join(", "),
        );

        let gated: Vec<&str> = self
            .descriptors()
            .filter(|d| d.safety == SafetyClass::Confirm)
            .map(|d| d.name.as_str())
            .collect();
        if !gated.is_empty() {
            summary.push_str(&format!("\nRequire user approval: {}.", gated.join(", ")));
        }

        summary
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
