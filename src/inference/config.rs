//! Model configuration and tier resolution.
//!
//! The `models` section of the relay config: model endpoints, which model
//! serves each tier, and the fallback chain tried when a model is down.
//! File loading and env interpolation live in [`crate::config`].

use std::collections::HashMap;

use serde::Deserialize;

use super::errors::InferenceError;
use super::types::ModelTier;

/// Fallback-chain marker kept for config compatibility; never a real model.
const STATIC_RESPONSE_KEY: &str = "static_response";

// ─── Public Types ────────────────────────────────────────────────────────────

/// A single model's runtime configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub display_name: String,
    /// OpenAI-compatible base URL, e.g. `http://localhost:11434/v1`.
    pub base_url: String,
    /// Model name sent in the request body. Defaults to the config key.
    #[serde(default)]
    pub model_name: Option<String>,
    /// Bearer token, usually `${SOME_API_KEY}`.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Send `response_format: json_object` when a JSON reply is requested.
    #[serde(default)]
    pub force_json_response: bool,
}

fn default_temperature() -> f32 {
    0.3
}

fn default_max_tokens() -> u32 {
    2048
}

/// The `models` config section.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    /// Model key serving the `fast` tier.
    pub fast_model: String,
    /// Model key serving the `full` tier.
    pub full_model: String,
    pub models: HashMap<String, ModelConfig>,
    /// Models tried, in order, when the tier's model is unreachable.
    #[serde(default)]
    pub fallback_chain: Vec<String>,
    /// Total timeout for non-streaming calls.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Total timeout for streaming calls.
    #[serde(default = "default_stream_timeout_secs")]
    pub stream_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_stream_timeout_secs() -> u64 {
    180
}

impl ModelsConfig {
    /// Config key of the model serving a tier.
    pub fn model_key(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Fast => &self.fast_model,
            ModelTier::Full => &self.full_model,
        }
    }

    /// Models to try for a tier, in order: the tier's own model, the
    /// fallback chain, then the other tier's model. Duplicates and keys
    /// missing from `models` are skipped.
    pub fn candidates(&self, tier: ModelTier) -> Vec<(&str, &ModelConfig)> {
        let other = match tier {
            ModelTier::Fast => ModelTier::Full,
            ModelTier::Full => ModelTier::Fast,
        };

        let ordered = std::iter::once(self.model_key(tier))
            .chain(self.fallback_chain.iter().map(String::as_str))
            .chain(std::iter::once(self.model_key(other)));

        let mut seen: Vec<&str> = Vec::new();
        let mut out = Vec::new();
        for key in ordered {
            if key == STATIC_RESPONSE_KEY || seen.contains(&key) {
                continue;
            }
            seen.push(key);
            if let Some(model) = self.models.get(key) {
                out.push((key, model));
            }
        }
        out
    }

    /// Both tiers must point at configured models.
    pub fn validate(&self) -> Result<(), InferenceError> {
        for tier in [ModelTier::Fast, ModelTier::Full] {
            let key = self.model_key(tier);
            if !self.models.contains_key(key) {
                return Err(InferenceError::ConfigError {
                    reason: format!("{tier} tier model '{key}' not found in models"),
                });
            }
        }
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
