//! Shared types for the model backend.
//!
//! The generation request the engine speaks, plus the OpenAI Chat
//! Completions wire types the HTTP client uses for request building and
//! response parsing.

use serde::{Deserialize, Serialize};

// ─── Generation Requests ─────────────────────────────────────────────────────

/// Which model class serves a call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    /// Cheap model for classification and structural lookups.
    #[default]
    Fast,
    /// Larger model for anything that needs judgment.
    Full,
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelTier::Fast => f.write_str("fast"),
            ModelTier::Full => f.write_str("full"),
        }
    }
}

/// What a model call is for. Used for logging and by test doubles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPurpose {
    Planning,
    ToolSelection,
    Arguments,
    Decision,
    Conclusion,
}

/// One "generate text from prompt" call.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub purpose: CallPurpose,
    pub tier: ModelTier,
    pub system: Option<String>,
    pub prompt: String,
    /// Overrides the model's configured temperature.
    pub temperature: Option<f32>,
    /// Overrides the model's configured token limit.
    pub max_tokens: Option<u32>,
    /// Ask the backend for a JSON object reply when it supports that.
    pub json_reply: bool,
}

impl GenerateRequest {
    pub fn new(purpose: CallPurpose, tier: ModelTier, prompt: impl Into<String>) -> Self {
        Self {
            purpose,
            tier,
            system: None,
            prompt: prompt.into(),
            temperature: None,
            max_tokens: None,
            json_reply: false,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn expect_json(mut self) -> Self {
        self.json_reply = true;
        self
    }
}

// ─── Chat Completions Wire Types ─────────────────────────────────────────────

/// A single message in the conversation sent to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Message role in the OpenAI chat format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Response format constraint (e.g., `{"type": "json_object"}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFormat {
    pub r#type: String,
}

/// Request body for `/v1/chat/completions`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
}

/// Non-streaming completion response.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub choices: Vec<ResponseChoice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseChoice {
    pub message: ResponseMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
}

/// A single SSE chunk from a streaming completion.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChunkChoice {
    pub delta: ChunkDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Content delta. Reasoning models stream chain-of-thought in `reasoning`;
/// only `content` is surfaced.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_format_omitted_when_none() {
        let req = ChatCompletionRequest {
            model: "test".to_string(),
            messages: vec![ChatMessage::user("hi")],
            temperature: 0.7,
            max_tokens: 1024,
            stream: false,
            response_format: None,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("response_format"));
        assert!(json.contains("\"role\":\"user\""));
    }

    #[test]
    fn test_generate_request_builder() {
        let req = GenerateRequest::new(CallPurpose::Arguments, ModelTier::Full, "args please")
            .with_system("be terse")
            .with_temperature(0.0)
            .with_max_tokens(256)
            .expect_json();
        assert_eq!(req.tier, ModelTier::Full);
        assert_eq!(req.system.as_deref(), Some("be terse"));
        assert_eq!(req.temperature, Some(0.0));
        assert_eq!(req.max_tokens, Some(256));
        assert!(req.json_reply);
    }

    #[test]
    fn test_model_tier_serde() {
        let tier: ModelTier = serde_json::from_str("\"full\"").unwrap();
        assert_eq!(tier, ModelTier::Full);
        assert_eq!(ModelTier::default().to_string(), "fast");
    }
}
