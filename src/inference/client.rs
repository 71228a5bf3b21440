//! OpenAI-compatible inference client.
//!
//! Sends chat completion requests to the model serving the requested tier.
//! When that model is unreachable the call walks the fallback chain; when
//! every candidate fails the caller gets `AllModelsUnavailable`.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client as HttpClient;

use super::backend::{ModelBackend, TextStream};
use super::config::{ModelConfig, ModelsConfig};
use super::errors::InferenceError;
use super::streaming::{parse_non_streaming_response, parse_sse_stream};
use super::types::{ChatCompletionRequest, ChatMessage, GenerateRequest, ModelTier, ResponseFormat};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ─── InferenceClient ─────────────────────────────────────────────────────────

/// Client for OpenAI-compatible model endpoints.
///
/// Stateless across calls: every call starts from its tier's model, so one
/// outage does not pin later calls to a fallback.
pub struct InferenceClient {
    /// HTTP client for non-streaming requests.
    http: HttpClient,
    /// HTTP client for streaming requests (longer total timeout).
    http_stream: HttpClient,
    config: ModelsConfig,
}

impl InferenceClient {
    /// Create a client from the models configuration.
    ///
    /// Validates that both tiers resolve. Does NOT check connectivity; that
    /// happens on the first request or via [`health_check`](Self::health_check).
    pub fn from_config(config: ModelsConfig) -> Result<Self, InferenceError> {
        config.validate()?;

        let http = build_http(Duration::from_secs(config.request_timeout_secs))?;
        let http_stream = build_http(Duration::from_secs(config.stream_timeout_secs))?;

        Ok(Self {
            http,
            http_stream,
            config,
        })
    }

    pub fn config(&self) -> &ModelsConfig {
        &self.config
    }

    // ─── Health Check ────────────────────────────────────────────────────

    /// Check whether the model serving a tier is reachable.
    ///
    /// Sends `GET {base_url}/models`. Does not consume inference tokens.
    pub async fn health_check(&self, tier: ModelTier) -> bool {
        let Some(model) = self.config.models.get(self.config.model_key(tier)) else {
            return false;
        };
        let url = format!("{}/models", model.base_url.trim_end_matches('/'));

        let mut request = self.http.get(&url).timeout(CONNECT_TIMEOUT);
        if let Some(key) = model.api_key.as_deref().filter(|k| !k.is_empty()) {
            request = request.bearer_auth(key);
        }

        match request.send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "model health check failed");
                false
            }
        }
    }

    // ─── Requests ────────────────────────────────────────────────────────

    fn build_body(
        &self,
        key: &str,
        model: &ModelConfig,
        request: &GenerateRequest,
        stream: bool,
    ) -> ChatCompletionRequest {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system {
            messages.push(ChatMessage::system(system.clone()));
        }
        messages.push(ChatMessage::user(request.prompt.clone()));

        let response_format = (model.force_json_response && request.json_reply).then(|| ResponseFormat {
            r#type: "json_object".to_string(),
        });

        ChatCompletionRequest {
            model: model.model_name.clone().unwrap_or_else(|| key.to_string()),
            messages,
            temperature: request.temperature.unwrap_or(model.temperature),
            max_tokens: request.max_tokens.unwrap_or(model.max_tokens),
            stream,
            response_format,
        }
    }

    async fn send(
        &self,
        key: &str,
        model: &ModelConfig,
        request: &GenerateRequest,
        stream: bool,
    ) -> Result<reqwest::Response, InferenceError> {
        let url = format!("{}/chat/completions", model.base_url.trim_end_matches('/'));
        let body = self.build_body(key, model, request, stream);

        // Metadata only; prompts can be large.
        tracing::info!(
            url = %url,
            model = %body.model,
            purpose = ?request.purpose,
            tier = %request.tier,
            max_tokens = body.max_tokens,
            stream,
            "model request"
        );

        let (http, timeout_secs) = if stream {
            (&self.http_stream, self.config.stream_timeout_secs)
        } else {
            (&self.http, self.config.request_timeout_secs)
        };

        let mut builder = http.post(&url).json(&body);
        if stream {
            builder = builder.header("Accept", "text/event-stream");
        }
        if let Some(api_key) = model.api_key.as_deref().filter(|k| !k.is_empty()) {
            builder = builder.bearer_auth(api_key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout {
                    duration_secs: timeout_secs,
                }
            } else {
                InferenceError::ConnectionFailed {
                    endpoint: url.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        Ok(response)
    }

    async fn complete_once(
        &self,
        key: &str,
        model: &ModelConfig,
        request: &GenerateRequest,
    ) -> Result<String, InferenceError> {
        let response = self.send(key, model, request, false).await?;
        let body_text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout {
                    duration_secs: self.config.request_timeout_secs,
                }
            } else {
                InferenceError::StreamError {
                    reason: format!("failed to read response body: {e}"),
                }
            }
        })?;
        parse_non_streaming_response(&body_text)
    }

    // ─── Fallback Chain ──────────────────────────────────────────────────

    /// Whether an error should move on to the next candidate model.
    ///
    /// Empty or unparseable completions count too: a reasoning model that
    /// ran out of tokens may still be served by the next model.
    fn should_fall_back(err: &InferenceError) -> bool {
        err.is_retriable() || matches!(err, InferenceError::MalformedResponse { .. })
    }
}

fn build_http(timeout: Duration) -> Result<HttpClient, InferenceError> {
    HttpClient::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(timeout)
        .build()
        .map_err(|e| InferenceError::ConfigError {
            reason: format!("failed to build HTTP client: {e}"),
        })
}

#[async_trait]
impl ModelBackend for InferenceClient {
    async fn generate(&self, request: GenerateRequest) -> Result<String, InferenceError> {
        let mut attempted = Vec::new();

        for (key, model) in self.config.candidates(request.tier) {
            match self.complete_once(key, model, &request).await {
                Ok(text) => return Ok(text),
                Err(e) if Self::should_fall_back(&e) => {
                    tracing::warn!(model = %key, error = %e, "model unavailable, trying next candidate");
                    attempted.push(key.to_string());
                }
                Err(e) => return Err(e),
            }
        }

        Err(InferenceError::AllModelsUnavailable { attempted })
    }

    async fn generate_stream(&self, request: GenerateRequest) -> Result<TextStream, InferenceError> {
        let mut attempted = Vec::new();

        for (key, model) in self.config.candidates(request.tier) {
            match self.send(key, model, &request, true).await {
                Ok(response) => return Ok(parse_sse_stream(response).boxed()),
                Err(e) if e.is_retriable() => {
                    tracing::warn!(model = %key, error = %e, "model unavailable, trying next candidate");
                    attempted.push(key.to_string());
                }
                Err(e) => return Err(e),
            }
        }

        Err(InferenceError::AllModelsUnavailable { attempted })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
