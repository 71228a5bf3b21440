//! Two-stage tool selection.
//!
//! Stage (a) classifies which registered tool, if any, serves an
//! instruction. Stage (b) asks for that tool's arguments and validates them
//! field by field against its schema. All retries and tier escalation in
//! stage (b) come from one [`RetryPolicy`].

use std::sync::Arc;

use serde_json::{json, Value};

use crate::agent_core::errors::ArgumentError;
use crate::agent_core::plan_parser::{parse_arguments, parse_tool_choice};
use crate::agent_core::prompts;
use crate::agent_core::types::StepIntent;
use crate::inference::{CallPurpose, GenerateRequest, InferenceError, ModelBackend, ModelTier};
use crate::mcp_client::schema::{has_parameters, validate_arguments};
use crate::mcp_client::{ToolDescriptor, ToolRegistry};

// ─── Retry Policy ───────────────────────────────────────────────────────────

/// Attempt schedule for argument generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts on the preferred tier before escalating.
    pub attempts_per_tier: usize,
    /// Tier used once the preferred tier is exhausted.
    pub escalation_tier: ModelTier,
    /// Attempts on the escalation tier.
    pub escalation_attempts: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts_per_tier: 2,
            escalation_tier: ModelTier::Full,
            escalation_attempts: 1,
        }
    }
}

impl RetryPolicy {
    /// Tiers to try, in order, for a tool preferring `preferred`.
    ///
    /// A `fast` tool gets two fast attempts, then one on `full`. A tool
    /// already on the escalation tier never escalates.
    pub fn schedule(&self, preferred: ModelTier) -> Vec<ModelTier> {
        let mut tiers = vec![preferred; self.attempts_per_tier.max(1)];
        if preferred != self.escalation_tier {
            tiers.extend(std::iter::repeat(self.escalation_tier).take(self.escalation_attempts));
        }
        tiers
    }
}

// ─── ToolSelector ───────────────────────────────────────────────────────────

pub struct ToolSelector {
    backend: Arc<dyn ModelBackend>,
    policy: RetryPolicy,
    selection_temperature: f32,
    arguments_temperature: f32,
    max_tokens: u32,
}

impl ToolSelector {
    pub fn new(backend: Arc<dyn ModelBackend>) -> Self {
        Self {
            backend,
            policy: RetryPolicy::default(),
            selection_temperature: 0.0,
            arguments_temperature: 0.1,
            max_tokens: 512,
        }
    }

    pub fn with_temperatures(mut self, selection: f32, arguments: f32) -> Self {
        self.selection_temperature = selection;
        self.arguments_temperature = arguments;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Resolve the tool for a step.
    ///
    /// A step that already names a registered tool skips classification.
    pub async fn resolve(
        &self,
        intent: &StepIntent,
        registry: &ToolRegistry,
    ) -> Result<Option<String>, InferenceError> {
        if let Some(name) = intent.tool_name.as_deref().filter(|n| registry.contains(n)) {
            return Ok(Some(name.to_string()));
        }
        self.select_tool(&intent.instruction, registry).await
    }

    /// Stage (a): one classification call on the fast tier.
    ///
    /// An unparseable reply or an unknown tool name is `None`. Only total
    /// backend unavailability is an error.
    pub async fn select_tool(
        &self,
        instruction: &str,
        registry: &ToolRegistry,
    ) -> Result<Option<String>, InferenceError> {
        if registry.is_empty() {
            return Ok(None);
        }

        let request = GenerateRequest::new(
            CallPurpose::ToolSelection,
            ModelTier::Fast,
            prompts::selection_prompt(instruction, registry),
        )
        .with_system(prompts::SELECTOR_SYSTEM)
        .with_temperature(self.selection_temperature)
        .with_max_tokens(self.max_tokens)
        .expect_json();

        match self.backend.generate(request).await {
            Ok(reply) => {
                let choice = parse_tool_choice(&reply, registry);
                tracing::debug!(tool = ?choice, "tool classified");
                Ok(choice)
            }
            Err(e) if e.is_unavailable() => Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "tool classification failed, treating as no tool");
                Ok(None)
            }
        }
    }

    /// Stage (b): arguments for one tool, validated against its schema.
    ///
    /// Tools without parameters get `{}` without a model call. Rejected
    /// attempts are fed back into the next prompt; tiers follow the policy.
    pub async fn generate_arguments(
        &self,
        descriptor: &ToolDescriptor,
        instruction: &str,
        notes: Option<&str>,
    ) -> Result<Value, ArgumentError> {
        if !has_parameters(&descriptor.parameter_schema) {
            return Ok(json!({}));
        }

        let schedule = self.policy.schedule(descriptor.preferred_tier);
        let mut last_error: Option<ArgumentError> = None;

        for (attempt, tier) in schedule.into_iter().enumerate() {
            let feedback = last_error.as_ref().map(ToString::to_string);
            let request = GenerateRequest::new(
                CallPurpose::Arguments,
                tier,
                prompts::arguments_prompt(descriptor, instruction, notes, feedback.as_deref()),
            )
            .with_system(prompts::ARGUMENTS_SYSTEM)
            .with_temperature(self.arguments_temperature)
            .with_max_tokens(self.max_tokens)
            .expect_json();

            let reply = self.backend.generate(request).await?;

            let error = match parse_arguments(&reply) {
                Ok(args) => match validate_arguments(&descriptor.parameter_schema, &args) {
                    Ok(()) => return Ok(args),
                    Err(violation) => ArgumentError::Invalid {
                        tool: descriptor.name.clone(),
                        violation,
                    },
                },
                Err(reason) => ArgumentError::Unparseable {
                    tool: descriptor.name.clone(),
                    reason,
                },
            };

            tracing::debug!(tool = %descriptor.name, attempt, tier = %tier, error = %error, "arguments rejected");
            last_error = Some(error);
        }

        Err(last_error.unwrap_or_else(|| ArgumentError::Unparseable {
            tool: descriptor.name.clone(),
            reason: "no attempts made".into(),
        }))
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
