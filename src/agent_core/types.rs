//! Agent Core type definitions.
//!
//! Plan state, step records, engine settings, and the confirmation
//! round-trip types shared by the engine and approval gates.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Requests ───────────────────────────────────────────────────────────────

/// One inbound user request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRequest {
    pub instruction: String,
    /// Minimal project context snapshot handed to the planner.
    #[serde(default)]
    pub context: Option<String>,
}

impl PlanRequest {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

// ─── Plan State ─────────────────────────────────────────────────────────────

/// What the engine intends to do next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepIntent {
    pub objective: String,
    /// Tool the planner named, if any. Resolved by the selector otherwise.
    #[serde(default)]
    pub tool_name: Option<String>,
    /// Natural-language instruction handed to argument generation.
    pub instruction: String,
    /// Notes carried over from a refined attempt.
    #[serde(default)]
    pub notes: Option<String>,
}

/// Compact summary of a finished step. Raw tool output is not kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedStep {
    pub objective: String,
    pub succeeded: bool,
    pub conclusion: String,
}

/// Outcome of one tool execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum StepOutcome {
    Ok(String),
    Error(String),
}

/// Result of executing the current step. Fed into exactly one decision
/// call, then dropped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepResult {
    pub tool: Option<String>,
    pub instruction: String,
    pub args: Option<serde_json::Value>,
    pub outcome: StepOutcome,
}

impl StepResult {
    /// A step that never reached a tool call.
    pub fn failed(tool: Option<String>, instruction: &str, message: impl Into<String>) -> Self {
        Self {
            tool,
            instruction: instruction.to_string(),
            args: None,
            outcome: StepOutcome::Error(message.into()),
        }
    }
}

/// Per-request plan state. Owned and mutated only by the engine.
#[derive(Debug, Clone)]
pub struct PlanState {
    pub objective: String,
    completed_steps: Vec<CompletedStep>,
    pub current_step: StepIntent,
    /// Remaining objectives, plain strings.
    pub later_steps: Vec<String>,
}

impl PlanState {
    pub fn new(objective: impl Into<String>, first: StepIntent, later_steps: Vec<String>) -> Self {
        Self {
            objective: objective.into(),
            completed_steps: Vec::new(),
            current_step: first,
            later_steps,
        }
    }

    /// Append-only; earlier entries are never touched.
    pub fn push_completed(&mut self, step: CompletedStep) {
        self.completed_steps.push(step);
    }

    pub fn completed_steps(&self) -> &[CompletedStep] {
        &self.completed_steps
    }

    /// Iteration count: the number of completed steps.
    pub fn iterations(&self) -> usize {
        self.completed_steps.len()
    }

    pub fn cap_reached(&self, max_iterations: usize) -> bool {
        self.completed_steps.len() >= max_iterations
    }

    pub fn into_completed_steps(self) -> Vec<CompletedStep> {
        self.completed_steps
    }
}

// ─── Engine Settings ────────────────────────────────────────────────────────

/// The `engine` config section.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Cap on completed steps per plan.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Refinements of one step before the conclusion is forced.
    #[serde(default = "default_max_refinements")]
    pub max_refinements_per_step: usize,
    /// Bytes of tool output shown to the decision model.
    #[serde(default = "default_result_preview_bytes")]
    pub result_preview_bytes: usize,
    #[serde(default = "default_planning_temperature")]
    pub planning_temperature: f32,
    /// Tool classification runs deterministic by default.
    #[serde(default)]
    pub selection_temperature: f32,
    #[serde(default = "default_arguments_temperature")]
    pub arguments_temperature: f32,
    #[serde(default = "default_decision_temperature")]
    pub decision_temperature: f32,
    #[serde(default = "default_conclusion_temperature")]
    pub conclusion_temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_max_iterations() -> usize {
    10
}

fn default_max_refinements() -> usize {
    3
}

fn default_result_preview_bytes() -> usize {
    4000
}

fn default_planning_temperature() -> f32 {
    0.2
}

fn default_arguments_temperature() -> f32 {
    0.1
}

fn default_decision_temperature() -> f32 {
    0.2
}

fn default_conclusion_temperature() -> f32 {
    0.4
}

fn default_max_tokens() -> u32 {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_refinements_per_step: default_max_refinements(),
            result_preview_bytes: default_result_preview_bytes(),
            planning_temperature: default_planning_temperature(),
            selection_temperature: 0.0,
            arguments_temperature: default_arguments_temperature(),
            decision_temperature: default_decision_temperature(),
            conclusion_temperature: default_conclusion_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

// ─── Outcomes ───────────────────────────────────────────────────────────────

/// How a plan ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// The model concluded on its own.
    Answered,
    /// The iteration or refinement bound forced the conclusion, or a
    /// failed model call was answered with a fallback.
    ForcedConclusion,
    /// No model was reachable; an error conclusion was written.
    Failed,
    /// The client went away; nothing more was written.
    Cancelled,
}

/// Summary returned to the caller after a plan finishes.
#[derive(Debug, Clone, Serialize)]
pub struct PlanOutcome {
    pub plan_id: Uuid,
    pub status: PlanStatus,
    pub conclusion: Option<String>,
    pub completed_steps: Vec<CompletedStep>,
    /// Tool executions attempted, including refinements.
    pub tool_calls: usize,
}

// ─── Confirmation ───────────────────────────────────────────────────────────

/// Approval request for a confirm-class tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationRequest {
    /// Unique request ID for matching responses.
    pub request_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    /// Human-readable preview of what will happen.
    pub preview: String,
}

/// The approver's decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ConfirmationResponse {
    Confirmed,
    Rejected,
    /// Approved with edited arguments. They are validated again before use.
    #[serde(rename = "edited")]
    EditedAndConfirmed { new_arguments: serde_json::Value },
}

// ─── Tests ──────────────────────────────────────────────────────────────────
