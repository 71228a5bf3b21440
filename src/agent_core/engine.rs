//! Iterative plan engine.
//!
//! One engine run per inbound request:
//!
//! 1. **Planning**: the planner returns an objective and a first step, or a
//!    direct answer that goes straight to the sink.
//! 2. **ExecutingStep**: the selector resolves the tool and its arguments,
//!    the pool runs it. Every failure becomes an `Error` step result.
//! 3. **Deciding**: the model sees step summaries plus the current result
//!    and refines the step, completes it with a next step, or concludes.
//! 4. **Concluding**: the answer is written and the sink ended once.
//!
//! Once `max_iterations` steps are complete, or one step has been refined
//! `max_refinements_per_step` times, the next Deciding call is replaced by
//! a forced conclusion that is streamed to the sink.

use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::agent_core::approval::ApprovalGate;
use crate::agent_core::errors::{ArgumentError, PlanError};
use crate::agent_core::plan_parser::{conclusion_text, parse_decision, parse_initial_plan, Decision, InitialPlan};
use crate::agent_core::prompts::{self, truncate_utf8};
use crate::agent_core::selector::ToolSelector;
use crate::agent_core::sink::{Sink, SinkWriter};
use crate::agent_core::types::{
    CompletedStep, ConfirmationRequest, ConfirmationResponse, EngineConfig, PlanOutcome, PlanRequest,
    PlanState, PlanStatus, StepIntent, StepOutcome, StepResult,
};
use crate::inference::{CallPurpose, GenerateRequest, ModelBackend, ModelTier};
use crate::mcp_client::ProcessPool;

/// Outcome text for a step whose tool call timed out.
const TIMEOUT_OUTCOME: &str = "timeout";

/// Header written before the final answer.
const ANSWER_HEADER: &str = "Answer";

/// Why a plan stopped, before the outcome is assembled.
enum Ending {
    Answered(String),
    Forced(String),
    Cancelled,
}

/// Drives plans against a shared process pool.
pub struct PlanEngine {
    backend: Arc<dyn ModelBackend>,
    pool: Arc<ProcessPool>,
    selector: ToolSelector,
    approval: Arc<dyn ApprovalGate>,
    config: EngineConfig,
}

impl PlanEngine {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        pool: Arc<ProcessPool>,
        approval: Arc<dyn ApprovalGate>,
        config: EngineConfig,
    ) -> Self {
        let selector = ToolSelector::new(Arc::clone(&backend))
            .with_temperatures(config.selection_temperature, config.arguments_temperature)
            .with_max_tokens(config.max_tokens);
        Self {
            backend,
            pool,
            selector,
            approval,
            config,
        }
    }

    /// Run one request to completion.
    ///
    /// Unless cancelled, the sink is ended exactly once. After `cancel`
    /// fires nothing more is written; in-flight calls finish and their
    /// results are dropped.
    pub async fn run(&self, request: PlanRequest, sink: &mut dyn Sink, cancel: CancellationToken) -> PlanOutcome {
        let plan_id = Uuid::new_v4();
        let span = tracing::info_span!("plan", plan_id = %plan_id);
        self.run_inner(plan_id, request, sink, cancel).instrument(span).await
    }

    async fn run_inner(
        &self,
        plan_id: Uuid,
        request: PlanRequest,
        sink: &mut dyn Sink,
        cancel: CancellationToken,
    ) -> PlanOutcome {
        tracing::info!(instruction_len = request.instruction.len(), "plan started");
        let mut out = SinkWriter::new(sink, cancel.clone());
        let mut tool_calls = 0usize;
        let mut completed = Vec::new();

        let ending = self
            .drive(&request, &mut out, &cancel, &mut tool_calls, &mut completed)
            .await;

        let (status, conclusion) = match ending {
            Ok(Ending::Answered(text)) => (PlanStatus::Answered, Some(text)),
            Ok(Ending::Forced(text)) => (PlanStatus::ForcedConclusion, Some(text)),
            Ok(Ending::Cancelled) => (PlanStatus::Cancelled, None),
            Err(PlanError::Backend(e)) => {
                tracing::error!(error = %e, "plan failed");
                let message = format!("Error: {e}");
                out.chunk(&message).await;
                (PlanStatus::Failed, Some(message))
            }
        };

        if status != PlanStatus::Cancelled {
            out.end().await;
        }

        tracing::info!(status = ?status, steps = completed.len(), tool_calls, "plan finished");
        PlanOutcome {
            plan_id,
            status,
            conclusion,
            completed_steps: completed,
            tool_calls,
        }
    }

    /// The state machine. Returns how the plan ended; the caller ends the sink.
    async fn drive(
        &self,
        request: &PlanRequest,
        out: &mut SinkWriter<'_>,
        cancel: &CancellationToken,
        tool_calls: &mut usize,
        completed: &mut Vec<CompletedStep>,
    ) -> Result<Ending, PlanError> {
        // ── Planning ────────────────────────────────────────────────────
        let plan = self.plan(request).await?;
        if cancel.is_cancelled() {
            return Ok(Ending::Cancelled);
        }

        let mut state = match plan {
            None => {
                let answer = prompts::PLANNING_FALLBACK.to_string();
                self.write_answer(out, &answer).await;
                return Ok(Ending::Forced(answer));
            }
            Some(InitialPlan::Direct(answer)) => {
                tracing::info!("planner answered directly");
                self.write_answer(out, &answer).await;
                return Ok(Ending::Answered(answer));
            }
            Some(InitialPlan::Steps { objective, first, later_steps }) => {
                tracing::info!(objective = %objective, later = later_steps.len(), "plan created");
                PlanState::new(objective, first, later_steps)
            }
        };

        let mut refinements = 0usize;

        loop {
            // ── ExecutingStep ───────────────────────────────────────────
            out.header(&format!("Step {}: {}", state.iterations() + 1, state.current_step.objective))
                .await;
            let result = self.execute_step(&state.current_step).await?;
            *tool_calls += 1;
            if cancel.is_cancelled() {
                *completed = state.into_completed_steps();
                return Ok(Ending::Cancelled);
            }
            out.chunk(&prompts::step_progress(&result)).await;

            // ── IterationCapReached / refinement bound ──────────────────
            let forced_reason = if state.cap_reached(self.config.max_iterations) {
                Some("iteration limit reached")
            } else if refinements >= self.config.max_refinements_per_step {
                Some("step refinement limit reached")
            } else {
                None
            };
            if let Some(reason) = forced_reason {
                tracing::info!(reason, iterations = state.iterations(), "forcing conclusion");
                let ending = self.conclude_forced(out, cancel, &state, Some(&result), reason).await;
                *completed = state.into_completed_steps();
                return ending;
            }

            // ── Deciding ────────────────────────────────────────────────
            let decision = self.decide(&state, &result).await?;
            if cancel.is_cancelled() {
                *completed = state.into_completed_steps();
                return Ok(Ending::Cancelled);
            }

            match decision {
                Decision::ContinueStep { notes, tool_name, instruction } => {
                    refinements += 1;
                    tracing::debug!(refinements, "step refined");
                    let step = &mut state.current_step;
                    if tool_name.is_some() {
                        step.tool_name = tool_name;
                    }
                    if let Some(instruction) = instruction {
                        step.instruction = instruction;
                    }
                    step.notes = Some(notes).filter(|n| !n.trim().is_empty());
                }
                Decision::CompleteStep { succeeded, conclusion, next, later_steps } => {
                    refinements = 0;
                    state.push_completed(CompletedStep {
                        objective: state.current_step.objective.clone(),
                        succeeded,
                        conclusion,
                    });
                    if let Some(later) = later_steps {
                        state.later_steps = later;
                    }
                    tracing::debug!(iterations = state.iterations(), succeeded, "step completed");

                    match next {
                        Some(intent) => state.current_step = intent,
                        None => {
                            let ending = self
                                .conclude_forced(out, cancel, &state, None, "no further step was proposed")
                                .await;
                            *completed = state.into_completed_steps();
                            return ending;
                        }
                    }
                }
                Decision::FinalConclusion(answer) => {
                    self.write_answer(out, &answer).await;
                    *completed = state.into_completed_steps();
                    return Ok(Ending::Answered(answer));
                }
                Decision::Unparseable(raw) => {
                    if raw.trim().is_empty() {
                        let ending = self
                            .conclude_forced(out, cancel, &state, Some(&result), "the last reply was empty")
                            .await;
                        *completed = state.into_completed_steps();
                        return ending;
                    }
                    tracing::warn!("decision reply matched no shape, treating it as the conclusion");
                    self.write_answer(out, &raw).await;
                    *completed = state.into_completed_steps();
                    return Ok(Ending::Answered(raw));
                }
            }
        }
    }

    // ─── Planning ───────────────────────────────────────────────────────

    /// `None` when the planner call failed for a reason other than total
    /// unavailability.
    async fn plan(&self, request: &PlanRequest) -> Result<Option<InitialPlan>, PlanError> {
        let registry = self.pool.registry();
        let generate = GenerateRequest::new(
            CallPurpose::Planning,
            ModelTier::Full,
            prompts::planning_prompt(request, &registry),
        )
        .with_system(prompts::PLANNER_SYSTEM)
        .with_temperature(self.config.planning_temperature)
        .with_max_tokens(self.config.max_tokens)
        .expect_json();

        match self.backend.generate(generate).await {
            Ok(reply) => Ok(Some(parse_initial_plan(&reply))),
            Err(e) if e.is_unavailable() => Err(e.into()),
            Err(e) => {
                tracing::warn!(error = %e, "planning call failed");
                Ok(None)
            }
        }
    }

    // ─── ExecutingStep ──────────────────────────────────────────────────

    /// Resolve, approve, and run one step.
    ///
    /// Only total backend unavailability escapes as an error; everything
    /// else is an `Error` outcome for the model to reason about.
    async fn execute_step(&self, intent: &StepIntent) -> Result<StepResult, PlanError> {
        let registry = self.pool.registry();

        let tool = match self.selector.resolve(intent, &registry).await {
            Ok(Some(tool)) => tool,
            Ok(None) => {
                tracing::info!(objective = %intent.objective, "no tool matches step");
                return Ok(StepResult::failed(None, &intent.instruction, "no tool available for this step"));
            }
            Err(e) if e.is_unavailable() => return Err(e.into()),
            Err(e) => return Ok(StepResult::failed(None, &intent.instruction, e.to_string())),
        };

        let Some(descriptor) = registry.get(&tool) else {
            return Ok(StepResult::failed(
                Some(tool.clone()),
                &intent.instruction,
                format!("unknown tool: '{tool}'"),
            ));
        };

        let mut args = match self
            .selector
            .generate_arguments(descriptor, &intent.instruction, intent.notes.as_deref())
            .await
        {
            Ok(args) => args,
            Err(ArgumentError::Backend(e)) if e.is_unavailable() => return Err(e.into()),
            Err(e) => {
                tracing::info!(tool = %tool, error = %e, "argument generation failed");
                return Ok(StepResult::failed(Some(tool), &intent.instruction, e.to_string()));
            }
        };

        if registry.requires_confirmation(&tool) {
            let request = ConfirmationRequest {
                request_id: Uuid::new_v4().to_string(),
                tool_name: tool.clone(),
                arguments: args.clone(),
                preview: intent.instruction.clone(),
            };
            match self.approval.confirm(request).await {
                ConfirmationResponse::Confirmed => {}
                ConfirmationResponse::Rejected => {
                    tracing::info!(tool = %tool, "tool call rejected");
                    return Ok(StepResult {
                        tool: Some(tool),
                        instruction: intent.instruction.clone(),
                        args: Some(args),
                        outcome: StepOutcome::Error("rejected by user".into()),
                    });
                }
                ConfirmationResponse::EditedAndConfirmed { new_arguments } => {
                    if let Err(e) = registry.validate_tool_call(&tool, &new_arguments) {
                        return Ok(StepResult {
                            tool: Some(tool),
                            instruction: intent.instruction.clone(),
                            args: Some(new_arguments),
                            outcome: StepOutcome::Error(e.to_string()),
                        });
                    }
                    args = new_arguments;
                }
            }
        }

        let outcome = match self.pool.call_tool(&tool, args.clone(), None).await {
            Ok(result) => StepOutcome::Ok(result.text()),
            Err(e) if e.is_timeout() => StepOutcome::Error(TIMEOUT_OUTCOME.into()),
            Err(e) => StepOutcome::Error(e.to_string()),
        };

        Ok(StepResult {
            tool: Some(tool),
            instruction: intent.instruction.clone(),
            args: Some(args),
            outcome,
        })
    }

    // ─── Deciding ───────────────────────────────────────────────────────

    async fn decide(&self, state: &PlanState, result: &StepResult) -> Result<Decision, PlanError> {
        let request = GenerateRequest::new(
            CallPurpose::Decision,
            ModelTier::Full,
            prompts::decision_prompt(state, result, self.config.result_preview_bytes),
        )
        .with_system(prompts::DECIDER_SYSTEM)
        .with_temperature(self.config.decision_temperature)
        .with_max_tokens(self.config.max_tokens)
        .expect_json();

        match self.backend.generate(request).await {
            Ok(reply) => Ok(parse_decision(&reply)),
            Err(e) if e.is_unavailable() => Err(e.into()),
            Err(e) => {
                // An empty Unparseable routes to the forced conclusion.
                tracing::warn!(error = %e, "decision call failed");
                Ok(Decision::Unparseable(String::new()))
            }
        }
    }

    // ─── Concluding ─────────────────────────────────────────────────────

    async fn write_answer(&self, out: &mut SinkWriter<'_>, answer: &str) {
        out.header(ANSWER_HEADER).await;
        out.chunk(answer).await;
    }

    /// Stream the "you must conclude now" reply to the sink.
    ///
    /// The reply is the conclusion whatever its form. If the call itself
    /// fails short of total unavailability, the completed step summaries
    /// are written instead.
    async fn conclude_forced(
        &self,
        out: &mut SinkWriter<'_>,
        cancel: &CancellationToken,
        state: &PlanState,
        last: Option<&StepResult>,
        reason: &str,
    ) -> Result<Ending, PlanError> {
        let request = GenerateRequest::new(
            CallPurpose::Conclusion,
            ModelTier::Full,
            prompts::conclusion_prompt(state, last, reason, self.config.result_preview_bytes),
        )
        .with_system(prompts::CONCLUDER_SYSTEM)
        .with_temperature(self.config.conclusion_temperature)
        .with_max_tokens(self.config.max_tokens);

        let mut stream = match self.backend.generate_stream(request).await {
            Ok(stream) => stream,
            Err(e) if e.is_unavailable() => return Err(e.into()),
            Err(e) => {
                tracing::warn!(error = %e, "conclusion call failed, summarizing completed steps");
                let summary = prompts::fallback_conclusion(state);
                self.write_answer(out, &summary).await;
                if cancel.is_cancelled() {
                    return Ok(Ending::Cancelled);
                }
                return Ok(Ending::Forced(summary));
            }
        };
        out.header(ANSWER_HEADER).await;

        let mut text = String::new();
        while let Some(delta) = stream.next().await {
            if cancel.is_cancelled() {
                return Ok(Ending::Cancelled);
            }
            match delta {
                Ok(delta) => {
                    out.chunk(&delta).await;
                    text.push_str(&delta);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "conclusion stream broke off");
                    let note = format!("\n[conclusion interrupted: {e}]");
                    out.chunk(&note).await;
                    text.push_str(&note);
                    break;
                }
            }
        }

        if cancel.is_cancelled() {
            return Ok(Ending::Cancelled);
        }
        let conclusion = conclusion_text(&text);
        tracing::debug!(
            conclusion_len = conclusion.len(),
            preview = truncate_utf8(&conclusion, 80),
            "forced conclusion written"
        );
        Ok(Ending::Forced(conclusion))
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
