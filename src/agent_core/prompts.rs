//! Prompt builders for the plan engine and tool selector.
//!
//! Every builder returns the user prompt; system prompts are constants.
//! Reply formats here must stay in sync with the decoders in
//! [`plan_parser`](super::plan_parser).

use serde_json::Value;

use crate::agent_core::types::{PlanRequest, PlanState, StepIntent, StepOutcome, StepResult};
use crate::mcp_client::{ToolDescriptor, ToolRegistry};

/// Characters of a step result shown in the streamed progress line.
const PROGRESS_PREVIEW_CHARS: usize = 200;

// ─── System Prompts ─────────────────────────────────────────────────────────

pub const PLANNER_SYSTEM: &str = r#"You are the planner of a tool-using assistant. Given a user request and the available tools, decide whether tools are needed.

Reply with ONE JSON object and nothing else.

If no tool is needed:
{"objective": "<restated goal>", "answer": "<your answer>"}

If tools are needed, describe only the FIRST step in detail and list the rest as short objectives:
{"objective": "<overall goal>", "step": {"objective": "<what this step achieves>", "tool": "<tool name or null>", "instruction": "<self-contained instruction including paths, names and values from the request>"}, "later_steps": ["<objective>", "..."]}"#;

pub const SELECTOR_SYSTEM: &str = r#"You pick the single tool that carries out an instruction.
Reply with ONE JSON object: {"tool": "<tool name>"} or {"tool": null} when no listed tool fits. Never invent tool names."#;

pub const ARGUMENTS_SYSTEM: &str = r#"You write the arguments for one tool call.
Reply with ONE JSON object whose fields follow the parameter schema exactly. Include every required field. Use values from the instruction; do not invent paths or identifiers."#;

pub const DECIDER_SYSTEM: &str = r#"You supervise a multi-step plan. After each tool call, decide what happens next.

Reply with ONE JSON object, exactly one of:
1. Retry the current step with adjustments:
{"action": "refine", "notes": "<what to change>", "tool": "<tool name or null to keep>", "instruction": "<new instruction or null to keep>"}
2. Close the current step and start the next one:
{"action": "complete", "succeeded": true, "conclusion": "<one or two sentences on what this step established>", "next": {"objective": "...", "tool": "<tool name or null>", "instruction": "..."}, "later_steps": ["..."]}
3. Finish with the answer for the user:
{"action": "conclude", "answer": "<final answer>"}"#;

pub const CONCLUDER_SYSTEM: &str = r#"You finish a multi-step task. No more tools can be called.
Write the final answer for the user in plain text, based only on what the steps established. Say plainly what could not be done."#;

// ─── Builders ───────────────────────────────────────────────────────────────

/// Planning prompt: request, context snapshot, and tool catalog.
pub fn planning_prompt(request: &PlanRequest, registry: &ToolRegistry) -> String {
    let mut prompt = String::new();
    if let Some(context) = request.context.as_deref().filter(|c| !c.trim().is_empty()) {
        prompt.push_str(&format!("Context:\n{}\n\n", context.trim()));
    }
    prompt.push_str(&format!("{}\n", registry.capability_summary()));
    if !registry.is_empty() {
        prompt.push_str(&format!("Tools:\n{}\n", registry.catalog()));
    }
    prompt.push_str(&format!("\nRequest:\n{}", request.instruction.trim()));
    prompt
}

/// Stage (a): classify an instruction against the catalog.
pub fn selection_prompt(instruction: &str, registry: &ToolRegistry) -> String {
    format!(
        "Tools:\n{}\n\nInstruction:\n{}",
        registry.catalog(),
        instruction.trim()
    )
}

/// Stage (b): arguments for one tool, scoped to its schema.
///
/// `previous_error` carries the rejection reason of the last attempt.
pub fn arguments_prompt(
    descriptor: &ToolDescriptor,
    instruction: &str,
    notes: Option<&str>,
    previous_error: Option<&str>,
) -> String {
    let schema = serde_json::to_string_pretty(&descriptor.parameter_schema)
        .unwrap_or_else(|_| descriptor.parameter_schema.to_string());

    let mut prompt = format!(
        "Tool: {}\nDescription: {}\nParameter schema:\n{}\n\nInstruction:\n{}",
        descriptor.name,
        descriptor.description.trim(),
        schema,
        instruction.trim()
    );
    if let Some(notes) = notes.filter(|n| !n.trim().is_empty()) {
        prompt.push_str(&format!("\n\nNotes from the previous attempt:\n{}", notes.trim()));
    }
    if let Some(err) = previous_error {
        prompt.push_str(&format!(
            "\n\nYour previous arguments were rejected: {err}\nReturn corrected arguments."
        ));
    }
    prompt
}

/// Decision prompt: objective, step summaries, the current step and its
/// result, and what is left.
pub fn decision_prompt(state: &PlanState, result: &StepResult, preview_bytes: usize) -> String {
    let mut prompt = plan_summary(state);
    prompt.push_str(&current_step_block(&state.current_step, result, preview_bytes));
    prompt.push_str(&later_steps_block(&state.later_steps));
    prompt.push_str("\nDecide: refine, complete, or conclude.");
    prompt
}

/// Forced-conclusion prompt: same context, no option to continue.
pub fn conclusion_prompt(
    state: &PlanState,
    last: Option<&StepResult>,
    reason: &str,
    preview_bytes: usize,
) -> String {
    let mut prompt = plan_summary(state);
    if let Some(result) = last {
        prompt.push_str(&current_step_block(&state.current_step, result, preview_bytes));
    }
    prompt.push_str(&format!(
        "\nThe plan must stop now ({reason}). You must conclude: write the final answer."
    ));
    prompt
}

/// One-line progress text for a finished step.
/// Answer written when the planner call fails.
pub const PLANNING_FALLBACK: &str =
    "I could not work out a plan for this request. Please try again or rephrase it.";

/// Conclusion built from step summaries when the concluding call fails.
pub fn fallback_conclusion(state: &PlanState) -> String {
    let steps = state.completed_steps();
    if steps.is_empty() {
        return format!("I could not finish \"{}\". No steps were completed.", state.objective);
    }
    let mut text = format!("I could not finish \"{}\". Completed steps:\n", state.objective);
    for step in steps {
        let mark = if step.succeeded { "ok" } else { "failed" };
        text.push_str(&format!("- [{mark}] {}: {}\n", step.objective, step.conclusion));
    }
    text
}

pub fn step_progress(result: &StepResult) -> String {
    let tool = result.tool.as_deref().unwrap_or("no tool");
    match &result.outcome {
        StepOutcome::Ok(text) => {
            let preview = preview_chars(text, PROGRESS_PREVIEW_CHARS);
            format!("[{tool}] ok: {preview}\n")
        }
        StepOutcome::Error(message) => format!("[{tool}] failed: {message}\n"),
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn plan_summary(state: &PlanState) -> String {
    let mut text = format!("Objective: {}\n", state.objective);
    if state.completed_steps().is_empty() {
        text.push_str("Completed steps: none\n");
    } else {
        text.push_str("Completed steps:\n");
        for (i, step) in state.completed_steps().iter().enumerate() {
            let mark = if step.succeeded { "ok" } else { "failed" };
            text.push_str(&format!("{}. [{mark}] {}: {}\n", i + 1, step.objective, step.conclusion));
        }
    }
    text
}

fn current_step_block(intent: &StepIntent, result: &StepResult, preview_bytes: usize) -> String {
    let mut text = format!(
        "\nCurrent step: {}\nTool: {}\nInstruction: {}\n",
        intent.objective,
        result.tool.as_deref().unwrap_or("none"),
        result.instruction
    );
    if let Some(args) = &result.args {
        text.push_str(&format!("Arguments: {}\n", compact_json(args)));
    }
    match &result.outcome {
        StepOutcome::Ok(output) => {
            let shown = truncate_utf8(output, preview_bytes);
            text.push_str(&format!("Result:\n{shown}\n"));
            if shown.len() < output.len() {
                text.push_str(&format!("... ({} bytes total)\n", output.len()));
            }
        }
        StepOutcome::Error(message) => text.push_str(&format!("Error: {message}\n")),
    }
    text
}

fn later_steps_block(later: &[String]) -> String {
    if later.is_empty() {
        return String::new();
    }
    let items: Vec<String> = later.iter().map(|s| format!("- {s}")).collect();
    format!("\nRemaining steps:\n{}\n", items.join("\n"))
}

fn compact_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

fn preview_chars(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{cut}…")
    }
}

/// Truncate a string to at most `max_bytes` bytes on a valid UTF-8 char boundary.
pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::types::CompletedStep;
    use serde_json::json;

    fn state() -> PlanState {
        let mut state = PlanState::new(
            "Tidy downloads",
            StepIntent {
                objective: "List files".into(),
                tool_name: Some("list_dir".into()),
                instruction: "List ~/Downloads".into(),
                notes: None,
            },
            vec!["Move PDFs".into()],
        );
        state.push_completed(CompletedStep {
            objective: "Check disk".into(),
            succeeded: false,
            conclusion: "permission denied".into(),
        });
        state
    }

    #[test]
    fn test_truncate_utf8_boundaries() {
        assert_eq!(truncate_utf8("hello", 10), "hello");
        assert_eq!(truncate_utf8("hello", 3), "hel");
        // 'é' is two bytes; cutting inside it backs off.
        assert_eq!(truncate_utf8("héllo", 2), "h");
    }

    #[test]
    fn test_decision_prompt_carries_summaries_not_payloads() {
        let result = StepResult {
            tool: Some("list_dir".into()),
            instruction: "List ~/Downloads".into(),
            args: Some(json!({"path": "~/Downloads"})),
            outcome: StepOutcome::Ok("a.pdf\n".repeat(100)),
        };
        let prompt = decision_prompt(&state(), &result, 20);
        assert!(prompt.contains("1. [failed] Check disk: permission denied"));
        assert!(prompt.contains(r#"Arguments: {"path":"~/Downloads"}"#));
        assert!(prompt.contains("(600 bytes total)"));
        assert!(prompt.contains("- Move PDFs"));
    }

    #[test]
    fn test_conclusion_prompt_omits_continue_option() {
        let prompt = conclusion_prompt(&state(), None, "iteration limit reached", 100);
        assert!(prompt.contains("You must conclude"));
        assert!(!prompt.contains("refine"));
    }

    #[test]
    fn test_step_progress() {
        let failed = StepResult::failed(None, "x", "no tool available for this step");
        assert_eq!(step_progress(&failed), "[no tool] failed: no tool available for this step\n");

        let ok = StepResult {
            tool: Some("echo".into()),
            instruction: "x".into(),
            args: None,
            outcome: StepOutcome::Ok("line one\nline two".into()),
        };
        assert_eq!(step_progress(&ok), "[echo] ok: line one line two\n");
    }

    #[test]
    fn test_fallback_conclusion_lists_completed_steps() {
        let text = fallback_conclusion(&state());
        assert!(text.starts_with("I could not finish \"Tidy downloads\"."));
        assert!(text.contains("- [failed] Check disk: permission denied\n"));

        let empty = PlanState::new("Tidy downloads", state().current_step, Vec::new());
        assert!(fallback_conclusion(&empty).ends_with("No steps were completed."));
    }

    #[test]
    fn test_planning_prompt_includes_context() {
        let request = PlanRequest::new("What changed?").with_context("repo: toolrelay");
        let prompt = planning_prompt(&request, &ToolRegistry::new());
        assert!(prompt.starts_with("Context:\nrepo: toolrelay"));
        assert!(prompt.contains("No tools are currently available."));
        assert!(prompt.ends_with("What changed?"));
    }
}
