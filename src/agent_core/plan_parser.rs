//! Decoders for model replies.
//!
//! Every model reply the engine acts on passes through one function here and
//! comes out as a closed enum. Downstream code matches on variants only.
//!
//! Replies are expected as JSON objects, but models wrap them in prose or
//! markdown fences, so the outermost `{…}` span is extracted first.

use serde::Deserialize;
use serde_json::Value;

use crate::agent_core::types::StepIntent;
use crate::mcp_client::ToolRegistry;

// ─── Reply Shapes ───────────────────────────────────────────────────────────

/// Decoded planner reply.
#[derive(Debug, Clone, PartialEq)]
pub enum InitialPlan {
    /// Work is needed: an objective and the first step.
    Steps {
        objective: String,
        first: StepIntent,
        later_steps: Vec<String>,
    },
    /// No step is needed; the text is the answer.
    Direct(String),
}

/// Decoded decision reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Retry the current step. `None` fields keep the current value.
    ContinueStep {
        notes: String,
        tool_name: Option<String>,
        instruction: Option<String>,
    },
    /// Close the current step and move to `next`.
    CompleteStep {
        succeeded: bool,
        conclusion: String,
        next: Option<StepIntent>,
        later_steps: Option<Vec<String>>,
    },
    /// Final answer.
    FinalConclusion(String),
    /// Matched no known shape. Carries the raw reply.
    Unparseable(String),
}

// ─── Wire Shapes ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawStep {
    #[serde(default)]
    objective: Option<String>,
    #[serde(default, alias = "tool_name")]
    tool: Option<String>,
    #[serde(default, alias = "prompt")]
    instruction: Option<String>,
}

impl RawStep {
    /// A step needs at least an objective or an instruction.
    fn into_intent(self) -> Option<StepIntent> {
        let objective = non_empty(self.objective);
        let instruction = non_empty(self.instruction);
        let (objective, instruction) = match (objective, instruction) {
            (Some(o), Some(i)) => (o, i),
            (Some(o), None) => (o.clone(), o),
            (None, Some(i)) => (i.clone(), i),
            (None, None) => return None,
        };
        Some(StepIntent {
            objective,
            tool_name: non_empty(self.tool),
            instruction,
            notes: None,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    objective: Option<String>,
    #[serde(default, alias = "response")]
    answer: Option<String>,
    #[serde(default, alias = "next_step", alias = "first_step")]
    step: Option<RawStep>,
    #[serde(default)]
    later_steps: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    action: String,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default, alias = "tool_name")]
    tool: Option<String>,
    #[serde(default)]
    instruction: Option<String>,
    #[serde(default)]
    succeeded: Option<bool>,
    #[serde(default)]
    conclusion: Option<String>,
    #[serde(default, alias = "next_step")]
    next: Option<RawStep>,
    #[serde(default)]
    later_steps: Option<Vec<String>>,
    #[serde(default, alias = "response")]
    answer: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawToolChoice {
    #[serde(default)]
    tool: Option<String>,
}

// ─── Decoders ───────────────────────────────────────────────────────────────

/// Decode the planner's reply.
///
/// A reply with no usable step is a direct answer: the `answer` field when
/// present, otherwise the reply text itself.
pub fn parse_initial_plan(text: &str) -> InitialPlan {
    let trimmed = text.trim();
    let Some(json) = extract_json(trimmed) else {
        return InitialPlan::Direct(trimmed.to_string());
    };

    let raw: RawPlan = match serde_json::from_str(json) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::debug!(error = %e, "planner reply is not a plan object");
            return InitialPlan::Direct(trimmed.to_string());
        }
    };

    let objective = non_empty(raw.objective);
    match raw.step.and_then(RawStep::into_intent) {
        Some(first) => InitialPlan::Steps {
            objective: objective.unwrap_or_else(|| first.objective.clone()),
            first,
            later_steps: raw.later_steps,
        },
        None => InitialPlan::Direct(
            non_empty(raw.answer)
                .or(objective)
                .unwrap_or_else(|| trimmed.to_string()),
        ),
    }
}

/// Decode a decision reply into exactly one [`Decision`].
///
/// Plain prose (no JSON at all) is a final conclusion. JSON that fits none
/// of the three actions is `Unparseable`.
pub fn parse_decision(text: &str) -> Decision {
    let trimmed = text.trim();
    let Some(json) = extract_json(trimmed) else {
        return if trimmed.is_empty() {
            Decision::Unparseable(String::new())
        } else {
            Decision::FinalConclusion(trimmed.to_string())
        };
    };

    let raw: RawDecision = match serde_json::from_str(json) {
        Ok(raw) => raw,
        Err(_) => return Decision::Unparseable(trimmed.to_string()),
    };

    match raw.action.trim().to_ascii_lowercase().as_str() {
        "refine" | "continue" | "retry" => Decision::ContinueStep {
            notes: raw.notes.unwrap_or_default(),
            tool_name: non_empty(raw.tool),
            instruction: non_empty(raw.instruction),
        },
        "complete" | "next" => Decision::CompleteStep {
            succeeded: raw.succeeded.unwrap_or(true),
            conclusion: raw.conclusion.unwrap_or_default(),
            next: raw.next.and_then(RawStep::into_intent),
            later_steps: raw.later_steps,
        },
        "conclude" | "final" | "answer" => {
            match non_empty(raw.answer).or_else(|| non_empty(raw.conclusion)) {
                Some(answer) => Decision::FinalConclusion(answer),
                None => Decision::Unparseable(trimmed.to_string()),
            }
        }
        _ => Decision::Unparseable(trimmed.to_string()),
    }
}

/// Text of a forced conclusion, whatever shape the model used.
pub fn conclusion_text(text: &str) -> String {
    match parse_decision(text) {
        Decision::FinalConclusion(answer) => answer,
        Decision::CompleteStep { conclusion, .. } if !conclusion.trim().is_empty() => conclusion,
        _ => text.trim().to_string(),
    }
}

/// Decode a stage (a) classification reply `{"tool": name|null}`.
///
/// Anything unparseable, or a name the registry does not know, is `None`.
pub fn parse_tool_choice(text: &str, registry: &ToolRegistry) -> Option<String> {
    let trimmed = text.trim();
    let name = match extract_json(trimmed) {
        Some(json) => serde_json::from_str::<RawToolChoice>(json).ok()?.tool?,
        // A bare tool name is accepted as-is.
        None => trimmed.trim_matches(|c| c == '"' || c == '`').to_string(),
    };

    let name = name.trim();
    if registry.contains(name) {
        Some(name.to_string())
    } else {
        if !name.is_empty() && name != "null" {
            tracing::debug!(tool = name, "selector named an unknown tool");
        }
        None
    }
}

/// Decode a stage (b) arguments reply into a JSON object.
pub fn parse_arguments(text: &str) -> Result<Value, String> {
    let json = extract_json(text.trim()).ok_or_else(|| "no JSON object in reply".to_string())?;
    let value: Value = serde_json::from_str(json).map_err(|e| format!("invalid JSON: {e}"))?;
    if value.is_object() {
        Ok(value)
    } else {
        Err("reply is not a JSON object".to_string())
    }
}

/// Extract the outermost `{…}` span, dropping fences and surrounding prose.
pub fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && v != "null")
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::{SafetyClass, ToolDescriptor};
    use crate::inference::ModelTier;
    use serde_json::json;

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register_server_tools(
            "fs",
            vec![ToolDescriptor {
                name: "read_file".into(),
                description: "Read a file.".into(),
                parameter_schema: json!({"type": "object"}),
                safety: SafetyClass::Auto,
                preferred_tier: ModelTier::Fast,
            }],
        );
        registry
    }

    #[test]
    fn test_initial_plan_with_step() {
        let reply = r#"Here is the plan:
```json
{"objective": "Summarize notes", "step": {"objective": "Read notes", "tool": "read_file", "instruction": "Read notes.md"}, "later_steps": ["Summarize"]}
```"#;
        match parse_initial_plan(reply) {
            InitialPlan::Steps { objective, first, later_steps } => {
                assert_eq!(objective, "Summarize notes");
                assert_eq!(first.tool_name.as_deref(), Some("read_file"));
                assert_eq!(first.instruction, "Read notes.md");
                assert_eq!(later_steps, vec!["Summarize".to_string()]);
            }
            other => panic!("expected steps, got {other:?}"),
        }
    }

    #[test]
    fn test_initial_plan_direct_answers() {
        assert_eq!(
            parse_initial_plan(r#"{"objective": "greet", "answer": "Hello!"}"#),
            InitialPlan::Direct("Hello!".into())
        );
        assert_eq!(
            parse_initial_plan("Just a plain answer."),
            InitialPlan::Direct("Just a plain answer.".into())
        );
        // A step with nothing in it is no step.
        assert_eq!(
            parse_initial_plan(r#"{"objective": "x", "step": {"tool": null}}"#),
            InitialPlan::Direct("x".into())
        );
    }

    #[test]
    fn test_decision_variants() {
        let refine = parse_decision(r#"{"action": "refine", "notes": "use the other dir", "tool": null}"#);
        assert_eq!(
            refine,
            Decision::ContinueStep {
                notes: "use the other dir".into(),
                tool_name: None,
                instruction: None,
            }
        );

        let complete = parse_decision(
            r#"{"action": "complete", "succeeded": false, "conclusion": "file missing",
                "next": {"objective": "list dir", "instruction": "list /tmp"}}"#,
        );
        match complete {
            Decision::CompleteStep { succeeded, conclusion, next, later_steps } => {
                assert!(!succeeded);
                assert_eq!(conclusion, "file missing");
                assert_eq!(next.unwrap().instruction, "list /tmp");
                assert!(later_steps.is_none());
            }
            other => panic!("expected CompleteStep, got {other:?}"),
        }

        assert_eq!(
            parse_decision(r#"{"action": "conclude", "answer": "42"}"#),
            Decision::FinalConclusion("42".into())
        );
    }

    #[test]
    fn test_decision_fallbacks() {
        assert_eq!(
            parse_decision("The answer is 42."),
            Decision::FinalConclusion("The answer is 42.".into())
        );
        assert!(matches!(parse_decision(r#"{"action": "dance"}"#), Decision::Unparseable(_)));
        assert!(matches!(parse_decision("{not json}"), Decision::Unparseable(_)));
        assert_eq!(parse_decision("   "), Decision::Unparseable(String::new()));
    }

    #[test]
    fn test_conclusion_text_accepts_any_form() {
        assert_eq!(conclusion_text(r#"{"action": "conclude", "answer": "done"}"#), "done");
        assert_eq!(conclusion_text("plain text "), "plain text");
        assert_eq!(conclusion_text(r#"{"action": "refine"}"#), r#"{"action": "refine"}"#);
    }

    #[test]
    fn test_tool_choice() {
        let registry = registry();
        assert_eq!(parse_tool_choice(r#"{"tool": "read_file"}"#, &registry), Some("read_file".into()));
        assert_eq!(parse_tool_choice(r#"{"tool": "nonexistent_tool"}"#, &registry), None);
        assert_eq!(parse_tool_choice(r#"{"tool": null}"#, &registry), None);
        assert_eq!(parse_tool_choice("read_file", &registry), Some("read_file".into()));
        assert_eq!(parse_tool_choice("¯\\_(ツ)_/¯", &registry), None);
    }

    #[test]
    fn test_parse_arguments() {
        assert_eq!(parse_arguments(r#"args: {"path": "/tmp"}"#).unwrap(), json!({"path": "/tmp"}));
        assert!(parse_arguments("none").is_err());
        assert!(parse_arguments("{oops}").is_err());
    }

    #[test]
    fn test_extract_json() {
        assert_eq!(extract_json("```json\n{\"a\":1}\n```"), Some("{\"a\":1}"));
        assert_eq!(extract_json("} backwards {"), None);
        assert_eq!(extract_json("nothing"), None);
    }
}
