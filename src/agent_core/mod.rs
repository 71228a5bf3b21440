//! Agent Core: the iterative plan engine.
//!
//! Submodules:
//! - `engine`: Planning → ExecutingStep → Deciding → Concluding state machine
//! - `selector`: Two-stage tool selection (classify, then schema-scoped arguments)
//! - `plan_parser`: Decoders for planner, selector, and decision replies
//! - `prompts`: Prompt builders and system prompts
//! - `approval`: Confirmation round trip for `confirm`-class tools
//! - `sink`: Response streaming contract (headers, chunks, one end)
//! - `types`: Shared types across the agent core
//! - `errors`: Agent-level error types

pub mod approval;
pub mod engine;
pub mod errors;
pub mod plan_parser;
pub mod prompts;
pub mod selector;
pub mod sink;
pub mod types;

// Re-exports for convenience
pub use approval::{ApprovalGate, AutoApprove, ChannelApproval, DenyAll, PendingApproval};
pub use engine::PlanEngine;
pub use errors::{ArgumentError, PlanError, SinkError};
pub use selector::{RetryPolicy, ToolSelector};
pub use sink::{ChannelSink, Sink, SinkEvent, WriterSink};
pub use types::{
    CompletedStep, ConfirmationRequest, ConfirmationResponse, EngineConfig, PlanOutcome, PlanRequest,
    PlanState, PlanStatus, StepIntent, StepOutcome, StepResult,
};
