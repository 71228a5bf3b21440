//! Agent Core error types.

use thiserror::Error;

use crate::inference::InferenceError;
use crate::mcp_client::schema::SchemaViolation;

/// Stage (b) of tool selection could not produce usable arguments.
///
/// The engine turns this into a failed step rather than ending the plan.
#[derive(Debug, Error)]
pub enum ArgumentError {
    /// The model's reply held no JSON object.
    #[error("arguments for '{tool}' could not be parsed: {reason}")]
    Unparseable { tool: String, reason: String },

    /// The reply parsed but does not fit the tool's schema.
    #[error("arguments for '{tool}' are invalid: {violation}")]
    Invalid { tool: String, violation: SchemaViolation },

    /// The model call itself failed.
    #[error(transparent)]
    Backend(#[from] InferenceError),
}

/// Errors that end a plan early.
#[derive(Debug, Error)]
pub enum PlanError {
    /// No usable model reply; the request ends with an error conclusion.
    #[error("model backend failed: {0}")]
    Backend(#[from] InferenceError),
}

/// Errors writing to a response sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The receiving side is gone.
    #[error("sink closed")]
    Closed,

    #[error("sink write failed: {reason}")]
    Io { reason: String },
}

impl From<std::io::Error> for SinkError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::BrokenPipe => SinkError::Closed,
            _ => SinkError::Io {
                reason: e.to_string(),
            },
        }
    }
}
