//! Inference: model backend for planning, selection, and conclusions.
//!
//! This module handles all communication with model endpoints:
//! - The `ModelBackend` seam the engine and selector call through
//! - Fast/full tier routing with a per-call fallback chain
//! - Streaming and non-streaming chat completions (SSE parsing)
//!
//! The client speaks the OpenAI Chat Completions API, so swapping the model
//! behind a tier is a config change, not a code change.

pub mod backend;
pub mod client;
pub mod config;
pub mod errors;
pub mod streaming;
pub mod types;

// Re-exports for convenience
pub use backend::{ModelBackend, TextStream};
pub use client::InferenceClient;
pub use config::{ModelConfig, ModelsConfig};
pub use errors::InferenceError;
pub use types::{CallPurpose, GenerateRequest, ModelTier};
