//! The model backend seam.
//!
//! The plan engine and tool selector only need "generate text from a prompt
//! for a tier". [`InferenceClient`](super::client::InferenceClient) is the
//! HTTP implementation; tests script replies through the same trait.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;

use super::errors::InferenceError;
use super::types::GenerateRequest;

/// Text deltas from a streaming generation.
pub type TextStream = BoxStream<'static, Result<String, InferenceError>>;

#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Generate a complete reply.
    async fn generate(&self, request: GenerateRequest) -> Result<String, InferenceError>;

    /// Generate a reply as a stream of text deltas.
    ///
    /// Backends without streaming support yield the full reply as one delta.
    async fn generate_stream(&self, request: GenerateRequest) -> Result<TextStream, InferenceError> {
        let text = self.generate(request).await?;
        Ok(futures::stream::once(async move { Ok(text) }).boxed())
    }
}
