//! Model provider collaborator.
//!
//! A trait-based abstraction over text-generation providers, with
//! OpenRouter as the primary implementation. Clients here never retry:
//! the orchestrator owns the retry budget so it stays uniform and
//! auditable across phases.

mod error;
mod openrouter;

pub use error::{classify_http_status, ProviderError, ProviderErrorKind};
pub use openrouter::OpenRouterClient;

use async_trait::async_trait;

/// A single generation request for a resolved model.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub model_id: String,
    pub prompt: String,
    pub max_tokens: u64,
}

/// Text plus the token usage it was billed at.
#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Trait for model provider clients.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Invoke the model once. No internal retries.
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, ProviderError>;

    /// Provider name recorded on cost entries.
    fn provider(&self) -> &str;
}
