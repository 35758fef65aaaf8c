//! OpenRouter API client.
//!
//! One request per call; failures are classified into transient/permanent
//! and bubble up so the orchestrator can apply its retry budget.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::ProviderError;
use super::{Generation, GenerationRequest, ModelClient};

const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// OpenRouter chat-completions client.
pub struct OpenRouterClient {
    client: Client,
    api_key: String,
}

impl OpenRouterClient {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
        }
    }

    /// Parse Retry-After header if present (seconds form only).
    fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
        headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok().map(Duration::from_secs))
    }
}

#[async_trait]
impl ModelClient for OpenRouterClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, ProviderError> {
        let body = OpenRouterRequest {
            model: request.model_id.clone(),
            messages: vec![OpenRouterMessage {
                role: "user".to_string(),
                content: request.prompt.clone(),
            }],
            max_tokens: request.max_tokens,
        };

        tracing::debug!(model = %request.model_id, "Sending request to OpenRouter");

        let response = match self
            .client
            .post(OPENROUTER_API_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                return Err(if e.is_timeout() {
                    ProviderError::transient(format!("Request timeout: {}", e))
                } else if e.is_connect() {
                    ProviderError::transient(format!("Connection failed: {}", e))
                } else {
                    ProviderError::transient(format!("Request failed: {}", e))
                });
            }
        };

        let status = response.status();
        let retry_after = Self::parse_retry_after(response.headers());
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(
                ProviderError::from_status(status.as_u16(), text).with_retry_after(retry_after)
            );
        }

        let parsed: OpenRouterResponse = serde_json::from_str(&text).map_err(|e| {
            ProviderError::permanent(format!("Failed to parse response: {}, body: {}", e, text))
        })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::permanent("No choices in response"))?;

        let content = choice
            .message
            .content
            .ok_or_else(|| ProviderError::permanent("Empty completion content"))?;

        // Providers occasionally omit usage; fall back to a length estimate
        // so cost entries are never silently zero.
        let (input_tokens, output_tokens) = match parsed.usage {
            Some(u) => (u.prompt_tokens, u.completion_tokens),
            None => (
                (body.messages[0].content.len() / 4) as u64,
                (content.len() / 4) as u64,
            ),
        };

        Ok(Generation {
            text: content,
            input_tokens,
            output_tokens,
        })
    }

    fn provider(&self) -> &str {
        "openrouter"
    }
}

/// OpenRouter API request format.
#[derive(Debug, Serialize)]
struct OpenRouterRequest {
    model: String,
    messages: Vec<OpenRouterMessage>,
    max_tokens: u64,
}

#[derive(Debug, Serialize)]
struct OpenRouterMessage {
    role: String,
    content: String,
}

/// OpenRouter API response format.
#[derive(Debug, Deserialize)]
struct OpenRouterResponse {
    choices: Vec<OpenRouterChoice>,
    #[serde(default)]
    usage: Option<OpenRouterUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenRouterChoice {
    message: OpenRouterResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenRouterResponseMessage {
    content: Option<String>,
}

/// Usage data (OpenAI-compatible).
#[derive(Debug, Deserialize)]
struct OpenRouterUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}
