//! Chat completion client with tool calling support
//!
//! `CompletionClient` is the seam between the orchestration loop and the model
//! provider. `OpenAiClient` speaks the OpenAI-compatible `/chat/completions`
//! endpoint (OpenAI, DeepSeek and friends).
//!
//! Rate limits are surfaced as `CompletionError::RateLimited` and never
//! retried here; the caller owns the backoff policy.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use super::messages::{ChatMessage, Tool, ToolCall};
use super::usage::TokenUsage;
use crate::config::ProviderConfig;

/// One choice of a completion response
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionChoice {
    pub message: ChatMessage,
}

/// Response from `/chat/completions`
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionResponse {
    pub choices: Vec<CompletionChoice>,
    #[serde(default)]
    pub usage: TokenUsage,
}

impl CompletionResponse {
    /// Single-choice text response
    pub fn text(content: impl Into<String>, usage: TokenUsage) -> Self {
        Self {
            choices: vec![CompletionChoice {
                message: ChatMessage::assistant(content),
            }],
            usage,
        }
    }

    /// Single-choice response requesting tool calls
    pub fn tool_calls(calls: Vec<ToolCall>, usage: TokenUsage) -> Self {
        Self {
            choices: vec![CompletionChoice {
                message: ChatMessage::assistant_tool_calls(None, calls),
            }],
            usage,
        }
    }

    /// First choice that requests at least one tool call
    pub fn tool_call_message(&self) -> Option<&ChatMessage> {
        self.choices
            .iter()
            .map(|c| &c.message)
            .find(|m| !m.requested_tool_calls().is_empty())
    }

    /// Text of every choice joined with newlines
    pub fn joined_text(&self) -> String {
        self.choices
            .iter()
            .map(|c| c.message.text())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A completion request borrowing the live conversation
#[derive(Debug, Clone, Copy)]
pub struct CompletionRequest<'a> {
    pub messages: &'a [ChatMessage],
    pub tools: &'a [Tool],
    /// Forwarded as `parallel_tool_calls` when set and tools are present
    pub parallel_tool_calls: Option<bool>,
}

/// Error type for completion calls
#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("rate limited by provider: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },

    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("empty response from provider")]
    EmptyResponse,
}

impl CompletionError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, CompletionError::RateLimited { .. })
    }

    pub fn status_label(&self) -> &'static str {
        if self.is_rate_limit() {
            "rate_limited"
        } else {
            "error"
        }
    }
}

/// Classify a non-success HTTP status
///
/// 429 becomes `RateLimited` (with the `Retry-After` seconds when present);
/// every other status is a fatal `Status` error.
pub fn classify_failure(status: u16, retry_after: Option<&str>, body: String) -> CompletionError {
    if status == 429 {
        let retry_after = retry_after
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        return CompletionError::RateLimited {
            retry_after,
            message: truncate_body(&body),
        };
    }
    CompletionError::Status {
        status,
        body: truncate_body(&body),
    }
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 300;
    if body.chars().count() <= MAX {
        body.to_string()
    } else {
        format!("{}...", body.chars().take(MAX).collect::<String>())
    }
}

/// A single request/response exchange with the model provider
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Model identifier used for requests and pricing
    fn model(&self) -> &str;

    async fn complete(
        &self,
        request: CompletionRequest<'_>,
    ) -> Result<CompletionResponse, CompletionError>;
}

/// Client for OpenAI-compatible `/chat/completions` endpoints
#[derive(Clone)]
pub struct OpenAiClient {
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiClient {
    /// Create a new client
    ///
    /// # Arguments
    /// * `base_url` - API root, e.g. `https://api.openai.com/v1`
    /// * `api_key` - Bearer token
    /// * `model` - Model name, e.g. `gpt-4o-mini`
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &ProviderConfig) -> Self {
        Self::new(&config.base_url, &config.api_key, &config.model)
    }

    /// JSON body for a completion request
    pub fn request_body(&self, request: &CompletionRequest<'_>) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": request.messages,
        });

        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(request.tools);
            body["tool_choice"] = serde_json::json!("auto");
            if let Some(parallel) = request.parallel_tool_calls {
                body["parallel_tool_calls"] = serde_json::json!(parallel);
            }
        }

        body
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        request: CompletionRequest<'_>,
    ) -> Result<CompletionResponse, CompletionError> {
        let endpoint = format!("{}/chat/completions", self.base_url);
        let body = self.request_body(&request);

        let response = self
            .client
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let text = response.text().await.unwrap_or_default();
            return Err(classify_failure(status.as_u16(), retry_after.as_deref(), text));
        }

        let text = response.text().await?;
        if text.is_empty() {
            return Err(CompletionError::EmptyResponse);
        }

        let parsed: CompletionResponse = serde_json::from_str(&text)?;
        if parsed.choices.is_empty() {
            return Err(CompletionError::EmptyResponse);
        }
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rate_limit_with_retry_after() {
        let err = classify_failure(429, Some("17"), "slow down".to_string());
        match err {
            CompletionError::RateLimited { retry_after, message } => {
                assert_eq!(retry_after, Some(Duration::from_secs(17)));
                assert_eq!(message, "slow down");
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_other_status_is_fatal() {
        let err = classify_failure(401, None, "bad key".to_string());
        assert!(!err.is_rate_limit());
        assert!(err.to_string().contains("401"));
    }

    #[test]
    fn test_parse_response_with_usage() {
        let raw = r#"{
            "id": "x",
            "choices": [
                {"index": 0, "message": {"role": "assistant", "content": "4"}, "finish_reason": "stop"},
                {"index": 1, "message": {"role": "assistant", "content": "four"}, "finish_reason": "stop"}
            ],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        }"#;
        let response: CompletionResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.usage, TokenUsage::new(12, 3));
        assert!(response.tool_call_message().is_none());
        assert_eq!(response.joined_text(), "4\nfour");
    }

    #[test]
    fn test_request_body_includes_tool_settings() {
        let client = OpenAiClient::new("https://api.example.com/v1/", "k", "gpt-4o-mini");
        let messages = vec![ChatMessage::user("hi")];
        let tools = vec![Tool {
            tool_type: "function".to_string(),
            function: crate::llm::ToolFunction {
                name: "run_bash_shell".to_string(),
                description: "Run a bash command".to_string(),
                parameters: serde_json::json!({"type": "object"}),
            },
        }];
        let request = CompletionRequest {
            messages: &messages,
            tools: &tools,
            parallel_tool_calls: Some(false),
        };

        let body = client.request_body(&request);
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["parallel_tool_calls"], false);
        assert_eq!(body["tools"][0]["function"]["name"], "run_bash_shell");
        assert_eq!(client.base_url, "https://api.example.com/v1");
    }

    #[test]
    fn test_request_body_without_tools() {
        let client = OpenAiClient::new("http://localhost", "k", "m");
        let messages = vec![ChatMessage::user("hi")];
        let request = CompletionRequest {
            messages: &messages,
            tools: &[],
            parallel_tool_calls: Some(true),
        };
        let body = client.request_body(&request);
        assert!(body.get("tools").is_none());
        assert!(body.get("parallel_tool_calls").is_none());
    }
}
