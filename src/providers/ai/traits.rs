//! Inference backend trait and the single-turn prompt it answers.

use std::borrow::Cow;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Appended to the system prompt by backends without a native JSON mode.
pub const JSON_ONLY_INSTRUCTION: &str =
    "Respond with a single JSON object and nothing else: no prose, no code fences.";

/// Errors from an inference backend.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("unreadable backend response: {0}")]
    InvalidResponse(String),

    #[error("rate limited, retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("backend rejected the credentials: {0}")]
    Authentication(String),

    #[error("backend overloaded: {0}")]
    Overloaded(String),

    #[error("backend not configured: {0}")]
    NotConfigured(String),
}

pub type LlmResult<T> = Result<T, LlmError>;

/// Shape the caller expects the output in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    /// Free text.
    #[default]
    Text,
    /// A single JSON object. Backends with a native JSON mode enable it;
    /// the others rely on [`JSON_ONLY_INSTRUCTION`].
    Json,
}

/// One system prompt and one user turn.
///
/// Classification and drafting never hold a conversation, so this is all a
/// backend is asked to answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Instructions and reference material (FAQ list, template, history).
    pub system: String,
    /// The email being triaged.
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    #[serde(default)]
    pub response_format: ResponseFormat,
}

impl CompletionRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            temperature: 0.3,
            max_tokens: 500,
            response_format: ResponseFormat::Text,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_json_output(mut self) -> Self {
        self.response_format = ResponseFormat::Json;
        self
    }

    /// The system prompt with the JSON-only instruction appended when JSON
    /// was requested.
    pub fn system_with_format_hint(&self) -> Cow<'_, str> {
        match self.response_format {
            ResponseFormat::Text => Cow::Borrowed(&self.system),
            ResponseFormat::Json if self.system.is_empty() => Cow::Borrowed(JSON_ONLY_INSTRUCTION),
            ResponseFormat::Json => Cow::Owned(format!("{}\n\n{JSON_ONLY_INSTRUCTION}", self.system)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u32,
    pub output: u32,
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    /// Hit `max_tokens`; the text is cut off.
    Length,
    Filtered,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub text: String,
    pub usage: TokenUsage,
    pub finish_reason: FinishReason,
}

impl CompletionResponse {
    /// A complete answer with no usage figures.
    pub fn finished(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: TokenUsage::default(),
            finish_reason: FinishReason::Stop,
        }
    }

    /// Whether generation was cut off by the token limit.
    pub fn is_truncated(&self) -> bool {
        self.finish_reason == FinishReason::Length
    }
}

/// An inference backend (OpenAI-compatible, Anthropic, Ollama).
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Short backend name for logs, e.g. "anthropic".
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> LlmResult<CompletionResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn builder_sets_sampling_and_format() {
        let request = CompletionRequest::new("Classify", "Dobrý deň")
            .with_temperature(0.2)
            .with_max_tokens(300)
            .with_json_output();

        assert_eq!(request.system, "Classify");
        assert_eq!(request.prompt, "Dobrý deň");
        assert_eq!(request.temperature, 0.2);
        assert_eq!(request.max_tokens, 300);
        assert_eq!(request.response_format, ResponseFormat::Json);
    }

    #[test]
    fn format_hint_only_for_json() {
        let text = CompletionRequest::new("Draft a reply", "x");
        assert_eq!(text.system_with_format_hint(), "Draft a reply");

        let json = text.clone().with_json_output();
        assert_eq!(
            json.system_with_format_hint(),
            format!("Draft a reply\n\n{JSON_ONLY_INSTRUCTION}")
        );

        let bare = CompletionRequest::new("", "x").with_json_output();
        assert_eq!(bare.system_with_format_hint(), JSON_ONLY_INSTRUCTION);
    }

    #[test]
    fn response_format_defaults_to_text() {
        let request: CompletionRequest = serde_json::from_str(
            r#"{"system":"s","prompt":"p","temperature":0.3,"max_tokens":10}"#,
        )
        .unwrap();
        assert_eq!(request.response_format, ResponseFormat::Text);
    }

    #[test]
    fn unknown_finish_reason_is_other() {
        let reason: FinishReason = serde_json::from_str("\"tool_calls\"").unwrap();
        assert_eq!(reason, FinishReason::Other);
    }

    #[test]
    fn truncation_follows_finish_reason() {
        let mut response = CompletionResponse::finished("Dobrý deň, otvorené máme");
        assert!(!response.is_truncated());
        response.finish_reason = FinishReason::Length;
        assert!(response.is_truncated());
    }
}
