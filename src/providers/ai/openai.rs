//! OpenAI-compatible chat completions backend.
//!
//! Also drives Ollama, vLLM, LM Studio and anything else that speaks the
//! `/chat/completions` dialect, including `response_format: json_object`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::retry_after;
use super::traits::{
    CompletionRequest, CompletionResponse, FinishReason, LlmError, LlmProvider, LlmResult,
    ResponseFormat, TokenUsage,
};

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: [Turn<'a>; 2],
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<JsonMode>,
}

#[derive(Debug, Serialize)]
struct Turn<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct JsonMode {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
    code: Option<String>,
}

/// Backend for OpenAI and OpenAI-compatible servers.
pub struct OpenAiCompatibleProvider {
    client: reqwest::Client,
    name: &'static str,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiCompatibleProvider {
    /// OpenAI itself.
    pub fn openai(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self::custom(OPENAI_BASE_URL, Some(api_key.into()), model).with_name("openai")
    }

    /// Any server at `base_url`; local servers usually need no key.
    pub fn custom(
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            name: "openai-compatible",
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
        }
    }

    /// Reports a different backend name, for servers that only borrow the
    /// OpenAI dialect.
    pub(crate) fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Rebuilds the HTTP client with a per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> LlmResult<Self> {
        self.client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(self)
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(value) = self
            .api_key
            .as_ref()
            .and_then(|key| HeaderValue::from_str(&format!("Bearer {key}")).ok())
        {
            headers.insert(AUTHORIZATION, value);
        }
        headers
    }

    fn body<'a>(&'a self, request: &'a CompletionRequest) -> ChatBody<'a> {
        ChatBody {
            model: &self.model,
            messages: [
                Turn {
                    role: "system",
                    content: &request.system,
                },
                Turn {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: (request.response_format == ResponseFormat::Json).then_some(JsonMode {
                kind: "json_object",
            }),
        }
    }

    async fn error_from(response: reqwest::Response) -> LlmError {
        let status = response.status().as_u16();
        if status == 429 {
            return LlmError::RateLimited {
                retry_after_secs: retry_after(response.headers()),
            };
        }

        match response.json::<ErrorBody>().await {
            Ok(body) if status == 401 || body.error.code.as_deref() == Some("invalid_api_key") => {
                LlmError::Authentication(body.error.message)
            }
            Ok(body) if status == 503 => LlmError::Overloaded(body.error.message),
            Ok(body) => LlmError::Api {
                status,
                message: body.error.message,
            },
            Err(_) => LlmError::Api {
                status,
                message: format!("http {status}"),
            },
        }
    }
}

fn finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("stop") => FinishReason::Stop,
        Some("length") => FinishReason::Length,
        Some("content_filter") => FinishReason::Filtered,
        _ => FinishReason::Other,
    }
}

fn into_response(reply: ChatReply) -> LlmResult<CompletionResponse> {
    let choice = reply
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::InvalidResponse("no choices".to_string()))?;
    let usage = reply
        .usage
        .map(|u| TokenUsage {
            input: u.prompt_tokens,
            output: u.completion_tokens,
        })
        .unwrap_or_default();

    Ok(CompletionResponse {
        text: choice.message.content.unwrap_or_default(),
        usage,
        finish_reason: finish_reason(choice.finish_reason.as_deref()),
    })
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> LlmResult<CompletionResponse> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .headers(self.headers())
            .json(&self.body(request))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let reply: ChatReply = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        into_response(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn body_has_system_then_user_turn() {
        let provider = OpenAiCompatibleProvider::openai("sk-test", "gpt-4o-mini");
        let request = CompletionRequest::new("Classify", "Kedy máte otvorené?")
            .with_temperature(0.5)
            .with_max_tokens(300);

        let json = serde_json::to_value(provider.body(&request)).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "model": "gpt-4o-mini",
                "messages": [
                    {"role": "system", "content": "Classify"},
                    {"role": "user", "content": "Kedy máte otvorené?"},
                ],
                "temperature": 0.5,
                "max_tokens": 300,
            })
        );
    }

    #[test]
    fn json_requests_enable_json_mode() {
        let provider = OpenAiCompatibleProvider::openai("sk-test", "gpt-4o-mini");
        let request = CompletionRequest::new("Classify", "x").with_json_output();

        let json = serde_json::to_value(provider.body(&request)).unwrap();

        assert_eq!(json["response_format"], serde_json::json!({"type": "json_object"}));
        // The native mode replaces the prompt hint.
        assert_eq!(json["messages"][0]["content"], "Classify");
    }

    #[test]
    fn reply_maps_to_response() {
        let reply: ChatReply = serde_json::from_str(
            r#"{
                "choices": [{
                    "message": {"content": "{\"category\":\"FAQ\"}"},
                    "finish_reason": "length"
                }],
                "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
            }"#,
        )
        .unwrap();

        let response = into_response(reply).unwrap();

        assert_eq!(response.text, "{\"category\":\"FAQ\"}");
        assert_eq!(response.usage, TokenUsage { input: 10, output: 5 });
        assert!(response.is_truncated());
    }

    #[test]
    fn empty_choices_are_invalid() {
        let reply: ChatReply = serde_json::from_str(r#"{"choices": []}"#).unwrap();
        assert!(matches!(into_response(reply), Err(LlmError::InvalidResponse(_))));
    }

    #[test]
    fn custom_endpoint_without_key() {
        let provider = OpenAiCompatibleProvider::custom("http://localhost:8000/v1/", None, "qwen2.5");

        assert_eq!(provider.base_url, "http://localhost:8000/v1");
        assert_eq!(provider.name(), "openai-compatible");
        assert!(provider.headers().get(AUTHORIZATION).is_none());
    }

    #[test]
    fn bearer_header_for_openai() {
        let provider = OpenAiCompatibleProvider::openai("sk-test", "gpt-4o");
        assert_eq!(provider.headers().get(AUTHORIZATION).unwrap(), "Bearer sk-test");
        assert_eq!(provider.name(), "openai");
    }
}
