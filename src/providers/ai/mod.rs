//! Inference backends used for classification and drafting.
//!
//! - **OpenAI-compatible**: OpenAI, vLLM, LM Studio and similar endpoints
//! - **Anthropic**: Claude models via the Messages API
//! - **Ollama**: local models
//!
//! [`build_provider`] turns a configured provider entry into a trait object.

mod anthropic;
mod ollama;
mod openai;
mod traits;

use std::sync::Arc;
use std::time::Duration;

pub use anthropic::AnthropicProvider;
pub use ollama::{OllamaProvider, OLLAMA_DEFAULT_URL};
pub use openai::{OpenAiCompatibleProvider, OPENAI_BASE_URL};
pub use traits::{
    CompletionRequest, CompletionResponse, FinishReason, LlmError, LlmProvider, LlmResult,
    ResponseFormat, TokenUsage, JSON_ONLY_INSTRUCTION,
};

use reqwest::header::{HeaderMap, RETRY_AFTER};

use crate::config::ProviderSettings;

/// Seconds from a `Retry-After` header, when it holds a plain number.
fn retry_after(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Builds the backend named `name` from its settings.
///
/// `anthropic` and `openai` need an API key; `ollama` never does. Any other
/// name is treated as a custom OpenAI-compatible endpoint and requires a
/// `base_url`.
pub fn build_provider(
    name: &str,
    settings: &ProviderSettings,
    api_key: Option<String>,
    timeout: Duration,
) -> LlmResult<Arc<dyn LlmProvider>> {
    let require_key = |key: Option<String>| {
        key.ok_or_else(|| LlmError::NotConfigured(format!("no API key for {name}")))
    };

    let provider: Arc<dyn LlmProvider> = match name {
        "anthropic" => Arc::new(
            AnthropicProvider::new(require_key(api_key)?, &settings.model).with_timeout(timeout)?,
        ),
        "openai" => {
            let base = settings.base_url.as_deref().unwrap_or(OPENAI_BASE_URL);
            Arc::new(
                OpenAiCompatibleProvider::custom(base, Some(require_key(api_key)?), &settings.model)
                    .with_timeout(timeout)?,
            )
        }
        "ollama" => {
            let base = settings.base_url.as_deref().unwrap_or(OLLAMA_DEFAULT_URL);
            Arc::new(OllamaProvider::with_url(base, &settings.model).with_timeout(timeout)?)
        }
        other => {
            let base = settings.base_url.as_deref().ok_or_else(|| {
                LlmError::NotConfigured(format!("provider {other} has no base_url"))
            })?;
            Arc::new(
                OpenAiCompatibleProvider::custom(base, api_key, &settings.model)
                    .with_timeout(timeout)?,
            )
        }
    };

    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(model: &str, base_url: Option<&str>) -> ProviderSettings {
        ProviderSettings {
            api_key_keychain_id: None,
            base_url: base_url.map(str::to_string),
            model: model.to_string(),
        }
    }

    #[test]
    fn builds_ollama_without_key() {
        let provider = build_provider(
            "ollama",
            &settings("llama3.2", None),
            None,
            Duration::from_secs(30),
        )
        .unwrap();
        assert_eq!(provider.name(), "ollama");
        assert_eq!(provider.model(), "llama3.2");
    }

    #[test]
    fn anthropic_requires_key() {
        let result = build_provider(
            "anthropic",
            &settings("claude-3-5-haiku-latest", None),
            None,
            Duration::from_secs(30),
        );
        assert!(matches!(result, Err(LlmError::NotConfigured(_))));
    }

    #[test]
    fn custom_endpoint_requires_base_url() {
        let missing = build_provider("vllm", &settings("qwen", None), None, Duration::from_secs(5));
        assert!(matches!(missing, Err(LlmError::NotConfigured(_))));

        let ok = build_provider(
            "vllm",
            &settings("qwen", Some("http://gpu-box:8000/v1")),
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(ok.name(), "openai-compatible");
    }

    #[test]
    fn retry_after_reads_seconds() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);

        headers.insert(RETRY_AFTER, "12".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(12));

        headers.insert(RETRY_AFTER, "Wed, 21 Oct 2026 07:28:00 GMT".parse().unwrap());
        assert_eq!(retry_after(&headers), None);
    }
}
