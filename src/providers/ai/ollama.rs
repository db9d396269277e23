//! Local Ollama server.
//!
//! Ollama accepts the OpenAI dialect, `response_format` included, so this is
//! the OpenAI-compatible backend with local defaults and no key.

use std::time::Duration;

use async_trait::async_trait;

use super::openai::OpenAiCompatibleProvider;
use super::traits::{CompletionRequest, CompletionResponse, LlmProvider, LlmResult};

/// Where `ollama serve` listens by default.
pub const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434/v1";

/// Backend for models served by a local or LAN Ollama instance.
pub struct OllamaProvider {
    inner: OpenAiCompatibleProvider,
}

impl OllamaProvider {
    /// Creates a provider for `model` on the default local server.
    pub fn new(model: impl Into<String>) -> Self {
        Self::with_url(OLLAMA_DEFAULT_URL, model)
    }

    /// Creates a provider for `model` on the server at `base_url`, which must
    /// include the `/v1` suffix.
    pub fn with_url(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            inner: OpenAiCompatibleProvider::custom(base_url, None, model).with_name("ollama"),
        }
    }

    /// Local models on modest hardware can be slow; callers usually pass a
    /// longer timeout here than for hosted backends.
    pub fn with_timeout(self, timeout: Duration) -> LlmResult<Self> {
        Ok(Self {
            inner: self.inner.with_timeout(timeout)?,
        })
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn complete(&self, request: &CompletionRequest) -> LlmResult<CompletionResponse> {
        self.inner.complete(request).await
    }
}
