use crate::types::{AppError, AppResult, LLMRequest, LLMResponse};
use async_trait::async_trait;
use futures::stream::BoxStream;

/// A stream of incremental text deltas from a chat completion
pub type ChatStream = BoxStream<'static, AppResult<String>>;

#[async_trait]
pub trait LLMAdapter: Send + Sync {
    async fn create_chat_completion(&self, request: &LLMRequest) -> AppResult<LLMResponse>;

    /// Streaming variant. Adapters without streaming support return an error
    /// and callers fall back to `create_chat_completion`.
    async fn create_chat_completion_stream(&self, request: &LLMRequest) -> AppResult<ChatStream>;
}

/// Configuration for an LLM provider
pub struct LLMProviderConfig {
    pub name: String,
    pub api_key: String,
}

pub struct LLM {
    adapter: Box<dyn LLMAdapter>,
    provider_name: String,
}

impl LLM {
    pub fn new(provider: LLMProviderConfig) -> AppResult<Self> {
        let adapter: Box<dyn LLMAdapter> = match provider.name.as_str() {
            "openai" => Box::new(crate::llm::openai::OpenAIAdapter::new(&provider.api_key)),
            "anthropic" => Box::new(crate::llm::anthropic::AnthropicAdapter::new(&provider.api_key)),
            other => {
                return Err(AppError::InvalidRequest(format!(
                    "Unsupported LLM provider: {}",
                    other
                )))
            }
        };

        Ok(Self {
            adapter,
            provider_name: provider.name,
        })
    }

    /// Wrap an already constructed adapter (used by tests and custom setups)
    pub fn with_adapter(adapter: Box<dyn LLMAdapter>, provider_name: impl Into<String>) -> Self {
        Self {
            adapter,
            provider_name: provider_name.into(),
        }
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    pub async fn create_chat_completion(&self, request: &LLMRequest) -> AppResult<LLMResponse> {
        self.adapter.create_chat_completion(request).await
    }

    pub async fn create_chat_completion_stream(&self, request: &LLMRequest) -> AppResult<ChatStream> {
        self.adapter.create_chat_completion_stream(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_provider_rejected() {
        let result = LLM::new(LLMProviderConfig {
            name: "not-a-provider".to_string(),
            api_key: "key".to_string(),
        });
        assert!(matches!(result, Err(AppError::InvalidRequest(_))));
    }
}
