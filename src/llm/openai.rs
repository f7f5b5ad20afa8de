// OpenAI chat completions adapter
// API Reference: https://platform.openai.com/docs/api-reference/chat

use crate::llm::provider::{ChatStream, LLMAdapter};
use crate::types::{AppError, AppResult, LLMMessage, LLMRequest, LLMResponse, TokenUsage};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

pub struct OpenAIAdapter {
    client: Client,
    api_key: String,
    base_url: String,
}

// Request types for the OpenAI API
#[derive(Serialize)]
struct OpenAIChatRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

// Response types for the OpenAI API
#[derive(Deserialize)]
struct OpenAIChatResponse {
    choices: Vec<OpenAIChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

// Streaming chunk types (SSE `data:` payloads)
#[derive(Deserialize)]
struct OpenAIStreamChunk {
    choices: Vec<OpenAIStreamChoice>,
}

#[derive(Deserialize)]
struct OpenAIStreamChoice {
    delta: OpenAIStreamDelta,
}

#[derive(Deserialize, Default)]
struct OpenAIStreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIErrorResponse {
    error: OpenAIError,
}

#[derive(Deserialize)]
struct OpenAIError {
    message: String,
}

impl OpenAIAdapter {
    pub fn new(api_key: &str) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.to_string(),
            base_url: OPENAI_API_BASE.to_string(),
        }
    }

    /// Override the API base URL (OpenAI-compatible gateways, tests)
    pub fn with_base_url(api_key: &str, base_url: &str) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn convert_messages(request: &LLMRequest) -> Vec<OpenAIMessage> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system_instruction {
            messages.push(OpenAIMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.extend(request.messages.iter().map(|m: &LLMMessage| OpenAIMessage {
            role: m.role.clone(),
            content: m.content.clone(),
        }));
        messages
    }

    async fn send(&self, request: &LLMRequest, stream: bool) -> AppResult<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = OpenAIChatRequest {
            model: request.model.clone(),
            messages: Self::convert_messages(request),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream: stream.then_some(true),
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::LLMApi(format!("OpenAI request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            if let Ok(parsed) = serde_json::from_str::<OpenAIErrorResponse>(&error_text) {
                return Err(AppError::LLMApi(format!(
                    "OpenAI API error ({}): {}",
                    status, parsed.error.message
                )));
            }
            return Err(AppError::LLMApi(format!(
                "OpenAI API error ({}): {}",
                status, error_text
            )));
        }

        Ok(response)
    }
}

#[async_trait]
impl LLMAdapter for OpenAIAdapter {
    async fn create_chat_completion(&self, request: &LLMRequest) -> AppResult<LLMResponse> {
        let response = self.send(request, false).await?;

        let parsed: OpenAIChatResponse = response
            .json()
            .await
            .map_err(|e| AppError::LLMApi(format!("Failed to parse OpenAI response: {}", e)))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AppError::LLMApi("OpenAI returned no choices".to_string()))?;

        let usage = parsed
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            })
            .unwrap_or_default();

        Ok(LLMResponse {
            content: choice.message.content.unwrap_or_default(),
            finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
            usage,
        })
    }

    async fn create_chat_completion_stream(&self, request: &LLMRequest) -> AppResult<ChatStream> {
        let response = self.send(request, true).await?;
        let bytes = response.bytes_stream();

        struct SseState<S> {
            inner: S,
            buf: String,
            pending: VecDeque<String>,
            done: bool,
        }

        let state = SseState {
            inner: bytes,
            buf: String::new(),
            pending: VecDeque::new(),
            done: false,
        };

        let stream = futures::stream::unfold(state, |mut st| async move {
            loop {
                if let Some(delta) = st.pending.pop_front() {
                    return Some((Ok(delta), st));
                }
                if st.done {
                    return None;
                }

                match st.inner.next().await {
                    Some(Ok(chunk)) => {
                        st.buf.push_str(&String::from_utf8_lossy(&chunk));
                        while let Some(pos) = st.buf.find('\n') {
                            let line = st.buf[..pos].trim().to_string();
                            st.buf.drain(..=pos);

                            let Some(data) = line.strip_prefix("data:") else {
                                continue;
                            };
                            let data = data.trim();
                            if data == "[DONE]" {
                                st.done = true;
                                break;
                            }
                            if let Ok(parsed) = serde_json::from_str::<OpenAIStreamChunk>(data) {
                                if let Some(content) = parsed
                                    .choices
                                    .first()
                                    .and_then(|c| c.delta.content.as_deref())
                                {
                                    if !content.is_empty() {
                                        st.pending.push_back(content.to_string());
                                    }
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        st.done = true;
                        return Some((
                            Err(AppError::LLMApi(format!("OpenAI stream failed: {}", e))),
                            st,
                        ));
                    }
                    None => return None,
                }
            }
        });

        Ok(Box::pin(stream))
    }
}
