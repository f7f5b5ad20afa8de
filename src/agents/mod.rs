//! LLM sub-agents
//!
//! Each sub-agent is a thin prompt -> LLM -> parser unit with a strict
//! output schema. The shared `AgentRuntime` handles streaming (with a
//! non-streaming fallback), lenient JSON recovery, and bounded re-prompting
//! when a reply fails its schema check.

pub mod connector;
pub mod executor;
pub mod planner;
pub mod query_parser;
pub mod responder;
pub mod titler;

use crate::llm::LLM;
use crate::types::{AppError, AppResult, LLMMessage, LLMRequest};
use crate::utils::json_repair::repair_json;
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

/// Channel for forwarding partial sub-agent text to the orchestrator
pub type DeltaSink = tokio::sync::mpsc::Sender<String>;

pub struct AgentRuntime {
    pub llm: Arc<LLM>,
    pub provider: String,
    pub model: String,
    /// Re-prompt budget for a single call whose output fails to parse
    pub max_retries: u32,
}

impl AgentRuntime {
    pub fn new(llm: Arc<LLM>, provider: &str, model: &str, max_retries: u32) -> Self {
        Self {
            llm,
            provider: provider.to_string(),
            model: model.to_string(),
            max_retries,
        }
    }

    fn request(&self, system: &str, messages: Vec<LLMMessage>) -> LLMRequest {
        LLMRequest {
            provider: self.provider.clone(),
            model: self.model.clone(),
            messages,
            max_tokens: None,
            temperature: Some(0.2),
            system_instruction: Some(system.to_string()),
        }
    }

    /// One completion, streamed when the adapter supports it. Deltas are
    /// forwarded as they arrive; the full text is returned either way.
    async fn complete(
        &self,
        request: &LLMRequest,
        deltas: Option<&DeltaSink>,
    ) -> AppResult<String> {
        match self.llm.create_chat_completion_stream(request).await {
            Ok(mut stream) => {
                let mut full = String::new();
                while let Some(delta) = stream.next().await {
                    let delta = delta?;
                    full.push_str(&delta);
                    if let Some(tx) = deltas {
                        let _ = tx.send(delta).await;
                    }
                }
                Ok(full)
            }
            Err(_) => {
                let response = self.llm.create_chat_completion(request).await?;
                if let Some(tx) = deltas {
                    let _ = tx.send(response.content.clone()).await;
                }
                Ok(response.content)
            }
        }
    }

    /// Call the model and parse its reply through `parse`. A rejected reply
    /// is appended to the conversation together with the rejection reason,
    /// and the model is asked again, up to `max_retries` extra attempts.
    pub async fn structured_call<T, F>(
        &self,
        system: &str,
        prompt: &str,
        deltas: Option<&DeltaSink>,
        parse: F,
    ) -> AppResult<T>
    where
        F: Fn(&Value) -> AppResult<T>,
    {
        let mut messages = vec![LLMMessage::user(prompt)];
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            let request = self.request(system, messages.clone());
            let text = self.complete(&request, deltas).await?;

            match repair_json(&text).and_then(|value| parse(&value)) {
                Ok(parsed) => return Ok(parsed),
                Err(e) => {
                    warn!(attempt, error = %e, "Sub-agent reply rejected");
                    messages.push(LLMMessage::assistant(&text));
                    messages.push(LLMMessage::user(format!(
                        "Your previous reply was rejected: {}. Answer again with \
                         ONLY one valid JSON object in the required schema, no prose.",
                        e
                    )));
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| AppError::Protocol("sub-agent retry budget exhausted".to_string())))
    }

    /// Free-text completion for the prose-producing sub-agents.
    pub async fn text_call(
        &self,
        system: &str,
        prompt: &str,
        deltas: Option<&DeltaSink>,
    ) -> AppResult<String> {
        let request = self.request(system, vec![LLMMessage::user(prompt)]);
        self.complete(&request, deltas).await
    }
}

/// Pull `analysis` (free text) and `content` out of a sub-agent envelope.
/// Models that skip the envelope and emit the content object directly are
/// tolerated.
pub fn split_envelope(value: &Value) -> (String, Value) {
    match value.as_object() {
        Some(map) if map.contains_key("content") => {
            let analysis = map
                .get("analysis")
                .and_then(|a| a.as_str())
                .unwrap_or_default()
                .to_string();
            (analysis, map["content"].clone())
        }
        _ => (String::new(), value.clone()),
    }
}
