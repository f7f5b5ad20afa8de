//! Messages exchanged between sub-agents and with the UI
//!
//! Every sub-agent emits an `AgentMessage` envelope; the orchestrator
//! accumulates them in an append-only `MessagePool` and streams serialized
//! snapshots of that pool to the UI inside `AgentResponse` events.

use crate::tools::JsonMap;
use crate::types::{AppError, AppResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    QueryParser,
    Planner,
    Connector,
    Executor,
    Responder,
    Titler,
}

/// One sub-agent utterance. `content` is a JSON payload whose schema
/// depends on the sender; `analysis` is free-text reasoning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub sender: Sender,
    #[serde(default)]
    pub analysis: String,
    pub content: Value,
}

impl AgentMessage {
    pub fn new(sender: Sender, analysis: impl Into<String>, content: Value) -> Self {
        Self {
            sender,
            analysis: analysis.into(),
            content,
        }
    }

    pub fn content_as<T: DeserializeOwned>(&self) -> AppResult<T> {
        serde_json::from_value(self.content.clone()).map_err(|e| {
            AppError::Protocol(format!("malformed {:?} content: {}", self.sender, e))
        })
    }

    pub fn content_text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Append-only log of sub-agent messages
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagePool {
    messages: Vec<AgentMessage>,
}

impl MessagePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: AgentMessage) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[AgentMessage] {
        &self.messages
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last_of(&self, sender: Sender) -> Option<&AgentMessage> {
        self.messages.iter().rev().find(|m| m.sender == sender)
    }

    /// Snapshot for streaming. Successive snapshots are growing prefixes.
    pub fn serialized(&self) -> String {
        serde_json::to_string(&self.messages).unwrap_or_else(|_| "[]".to_string())
    }

    /// Snapshot with one in-progress message appended, so consumers see
    /// partial text for the sub-agent currently speaking.
    pub fn serialized_with_partial(&self, sender: Sender, partial: &str) -> String {
        let mut messages: Vec<Value> = self
            .messages
            .iter()
            .filter_map(|m| serde_json::to_value(m).ok())
            .collect();
        messages.push(serde_json::json!({
            "sender": sender,
            "analysis": "",
            "content": partial,
        }));
        serde_json::to_string(&messages).unwrap_or_else(|_| "[]".to_string())
    }

    /// Conversation transcript for prompt injection
    pub fn render_history(&self) -> String {
        self.messages
            .iter()
            .map(|m| format!("[{:?}] {}", m.sender, m.content_text()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Planner payload: ordered steps, each naming a tool and a reason.
/// Replanned and repaired plans carry forward already-executed steps via
/// the optional executed-result fields, so those steps are not reissued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub tool: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub executed: bool,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub tool_args: JsonMap,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub results: JsonMap,
}

impl PlanStep {
    pub fn new(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            reason: reason.into(),
            executed: false,
            tool_args: JsonMap::new(),
            results: JsonMap::new(),
        }
    }
}

pub type PlanContent = BTreeMap<String, PlanStep>;

/// Steps of a plan in step-index order
pub fn ordered_steps(plan: &PlanContent) -> Vec<(String, PlanStep)> {
    let mut steps: Vec<(usize, String, PlanStep)> = plan
        .iter()
        .filter_map(|(id, step)| {
            crate::workflow::node::step_index(id).map(|i| (i, id.clone(), step.clone()))
        })
        .collect();
    steps.sort_by_key(|(i, _, _)| *i);
    steps.into_iter().map(|(_, id, step)| (id, step)).collect()
}

/// One bound parameter in a successful connector report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSource {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_parameter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionReport {
    pub connection: BTreeMap<String, ConnectionSource>,
    pub current_step: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionFailure {
    pub error: String,
    pub current_step: String,
    #[serde(default)]
    pub arguments_pool: JsonMap,
    #[serde(default)]
    pub missing_types: Vec<String>,
}

/// Connector payloads are one of two shapes, discriminated by their fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConnectorContent {
    Connected(ConnectionReport),
    Failed(ConnectionFailure),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorContent {
    pub status: String,
    #[serde(default)]
    pub results: JsonMap,
    #[serde(default)]
    pub tool_arg: JsonMap,
    pub current_step: String,
    pub tool_name: String,
}

impl ExecutorContent {
    pub fn succeeded(&self) -> bool {
        self.status == "success"
    }
}

/// Event streamed to the UI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub content: String,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    Generating,
    FinalResponse,
    Workflow,
    Title,
    Idle,
    Error,
}

impl AgentResponse {
    pub fn generating(content: String) -> Self {
        Self {
            content,
            status: ResponseStatus::Generating,
            workflow: None,
            error: None,
        }
    }

    pub fn error(content: String, reason: impl Into<String>) -> Self {
        Self {
            content,
            status: ResponseStatus::Error,
            workflow: None,
            error: Some(reason.into()),
        }
    }
}
