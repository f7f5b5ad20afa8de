//! Tool connector sub-agent
//!
//! For one plan step, decides where each parameter of the step's tool comes
//! from: a user-supplied input, the tool's own default, or an output of an
//! earlier executed step. When a required parameter cannot be sourced the
//! connector reports the missing detailed types, which triggers
//! type-directed plan repair.

use crate::agents::{split_envelope, AgentRuntime, DeltaSink};
use crate::protocol::{AgentMessage, ConnectorContent, Sender};
use crate::tools::ToolDocument;
use crate::types::{AppError, AppResult};

const SYSTEM: &str = "You are the connection stage of a biology workflow \
    assistant. You wire tool parameters to their sources; you never invent \
    values that are not in the arguments pool.";

pub struct ToolConnector;

impl ToolConnector {
    pub async fn run(
        runtime: &AgentRuntime,
        step_id: &str,
        document: &ToolDocument,
        arguments_pool: &str,
        deltas: Option<&DeltaSink>,
    ) -> AppResult<(AgentMessage, ConnectorContent)> {
        let prompt = build_prompt(step_id, &document.render_detailed(), arguments_pool);

        runtime
            .structured_call(SYSTEM, &prompt, deltas, |value| {
                let (analysis, content) = split_envelope(value);
                let parsed: ConnectorContent = serde_json::from_value(content.clone())
                    .map_err(|e| AppError::Protocol(format!("malformed connection: {}", e)))?;
                validate(&parsed, step_id, document)?;
                Ok((
                    AgentMessage::new(Sender::Connector, analysis, content),
                    parsed,
                ))
            })
            .await
    }
}

fn validate(content: &ConnectorContent, step_id: &str, document: &ToolDocument) -> AppResult<()> {
    match content {
        ConnectorContent::Connected(report) => {
            if report.current_step != step_id {
                return Err(AppError::Protocol(format!(
                    "connection is for '{}', expected '{}'",
                    report.current_step, step_id
                )));
            }
            for param in report.connection.keys() {
                if document.parameter(param).is_none() {
                    return Err(AppError::Protocol(format!(
                        "'{}' is not a parameter of {}",
                        param, document.tool_name
                    )));
                }
            }
            for required in &document.required_parameters {
                match report.connection.get(&required.name) {
                    None => {
                        return Err(AppError::Protocol(format!(
                            "required parameter '{}' has no source",
                            required.name
                        )))
                    }
                    Some(source) if source.source == "default" => {
                        return Err(AppError::Protocol(format!(
                            "required parameter '{}' cannot come from a default",
                            required.name
                        )))
                    }
                    Some(_) => {}
                }
            }
            Ok(())
        }
        ConnectorContent::Failed(failure) => {
            if failure.current_step != step_id {
                return Err(AppError::Protocol(format!(
                    "failure report is for '{}', expected '{}'",
                    failure.current_step, step_id
                )));
            }
            Ok(())
        }
    }
}

fn build_prompt(step_id: &str, document: &str, arguments_pool: &str) -> String {
    format!(
        r#"Decide the source of every parameter for the current step.

CURRENT STEP: {step_id}

TOOL DOCUMENT:
{document}

ARGUMENTS POOL (everything available to this step; user inputs and
executed-step outputs are keyed by detailed type):
{arguments_pool}

RULES:
- Every required parameter needs a source: "user_input" when the value is
  among the user-provided inputs, or "node_output" with "source_id" (the
  producing step) and "source_parameter" (its output name) when it comes
  from an earlier executed step.
- Optional parameters may use "default".
- Never fabricate a source. If a required parameter's detailed type is
  not obtainable from the pool, report a failure instead.

OUTPUT FORMAT, success (JSON only, no prose):
{{"analysis": "<reasoning>",
  "content": {{"connection": {{"<param>": {{"source": "user_input"}},
                           "<param>": {{"source": "node_output",
                                       "source_id": "step_j",
                                       "source_parameter": "<output>"}}}},
              "current_step": "{step_id}"}}}}

OUTPUT FORMAT, failure:
{{"analysis": "<reasoning>",
  "content": {{"error": "<what is missing>",
              "current_step": "{step_id}",
              "arguments_pool": {{"<DETAILED_TYPE>": <value>, ...}},
              "missing_types": ["<DETAILED_TYPE>", ...]}}}}"#,
        step_id = step_id,
        document = document,
        arguments_pool = arguments_pool,
    )
}
