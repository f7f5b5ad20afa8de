//! Tool executor sub-agent
//!
//! Chooses literal argument values for a connected step, runs the tool
//! through the shared runtime, and reports the outcome. Argument choices
//! that fail the tool's own validation are re-prompted with the errors,
//! within the runtime's retry budget.

use crate::agents::{split_envelope, AgentRuntime, DeltaSink};
use crate::protocol::{AgentMessage, ExecutorContent, Sender};
use crate::tools::{DynTool, InvocationContext, InvocationStatus, JsonMap, RunUpdate};
use crate::types::{AppError, AppResult};
use futures::StreamExt;
use serde_json::Value;
use tracing::info;

const SYSTEM: &str = "You are the execution stage of a biology workflow \
    assistant. You materialize exact argument values for one tool call; you \
    copy values from the provided sources and never invent data.";

pub struct ToolExecutor;

impl ToolExecutor {
    pub async fn run(
        runtime: &AgentRuntime,
        tool: DynTool,
        step_id: &str,
        connections: &str,
        ctx: &InvocationContext,
        deltas: Option<&DeltaSink>,
    ) -> AppResult<(AgentMessage, ExecutorContent)> {
        let document = tool.document();
        let prompt = build_prompt(step_id, &document.render_detailed(), connections);

        let (analysis, args) = runtime
            .structured_call(SYSTEM, &prompt, deltas, |value| {
                let (analysis, content) = split_envelope(value);
                let args = content.as_object().cloned().ok_or_else(|| {
                    AppError::Protocol("tool arguments must be a JSON object".to_string())
                })?;
                let errors = tool.validate(&args, ctx);
                if !errors.is_empty() {
                    return Err(AppError::Protocol(format!(
                        "invalid arguments: {}",
                        errors.join("; ")
                    )));
                }
                Ok((analysis, args))
            })
            .await?;

        info!(step = %step_id, tool = %document.tool_name, "Running tool");
        let (results, status) = run_tool(&tool, args.clone(), ctx, deltas).await;

        let content = ExecutorContent {
            status: if status == InvocationStatus::Success {
                "success".to_string()
            } else {
                "error".to_string()
            },
            results,
            tool_arg: args,
            current_step: step_id.to_string(),
            tool_name: document.tool_name.clone(),
        };

        let payload = serde_json::to_value(&content)
            .map_err(|e| AppError::Internal(e.to_string()))?;
        Ok((
            AgentMessage::new(Sender::Executor, analysis, payload),
            content,
        ))
    }
}

/// Drive the streaming run, forwarding log tails, and return the terminal
/// results. The stream contract guarantees a final `Done`.
async fn run_tool(
    tool: &DynTool,
    args: JsonMap,
    ctx: &InvocationContext,
    deltas: Option<&DeltaSink>,
) -> (JsonMap, InvocationStatus) {
    let mut stream = tool.run_streaming(args, ctx.clone());
    let mut terminal = None;

    while let Some(update) = stream.next().await {
        match update {
            RunUpdate::LogTail { log } => {
                if let Some(tx) = deltas {
                    let _ = tx.send(log).await;
                }
            }
            RunUpdate::Done {
                results, status, ..
            } => terminal = Some((results, status)),
        }
    }

    terminal.unwrap_or_else(|| {
        let mut map = JsonMap::new();
        map.insert(
            "error".to_string(),
            Value::String("tool stream ended without a terminal update".to_string()),
        );
        (map, InvocationStatus::Error)
    })
}

fn build_prompt(step_id: &str, document: &str, connections: &str) -> String {
    format!(
        r#"Produce the exact argument values for the current tool call.

CURRENT STEP: {step_id}

TOOL DOCUMENT:
{document}

PARAMETER SOURCES AND AVAILABLE VALUES:
{connections}

RULES:
- Emit one value per connected parameter, copied verbatim from its source.
- Paths from earlier steps are relative to the shared output root; pass
  them through unchanged.
- Omit optional parameters that should keep their defaults.

OUTPUT FORMAT (JSON only, no prose):
{{"analysis": "<one short paragraph>",
  "content": {{"<param>": <value>, ...}}}}"#,
        step_id = step_id,
        document = document,
        connections = connections,
    )
}
