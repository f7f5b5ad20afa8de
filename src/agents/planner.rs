//! Plan generator sub-agent
//!
//! Turns the parsed request into an ordered step list over the registered
//! tools. Purely conversational steps use the `chat` sentinel.

use crate::agents::{split_envelope, AgentRuntime, DeltaSink};
use crate::protocol::{AgentMessage, PlanContent, Sender};
use crate::tools::ToolManager;
use crate::types::{AppError, AppResult};
use crate::workflow::node::step_index;

const SYSTEM: &str = "You are the planning stage of a biology workflow \
    assistant. You decompose requests into tool invocations; you never run \
    tools or answer the user yourself.";

pub struct PlanGenerator;

impl PlanGenerator {
    pub async fn run(
        runtime: &AgentRuntime,
        query: &str,
        parsed_inputs: &serde_json::Value,
        tools: &ToolManager,
        history: &str,
        deltas: Option<&DeltaSink>,
    ) -> AppResult<(AgentMessage, PlanContent)> {
        let prompt = build_prompt(query, parsed_inputs, &tools.render_catalog(), history);

        runtime
            .structured_call(SYSTEM, &prompt, deltas, |value| {
                let (analysis, content) = split_envelope(value);
                let plan: PlanContent = serde_json::from_value(content.clone())
                    .map_err(|e| AppError::Protocol(format!("malformed plan: {}", e)))?;
                validate_plan(&plan, tools)?;
                Ok((
                    AgentMessage::new(Sender::Planner, analysis, content),
                    plan,
                ))
            })
            .await
    }
}

fn validate_plan(plan: &PlanContent, tools: &ToolManager) -> AppResult<()> {
    if plan.is_empty() {
        return Err(AppError::Protocol("plan has no steps".to_string()));
    }
    for (step, entry) in plan {
        if step_index(step).is_none() {
            return Err(AppError::Protocol(format!(
                "step id '{}' is not of the form step_k",
                step
            )));
        }
        if !tools.contains(&entry.tool) {
            return Err(AppError::Protocol(format!(
                "step {} names unknown tool '{}'",
                step, entry.tool
            )));
        }
    }
    Ok(())
}

fn build_prompt(
    query: &str,
    parsed_inputs: &serde_json::Value,
    catalog: &str,
    history: &str,
) -> String {
    let history_block = if history.is_empty() {
        "(none)".to_string()
    } else {
        history.to_string()
    };

    format!(
        r#"Plan the tool invocations that satisfy the user's request.

USER REQUEST: {query}

EXTRACTED INPUTS:
{parsed_inputs}

AVAILABLE TOOLS:
{catalog}

PIPELINE HISTORY (earlier attempts and failures, if any):
{history_block}

RULES:
- Use only tools from the list above, by exact name.
- Number steps step_1, step_2, ... in execution order.
- A step that only needs a conversational answer uses the tool "chat".
- When the history shows a failed plan, produce a different plan that
  avoids the failure; keep steps already marked executed unchanged and
  carry their "executed", "tool_args" and "results" fields forward.

OUTPUT FORMAT (JSON only, no prose):
{{"analysis": "<one short paragraph of reasoning>",
  "content": {{"step_1": {{"tool": "<tool_name>", "reason": "<why>"}}, ...}}}}"#,
        query = query,
        parsed_inputs = parsed_inputs,
        catalog = catalog,
        history_block = history_block,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::ScriptedAdapter;
    use crate::config::RuntimeConfig;
    use crate::llm::LLM;
    use serde_json::json;
    use std::sync::Arc;

    fn fixture_tools() -> ToolManager {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("detailed_types.json"),
            json!({"PROTEIN_SEQUENCE": "seq", "STRUCTURE_FILE": "structure"}).to_string(),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("esmfold.json"),
            json!({
                "category": "structure_prediction",
                "tool_name": "esmfold",
                "description": "Predict protein structure",
                "required_parameters": [
                    {"name": "protein_sequence", "type": "text",
                     "detailed_type": "PROTEIN_SEQUENCE", "description": ""}
                ],
                "return_values": [
                    {"name": "save_path", "type": "path",
                     "detailed_type": "STRUCTURE_FILE", "description": ""}
                ],
                "runtime": {"kind": "subprocess", "command": ["true"]}
            })
            .to_string(),
        )
        .unwrap();
        let runtime = RuntimeConfig {
            tool_config_dir: dir.path().to_path_buf(),
            output_root: "unused".into(),
            tool_timeout_secs: 60,
            log_poll_interval_ms: 100,
        };
        ToolManager::load(dir.path(), &runtime).unwrap()
    }

    fn runtime(replies: Vec<&str>) -> AgentRuntime {
        let llm = Arc::new(LLM::with_adapter(
            Box::new(ScriptedAdapter::new(replies)),
            "openai",
        ));
        AgentRuntime::new(llm, "openai", "gpt-4o", 1)
    }

    #[tokio::test]
    async fn test_valid_plan_parsed() {
        let tools = fixture_tools();
        let rt = runtime(vec![
            r#"{"analysis": "fold it", "content": {"step_1": {"tool": "esmfold", "reason": "predict"}}}"#,
        ]);

        let (message, plan) =
            PlanGenerator::run(&rt, "fold AAAA", &json!({}), &tools, "", None)
                .await
                .unwrap();
        assert_eq!(message.sender, Sender::Planner);
        assert_eq!(plan["step_1"].tool, "esmfold");
    }

    #[tokio::test]
    async fn test_unknown_tool_reprompted() {
        let tools = fixture_tools();
        let rt = runtime(vec![
            r#"{"analysis": "", "content": {"step_1": {"tool": "alphafold99", "reason": ""}}}"#,
            r#"{"analysis": "", "content": {"step_1": {"tool": "chat", "reason": "greet"}}}"#,
        ]);

        let (_, plan) = PlanGenerator::run(&rt, "Hi!", &json!({}), &tools, "", None)
            .await
            .unwrap();
        assert_eq!(plan["step_1"].tool, "chat");
    }

    #[tokio::test]
    async fn test_empty_plan_rejected() {
        let tools = fixture_tools();
        let rt = runtime(vec![
            r#"{"analysis": "", "content": {}}"#,
            r#"{"analysis": "", "content": {}}"#,
        ]);
        let err = PlanGenerator::run(&rt, "Hi!", &json!({}), &tools, "", None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no steps"));
    }
}
