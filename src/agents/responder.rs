//! Responder sub-agent
//!
//! Synthesizes the final human-readable answer from the full pipeline
//! history: parsed inputs, plan, executed steps and their results.

use crate::agents::{AgentRuntime, DeltaSink};
use crate::protocol::{AgentMessage, Sender};
use crate::types::AppResult;
use serde_json::Value;

const SYSTEM: &str = "You are a biology workflow assistant talking to the \
    user. You explain what was run and what the results mean, in plain \
    language backed by the recorded outputs.";

pub struct Responder;

impl Responder {
    pub async fn run(
        runtime: &AgentRuntime,
        query: &str,
        history: &str,
        deltas: Option<&DeltaSink>,
    ) -> AppResult<AgentMessage> {
        let prompt = build_prompt(query, history);
        let text = runtime.text_call(SYSTEM, &prompt, deltas).await?;
        Ok(AgentMessage::new(
            Sender::Responder,
            "",
            Value::String(text.trim().to_string()),
        ))
    }
}

fn build_prompt(query: &str, history: &str) -> String {
    format!(
        r#"Answer the user based on what the pipeline did.

USER REQUEST: {query}

PIPELINE HISTORY (plans, connections, executions, results):
{history}

TASK:
Write the final answer for the user.

GUIDELINES:
- Lead with a direct answer to their request.
- Mention concrete result values and output file paths from the history.
- If a step failed, say so plainly and state what was still achieved.
- For purely conversational requests, just answer naturally.
- Markdown formatting is fine; keep it concise."#,
        query = query,
        history = history,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::ScriptedAdapter;
    use crate::llm::LLM;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_returns_trimmed_text_message() {
        let llm = Arc::new(LLM::with_adapter(
            Box::new(ScriptedAdapter::new(vec![
                "  The predicted structure is saved at esmfold/xyz/prediction.pdb.\n",
            ])),
            "openai",
        ));
        let rt = AgentRuntime::new(llm, "openai", "gpt-4o", 1);

        let message = Responder::run(&rt, "Predict the structure", "step_1 executed", None)
            .await
            .unwrap();
        assert_eq!(message.sender, Sender::Responder);
        assert_eq!(
            message.content,
            serde_json::json!("The predicted structure is saved at esmfold/xyz/prediction.pdb.")
        );
    }
}
