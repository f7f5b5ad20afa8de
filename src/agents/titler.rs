//! Titler sub-agent
//!
//! Names the conversation after the pipeline finishes.

use crate::agents::{AgentRuntime, DeltaSink};
use crate::protocol::{AgentMessage, Sender};
use crate::types::AppResult;
use serde_json::Value;

const SYSTEM: &str =
    "You write short titles for conversations with a biology workflow assistant.";

const MAX_TITLE_CHARS: usize = 60;

pub struct Titler;

impl Titler {
    pub async fn run(
        runtime: &AgentRuntime,
        query: &str,
        final_answer: &str,
        deltas: Option<&DeltaSink>,
    ) -> AppResult<AgentMessage> {
        let prompt = build_prompt(query, final_answer);
        let raw = runtime.text_call(SYSTEM, &prompt, deltas).await?;
        Ok(AgentMessage::new(
            Sender::Titler,
            "",
            Value::String(clean_title(&raw)),
        ))
    }
}

fn clean_title(raw: &str) -> String {
    let line = raw.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let trimmed = line.trim().trim_matches(['"', '\'', '`']).trim();
    let title: String = trimmed.chars().take(MAX_TITLE_CHARS).collect();
    if title.is_empty() {
        "Untitled conversation".to_string()
    } else {
        title
    }
}

fn build_prompt(query: &str, final_answer: &str) -> String {
    format!(
        r#"Write a title for this conversation.

USER REQUEST: {query}

FINAL ANSWER (excerpt):
{final_answer}

RULES:
- At most six words, no quotes, no trailing punctuation.
- Name the subject of the work, not the assistant.

Reply with the title only."#,
        query = query,
        final_answer = final_answer,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::ScriptedAdapter;
    use crate::llm::LLM;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_title_cleaned() {
        let llm = Arc::new(LLM::with_adapter(
            Box::new(ScriptedAdapter::new(vec![
                "\n\"ESMFold structure prediction\"\nextra notes",
            ])),
            "openai",
        ));
        let rt = AgentRuntime::new(llm, "openai", "gpt-4o", 1);

        let message = Titler::run(&rt, "Predict the structure of AAAA", "done", None)
            .await
            .unwrap();
        assert_eq!(message.sender, Sender::Titler);
        assert_eq!(
            message.content,
            serde_json::json!("ESMFold structure prediction")
        );
    }

    #[tokio::test]
    async fn test_title_forwards_deltas() {
        let llm = Arc::new(LLM::with_adapter(
            Box::new(ScriptedAdapter::new(vec!["Protein folding walkthrough"])),
            "openai",
        ));
        let rt = AgentRuntime::new(llm, "openai", "gpt-4o", 1);
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);

        let message = Titler::run(&rt, "Explain folding", "done", Some(&tx))
            .await
            .unwrap();
        assert_eq!(message.content, serde_json::json!("Protein folding walkthrough"));
        assert_eq!(rx.recv().await.unwrap(), "Protein folding walkthrough");
    }

    #[test]
    fn test_clean_title_truncates_and_defaults() {
        let long = "a".repeat(100);
        assert_eq!(clean_title(&long).len(), MAX_TITLE_CHARS);
        assert_eq!(clean_title("   \n  "), "Untitled conversation");
    }
}
