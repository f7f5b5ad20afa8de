//! Query parser sub-agent
//!
//! First stage of the pipeline: classifies the request and extracts every
//! explicitly provided input, keyed by its detailed type tag.

use crate::agents::{split_envelope, AgentRuntime, DeltaSink};
use crate::protocol::{AgentMessage, Sender};
use crate::types::{AppError, AppResult};
use serde_json::Value;
use std::collections::HashMap;

const SYSTEM: &str = "You are the query-parsing stage of a biology workflow \
    assistant. You never answer the user directly; you only extract structured \
    inputs from their request.";

pub struct QueryParser;

impl QueryParser {
    pub async fn run(
        runtime: &AgentRuntime,
        query: &str,
        vocabulary: &HashMap<String, String>,
        uploaded_files: &[String],
        deltas: Option<&DeltaSink>,
    ) -> AppResult<AgentMessage> {
        let prompt = build_prompt(query, vocabulary, uploaded_files);

        runtime
            .structured_call(SYSTEM, &prompt, deltas, |value| {
                let (analysis, content) = split_envelope(value);
                let object = content.as_object().cloned().ok_or_else(|| {
                    AppError::Protocol("query parser content must be a JSON object".to_string())
                })?;
                Ok(AgentMessage::new(
                    Sender::QueryParser,
                    analysis,
                    Value::Object(object),
                ))
            })
            .await
    }
}

fn build_prompt(
    query: &str,
    vocabulary: &HashMap<String, String>,
    uploaded_files: &[String],
) -> String {
    let mut tags: Vec<String> = vocabulary
        .iter()
        .map(|(tag, description)| format!("- {}: {}", tag, description))
        .collect();
    tags.sort();
    let vocabulary_block = tags.join("\n");

    let files_block = if uploaded_files.is_empty() {
        "(none)".to_string()
    } else {
        uploaded_files
            .iter()
            .map(|f| format!("- {}", f))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        r#"Extract every explicit input from the user's request.

USER REQUEST: {query}

UPLOADED FILES (available by relative path):
{files_block}

INPUT TYPE VOCABULARY:
{vocabulary_block}

TASK:
Identify each concrete value the user supplied (sequences, database
identifiers, file paths, numeric settings) and tag it with the matching
type from the vocabulary. A request with no extractable inputs yields an
empty content object.

OUTPUT FORMAT (JSON only, no prose):
{{"analysis": "<one short paragraph of reasoning>",
  "content": {{"<DETAILED_TYPE>": "<value>", ...}}}}"#,
        query = query,
        files_block = files_block,
        vocabulary_block = vocabulary_block,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::ScriptedAdapter;
    use crate::llm::LLM;
    use serde_json::json;
    use std::sync::Arc;

    fn runtime(replies: Vec<&str>) -> AgentRuntime {
        let llm = Arc::new(LLM::with_adapter(
            Box::new(ScriptedAdapter::new(replies)),
            "openai",
        ));
        AgentRuntime::new(llm, "openai", "gpt-4o", 1)
    }

    #[tokio::test]
    async fn test_extracts_typed_inputs() {
        let rt = runtime(vec![
            r#"{"analysis": "one sequence", "content": {"PROTEIN_SEQUENCE": "AAAAAAAA"}}"#,
        ]);
        let vocab = HashMap::from([(
            "PROTEIN_SEQUENCE".to_string(),
            "Amino-acid sequence".to_string(),
        )]);

        let message = QueryParser::run(&rt, "Predict the structure of AAAAAAAA", &vocab, &[], None)
            .await
            .unwrap();
        assert_eq!(message.sender, Sender::QueryParser);
        assert_eq!(message.content["PROTEIN_SEQUENCE"], json!("AAAAAAAA"));
    }

    #[tokio::test]
    async fn test_non_object_content_reprompted() {
        let rt = runtime(vec![
            r#"{"analysis": "", "content": "not an object"}"#,
            r#"{"analysis": "", "content": {}}"#,
        ]);
        let message = QueryParser::run(&rt, "Hi!", &HashMap::new(), &[], None)
            .await
            .unwrap();
        assert_eq!(message.content, json!({}));
    }
}
