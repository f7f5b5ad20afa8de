//! In-process tools
//!
//! A `BuiltinTool` wraps an async closure so locally implemented utilities
//! share the same contract as subprocess and HTTP tools. The `chat` sentinel
//! is also defined here: it occupies a plan step that needs a conversational
//! answer instead of a tool, and is never executed.

use crate::tools::document::ToolDocument;
use crate::tools::runtime::{
    single_shot_stream, InvocationContext, JsonMap, RunStream, Tool,
};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::json;
use std::sync::Arc;

/// Name of the sentinel tool standing in for plain conversational steps
pub const CHAT_TOOL_NAME: &str = "chat";

type Handler =
    Arc<dyn Fn(JsonMap, InvocationContext) -> BoxFuture<'static, JsonMap> + Send + Sync>;

pub struct BuiltinTool {
    document: ToolDocument,
    handler: Handler,
}

impl BuiltinTool {
    pub fn new<F>(document: ToolDocument, handler: F) -> Self
    where
        F: Fn(JsonMap, InvocationContext) -> BoxFuture<'static, JsonMap> + Send + Sync + 'static,
    {
        Self {
            document,
            handler: Arc::new(handler),
        }
    }
}

#[async_trait]
impl Tool for BuiltinTool {
    fn document(&self) -> &ToolDocument {
        &self.document
    }

    async fn run(&self, args: JsonMap, ctx: &InvocationContext) -> JsonMap {
        (self.handler)(args, ctx.clone()).await
    }

    fn run_streaming(&self, args: JsonMap, ctx: InvocationContext) -> RunStream {
        let handler = self.handler.clone();
        single_shot_stream(Box::pin(async move { handler(args, ctx).await }))
    }

    async fn cancel(&self, _ctx: &InvocationContext) {}
}

/// Document for the `chat` sentinel. Takes nothing, produces nothing; the
/// responder supplies the actual content for such steps.
pub fn chat_tool_document() -> ToolDocument {
    serde_json::from_value(json!({
        "category": "conversation",
        "tool_name": CHAT_TOOL_NAME,
        "description": "Answer the user directly from the conversation, without running any external tool. Use this step when the request needs explanation, interpretation, or discussion rather than computation.",
        "required_parameters": [],
        "optional_parameters": [],
        "return_values": []
    }))
    .unwrap_or_else(|_| unreachable!("chat sentinel document is statically valid"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn test_builtin_runs_handler() {
        let tool = BuiltinTool::new(chat_tool_document(), |args, _ctx| {
            Box::pin(async move {
                let mut out = JsonMap::new();
                out.insert("echo".to_string(), Value::Object(args));
                out
            })
        });

        let mut args = JsonMap::new();
        args.insert("x".to_string(), json!(1));
        let ctx = InvocationContext::new("/tmp/unused");
        let results = tool.run(args, &ctx).await;
        assert_eq!(results["echo"]["x"], json!(1));
    }

    #[tokio::test]
    async fn test_builtin_streaming_single_terminal() {
        let tool = BuiltinTool::new(chat_tool_document(), |_args, _ctx| {
            Box::pin(async move {
                let mut out = JsonMap::new();
                out.insert("ok".to_string(), json!(true));
                out
            })
        });

        let updates: Vec<_> = tool
            .run_streaming(JsonMap::new(), InvocationContext::new("/tmp/unused"))
            .collect()
            .await;
        assert_eq!(updates.len(), 1);
    }

    #[test]
    fn test_chat_document_shape() {
        let doc = chat_tool_document();
        assert_eq!(doc.tool_name, CHAT_TOOL_NAME);
        assert!(doc.required_parameters.is_empty());
        assert!(doc.return_values.is_empty());
    }
}
