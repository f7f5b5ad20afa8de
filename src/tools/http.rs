//! HTTP-backed tools
//!
//! Wraps a remote JSON endpoint: arguments go out as the request body, the
//! response body comes back as the results map. No incremental output, so
//! streaming is a single terminal update.

use crate::tools::document::ToolDocument;
use crate::tools::runtime::{
    error_results, single_shot_stream, InvocationContext, JsonMap, RunStream, Tool,
};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

pub struct HttpTool {
    document: ToolDocument,
    client: Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpTool {
    pub fn new(document: ToolDocument, endpoint: &str, timeout: Duration) -> Self {
        Self {
            document,
            client: Client::new(),
            endpoint: endpoint.to_string(),
            timeout,
        }
    }

    async fn post_args(&self, args: &JsonMap) -> JsonMap {
        debug!(tool = %self.document.tool_name, endpoint = %self.endpoint, "Calling HTTP tool");

        let response = match self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&Value::Object(args.clone()))
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return error_results("Timeout"),
            Err(e) => return error_results(format!("request failed: {}", e)),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return error_results(format!("endpoint returned {}: {}", status, body));
        }

        match response.json::<Value>().await {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                // Non-object payloads are wrapped rather than dropped
                let mut map = JsonMap::new();
                map.insert("output".to_string(), other);
                map
            }
            Err(e) => error_results(format!("invalid JSON response: {}", e)),
        }
    }
}

#[async_trait]
impl Tool for HttpTool {
    fn document(&self) -> &ToolDocument {
        &self.document
    }

    async fn run(&self, args: JsonMap, _ctx: &InvocationContext) -> JsonMap {
        self.post_args(&args).await
    }

    fn run_streaming(&self, args: JsonMap, _ctx: InvocationContext) -> RunStream {
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let timeout = self.timeout;
        let tool_name = self.document.tool_name.clone();
        single_shot_stream(Box::pin(async move {
            debug!(tool = %tool_name, endpoint = %endpoint, "Calling HTTP tool");
            let response = match client
                .post(&endpoint)
                .timeout(timeout)
                .json(&Value::Object(args))
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) if e.is_timeout() => return error_results("Timeout"),
                Err(e) => return error_results(format!("request failed: {}", e)),
            };
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return error_results(format!("endpoint returned {}: {}", status, body));
            }
            match response.json::<Value>().await {
                Ok(Value::Object(map)) => map,
                Ok(other) => {
                    let mut map = JsonMap::new();
                    map.insert("output".to_string(), other);
                    map
                }
                Err(e) => error_results(format!("invalid JSON response: {}", e)),
            }
        }))
    }

    // An in-flight HTTP request has no kill handle; the timeout bounds it.
    async fn cancel(&self, _ctx: &InvocationContext) {}
}
