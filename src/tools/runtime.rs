//! Tool runtime contract
//!
//! Every external tool, whatever its transport (subprocess, HTTP API,
//! in-process function), is wrapped behind one capability set:
//! document, validate, run, run_streaming, cancel. Implementations stay one
//! level deep; there is no hierarchy beyond this trait.

use crate::tools::document::ToolDocument;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub type JsonMap = serde_json::Map<String, Value>;

/// Terminal and in-flight states of a single invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationStatus {
    Pending,
    Running,
    Success,
    Error,
    Timeout,
    Cancelled,
}

/// Record of one tool run. Survives in the owning workflow node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
    pub results: JsonMap,
    pub start_time: DateTime<Utc>,
    /// Wall-clock duration in seconds
    pub duration: f64,
    pub status: InvocationStatus,
}

impl ToolInvocation {
    pub fn started() -> Self {
        Self {
            log_path: None,
            results: JsonMap::new(),
            start_time: Utc::now(),
            duration: 0.0,
            status: InvocationStatus::Running,
        }
    }

    pub fn finish(mut self, status: InvocationStatus, results: JsonMap) -> Self {
        self.duration = (Utc::now() - self.start_time).num_milliseconds() as f64 / 1000.0;
        self.status = status;
        self.results = results;
        self
    }
}

/// Caller-supplied invocation context. Each conversation owns a private
/// output root; tools compose all paths beneath it.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub output_root: PathBuf,
}

impl InvocationContext {
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self {
            output_root: output_root.into(),
        }
    }

    /// Private per-invocation directory `<root>/<tool>/<timestamp>/`
    pub fn invocation_dir(&self, tool_name: &str) -> std::io::Result<PathBuf> {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S%.3f").to_string();
        let dir = self.output_root.join(tool_name).join(stamp);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Resolve a possibly relative path argument against the output root
    pub fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.output_root.join(p)
        }
    }
}

/// Incremental update yielded by `run_streaming`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunUpdate {
    /// Snapshot of the invocation log so far
    LogTail { log: String },
    /// Terminal payload; always the last item of the stream
    Done {
        log: String,
        results: JsonMap,
        status: InvocationStatus,
    },
}

pub type RunStream = BoxStream<'static, RunUpdate>;

#[async_trait]
pub trait Tool: Send + Sync {
    fn document(&self) -> &ToolDocument;

    /// Validate arguments without running. Empty vec means valid.
    fn validate(&self, args: &JsonMap, ctx: &InvocationContext) -> Vec<String> {
        self.document().validate_args(args, &ctx.output_root)
    }

    /// Run to completion. Returns the tool's structured results on success
    /// or `{"error": <text>}` on any failure; never panics through.
    async fn run(&self, args: JsonMap, ctx: &InvocationContext) -> JsonMap;

    /// Run while yielding periodic log-tail snapshots. The stream always
    /// terminates with a `RunUpdate::Done` and never yields an error item.
    fn run_streaming(&self, args: JsonMap, ctx: InvocationContext) -> RunStream;

    /// Idempotent cancellation of the in-flight invocations belonging to
    /// one conversation. Other conversations sharing the tool keep running.
    async fn cancel(&self, ctx: &InvocationContext);
}

impl std::fmt::Debug for dyn Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("tool_name", &self.document().tool_name)
            .finish()
    }
}

pub type DynTool = Arc<dyn Tool>;

/// `{"error": <msg>}` result map
pub fn error_results(msg: impl Into<String>) -> JsonMap {
    let mut map = JsonMap::new();
    map.insert("error".to_string(), Value::String(msg.into()));
    map
}

/// Whether a results map represents a failure
pub fn is_error_results(results: &JsonMap) -> bool {
    results.contains_key("error")
}

/// Single-shot streaming wrapper for tools without incremental output:
/// runs the future, then yields one `Done` update.
pub fn single_shot_stream(
    fut: futures::future::BoxFuture<'static, JsonMap>,
) -> RunStream {
    Box::pin(futures::stream::once(async move {
        let results = fut.await;
        let status = if is_error_results(&results) {
            InvocationStatus::Error
        } else {
            InvocationStatus::Success
        };
        RunUpdate::Done {
            log: serde_json::to_string(&results).unwrap_or_default(),
            results,
            status,
        }
    }))
}
