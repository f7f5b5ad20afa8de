pub mod builtin;
pub mod document;
pub mod http;
pub mod manager;
pub mod runtime;
pub mod subprocess;

pub use builtin::{chat_tool_document, BuiltinTool, CHAT_TOOL_NAME};
pub use document::{ParameterSpec, ReturnSpec, ToolDocument, ValueType};
pub use http::HttpTool;
pub use manager::{RuntimeSpec, ToolConfig, ToolManager};
pub use runtime::{
    error_results, is_error_results, DynTool, InvocationContext, InvocationStatus, JsonMap,
    RunStream, RunUpdate, Tool, ToolInvocation,
};
pub use subprocess::SubprocessTool;
