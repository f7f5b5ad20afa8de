// Shared utilities

pub mod json_repair;
pub mod retry;

pub use json_repair::repair_json;
pub use retry::with_retry;
