// LLM abstraction layer

pub mod anthropic;
pub mod openai;
pub mod provider;

pub use provider::*;
