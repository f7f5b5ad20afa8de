use anyhow::Result;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub llm: LLMConfig,
    pub runtime: RuntimeConfig,
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub cors_allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LLMConfig {
    pub openai_api_key: String,
    pub anthropic_api_key: String,
    pub default_provider: String,
    pub default_model: String,
    pub embedding_model: String,
}

impl LLMConfig {
    /// API key for the currently selected provider, if configured
    pub fn active_api_key(&self) -> Option<String> {
        let key = match self.default_provider.as_str() {
            "anthropic" => &self.anthropic_api_key,
            _ => &self.openai_api_key,
        };
        if key.is_empty() {
            None
        } else {
            Some(key.clone())
        }
    }
}

/// Tool runtime settings: where tool documents live, where outputs go,
/// and how long a single invocation may run.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    pub tool_config_dir: PathBuf,
    pub output_root: PathBuf,
    pub tool_timeout_secs: u64,
    pub log_poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Maximum number of successive plans before giving up
    pub max_plan_turns: u32,
    /// Maximum attempts for a single step within one plan
    pub max_step_turns: u32,
    /// Re-prompt budget for a single sub-agent call whose output fails to parse
    pub max_agent_retries: u32,
    /// When true, any connector failure carrying missing types triggers
    /// type-directed repair; when false, only `missing_type` errors do.
    pub repair_on_any_error: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            server: ServerConfig {
                port: env::var("PORT")
                    .unwrap_or_else(|_| "3000".to_string())
                    .parse()?,
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                cors_allowed_origins: env::var("ALLOWED_ORIGINS")
                    .unwrap_or_else(|_| "http://localhost:3000,http://localhost:5173".to_string())
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .collect(),
            },
            llm: LLMConfig {
                openai_api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
                anthropic_api_key: env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
                default_provider: env::var("LLM_PROVIDER").unwrap_or_else(|_| "openai".to_string()),
                default_model: env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o".to_string()),
                embedding_model: env::var("EMBEDDING_MODEL")
                    .unwrap_or_else(|_| "text-embedding-3-small".to_string()),
            },
            runtime: RuntimeConfig {
                tool_config_dir: env::var("TOOL_CONFIG_DIR")
                    .unwrap_or_else(|_| "tools".to_string())
                    .into(),
                output_root: env::var("OUTPUT_ROOT")
                    .unwrap_or_else(|_| "output".to_string())
                    .into(),
                tool_timeout_secs: env::var("TOOL_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "1800".to_string())
                    .parse()?,
                log_poll_interval_ms: env::var("LOG_POLL_INTERVAL_MS")
                    .unwrap_or_else(|_| "1000".to_string())
                    .parse()?,
            },
            orchestrator: OrchestratorConfig {
                max_plan_turns: env::var("MAX_PLAN_TURNS")
                    .unwrap_or_else(|_| "3".to_string())
                    .parse()?,
                max_step_turns: env::var("MAX_STEP_TURNS")
                    .unwrap_or_else(|_| "3".to_string())
                    .parse()?,
                max_agent_retries: env::var("MAX_AGENT_RETRIES")
                    .unwrap_or_else(|_| "2".to_string())
                    .parse()?,
                repair_on_any_error: env::var("ORCH_REPAIR_ON_ANY_ERROR")
                    .unwrap_or_else(|_| "true".to_string())
                    .parse()?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_api_key() {
        let llm = LLMConfig {
            openai_api_key: "sk-test".to_string(),
            anthropic_api_key: String::new(),
            default_provider: "openai".to_string(),
            default_model: "gpt-4o".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
        };
        assert_eq!(llm.active_api_key(), Some("sk-test".to_string()));

        let anthropic = LLMConfig {
            default_provider: "anthropic".to_string(),
            ..llm.clone()
        };
        assert_eq!(anthropic.active_api_key(), None);
    }
}
