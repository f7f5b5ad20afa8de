//! Tool registry
//!
//! Loads tool definitions from a configuration directory at startup,
//! enforces the shared detailed-type vocabulary, and serves both direct
//! lookups and semantic retrieval over the registered documents.
//!
//! Layout of the configuration directory:
//!   detailed_types.json   vocabulary of domain tags, `{ "TAG": "description" }`
//!   <tool>.json           one tool document plus its runtime binding

use crate::config::RuntimeConfig;
use crate::embeddings::{cosine_similarity, EmbeddingBackend};
use crate::tools::builtin::{chat_tool_document, BuiltinTool, CHAT_TOOL_NAME};
use crate::tools::document::ToolDocument;
use crate::tools::http::HttpTool;
use crate::tools::runtime::{DynTool, JsonMap};
use crate::tools::subprocess::SubprocessTool;
use crate::types::{AppError, AppResult};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const VOCABULARY_FILE: &str = "detailed_types.json";

/// How a configured tool is actually invoked
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RuntimeSpec {
    Subprocess {
        command: Vec<String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    Http {
        endpoint: String,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolConfig {
    #[serde(flatten)]
    pub document: ToolDocument,
    pub runtime: RuntimeSpec,
}

#[derive(Debug)]
pub struct ToolManager {
    tools: HashMap<String, DynTool>,
    vocabulary: HashMap<String, String>,
    /// tool name -> embedding of its document text
    index: HashMap<String, Vec<f32>>,
}

impl ToolManager {
    /// Load every tool definition under `dir`. A document using a detailed
    /// type missing from the vocabulary is a configuration bug and fails the
    /// whole load.
    pub fn load(dir: &Path, runtime: &RuntimeConfig) -> AppResult<Self> {
        let vocabulary = load_vocabulary(dir)?;
        let tags: HashSet<String> = vocabulary.keys().cloned().collect();
        let default_timeout = Duration::from_secs(runtime.tool_timeout_secs);
        let poll_interval = Duration::from_millis(runtime.log_poll_interval_ms);

        let mut manager = Self {
            tools: HashMap::new(),
            vocabulary,
            index: HashMap::new(),
        };

        // Conversational steps are planned against the same catalog
        manager.register(Arc::new(BuiltinTool::new(chat_tool_document(), |_, _| {
            Box::pin(async { JsonMap::new() })
        })))?;

        let mut entries: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension().is_some_and(|ext| ext == "json")
                    && p.file_name().is_some_and(|n| n != VOCABULARY_FILE)
            })
            .collect();
        entries.sort();

        for path in entries {
            let raw = std::fs::read_to_string(&path)?;
            let config: ToolConfig = serde_json::from_str(&raw).map_err(|e| {
                AppError::Tool(format!("invalid tool config {}: {}", path.display(), e))
            })?;
            config
                .document
                .check_vocabulary(&tags)
                .map_err(AppError::Tool)?;
            manager.register(build_tool(config, default_timeout, poll_interval))?;
        }

        info!(
            tools = manager.tools.len(),
            detailed_types = manager.vocabulary.len(),
            dir = %dir.display(),
            "Tool registry loaded"
        );
        Ok(manager)
    }

    pub fn register(&mut self, tool: DynTool) -> AppResult<()> {
        let name = tool.document().tool_name.clone();
        if self.tools.contains_key(&name) {
            return Err(AppError::Tool(format!("duplicate tool '{}'", name)));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> AppResult<DynTool> {
        self.tools
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("unknown tool '{}'", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn documents(&self) -> Vec<&ToolDocument> {
        let mut docs: Vec<_> = self.tools.values().map(|t| t.document()).collect();
        docs.sort_by(|a, b| a.tool_name.cmp(&b.tool_name));
        docs
    }

    pub fn vocabulary(&self) -> &HashMap<String, String> {
        &self.vocabulary
    }

    /// One line per tool, for prompt injection
    pub fn render_catalog(&self) -> String {
        self.documents()
            .iter()
            .map(|d| format!("- {}", d.render_brief()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Full documents for the named tools, for prompt injection
    pub fn render_documents(&self, names: &[String]) -> String {
        names
            .iter()
            .filter_map(|n| self.tools.get(n))
            .map(|t| t.document().render_detailed())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Embed every document once; call at startup before serving.
    pub async fn build_index(&mut self, backend: &dyn EmbeddingBackend) -> AppResult<()> {
        for (name, tool) in &self.tools {
            let vector = backend.embed(&tool.document().embedding_text()).await?;
            self.index.insert(name.clone(), vector);
        }
        info!(indexed = self.index.len(), "Tool embedding index built");
        Ok(())
    }

    /// Top-k tools most relevant to `query`. Falls back to substring
    /// matching over names and descriptions when no index is available or
    /// the query cannot be embedded.
    pub async fn retrieve(
        &self,
        backend: &dyn EmbeddingBackend,
        query: &str,
        top_k: usize,
    ) -> Vec<String> {
        if !self.index.is_empty() {
            match backend.embed(query).await {
                Ok(query_vec) => {
                    let mut scored: Vec<(&String, f32)> = self
                        .index
                        .iter()
                        .map(|(name, vec)| (name, cosine_similarity(&query_vec, vec)))
                        .collect();
                    scored.sort_by(|a, b| {
                        b.1.partial_cmp(&a.1)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then_with(|| a.0.cmp(b.0))
                    });
                    return scored
                        .into_iter()
                        .take(top_k)
                        .map(|(name, _)| name.clone())
                        .collect();
                }
                Err(e) => {
                    warn!(error = %e, "Query embedding failed, using substring retrieval")
                }
            }
        }
        self.substring_retrieve(query, top_k)
    }

    /// Index-free retrieval over names and descriptions
    pub fn substring_retrieve(&self, query: &str, top_k: usize) -> Vec<String> {
        let needle = query.to_lowercase();
        let mut matches: Vec<String> = self
            .documents()
            .iter()
            .filter(|d| {
                needle.contains(&d.tool_name.to_lowercase())
                    || d.description.to_lowercase().contains(&needle)
                    || d.tool_name.to_lowercase().contains(&needle)
            })
            .map(|d| d.tool_name.clone())
            .collect();
        matches.truncate(top_k);
        matches
    }
}

fn build_tool(config: ToolConfig, default_timeout: Duration, poll_interval: Duration) -> DynTool {
    match config.runtime {
        RuntimeSpec::Subprocess {
            command,
            timeout_secs,
        } => Arc::new(SubprocessTool::new(
            config.document,
            command,
            timeout_secs.map_or(default_timeout, Duration::from_secs),
            poll_interval,
        )),
        RuntimeSpec::Http {
            endpoint,
            timeout_secs,
        } => Arc::new(HttpTool::new(
            config.document,
            &endpoint,
            timeout_secs.map_or(default_timeout, Duration::from_secs),
        )),
    }
}

fn load_vocabulary(dir: &Path) -> AppResult<HashMap<String, String>> {
    let path = dir.join(VOCABULARY_FILE);
    let raw = std::fs::read_to_string(&path).map_err(|e| {
        AppError::Tool(format!(
            "missing detailed-type vocabulary {}: {}",
            path.display(),
            e
        ))
    })?;
    serde_json::from_str(&raw)
        .map_err(|e| AppError::Tool(format!("invalid vocabulary {}: {}", path.display(), e)))
}
