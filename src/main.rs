use bioflow::config::Config;
use bioflow::embeddings::{EmbeddingBackend, OpenAIEmbeddings};
use bioflow::llm::{LLMProviderConfig, LLM};
use bioflow::routes::{create_router, AppState};
use bioflow::tools::ToolManager;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

#[derive(Debug, Parser)]
#[command(name = "bioflow", about = "Multi-agent biology workflow engine")]
struct Cli {
    /// Override the listen port from the environment
    #[arg(long)]
    port: Option<u16>,

    /// Override the tool configuration directory
    #[arg(long)]
    tool_config_dir: Option<PathBuf>,

    /// Also write logs to daily rolling files in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "bioflow=debug,tower_http=debug,axum=debug".into())
    };
    let (file_layer, _guard) = match &cli.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "bioflow.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(env_filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter()))
        .with(file_layer)
        .init();

    let mut config = Config::from_env()?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(dir) = cli.tool_config_dir {
        config.runtime.tool_config_dir = dir;
    }
    info!("Configuration loaded: {:?}", config.server);

    // Load the tool catalog and index it for retrieval. Without an OpenAI
    // key retrieval falls back to substring matching.
    let mut tools = ToolManager::load(&config.runtime.tool_config_dir, &config.runtime)?;
    let embeddings: Option<Arc<dyn EmbeddingBackend>> = if config.llm.openai_api_key.is_empty() {
        warn!("OPENAI_API_KEY not set, tool retrieval uses substring matching");
        None
    } else {
        let backend =
            OpenAIEmbeddings::new(&config.llm.openai_api_key, &config.llm.embedding_model);
        tools.build_index(&backend).await?;
        Some(Arc::new(backend))
    };

    let llm = LLM::new(LLMProviderConfig {
        name: config.llm.default_provider.clone(),
        api_key: config
            .llm
            .active_api_key()
            .ok_or_else(|| anyhow::anyhow!("no API key configured for the selected provider"))?,
    })?;

    let state = AppState::new(config.clone(), Arc::new(tools), Arc::new(llm), embeddings);
    let app = create_router(state);

    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    info!("Server listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
