// Bioflow - multi-agent orchestration engine for biological tool workflows

pub mod agents;
pub mod config;
pub mod embeddings;
pub mod llm;
pub mod orchestrator;
pub mod protocol;
pub mod routes;
pub mod tools;
pub mod types;
pub mod utils;
pub mod workflow;

// Re-exports for convenience
pub use config::Config;
pub use routes::AppState;

pub fn create_router(state: AppState) -> axum::Router {
    routes::create_router(state)
}
