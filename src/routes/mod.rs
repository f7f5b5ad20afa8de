//! API Routes
//!
//! HTTP surface of the engine:
//! - `POST /api/chat` - run the agent pipeline, streamed as SSE
//! - `POST /api/chat/{conversation_id}/cancel` - cancel a running pipeline
//! - `GET  /api/workflows/{conversation_id}` - latest materialized workflow
//! - `GET  /api/workflows/{conversation_id}/visualize` - DOT rendering
//! - `GET  /api/tools` - tool catalog, `?q=` for ranked retrieval
//! - `GET  /api/health` - liveness check

pub mod chat;
pub mod health;
pub mod tools;
pub mod workflows;

use crate::config::Config;
use crate::embeddings::EmbeddingBackend;
use crate::llm::LLM;
use crate::tools::ToolManager;
use crate::types::AppError;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

/// Shared application state. Conversations currently running the pipeline
/// keep their cancellation handle here.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub tools: Arc<ToolManager>,
    pub llm: Arc<LLM>,
    /// None when no embedding key is configured; retrieval then degrades
    /// to substring matching
    pub embeddings: Option<Arc<dyn EmbeddingBackend>>,
    pub conversations: Arc<Mutex<HashMap<Uuid, watch::Sender<bool>>>>,
}

impl AppState {
    pub fn new(
        config: Config,
        tools: Arc<ToolManager>,
        llm: Arc<LLM>,
        embeddings: Option<Arc<dyn EmbeddingBackend>>,
    ) -> Self {
        Self {
            config,
            tools,
            llm,
            embeddings,
            conversations: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    info!("Creating application router");
    let cors = cors_layer(&state.config.server.cors_allowed_origins);

    Router::new()
        .merge(chat::router(state.clone()))
        .merge(tools::router(state.clone()))
        .merge(workflows::router(state))
        .merge(health::router())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let parsed: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
    CorsLayer::new()
        .allow_origin(parsed)
        .allow_methods(Any)
        .allow_headers(Any)
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidRequest(_) | AppError::Protocol(_) => StatusCode::BAD_REQUEST,
            AppError::Cancelled => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({"error": self.to_string()}))).into_response()
    }
}
