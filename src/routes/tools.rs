//! Tool catalog endpoint
//!
//! Without a query, lists every registered tool. With `?q=`, returns the
//! top-k tools ranked by semantic similarity over the embedding index,
//! degrading to substring matching when no embedding backend is configured.

use crate::routes::AppState;
use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

const DEFAULT_TOP_K: usize = 5;

#[derive(Debug, Deserialize)]
pub struct ToolQuery {
    #[serde(default)]
    q: Option<String>,
    #[serde(default)]
    top_k: Option<usize>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/tools", get(list_tools))
        .with_state(state)
}

async fn list_tools(
    State(state): State<AppState>,
    Query(params): Query<ToolQuery>,
) -> Json<Value> {
    if let Some(q) = params.q.as_deref().filter(|q| !q.trim().is_empty()) {
        let top_k = params.top_k.unwrap_or(DEFAULT_TOP_K);
        let matches = match &state.embeddings {
            Some(backend) => state.tools.retrieve(backend.as_ref(), q, top_k).await,
            None => state.tools.substring_retrieve(q, top_k),
        };
        return Json(json!({"tools": matches}));
    }

    let catalog: Vec<Value> = state
        .tools
        .documents()
        .iter()
        .map(|d| {
            json!({
                "tool_name": d.tool_name,
                "category": d.category,
                "description": d.description,
            })
        })
        .collect();
    Json(json!({"tools": catalog}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::testing::scripted_state;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_catalog_lists_registered_tools() {
        let dir = tempfile::tempdir().unwrap();
        let state = scripted_state(dir.path(), vec![]);

        let response = router(state)
            .oneshot(
                Request::builder()
                    .uri("/api/tools")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        let names: Vec<&str> = parsed["tools"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|t| t["tool_name"].as_str())
            .collect();
        assert!(names.contains(&"chat"));
    }

    #[tokio::test]
    async fn test_query_without_backend_uses_substring_match() {
        let dir = tempfile::tempdir().unwrap();
        let state = scripted_state(dir.path(), vec![]);

        let response = router(state)
            .oneshot(
                Request::builder()
                    .uri("/api/tools?q=chat")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["tools"], json!(["chat"]));
    }
}
