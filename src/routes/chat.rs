//! Chat endpoint
//!
//! One POST runs the full agent pipeline for a conversation and streams
//! `AgentResponse` events back as SSE. A second conversation gets its own
//! orchestrator and its own output root, so parallel runs never share
//! filesystem state. The cancel endpoint flips the conversation's watch
//! channel; the orchestrator observes it between stages and kills any
//! running tool.

use crate::orchestrator::Orchestrator;
use crate::routes::AppState;
use crate::types::{AppError, AppResult};
use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::post;
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
    #[serde(default)]
    pub uploaded_files: Vec<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(post_chat))
        .route("/api/chat/{conversation_id}/cancel", post(cancel_chat))
        .with_state(state)
}

async fn post_chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    if request.message.trim().is_empty() {
        return Err(AppError::InvalidRequest("empty message".to_string()));
    }
    let conversation_id = request.conversation_id.unwrap_or_else(Uuid::new_v4);
    info!(conversation = %conversation_id, "Chat request accepted");

    // A new request for the same conversation replaces any stale handle
    let (cancel_tx, cancel_rx) = watch::channel(false);
    state
        .conversations
        .lock()
        .await
        .insert(conversation_id, cancel_tx);

    let output_root = state
        .config
        .runtime
        .output_root
        .join(conversation_id.to_string());
    let orchestrator = Arc::new(Orchestrator::new(
        state.tools.clone(),
        state.llm.clone(),
        &state.config.llm.default_provider,
        &state.config.llm.default_model,
        state.config.orchestrator.clone(),
        output_root,
    ));

    let events = orchestrator.stream_chat(request.message, request.uploaded_files, cancel_rx);
    let opening = futures::stream::once(async move {
        Event::default().json_data(json!({
            "conversation_id": conversation_id,
            "status": "ACCEPTED",
        }))
    });
    let sse = opening
        .chain(events.map(|event| Event::default().json_data(&event)))
        .map(|result| {
            Ok::<Event, Infallible>(result.unwrap_or_else(|_| Event::default().data("{}")))
        });

    Ok(Sse::new(sse).keep_alive(KeepAlive::default()))
}

async fn cancel_chat(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
) -> AppResult<Json<Value>> {
    let conversations = state.conversations.lock().await;
    let handle = conversations.get(&conversation_id).ok_or_else(|| {
        AppError::NotFound(format!("no running conversation {}", conversation_id))
    })?;
    handle.send_replace(true);
    info!(conversation = %conversation_id, "Cancellation requested");
    Ok(Json(json!({"status": "cancelling"})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::testing::scripted_state;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_chat_streams_pipeline_to_idle() {
        let dir = tempfile::tempdir().unwrap();
        let state = scripted_state(
            dir.path(),
            vec![
                r#"{"analysis": "", "content": {}}"#,
                r#"{"analysis": "", "content": {"step_1": {"tool": "chat", "reason": "greet"}}}"#,
                "Hello! What would you like to analyze?",
                "Greeting",
            ],
        );

        let response = router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/chat")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"message": "Hi"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("conversation_id"));
        assert!(text.contains("FINAL_RESPONSE"));
        assert!(text.contains("IDLE"));
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = scripted_state(dir.path(), vec![]);

        let response = router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/chat")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"message": "   "}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cancel_unknown_conversation_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let state = scripted_state(dir.path(), vec![]);

        let response = router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(&format!("/api/chat/{}/cancel", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
