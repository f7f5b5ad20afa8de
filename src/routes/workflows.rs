//! Workflow retrieval
//!
//! Serves the latest workflow materialized for a conversation. Workflows
//! are written by the orchestrator under
//! `<output_root>/<conversation_id>/workflows/` with sortable timestamped
//! names, so "latest" is the lexicographically last file.

use crate::routes::AppState;
use crate::types::{AppError, AppResult};
use crate::workflow::Workflow;
use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::Value;
use std::path::PathBuf;
use uuid::Uuid;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/workflows/{conversation_id}", get(get_workflow))
        .route(
            "/api/workflows/{conversation_id}/visualize",
            get(visualize_workflow),
        )
        .with_state(state)
}

async fn get_workflow(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
) -> AppResult<Json<Value>> {
    let body = latest_workflow(&state, conversation_id)?;
    let workflow: Value = serde_json::from_str(&body)
        .map_err(|e| AppError::Internal(format!("corrupt workflow file: {}", e)))?;
    Ok(Json(workflow))
}

/// DOT rendering of the latest workflow, for Graphviz
async fn visualize_workflow(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
) -> AppResult<String> {
    let body = latest_workflow(&state, conversation_id)?;
    let workflow: Workflow = serde_json::from_str(&body)
        .map_err(|e| AppError::Internal(format!("corrupt workflow file: {}", e)))?;
    Ok(workflow.visualize())
}

fn latest_workflow(state: &AppState, conversation_id: Uuid) -> AppResult<String> {
    let dir = state
        .config
        .runtime
        .output_root
        .join(conversation_id.to_string())
        .join("workflows");

    let mut saved: Vec<PathBuf> = std::fs::read_dir(&dir)
        .map_err(|_| {
            AppError::NotFound(format!("no workflows for conversation {}", conversation_id))
        })?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    saved.sort();

    let latest = saved.last().ok_or_else(|| {
        AppError::NotFound(format!("no workflows for conversation {}", conversation_id))
    })?;
    Ok(std::fs::read_to_string(latest)?)
}
