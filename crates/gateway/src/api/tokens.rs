//! Token estimates for sessions and workspace files.
//!
//! Estimation is the chars/4 heuristic (floor 1). The files endpoint
//! returns a per-path result vector: a guard violation or missing file
//! marks that row with an error instead of failing the call.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use warren_tools::path_guard::resolve_workspace_path;

use crate::prompt::PromptBuilder;
use crate::state::AppState;

use super::errors::{data, ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct AgentQuery {
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FileTokenRequest {
    pub paths: Vec<String>,
}

fn token_count(text: &str) -> usize {
    (text.chars().count() / 4).max(1)
}

pub async fn session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<AgentQuery>,
) -> ApiResult<Json<Value>> {
    let runtime = state
        .registry
        .get_runtime(query.agent_id.as_deref().unwrap_or("default"))?;
    let session = runtime.sessions.load(&session_id, false)?;

    let pack = PromptBuilder::new().build(
        &runtime.root_dir,
        &runtime.config,
        runtime.config.rag_mode,
        session.messages.is_empty(),
    );
    let system_tokens = token_count(&pack.prompt);
    let message_tokens: usize = session
        .messages
        .iter()
        .map(|message| token_count(&message.content))
        .sum();

    Ok(data(json!({
        "session_id": session_id,
        "agent_id": &runtime.agent_id,
        "system_tokens": system_tokens,
        "message_tokens": message_tokens,
        "total_tokens": system_tokens + message_tokens,
    })))
}

pub async fn files(
    State(state): State<AppState>,
    Query(query): Query<AgentQuery>,
    Json(request): Json<FileTokenRequest>,
) -> ApiResult<Json<Value>> {
    let runtime = state
        .registry
        .get_runtime(query.agent_id.as_deref().unwrap_or("default"))?;

    let mut items: Vec<Value> = Vec::with_capacity(request.paths.len());
    for rel_path in &request.paths {
        let root = if rel_path.starts_with("skills/") {
            state.base_dir.as_path()
        } else {
            runtime.root_dir.as_path()
        };
        let resolved = match resolve_workspace_path(root, rel_path) {
            Ok(resolved) => resolved,
            Err(_) => {
                items.push(json!({"path": rel_path, "tokens": 0, "error": "invalid_path"}));
                continue;
            }
        };
        if !resolved.is_file() {
            items.push(json!({"path": rel_path, "tokens": 0, "error": "not_found"}));
            continue;
        }
        let bytes = std::fs::read(&resolved).map_err(ApiError::internal)?;
        let content = String::from_utf8_lossy(&bytes);
        items.push(json!({"path": rel_path, "tokens": token_count(&content)}));
    }

    Ok(data(items))
}
