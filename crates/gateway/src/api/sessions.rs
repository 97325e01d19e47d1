//! Session CRUD, history projection, title generation, and compression.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use warren_sessions::SessionStore;

use crate::state::AppState;

use super::errors::{data, ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct AgentQuery {
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ArchivedQuery {
    #[serde(default)]
    pub archived: Option<bool>,
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RenameSessionRequest {
    pub title: String,
}

fn agent_of(agent_id: &Option<String>) -> &str {
    agent_id.as_deref().unwrap_or("default")
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Value>> {
    let scope = query.scope.as_deref().unwrap_or("active");
    if !matches!(scope, "active" | "archived" | "all") {
        return Err(ApiError::validation("scope must be active, archived, or all"));
    }
    let runtime = state.registry.get_runtime(agent_of(&query.agent_id))?;
    Ok(data(runtime.sessions.list(scope)))
}

pub async fn create(
    State(state): State<AppState>,
    Query(query): Query<AgentQuery>,
    body: Option<Json<CreateSessionRequest>>,
) -> ApiResult<Json<Value>> {
    let runtime = state.registry.get_runtime(agent_of(&query.agent_id))?;
    let session_id = Uuid::new_v4().to_string();
    let mut session = runtime.sessions.load(&session_id, false)?;

    if let Some(Json(request)) = body {
        if let Some(title) = request.title.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            session.title = title.to_string();
            runtime.sessions.save(&session_id, &mut session, false)?;
        }
    }
    Ok(data(json!({"session_id": session_id, "title": session.title})))
}

pub async fn rename(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<AgentQuery>,
    Json(request): Json<RenameSessionRequest>,
) -> ApiResult<Json<Value>> {
    if request.title.trim().is_empty() || request.title.len() > 100 {
        return Err(ApiError::validation("title must be 1..=100 characters"));
    }
    let runtime = state.registry.get_runtime(agent_of(&query.agent_id))?;
    if !runtime.sessions.exists(&session_id, false) {
        return Err(ApiError::not_found("Session not found"));
    }
    let session = runtime.sessions.rename(&session_id, &request.title)?;
    Ok(data(json!({"session_id": session_id, "title": session.title})))
}

pub async fn remove(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<ArchivedQuery>,
) -> ApiResult<Json<Value>> {
    let runtime = state.registry.get_runtime(agent_of(&query.agent_id))?;
    let archived = query.archived.unwrap_or(false);
    if !runtime.sessions.delete(&session_id, archived) {
        return Err(ApiError::not_found("Session not found"));
    }
    Ok(data(json!({
        "deleted": true,
        "session_id": session_id,
        "archived": archived,
    })))
}

pub async fn archive(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<AgentQuery>,
) -> ApiResult<Json<Value>> {
    let runtime = state.registry.get_runtime(agent_of(&query.agent_id))?;
    if !runtime.sessions.archive(&session_id)? {
        return Err(ApiError::not_found("Session not found"));
    }
    Ok(data(json!({"archived": true, "session_id": session_id})))
}

pub async fn restore(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<AgentQuery>,
) -> ApiResult<Json<Value>> {
    let runtime = state.registry.get_runtime(agent_of(&query.agent_id))?;
    if !runtime.sessions.restore(&session_id)? {
        return Err(ApiError::not_found("Archived session not found"));
    }
    Ok(data(json!({"restored": true, "session_id": session_id})))
}

pub async fn messages(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<ArchivedQuery>,
) -> ApiResult<Json<Value>> {
    let runtime = state.registry.get_runtime(agent_of(&query.agent_id))?;
    let archived = query.archived.unwrap_or(false);
    if archived && !runtime.sessions.exists(&session_id, true) {
        return Err(ApiError::not_found("Archived session not found"));
    }
    let session = runtime.sessions.load(&session_id, archived)?;

    let pack = crate::prompt::PromptBuilder::new().build(
        &runtime.root_dir,
        &runtime.config,
        runtime.config.rag_mode,
        session.messages.is_empty(),
    );

    Ok(data(json!({
        "session_id": session_id,
        "agent_id": &runtime.agent_id,
        "archived": archived,
        "system_prompt": pack.prompt,
        "messages": SessionStore::with_live_response(&session.messages, &session),
        "compressed_context": session.compressed_context,
    })))
}

pub async fn history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<ArchivedQuery>,
) -> ApiResult<Json<Value>> {
    let runtime = state.registry.get_runtime(agent_of(&query.agent_id))?;
    let archived = query.archived.unwrap_or(false);
    if archived && !runtime.sessions.exists(&session_id, true) {
        return Err(ApiError::not_found("Archived session not found"));
    }
    let session = runtime.sessions.load(&session_id, archived)?;
    Ok(data(json!({
        "session_id": session_id,
        "agent_id": &runtime.agent_id,
        "archived": archived,
        "messages": SessionStore::with_live_response(&session.messages, &session),
        "compressed_context": session.compressed_context,
    })))
}

pub async fn generate_title(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<AgentQuery>,
) -> ApiResult<Json<Value>> {
    let runtime = state.registry.get_runtime(agent_of(&query.agent_id))?;
    let session = runtime.sessions.load(&session_id, false)?;

    // Seed: first non-empty user message, else the first message, else the
    // compressed context.
    let mut seed = session
        .messages
        .iter()
        .find(|message| message.role == "user" && !message.content.trim().is_empty())
        .map(|message| message.content.trim().to_string())
        .unwrap_or_default();
    if seed.is_empty() {
        seed = session
            .messages
            .first()
            .map(|message| message.content.trim().to_string())
            .unwrap_or_default();
    }
    if seed.is_empty() {
        seed = session.compressed_context.trim().to_string();
    }
    if seed.is_empty() {
        return Err(ApiError::invalid_state(
            "Cannot generate title for empty session",
        ));
    }

    let title = state.engine.generate_title(&runtime.config, &seed).await;
    runtime.sessions.update_title(&session_id, &title)?;
    Ok(data(json!({"session_id": session_id, "title": title})))
}

pub async fn compress(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<AgentQuery>,
) -> ApiResult<Json<Value>> {
    let runtime = state.registry.get_runtime(agent_of(&query.agent_id))?;
    let session = runtime.sessions.load(&session_id, false)?;
    let message_count = session.messages.len();
    if message_count < 4 {
        return Err(ApiError::invalid_state(
            "At least 4 messages are required for compression",
        )
        .with_details(json!({"message_count": message_count})));
    }

    let n = (message_count / 2).max(4).min(message_count);
    let summary = state
        .engine
        .summarize_messages(&runtime.config, &session.messages[..n])
        .await;
    let (archived_count, remaining_count) =
        runtime.sessions.compress_history(&session_id, &summary, n)?;

    Ok(data(json!({
        "session_id": session_id,
        "agent_id": &runtime.agent_id,
        "archived_count": archived_count,
        "remaining_count": remaining_count,
        "summary": summary,
    })))
}
