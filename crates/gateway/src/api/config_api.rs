//! Runtime configuration endpoints: rag-mode toggle, the full runtime
//! config document, and the tracing flag.
//!
//! Writes go to the *agent's* config file as a delta against defaults, so
//! untouched fields keep inheriting from the global config; the registry
//! picks the change up through the file's mtime.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use warren_domain::config::{
    load_runtime_config, save_runtime_config_to_path, RuntimeConfig,
};

use crate::state::AppState;

use super::errors::{data, ApiError, ApiResult};

const TRACING_FLAG: &str = "WARREN_TRACING_ENABLED";

#[derive(Debug, Deserialize)]
pub struct AgentQuery {
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RagModeRequest {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct RuntimeConfigRequest {
    pub config: Value,
}

#[derive(Debug, Deserialize)]
pub struct TracingConfigRequest {
    pub enabled: bool,
}

fn agent_of(query: &AgentQuery) -> &str {
    query.agent_id.as_deref().unwrap_or("default")
}

pub async fn get_rag_mode(
    State(state): State<AppState>,
    Query(query): Query<AgentQuery>,
) -> ApiResult<Json<Value>> {
    let runtime = state.registry.get_runtime(agent_of(&query))?;
    Ok(data(json!({
        "enabled": runtime.config.rag_mode,
        "agent_id": &runtime.agent_id,
    })))
}

pub async fn set_rag_mode(
    State(state): State<AppState>,
    Query(query): Query<AgentQuery>,
    Json(request): Json<RagModeRequest>,
) -> ApiResult<Json<Value>> {
    let config_path = state.registry.agent_config_path(agent_of(&query))?;
    let mut config = load_runtime_config(&config_path);
    config.rag_mode = request.enabled;
    save_runtime_config_to_path(&config_path, &config)?;

    let refreshed = state.registry.get_runtime(agent_of(&query))?;
    Ok(data(json!({
        "enabled": refreshed.config.rag_mode,
        "agent_id": &refreshed.agent_id,
    })))
}

pub async fn get_runtime(
    State(state): State<AppState>,
    Query(query): Query<AgentQuery>,
) -> ApiResult<Json<Value>> {
    let runtime = state.registry.get_runtime(agent_of(&query))?;
    Ok(data(json!({
        "agent_id": &runtime.agent_id,
        "config": runtime.config.to_payload(),
    })))
}

pub async fn set_runtime(
    State(state): State<AppState>,
    Query(query): Query<AgentQuery>,
    Json(request): Json<RuntimeConfigRequest>,
) -> ApiResult<Json<Value>> {
    if !request.config.is_object() {
        return Err(ApiError::validation("Invalid runtime config payload"));
    }
    let parsed = RuntimeConfig::from_payload(&request.config);
    let config_path = state.registry.agent_config_path(agent_of(&query))?;
    save_runtime_config_to_path(&config_path, &parsed)?;

    let refreshed = state.registry.get_runtime(agent_of(&query))?;
    Ok(data(json!({
        "agent_id": &refreshed.agent_id,
        "config": refreshed.config.to_payload(),
    })))
}

// ── Tracing flag ────────────────────────────────────────────────────

fn tracing_enabled() -> bool {
    std::env::var(TRACING_FLAG)
        .map(|value| value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Upsert `KEY=value` into the base dir's `.env` so the flag survives a
/// restart.
fn persist_env_flag(base_dir: &std::path::Path, key: &str, enabled: bool) -> std::io::Result<()> {
    let env_path = base_dir.join(".env");
    let line = format!("{key}={}", if enabled { "true" } else { "false" });
    let text = std::fs::read_to_string(&env_path).unwrap_or_default();
    let mut lines: Vec<String> = Vec::new();
    let mut replaced = false;
    for existing in text.lines() {
        if existing.trim_start().starts_with(&format!("{key}=")) {
            lines.push(line.clone());
            replaced = true;
        } else {
            lines.push(existing.to_string());
        }
    }
    if !replaced {
        lines.push(line);
    }
    std::fs::write(&env_path, lines.join("\n") + "\n")
}

pub async fn get_tracing(State(_state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(data(json!({
        "provider": "tracing",
        "config_key": TRACING_FLAG,
        "enabled": tracing_enabled(),
    })))
}

pub async fn set_tracing(
    State(state): State<AppState>,
    Json(request): Json<TracingConfigRequest>,
) -> ApiResult<Json<Value>> {
    std::env::set_var(TRACING_FLAG, if request.enabled { "true" } else { "false" });
    persist_env_flag(&state.base_dir, TRACING_FLAG, request.enabled).map_err(ApiError::internal)?;
    Ok(data(json!({
        "provider": "tracing",
        "config_key": TRACING_FLAG,
        "enabled": tracing_enabled(),
    })))
}
