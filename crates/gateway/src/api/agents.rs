//! Agent CRUD: list workspaces, create, delete (the default agent is
//! protected).

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::state::AppState;

use super::errors::{data, ApiResult};

#[derive(Debug, Deserialize)]
pub struct CreateAgentRequest {
    pub agent_id: String,
}

pub async fn list(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(data(state.registry.list_agents()))
}

pub async fn create(
    State(state): State<AppState>,
    Json(request): Json<CreateAgentRequest>,
) -> ApiResult<Json<Value>> {
    let row = state.registry.create_agent(&request.agent_id)?;
    Ok(data(row))
}

pub async fn remove(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let deleted = state.registry.delete_agent(&agent_id)?;
    if !deleted {
        return Err(super::errors::ApiError::not_found("Agent not found"));
    }
    Ok(data(json!({"deleted": true, "agent_id": agent_id})))
}
