//! Scheduler endpoints: cron job CRUD + manual runs + history, and the
//! heartbeat configuration.
//!
//! Every route is gated on `scheduler.api_enabled` (403
//! `scheduler_api_disabled` when off). The default agent uses the shared
//! long-lived schedulers; other agents get per-request instances over the
//! same durable files.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use warren_domain::config::{load_runtime_config, save_runtime_config_to_path};
use warren_scheduler::{CronScheduler, ScheduleType};
use warren_storage::now_secs;

use crate::registry::AgentRuntime;
use crate::state::AppState;

use super::errors::{data, ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct AgentQuery {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct CronJobCreateRequest {
    #[serde(default)]
    pub name: String,
    pub schedule_type: ScheduleType,
    pub schedule: String,
    pub prompt: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct CronJobUpdateRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub schedule_type: Option<ScheduleType>,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatUpdateRequest {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub interval_seconds: Option<u64>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub active_start_hour: Option<u32>,
    #[serde(default)]
    pub active_end_hour: Option<u32>,
    #[serde(default)]
    pub session_id: Option<String>,
}

fn gated_runtime(state: &AppState, query: &AgentQuery) -> ApiResult<Arc<AgentRuntime>> {
    let runtime = state
        .registry
        .get_runtime(query.agent_id.as_deref().unwrap_or("default"))?;
    if !runtime.config.scheduler.api_enabled {
        return Err(ApiError::scheduler_api_disabled());
    }
    Ok(runtime)
}

fn cron_of(state: &AppState, query: &AgentQuery) -> ApiResult<(Arc<AgentRuntime>, Arc<CronScheduler>)> {
    let runtime = gated_runtime(state, query)?;
    let scheduler = state.cron_for(&runtime);
    Ok((runtime, scheduler))
}

fn validate_schedule(request: &CronJobCreateRequest) -> ApiResult<()> {
    if request.schedule.trim().is_empty() || request.schedule.len() > 120 {
        return Err(ApiError::validation("schedule must be 1..=120 characters"));
    }
    if request.prompt.trim().is_empty() || request.prompt.len() > 8000 {
        return Err(ApiError::validation("prompt must be 1..=8000 characters"));
    }
    if request.name.len() > 120 {
        return Err(ApiError::validation("name must be at most 120 characters"));
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cron jobs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list_cron_jobs(
    State(state): State<AppState>,
    Query(query): Query<AgentQuery>,
) -> ApiResult<Json<Value>> {
    let (runtime, scheduler) = cron_of(&state, &query)?;
    Ok(data(json!({
        "agent_id": &runtime.agent_id,
        "jobs": scheduler.list_jobs(),
    })))
}

pub async fn create_cron_job(
    State(state): State<AppState>,
    Query(query): Query<AgentQuery>,
    Json(request): Json<CronJobCreateRequest>,
) -> ApiResult<Json<Value>> {
    validate_schedule(&request)?;
    let (runtime, scheduler) = cron_of(&state, &query)?;
    let mut job = scheduler
        .create_and_store_job(
            &request.name,
            request.schedule_type,
            &request.schedule,
            &request.prompt,
        )
        .map_err(|e| ApiError::invalid_request(e.to_string()))?;

    if !request.enabled {
        job.enabled = false;
        job.next_run_ts = 0.0;
        scheduler.upsert_job(job.clone())?;
    }
    Ok(data(json!({"agent_id": &runtime.agent_id, "job": job})))
}

pub async fn update_cron_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<AgentQuery>,
    Json(request): Json<CronJobUpdateRequest>,
) -> ApiResult<Json<Value>> {
    let (runtime, scheduler) = cron_of(&state, &query)?;
    let mut current = scheduler
        .get_job(&job_id)
        .ok_or_else(|| ApiError::not_found("Cron job not found"))?;

    let next_type = request.schedule_type.unwrap_or(current.schedule_type);
    let next_schedule = request
        .schedule
        .clone()
        .unwrap_or_else(|| current.schedule.clone());
    let next_name = request.name.clone().unwrap_or_else(|| current.name.clone());
    let next_prompt = request
        .prompt
        .clone()
        .unwrap_or_else(|| current.prompt.clone());
    let next_enabled = request.enabled.unwrap_or(current.enabled);

    // Schedule changes re-validate by building a fresh job.
    if next_type != current.schedule_type || next_schedule != current.schedule {
        let refreshed = scheduler
            .create_job(&next_name, next_type, &next_schedule, &next_prompt)
            .map_err(|e| ApiError::invalid_request(e.to_string()))?;
        current.schedule_type = refreshed.schedule_type;
        current.schedule = refreshed.schedule;
        current.next_run_ts = refreshed.next_run_ts;
    }

    if !next_name.trim().is_empty() {
        current.name = next_name.trim().to_string();
    }
    if !next_prompt.trim().is_empty() {
        current.prompt = next_prompt.trim().to_string();
    }
    current.enabled = next_enabled;
    current.updated_at = now_secs();
    if !current.enabled {
        current.next_run_ts = 0.0;
    } else if current.next_run_ts <= 0.0 {
        // Re-enabling: recompute the first due time.
        if let Ok(refreshed) = scheduler.create_job(
            &current.name,
            current.schedule_type,
            &current.schedule,
            &current.prompt,
        ) {
            current.next_run_ts = refreshed.next_run_ts;
        }
    }
    scheduler.upsert_job(current.clone())?;
    Ok(data(json!({"agent_id": &runtime.agent_id, "job": current})))
}

pub async fn delete_cron_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<AgentQuery>,
) -> ApiResult<Json<Value>> {
    let (runtime, scheduler) = cron_of(&state, &query)?;
    if !scheduler.delete_job(&job_id)? {
        return Err(ApiError::not_found("Cron job not found"));
    }
    Ok(data(json!({
        "agent_id": &runtime.agent_id,
        "deleted": true,
        "job_id": job_id,
    })))
}

pub async fn run_cron_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<AgentQuery>,
) -> ApiResult<Json<Value>> {
    let (runtime, scheduler) = cron_of(&state, &query)?;
    let job = scheduler
        .run_job_now(&job_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Cron job not found"))?;
    Ok(data(json!({"agent_id": &runtime.agent_id, "job": job})))
}

pub async fn list_cron_runs(
    State(state): State<AppState>,
    Query(query): Query<AgentQuery>,
) -> ApiResult<Json<Value>> {
    let (runtime, scheduler) = cron_of(&state, &query)?;
    let limit = query
        .limit
        .unwrap_or(runtime.config.scheduler.runs_query_default_limit)
        .clamp(1, 5000);
    Ok(data(json!({
        "agent_id": &runtime.agent_id,
        "runs": scheduler.query_runs(limit),
    })))
}

pub async fn list_cron_failures(
    State(state): State<AppState>,
    Query(query): Query<AgentQuery>,
) -> ApiResult<Json<Value>> {
    let (runtime, scheduler) = cron_of(&state, &query)?;
    let limit = query
        .limit
        .unwrap_or(runtime.config.scheduler.runs_query_default_limit)
        .clamp(1, 5000);
    Ok(data(json!({
        "agent_id": &runtime.agent_id,
        "failures": scheduler.query_failures(limit),
    })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Heartbeat
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn heartbeat_view(agent_id: &str, config: &warren_domain::config::HeartbeatRuntimeConfig) -> Value {
    json!({
        "agent_id": agent_id,
        "config": {
            "enabled": config.enabled,
            "interval_seconds": config.interval_seconds,
            "timezone": config.timezone,
            "active_start_hour": config.active_start_hour,
            "active_end_hour": config.active_end_hour,
            "session_id": config.session_id,
        }
    })
}

pub async fn get_heartbeat(
    State(state): State<AppState>,
    Query(query): Query<AgentQuery>,
) -> ApiResult<Json<Value>> {
    let runtime = gated_runtime(&state, &query)?;
    Ok(data(heartbeat_view(
        &runtime.agent_id,
        &runtime.config.heartbeat,
    )))
}

pub async fn update_heartbeat(
    State(state): State<AppState>,
    Query(query): Query<AgentQuery>,
    Json(request): Json<HeartbeatUpdateRequest>,
) -> ApiResult<Json<Value>> {
    let runtime = gated_runtime(&state, &query)?;
    if let Some(interval) = request.interval_seconds {
        if !(30..=86400).contains(&interval) {
            return Err(ApiError::validation("interval_seconds must be 30..=86400"));
        }
    }
    if request.active_start_hour.is_some_and(|h| h > 23)
        || request.active_end_hour.is_some_and(|h| h > 23)
    {
        return Err(ApiError::validation("active hours must be 0..=23"));
    }

    // Mutate the agent's own config file; the registry reloads on mtime.
    let config_path = state.registry.agent_config_path(&runtime.agent_id)?;
    let mut config = load_runtime_config(&config_path);
    let heartbeat = &mut config.heartbeat;
    if let Some(enabled) = request.enabled {
        heartbeat.enabled = enabled;
    }
    if let Some(interval) = request.interval_seconds {
        heartbeat.interval_seconds = interval.max(30);
    }
    if let Some(timezone) = request.timezone.as_deref().map(str::trim) {
        if !timezone.is_empty() {
            heartbeat.timezone = timezone.to_string();
        }
    }
    if let Some(start) = request.active_start_hour {
        heartbeat.active_start_hour = start % 24;
    }
    if let Some(end) = request.active_end_hour {
        heartbeat.active_end_hour = end % 24;
    }
    if let Some(session_id) = request.session_id.as_deref().map(str::trim) {
        if !session_id.is_empty() {
            heartbeat.session_id = session_id.to_string();
        }
    }
    save_runtime_config_to_path(&config_path, &config)?;

    let refreshed = state.registry.get_runtime(&runtime.agent_id)?;
    // Keep the long-lived scheduler in sync for the default agent.
    let _ = state.heartbeat_for(&refreshed);
    Ok(data(heartbeat_view(
        &refreshed.agent_id,
        &refreshed.config.heartbeat,
    )))
}

pub async fn list_heartbeat_runs(
    State(state): State<AppState>,
    Query(query): Query<AgentQuery>,
) -> ApiResult<Json<Value>> {
    let runtime = gated_runtime(&state, &query)?;
    let scheduler = state.heartbeat_for(&runtime);
    let limit = query
        .limit
        .unwrap_or(runtime.config.scheduler.runs_query_default_limit)
        .clamp(1, 5000);
    Ok(data(json!({
        "agent_id": &runtime.agent_id,
        "runs": scheduler.query_runs(limit),
    })))
}
