//! Workspace file access behind a strict path allow-list.
//!
//! Only `workspace/`, `memory/`, `skills/`, `knowledge/` prefixes and the
//! root `SKILLS_SNAPSHOT.md` are reachable. `skills/` resolves against the
//! base dir (skills are shared), everything else against the agent's
//! workspace. Saving `memory/MEMORY.md` triggers a memory reindex.

use std::path::{Path as FsPath, PathBuf};

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use warren_retrieval::Domain;
use warren_tools::path_guard::resolve_workspace_path;

use crate::skills::scan_skills;
use crate::state::AppState;

use super::errors::{data, ApiError, ApiResult};

const ALLOWED_PREFIXES: [&str; 4] = ["workspace/", "memory/", "skills/", "knowledge/"];
const ALLOWED_ROOT_FILES: [&str; 1] = ["SKILLS_SNAPSHOT.md"];
const BROWSE_DIRS: [&str; 3] = ["workspace", "memory", "knowledge"];
const BROWSE_SUFFIXES: [&str; 6] = ["md", "txt", "json", "yaml", "yml", "toml"];
const MAX_BROWSE_FILES: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct ReadQuery {
    pub path: String,
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AgentQuery {
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SaveFileRequest {
    pub path: String,
    pub content: String,
}

fn resolve_allowed(
    base_dir: &FsPath,
    workspace_root: &FsPath,
    rel_path: &str,
) -> Result<PathBuf, ApiError> {
    let rel_path = rel_path.trim();
    if ALLOWED_ROOT_FILES.contains(&rel_path) {
        return Ok(workspace_root.join(rel_path));
    }
    if !ALLOWED_PREFIXES
        .iter()
        .any(|prefix| rel_path.starts_with(prefix))
    {
        return Err(ApiError::forbidden_path("Path prefix is not allowed")
            .with_details(json!({"path": rel_path})));
    }
    let root = if rel_path.starts_with("skills/") {
        base_dir
    } else {
        workspace_root
    };
    resolve_workspace_path(root, rel_path).map_err(|e| {
        ApiError::forbidden_path("Path escapes workspace root")
            .with_details(json!({"path": rel_path, "reason": e.to_string()}))
    })
}

pub async fn read(
    State(state): State<AppState>,
    Query(query): Query<ReadQuery>,
) -> ApiResult<Json<Value>> {
    let runtime = state
        .registry
        .get_runtime(query.agent_id.as_deref().unwrap_or("default"))?;
    let target = resolve_allowed(&state.base_dir, &runtime.root_dir, &query.path)?;
    if !target.is_file() {
        return Err(ApiError::not_found("File not found").with_details(json!({"path": query.path})));
    }
    let bytes = std::fs::read(&target).map_err(ApiError::internal)?;
    Ok(data(json!({
        "path": query.path,
        "content": String::from_utf8_lossy(&bytes),
    })))
}

pub async fn save(
    State(state): State<AppState>,
    Query(query): Query<AgentQuery>,
    Json(request): Json<SaveFileRequest>,
) -> ApiResult<Json<Value>> {
    if request.path.trim().is_empty() {
        return Err(ApiError::validation("path must not be empty"));
    }
    let runtime = state
        .registry
        .get_runtime(query.agent_id.as_deref().unwrap_or("default"))?;
    let target = resolve_allowed(&state.base_dir, &runtime.root_dir, &request.path)?;

    let write = || -> std::io::Result<()> {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = target.with_extension("tmp");
        std::fs::write(&tmp, &request.content)?;
        std::fs::rename(&tmp, &target)
    };
    write().map_err(ApiError::internal)?;

    if request.path.trim() == "memory/MEMORY.md" {
        if let Err(e) = runtime
            .retrieval
            .rebuild(
                Domain::Memory,
                &runtime.config.retrieval.memory,
                &runtime.config.retrieval.storage,
            )
            .await
        {
            tracing::warn!(error = %e, "memory reindex after save failed");
        }
    }

    Ok(data(json!({"path": request.path, "saved": true})))
}

fn browse_files(workspace_root: &FsPath) -> Vec<String> {
    fn walk(root: &FsPath, base: &FsPath, rows: &mut Vec<String>) {
        if rows.len() >= MAX_BROWSE_FILES {
            return;
        }
        let Ok(entries) = std::fs::read_dir(root) else {
            return;
        };
        let mut paths: Vec<PathBuf> = entries.flatten().map(|entry| entry.path()).collect();
        paths.sort();
        for path in paths {
            if rows.len() >= MAX_BROWSE_FILES {
                return;
            }
            if path.is_dir() {
                walk(&path, base, rows);
            } else if path.is_file() {
                let suffix_ok = path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| BROWSE_SUFFIXES.contains(&ext.to_lowercase().as_str()))
                    .unwrap_or(false);
                if suffix_ok {
                    if let Ok(rel) = path.strip_prefix(base) {
                        rows.push(rel.to_string_lossy().replace('\\', "/"));
                    }
                }
            }
        }
    }

    let mut rows = Vec::new();
    for dir in BROWSE_DIRS {
        walk(&workspace_root.join(dir), workspace_root, &mut rows);
    }
    for root_file in ALLOWED_ROOT_FILES {
        if workspace_root.join(root_file).is_file() {
            rows.push(root_file.to_string());
        }
    }
    rows.sort();
    rows.dedup();
    rows
}

pub async fn index(
    State(state): State<AppState>,
    Query(query): Query<AgentQuery>,
) -> ApiResult<Json<Value>> {
    let runtime = state
        .registry
        .get_runtime(query.agent_id.as_deref().unwrap_or("default"))?;
    Ok(data(json!({
        "agent_id": &runtime.agent_id,
        "workspace_root": runtime.root_dir.to_string_lossy(),
        "files": browse_files(&runtime.root_dir),
    })))
}

pub async fn skills(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let skills = scan_skills(&state.base_dir)?;
    Ok(data(skills))
}
