//! End-to-end handler tests driving the real router with a scripted LLM.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tower::ServiceExt;

use warren_domain::config::{EmbeddingProvider, SecretConfig};
use warren_domain::stream::{BoxStream, ProviderEvent};
use warren_domain::Result;
use warren_scheduler::{CronScheduler, HeartbeatScheduler};

use crate::llm::{LlmChatRequest, LlmClient};
use crate::registry::{AgentRegistry, DEFAULT_AGENT_ID};
use crate::runtime::{RunMap, TurnEngine};
use crate::state::AppState;

use super::{router, RateLimiter};

// ── Scripted LLM ────────────────────────────────────────────────────

struct ScriptedLlm {
    scripts: Mutex<VecDeque<Vec<ProviderEvent>>>,
}

impl ScriptedLlm {
    fn new(scripts: Vec<Vec<ProviderEvent>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
        })
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn stream_chat(
        &self,
        _request: &LlmChatRequest,
    ) -> Result<BoxStream<'static, Result<ProviderEvent>>> {
        let script = self
            .scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| vec![ProviderEvent::Done]);
        let stream = async_stream::stream! {
            for event in script {
                yield Ok(event);
            }
        };
        Ok(Box::pin(stream))
    }

    async fn complete(&self, _prompt: &str) -> Result<String> {
        Ok("Scripted summary".into())
    }

    fn model(&self) -> &str {
        "deepseek-chat"
    }
}

fn reply(text: &str) -> Vec<ProviderEvent> {
    vec![
        ProviderEvent::Token {
            text: text.to_string(),
        },
        ProviderEvent::Usage {
            payload: json!({"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}),
        },
        ProviderEvent::Done,
    ]
}

// ── Harness ─────────────────────────────────────────────────────────

fn secrets() -> SecretConfig {
    SecretConfig {
        llm_api_key: "test".into(),
        llm_base_url: "http://127.0.0.1:0".into(),
        llm_model: "deepseek-chat".into(),
        embedding_provider: EmbeddingProvider::Disabled,
        embedding_api_key: String::new(),
        embedding_base_url: String::new(),
        embedding_model: String::new(),
    }
}

fn app_with(scripts: Vec<Vec<ProviderEvent>>) -> (tempfile::TempDir, AppState, Router) {
    let dir = tempfile::TempDir::new().unwrap();
    let registry = Arc::new(AgentRegistry::new(dir.path(), secrets()).unwrap());
    let engine = Arc::new(TurnEngine::with_llm(
        registry.clone(),
        ScriptedLlm::new(scripts),
    ));
    let default_runtime = registry.get_runtime(DEFAULT_AGENT_ID).unwrap();
    let heartbeat = Arc::new(HeartbeatScheduler::new(
        &default_runtime.root_dir,
        DEFAULT_AGENT_ID,
        default_runtime.config.heartbeat.clone(),
        engine.clone(),
        default_runtime.sessions.clone(),
    ));
    let cron = Arc::new(CronScheduler::new(
        &default_runtime.root_dir,
        DEFAULT_AGENT_ID,
        default_runtime.config.cron.clone(),
        engine.clone(),
        default_runtime.sessions.clone(),
    ));
    let state = AppState {
        base_dir: dir.path().to_path_buf(),
        registry,
        engine,
        runs: Arc::new(RunMap::new()),
        heartbeat,
        cron,
        rate_limiter: Arc::new(RateLimiter::new()),
    };
    let app = router(state.clone());
    (dir, state, app)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(payload) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            builder
                .body(Body::from(serde_json::to_vec(&payload).unwrap()))
                .unwrap()
        }
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

// ── Scenarios ───────────────────────────────────────────────────────

#[tokio::test]
async fn chat_journey_persists_session_and_usage() {
    let (_dir, state, app) = app_with(vec![reply("Hello there")]);
    let (status, body) = send(
        &app,
        "POST",
        "/api/chat",
        Some(json!({"message": "hello", "session_id": "s1", "stream": false})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["content"], "Hello there");
    assert_eq!(body["data"]["session_id"], "s1");

    let runtime = state.registry.get_runtime("default").unwrap();
    let session = runtime.sessions.load("s1", false).unwrap();
    assert_eq!(session.messages.len(), 2);
    assert_eq!(session.messages[0].role, "user");
    assert_eq!(session.messages[0].content, "hello");
    assert_eq!(session.messages[1].content, "Hello there");

    let records = runtime
        .usage
        .query_records(&warren_storage::UsageQuery::last_day());
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["total_tokens"], 15);
}

#[tokio::test]
async fn chat_rejects_blank_message() {
    let (_dir, _state, app) = app_with(vec![]);
    let (status, body) = send(
        &app,
        "POST",
        "/api/chat",
        Some(json!({"message": "  ", "session_id": "s1", "stream": false})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "validation_error");
}

#[tokio::test]
async fn compression_gate_requires_four_messages() {
    let (_dir, state, app) = app_with(vec![]);
    let runtime = state.registry.get_runtime("default").unwrap();
    for idx in 0..3 {
        runtime
            .sessions
            .save_message("s1", if idx % 2 == 0 { "user" } else { "assistant" }, "m", None)
            .unwrap();
    }

    let (status, body) = send(&app, "POST", "/api/sessions/s1/compress", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_state");

    runtime.sessions.save_message("s1", "assistant", "m", None).unwrap();
    let (status, body) = send(&app, "POST", "/api/sessions/s1/compress", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["archived_count"], 4);
    assert_eq!(body["data"]["remaining_count"], 0);
    assert_eq!(body["data"]["summary"], "Scripted summary");
}

#[tokio::test]
async fn tokens_files_reports_per_row_path_errors() {
    let (_dir, _state, app) = app_with(vec![]);
    let (status, body) = send(
        &app,
        "POST",
        "/api/tokens/files",
        Some(json!({"paths": ["memory/MEMORY.md", "../../etc/passwd"]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let rows = body["data"].as_array().unwrap();
    assert!(rows[0].get("error").is_none());
    assert!(rows[0]["tokens"].as_u64().unwrap() >= 1);
    assert_eq!(rows[1]["error"], "invalid_path");
    assert_eq!(rows[1]["tokens"], 0);
}

#[tokio::test]
async fn cron_job_lifecycle_via_the_api() {
    let (_dir, _state, app) = app_with(vec![reply("pong")]);

    let (status, body) = send(
        &app,
        "POST",
        "/api/scheduler/cron/jobs",
        Some(json!({"schedule_type": "every", "schedule": "60", "prompt": "ping"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let job_id = body["data"]["job"]["id"].as_str().unwrap().to_string();
    assert!(body["data"]["job"]["next_run_ts"].as_f64().unwrap() > 0.0);

    // Disabling zeroes next_run_ts.
    let (status, body) = send(
        &app,
        "PUT",
        &format!("/api/scheduler/cron/jobs/{job_id}"),
        Some(json!({"enabled": false})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["job"]["next_run_ts"], 0.0);

    // Manual run executes despite enabled=false and appends a run row.
    let (status, body) = send(
        &app,
        "POST",
        &format!("/api/scheduler/cron/jobs/{job_id}/run"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]["job"]["last_run_ts"].as_f64().unwrap() > 0.0);

    let (status, body) = send(&app, "GET", "/api/scheduler/cron/runs", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["runs"].as_array().unwrap().len(), 1);

    let (status, body) = send(
        &app,
        "DELETE",
        &format!("/api/scheduler/cron/jobs/{job_id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["deleted"], true);
}

#[tokio::test]
async fn scheduler_api_gate_returns_403() {
    let (dir, _state, app) = app_with(vec![]);
    std::fs::write(
        dir.path().join("config.json"),
        r#"{"scheduler": {"api_enabled": false}}"#,
    )
    .unwrap();
    std::thread::sleep(std::time::Duration::from_millis(20));

    let (status, body) = send(&app, "GET", "/api/scheduler/cron/jobs", None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "scheduler_api_disabled");
}

#[tokio::test]
async fn files_outside_the_allow_list_are_forbidden() {
    let (_dir, _state, app) = app_with(vec![]);
    let (status, body) = send(&app, "GET", "/api/files?path=storage/audit/runs.jsonl", None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "forbidden_path");
}

#[tokio::test]
async fn file_save_and_read_round_trip() {
    let (_dir, _state, app) = app_with(vec![]);
    let (status, _) = send(
        &app,
        "POST",
        "/api/files",
        Some(json!({"path": "workspace/USER.md", "content": "# USER\nname: casey\n"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&app, "GET", "/api/files?path=workspace/USER.md", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]["content"].as_str().unwrap().contains("casey"));
}

#[tokio::test]
async fn security_headers_are_applied() {
    let (_dir, _state, app) = app_with(vec![]);
    let request = Request::builder()
        .method("GET")
        .uri("/api/health")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers["x-content-type-options"], "nosniff");
    assert_eq!(headers["x-frame-options"], "DENY");
    assert_eq!(headers["referrer-policy"], "no-referrer");
    assert_eq!(headers["cross-origin-resource-policy"], "same-site");
}

#[tokio::test]
async fn agents_crud_protects_the_default_agent() {
    let (_dir, _state, app) = app_with(vec![]);
    let (status, body) = send(
        &app,
        "POST",
        "/api/agents",
        Some(json!({"agent_id": "research"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["agent_id"], "research");

    let (status, _) = send(&app, "DELETE", "/api/agents/default", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&app, "DELETE", "/api/agents/research", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["deleted"], true);
}

#[tokio::test]
async fn rag_mode_toggle_round_trips() {
    let (_dir, _state, app) = app_with(vec![]);
    let (status, body) = send(&app, "GET", "/api/config/rag-mode", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["enabled"], false);

    std::thread::sleep(std::time::Duration::from_millis(20));
    let (status, body) = send(
        &app,
        "PUT",
        "/api/config/rag-mode",
        Some(json!({"enabled": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["enabled"], true);
}
