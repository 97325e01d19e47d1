//! HTTP surface: router, middleware, and the per-area handler modules.
//!
//! Middleware stack (outermost first): trace, CORS, security headers, and
//! per-path-prefix rate limits (chat 60/min/IP, files and tokens
//! 120/min/IP, 429 + `Retry-After: 60` on exceed).

pub mod agents;
pub mod chat;
pub mod config_api;
pub mod errors;
pub mod files;
pub mod scheduler_api;
pub mod sessions;
pub mod tokens;
pub mod usage_api;

#[cfg(test)]
mod http_tests;

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post, put};
use axum::Router;
use serde_json::json;

use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rate limiting
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// (path prefix, max requests, window seconds)
const RATE_LIMITS: [(&str, usize, u64); 3] = [
    ("/api/chat", 60, 60),
    ("/api/tokens", 120, 60),
    ("/api/files", 120, 60),
];

/// Sliding-window per-IP buckets keyed `client:path-prefix`.
#[derive(Default)]
pub struct RateLimiter {
    buckets: parking_lot::Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Err((limit, window))` when the request must be rejected.
    pub fn check(&self, path: &str, client: &str) -> Result<(), (usize, u64)> {
        let Some((prefix, limit, window_secs)) = RATE_LIMITS
            .iter()
            .find(|(prefix, _, _)| path.starts_with(prefix))
            .copied()
        else {
            return Ok(());
        };

        let now = Instant::now();
        let window = std::time::Duration::from_secs(window_secs);
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(format!("{client}:{prefix}")).or_default();
        while bucket
            .front()
            .is_some_and(|first| now.duration_since(*first) > window)
        {
            bucket.pop_front();
        }
        if bucket.len() >= limit {
            return Err((limit, window_secs));
        }
        bucket.push_back(now);
        Ok(())
    }
}

async fn rate_limit_middleware(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request,
    next: Next,
) -> Response {
    let client = connect_info
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    if let Err((limit, window_secs)) = state
        .rate_limiter
        .check(request.uri().path(), &client)
    {
        let body = json!({
            "error": {
                "code": "rate_limit_exceeded",
                "message": "Rate limit exceeded. Try again later.",
                "details": {"limit": limit, "window_seconds": window_secs},
            }
        });
        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from_static("60"));
        return response;
    }
    next.run(request).await
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trusted hosts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn host_allowed(host: &str, allowed: &[String]) -> bool {
    let host = host.split(':').next().unwrap_or(host).to_lowercase();
    allowed.iter().any(|pattern| {
        let pattern = pattern.to_lowercase();
        match pattern.strip_prefix("*.") {
            Some(suffix) => host.ends_with(&format!(".{suffix}")) || host == suffix,
            None => host == pattern,
        }
    })
}

async fn trusted_host_middleware(request: Request, next: Next) -> Response {
    let allowed = csv_env(
        "WARREN_TRUSTED_HOSTS",
        &["localhost", "127.0.0.1", "*.localhost"],
    );
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if !host.is_empty() && !host_allowed(host, &allowed) {
        let body = json!({
            "error": {"code": "invalid_request", "message": "Untrusted host header"}
        });
        return (StatusCode::BAD_REQUEST, Json(body)).into_response();
    }
    next.run(request).await
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Security headers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn security_headers_middleware(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    let set_default = |headers: &mut axum::http::HeaderMap, name: &'static str, value: &'static str| {
        if !headers.contains_key(name) {
            headers.insert(name, HeaderValue::from_static(value));
        }
    };
    set_default(headers, "x-content-type-options", "nosniff");
    set_default(headers, "x-frame-options", "DENY");
    set_default(headers, "referrer-policy", "no-referrer");
    set_default(
        headers,
        "permissions-policy",
        "camera=(), microphone=(), geolocation=()",
    );
    set_default(headers, "cross-origin-resource-policy", "same-site");
    response
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Router
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn csv_env(name: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect(),
        _ => default.iter().map(|item| item.to_string()).collect(),
    }
}

fn cors_layer() -> tower_http::cors::CorsLayer {
    let origins: Vec<HeaderValue> = csv_env(
        "WARREN_ALLOWED_ORIGINS",
        &["http://localhost:3000", "http://127.0.0.1:3000"],
    )
    .iter()
    .filter_map(|origin| origin.parse().ok())
    .collect();
    tower_http::cors::CorsLayer::new()
        .allow_origin(tower_http::cors::AllowOrigin::list(origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(tower_http::cors::Any)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

/// Build the full API router over the shared state.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        // Agents
        .route("/api/agents", get(agents::list).post(agents::create))
        .route("/api/agents/:agent_id", delete(agents::remove))
        // Sessions
        .route(
            "/api/sessions",
            get(sessions::list).post(sessions::create),
        )
        .route(
            "/api/sessions/:session_id",
            put(sessions::rename).delete(sessions::remove),
        )
        .route("/api/sessions/:session_id/archive", post(sessions::archive))
        .route("/api/sessions/:session_id/restore", post(sessions::restore))
        .route("/api/sessions/:session_id/messages", get(sessions::messages))
        .route("/api/sessions/:session_id/history", get(sessions::history))
        .route(
            "/api/sessions/:session_id/generate-title",
            post(sessions::generate_title),
        )
        .route(
            "/api/sessions/:session_id/compress",
            post(sessions::compress),
        )
        // Chat
        .route("/api/chat", post(chat::chat))
        // Files & skills
        .route("/api/files", get(files::read).post(files::save))
        .route("/api/files/index", get(files::index))
        .route("/api/skills", get(files::skills))
        // Tokens
        .route("/api/tokens/session/:session_id", get(tokens::session))
        .route("/api/tokens/files", post(tokens::files))
        // Config
        .route(
            "/api/config/rag-mode",
            get(config_api::get_rag_mode).put(config_api::set_rag_mode),
        )
        .route(
            "/api/config/runtime",
            get(config_api::get_runtime).put(config_api::set_runtime),
        )
        .route(
            "/api/config/tracing",
            get(config_api::get_tracing).put(config_api::set_tracing),
        )
        // Scheduler
        .route(
            "/api/scheduler/cron/jobs",
            get(scheduler_api::list_cron_jobs).post(scheduler_api::create_cron_job),
        )
        .route(
            "/api/scheduler/cron/jobs/:job_id",
            put(scheduler_api::update_cron_job).delete(scheduler_api::delete_cron_job),
        )
        .route(
            "/api/scheduler/cron/jobs/:job_id/run",
            post(scheduler_api::run_cron_job),
        )
        .route("/api/scheduler/cron/runs", get(scheduler_api::list_cron_runs))
        .route(
            "/api/scheduler/cron/failures",
            get(scheduler_api::list_cron_failures),
        )
        .route(
            "/api/scheduler/heartbeat",
            get(scheduler_api::get_heartbeat).put(scheduler_api::update_heartbeat),
        )
        .route(
            "/api/scheduler/heartbeat/runs",
            get(scheduler_api::list_heartbeat_runs),
        )
        // Usage
        .route("/api/usage/records", get(usage_api::records))
        .route("/api/usage/summary", get(usage_api::summary))
        // Middlewares (innermost applied last).
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .layer(middleware::from_fn(trusted_host_middleware))
        .layer(cors_layer())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
