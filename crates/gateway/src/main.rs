//! `warrend` — the Warren agent runtime server.
//!
//! Builds the agent registry, the run orchestrator, and both schedulers,
//! then serves the HTTP API until shutdown. Schedulers are stopped
//! gracefully on ctrl-c.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use warren_domain::config::SecretConfig;
use warren_gateway::api::{self, RateLimiter};
use warren_gateway::registry::{AgentRegistry, DEFAULT_AGENT_ID};
use warren_gateway::runtime::{RunMap, TurnEngine};
use warren_gateway::skills::scan_skills;
use warren_gateway::state::AppState;
use warren_scheduler::{CronScheduler, HeartbeatScheduler};

#[derive(Parser, Debug)]
#[command(name = "warrend", about = "Warren multi-tenant agent runtime")]
struct Args {
    /// Data directory holding config, workspaces, and skills.
    #[arg(long, default_value = "./data")]
    base_dir: PathBuf,

    /// Address to bind the HTTP server on.
    #[arg(long, default_value = "127.0.0.1:8000")]
    bind: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    std::fs::create_dir_all(&args.base_dir)
        .with_context(|| format!("create base dir {}", args.base_dir.display()))?;
    let base_dir = args
        .base_dir
        .canonicalize()
        .context("canonicalize base dir")?;

    let secrets = SecretConfig::from_env();
    let missing = secrets.missing();
    if !missing.is_empty() {
        anyhow::bail!("missing required secrets: {}", missing.join(", "));
    }

    let skills = scan_skills(&base_dir).context("scan skills")?;
    tracing::info!(count = skills.len(), "skills scanned");

    let registry = Arc::new(AgentRegistry::new(&base_dir, secrets).context("build registry")?);
    let engine = Arc::new(TurnEngine::new(registry.clone()));

    // Long-lived schedulers for the default agent.
    let default_runtime = registry
        .get_runtime(DEFAULT_AGENT_ID)
        .context("resolve default agent")?;
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
    heartbeat.clone().start();
    cron.clone().start();

    let state = AppState {
        base_dir,
        registry,
        engine,
        runs: Arc::new(RunMap::new()),
        heartbeat: heartbeat.clone(),
        cron: cron.clone(),
        rate_limiter: Arc::new(RateLimiter::new()),
    };

    let app = api::router(state)
        .into_make_service_with_connect_info::<std::net::SocketAddr>();
    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("bind {}", args.bind))?;
    tracing::info!(bind = %args.bind, "warrend listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .context("serve")?;

    heartbeat.stop().await;
    cron.stop().await;
    tracing::info!("schedulers stopped, goodbye");
    Ok(())
}
