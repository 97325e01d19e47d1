//! Shared application state passed to every API handler.
//!
//! All collaborators are constructed in `main` and injected here; handlers
//! close over this value instead of reaching for globals.

use std::path::PathBuf;
use std::sync::Arc;

use warren_scheduler::{CronScheduler, HeartbeatScheduler};

use crate::api::RateLimiter;
use crate::registry::{AgentRegistry, AgentRuntime, DEFAULT_AGENT_ID};
use crate::runtime::{RunMap, TurnEngine};

#[derive(Clone)]
pub struct AppState {
    pub base_dir: PathBuf,
    pub registry: Arc<AgentRegistry>,
    pub engine: Arc<TurnEngine>,
    pub runs: Arc<RunMap>,
    /// Long-lived schedulers for the default agent.
    pub heartbeat: Arc<HeartbeatScheduler>,
    pub cron: Arc<CronScheduler>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    /// Cron scheduler for an agent: the shared one for `default` (with its
    /// config refreshed), an ephemeral instance otherwise.
    pub fn cron_for(&self, runtime: &Arc<AgentRuntime>) -> Arc<CronScheduler> {
        if runtime.agent_id == DEFAULT_AGENT_ID {
            self.cron.set_config(runtime.config.cron.clone());
            return self.cron.clone();
        }
        Arc::new(CronScheduler::new(
            &runtime.root_dir,
            &runtime.agent_id,
            runtime.config.cron.clone(),
            self.engine.clone(),
            runtime.sessions.clone(),
        ))
    }

    /// Heartbeat scheduler for an agent, mirroring [`Self::cron_for`].
    pub fn heartbeat_for(&self, runtime: &Arc<AgentRuntime>) -> Arc<HeartbeatScheduler> {
        if runtime.agent_id == DEFAULT_AGENT_ID {
            self.heartbeat.set_config(runtime.config.heartbeat.clone());
            return self.heartbeat.clone();
        }
        Arc::new(HeartbeatScheduler::new(
            &runtime.root_dir,
            &runtime.agent_id,
            runtime.config.heartbeat.clone(),
            self.engine.clone(),
            runtime.sessions.clone(),
        ))
    }
}
