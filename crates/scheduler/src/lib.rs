//! Background schedulers that drive agent turns without a connected client.
//!
//! Two schedulers share one lifecycle pattern: `start()` spawns a single
//! background task when enabled, `stop()` flips a watch signal that
//! interrupts the inter-tick sleep immediately. Turns are executed through
//! the [`TurnRunner`] seam so this crate never depends on the HTTP layer or
//! the orchestrator directly.

pub mod cron;
pub mod heartbeat;

use async_trait::async_trait;
use serde_json::Value;

use warren_domain::tool::TriggerType;
use warren_domain::Result;

pub use cron::{CronJob, CronScheduler, ScheduleType};
pub use heartbeat::HeartbeatScheduler;

/// A request to run one autonomous agent turn.
#[derive(Clone, Debug)]
pub struct TurnRequest {
    pub agent_id: String,
    pub session_id: String,
    pub message: String,
    pub trigger: TriggerType,
}

/// The turn's final text plus whatever usage was recorded.
#[derive(Clone, Debug, Default)]
pub struct TurnOutcome {
    pub text: String,
    pub usage: Value,
}

/// Implemented by the run orchestrator; injected into both schedulers.
#[async_trait]
pub trait TurnRunner: Send + Sync {
    async fn run_turn(&self, request: TurnRequest) -> Result<TurnOutcome>;
}
