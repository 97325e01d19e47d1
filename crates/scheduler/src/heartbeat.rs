//! Heartbeat scheduler: fixed-interval ticks inside a timezone-local
//! active window.
//!
//! Each tick reads `workspace/HEARTBEAT.md`, strips blank lines and `#`
//! comments, and runs the remainder as a heartbeat turn. A reply of exactly
//! `HEARTBEAT_OK` is audited but not persisted to the session. Every tick
//! appends a row to `storage/heartbeat_runs.jsonl`.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use warren_domain::config::HeartbeatRuntimeConfig;
use warren_domain::tool::TriggerType;
use warren_sessions::SessionStore;
use warren_storage::{jsonl, now_ms};

use crate::{TurnRequest, TurnRunner};

const DEFAULT_PROMPT: &str = "Run a heartbeat check. Reply exactly HEARTBEAT_OK when healthy.";
const OK_SENTINEL: &str = "HEARTBEAT_OK";

pub struct HeartbeatScheduler {
    agent_id: String,
    prompt_file: PathBuf,
    audit_file: PathBuf,
    config: RwLock<HeartbeatRuntimeConfig>,
    runner: Arc<dyn TurnRunner>,
    sessions: Arc<SessionStore>,
    task: parking_lot::Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

pub(crate) fn parse_tz(tz: &str) -> chrono_tz::Tz {
    tz.parse::<chrono_tz::Tz>().unwrap_or(chrono_tz::UTC)
}

/// Active-window membership with wrap-around; equal bounds mean always on.
pub(crate) fn in_active_window(hour: u32, start: u32, end: u32) -> bool {
    let start = start % 24;
    let end = end % 24;
    if start == end {
        return true;
    }
    if start < end {
        (start..end).contains(&hour)
    } else {
        hour >= start || hour < end
    }
}

/// Drop blank lines and `#` comment lines from a heartbeat prompt.
pub(crate) fn normalize_prompt(raw: &str) -> String {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

impl HeartbeatScheduler {
    pub fn new(
        root_dir: &std::path::Path,
        agent_id: &str,
        config: HeartbeatRuntimeConfig,
        runner: Arc<dyn TurnRunner>,
        sessions: Arc<SessionStore>,
    ) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            prompt_file: root_dir.join("workspace").join("HEARTBEAT.md"),
            audit_file: root_dir.join("storage").join("heartbeat_runs.jsonl"),
            config: RwLock::new(config),
            runner,
            sessions,
            task: parking_lot::Mutex::new(None),
        }
    }

    pub fn config(&self) -> HeartbeatRuntimeConfig {
        self.config.read().clone()
    }

    /// Swap the config in place; the running task picks it up next tick.
    pub fn set_config(&self, config: HeartbeatRuntimeConfig) {
        *self.config.write() = config;
    }

    fn write_run(&self, status: &str, timezone: &str, details: Value) {
        let row = json!({
            "timestamp_ms": now_ms(),
            "status": status,
            "timezone": timezone,
            "details": details,
        });
        if let Err(e) = jsonl::append_record(&self.audit_file, &row) {
            tracing::warn!(error = %e, "failed to write heartbeat run row");
        }
    }

    pub fn query_runs(&self, limit: usize) -> Vec<Value> {
        jsonl::read_tail(&self.audit_file, limit)
    }

    fn read_prompt(&self) -> String {
        std::fs::read_to_string(&self.prompt_file)
            .map(|text| text.trim().to_string())
            .unwrap_or_else(|_| DEFAULT_PROMPT.to_string())
    }

    /// One heartbeat tick; always leaves exactly one audit row.
    pub async fn tick_once(&self) {
        self.tick_at(Utc::now()).await;
    }

    pub(crate) async fn tick_at(&self, now_utc: DateTime<Utc>) {
        let config = self.config();
        let tz = parse_tz(&config.timezone);
        let local_hour = now_utc.with_timezone(&tz).hour();

        if !in_active_window(local_hour, config.active_start_hour, config.active_end_hour) {
            self.write_run(
                "skipped_outside_window",
                &config.timezone,
                json!({
                    "active_start_hour": config.active_start_hour,
                    "active_end_hour": config.active_end_hour,
                    "local_hour": local_hour,
                }),
            );
            return;
        }

        let prompt = normalize_prompt(&self.read_prompt());
        if prompt.is_empty() {
            self.write_run(
                "skipped_no_prompt",
                &config.timezone,
                json!({"session_id": config.session_id}),
            );
            return;
        }

        let request = TurnRequest {
            agent_id: self.agent_id.clone(),
            session_id: config.session_id.clone(),
            message: prompt.clone(),
            trigger: TriggerType::Heartbeat,
        };
        match self.runner.run_turn(request).await {
            Ok(outcome) => {
                let text = outcome.text.trim().to_string();
                let suppressed = text == OK_SENTINEL;
                if !suppressed {
                    let reply = if text.is_empty() {
                        "HEARTBEAT_EMPTY".to_string()
                    } else {
                        text.clone()
                    };
                    let persist = self
                        .sessions
                        .save_message(&config.session_id, "user", &prompt, None)
                        .and_then(|_| {
                            self.sessions
                                .save_message(&config.session_id, "assistant", &reply, None)
                        });
                    if let Err(e) = persist {
                        tracing::warn!(error = %e, "failed to persist heartbeat exchange");
                    }
                }
                let preview: String = text.chars().take(200).collect();
                self.write_run(
                    "ok",
                    &config.timezone,
                    json!({
                        "session_id": config.session_id,
                        "suppressed": suppressed,
                        "response_preview": preview,
                    }),
                );
            }
            Err(e) => {
                self.write_run("error", &config.timezone, json!({"error": e.to_string()}));
            }
        }
    }

    /// Spawn the background loop (no-op when disabled or already running).
    pub fn start(self: Arc<Self>) {
        let mut slot = self.task.lock();
        if slot.is_some() || !self.config().enabled {
            return;
        }
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                scheduler.tick_once().await;
                let interval = scheduler.config().interval_seconds.max(30);
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = tokio::time::sleep(std::time::Duration::from_secs(interval)) => {}
                }
            }
            tracing::debug!("heartbeat scheduler stopped");
        });
        *slot = Some((stop_tx, handle));
    }

    /// Signal the loop to stop and wait for it to finish.
    pub async fn stop(&self) {
        let taken = self.task.lock().take();
        if let Some((stop_tx, handle)) = taken {
            let _ = stop_tx.send(true);
            let _ = handle.await;
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use warren_domain::Result;

    struct ScriptedRunner {
        reply: String,
        fail: bool,
    }

    #[async_trait]
    impl TurnRunner for ScriptedRunner {
        async fn run_turn(&self, _request: TurnRequest) -> Result<crate::TurnOutcome> {
            if self.fail {
                return Err(warren_domain::Error::Llm("provider down".into()));
            }
            Ok(crate::TurnOutcome {
                text: self.reply.clone(),
                usage: Value::Null,
            })
        }
    }

    fn scheduler_with(
        dir: &std::path::Path,
        reply: &str,
        fail: bool,
        config: HeartbeatRuntimeConfig,
    ) -> Arc<HeartbeatScheduler> {
        let sessions = Arc::new(SessionStore::new(dir).unwrap());
        Arc::new(HeartbeatScheduler::new(
            dir,
            "default",
            config,
            Arc::new(ScriptedRunner {
                reply: reply.to_string(),
                fail,
            }),
            sessions,
        ))
    }

    fn always_on_config() -> HeartbeatRuntimeConfig {
        HeartbeatRuntimeConfig {
            enabled: true,
            active_start_hour: 0,
            active_end_hour: 0, // equal bounds = always on
            ..Default::default()
        }
    }

    #[test]
    fn window_wraps_past_midnight() {
        assert!(in_active_window(23, 22, 6));
        assert!(in_active_window(3, 22, 6));
        assert!(!in_active_window(12, 22, 6));
        assert!(in_active_window(9, 9, 21));
        assert!(!in_active_window(21, 9, 21));
        assert!(in_active_window(15, 7, 7));
    }

    #[test]
    fn prompt_normalization_strips_comments_and_blanks() {
        let raw = "# heading\n\n  do the thing  \n# another\ncheck the queue\n";
        assert_eq!(normalize_prompt(raw), "do the thing\ncheck the queue");
        assert_eq!(normalize_prompt("# only\n# comments\n\n"), "");
    }

    #[tokio::test]
    async fn comment_only_prompt_logs_skipped_no_prompt() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("workspace")).unwrap();
        std::fs::write(
            dir.path().join("workspace/HEARTBEAT.md"),
            "# instructions only\n\n# nothing live\n",
        )
        .unwrap();
        let scheduler = scheduler_with(dir.path(), "irrelevant", false, always_on_config());
        scheduler.tick_once().await;

        let rows = scheduler.query_runs(10);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["status"], "skipped_no_prompt");
    }

    #[tokio::test]
    async fn outside_window_skips_without_running() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = always_on_config();
        config.timezone = "UTC".into();
        config.active_start_hour = 9;
        config.active_end_hour = 10;
        let scheduler = scheduler_with(dir.path(), "x", false, config);
        // 12:00 UTC is outside [9, 10).
        let noon = chrono::Utc.with_ymd_and_hms(2026, 6, 15, 12, 0, 0).unwrap();
        scheduler.tick_at(noon).await;

        let rows = scheduler.query_runs(10);
        assert_eq!(rows[0]["status"], "skipped_outside_window");
        assert_eq!(rows[0]["details"]["local_hour"], 12);
    }

    #[tokio::test]
    async fn heartbeat_ok_is_audited_but_not_persisted() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("workspace")).unwrap();
        std::fs::write(dir.path().join("workspace/HEARTBEAT.md"), "check things\n").unwrap();
        let scheduler = scheduler_with(dir.path(), "HEARTBEAT_OK", false, always_on_config());
        scheduler.tick_once().await;

        let rows = scheduler.query_runs(10);
        assert_eq!(rows[0]["status"], "ok");
        assert_eq!(rows[0]["details"]["suppressed"], true);

        let sessions = SessionStore::new(dir.path()).unwrap();
        let session = sessions.load("__heartbeat__", false).unwrap();
        assert!(session.messages.is_empty());
    }

    #[tokio::test]
    async fn real_reply_is_persisted_as_a_pair() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("workspace")).unwrap();
        std::fs::write(dir.path().join("workspace/HEARTBEAT.md"), "check things\n").unwrap();
        let scheduler = scheduler_with(dir.path(), "queue depth is 4", false, always_on_config());
        scheduler.tick_once().await;

        let sessions = SessionStore::new(dir.path()).unwrap();
        let session = sessions.load("__heartbeat__", false).unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].role, "user");
        assert_eq!(session.messages[1].content, "queue depth is 4");
    }

    #[tokio::test]
    async fn runner_failure_logs_error_status() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("workspace")).unwrap();
        std::fs::write(dir.path().join("workspace/HEARTBEAT.md"), "check\n").unwrap();
        let scheduler = scheduler_with(dir.path(), "", true, always_on_config());
        scheduler.tick_once().await;

        let rows = scheduler.query_runs(10);
        assert_eq!(rows[0]["status"], "error");
    }

    #[tokio::test]
    async fn start_and_stop_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let scheduler = scheduler_with(dir.path(), "HEARTBEAT_OK", false, always_on_config());
        scheduler.clone().start();
        scheduler.stop().await;
    }
}
