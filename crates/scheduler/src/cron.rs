//! Cron-like scheduler with a durable JSON job store.
//!
//! Three schedule kinds: `at` (ISO timestamp, fires once then disables),
//! `every` (seconds, floor 5), and `cron` (classic 5-field expression,
//! dow 0=Sun). Jobs persist in `storage/cron_jobs.json` with atomic writes;
//! run and failure history are JSONL files, failures trimmed to the
//! configured retention. Failed jobs back off exponentially and disable at
//! `max_failures`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveDateTime, TimeZone, Timelike};
use chrono_tz::Tz;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use warren_domain::config::CronRuntimeConfig;
use warren_domain::tool::TriggerType;
use warren_domain::{Error, Result};
use warren_sessions::SessionStore;
use warren_storage::{jsonl, now_secs, PathLocks};

use crate::{TurnRequest, TurnRunner};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Job model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    At,
    Every,
    Cron,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CronJob {
    pub id: String,
    pub name: String,
    pub schedule_type: ScheduleType,
    pub schedule: String,
    pub prompt: String,
    pub enabled: bool,
    pub next_run_ts: f64,
    pub created_at: f64,
    pub updated_at: f64,
    #[serde(default)]
    pub last_run_ts: f64,
    #[serde(default)]
    pub last_success_ts: f64,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default)]
    pub last_error: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cron expression evaluation (5-field, dow 0=Sun)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_cron_field(field: &str, lower: u32, upper: u32) -> Result<Vec<u32>> {
    let source = field.trim();
    if source == "*" {
        return Ok((lower..=upper).collect());
    }
    let mut values = Vec::new();
    for part in source.split(',') {
        let token = part.trim();
        if token.is_empty() {
            continue;
        }
        if let Some(step_str) = token.strip_prefix("*/") {
            let step: u32 = step_str
                .parse()
                .map_err(|_| Error::Scheduler(format!("invalid step in cron field: {field}")))?;
            if step == 0 {
                return Err(Error::Scheduler(format!("invalid step in cron field: {field}")));
            }
            values.extend((lower..=upper).step_by(step as usize));
            continue;
        }
        if let Some((start_str, end_str)) = token.split_once('-') {
            let start: u32 = start_str
                .parse()
                .map_err(|_| Error::Scheduler(format!("invalid cron range: {token}")))?;
            let end: u32 = end_str
                .parse()
                .map_err(|_| Error::Scheduler(format!("invalid cron range: {token}")))?;
            if start < lower || end > upper || start > end {
                return Err(Error::Scheduler(format!("cron range out of bounds: {token}")));
            }
            values.extend(start..=end);
            continue;
        }
        let number: u32 = token
            .parse()
            .map_err(|_| Error::Scheduler(format!("invalid cron field: {field}")))?;
        if number < lower || number > upper {
            return Err(Error::Scheduler(format!("cron field value out of range: {field}")));
        }
        values.push(number);
    }
    if values.is_empty() {
        return Err(Error::Scheduler(format!("invalid cron field: {field}")));
    }
    values.sort_unstable();
    values.dedup();
    Ok(values)
}

/// Does a local datetime match a 5-field cron expression?
pub fn cron_matches(expr: &str, dt: &DateTime<Tz>) -> Result<bool> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(Error::Scheduler(
            "cron expression must have 5 fields: minute hour day month weekday".into(),
        ));
    }
    let minutes = parse_cron_field(fields[0], 0, 59)?;
    let hours = parse_cron_field(fields[1], 0, 23)?;
    let days = parse_cron_field(fields[2], 1, 31)?;
    let months = parse_cron_field(fields[3], 1, 12)?;
    let weekdays = parse_cron_field(fields[4], 0, 6)?;
    let weekday = dt.weekday().num_days_from_sunday();

    Ok(minutes.contains(&dt.minute())
        && hours.contains(&dt.hour())
        && days.contains(&dt.day())
        && months.contains(&dt.month())
        && weekdays.contains(&weekday))
}

/// Next matching minute strictly after `after`, searched over ≤366 days.
pub fn next_cron_time(expr: &str, after: DateTime<Tz>) -> Result<DateTime<Tz>> {
    let mut cursor = after
        .with_second(0)
        .and_then(|dt| dt.with_nanosecond(0))
        .unwrap_or(after)
        + Duration::minutes(1);
    for _ in 0..(60 * 24 * 366) {
        if cron_matches(expr, &cursor)? {
            return Ok(cursor);
        }
        cursor += Duration::minutes(1);
    }
    Err(Error::Scheduler(format!(
        "unable to compute next run for cron expression: {expr}"
    )))
}

fn parse_at_timestamp(value: &str, tz: Tz) -> Result<f64> {
    let text = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.timestamp_millis() as f64 / 1000.0);
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
            if let Some(dt) = tz.from_local_datetime(&naive).earliest() {
                return Ok(dt.timestamp_millis() as f64 / 1000.0);
            }
        }
    }
    Err(Error::Scheduler(format!("invalid 'at' timestamp: {value}")))
}

fn parse_every_seconds(value: &str) -> Result<u64> {
    let seconds: u64 = value
        .trim()
        .parse()
        .map_err(|_| Error::Scheduler(format!("invalid 'every' interval: {value}")))?;
    Ok(seconds.max(5))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CronScheduler {
    agent_id: String,
    jobs_file: PathBuf,
    runs_file: PathBuf,
    failures_file: PathBuf,
    config: RwLock<CronRuntimeConfig>,
    runner: Arc<dyn TurnRunner>,
    sessions: Arc<SessionStore>,
    /// Serializes job execution within this scheduler.
    exec_lock: tokio::sync::Mutex<()>,
    task: parking_lot::Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl CronScheduler {
    pub fn new(
        root_dir: &Path,
        agent_id: &str,
        config: CronRuntimeConfig,
        runner: Arc<dyn TurnRunner>,
        sessions: Arc<SessionStore>,
    ) -> Self {
        let storage = root_dir.join("storage");
        Self {
            agent_id: agent_id.to_string(),
            jobs_file: storage.join("cron_jobs.json"),
            runs_file: storage.join("cron_runs.jsonl"),
            failures_file: storage.join("cron_failures.jsonl"),
            config: RwLock::new(config),
            runner,
            sessions,
            exec_lock: tokio::sync::Mutex::new(()),
            task: parking_lot::Mutex::new(None),
        }
    }

    pub fn config(&self) -> CronRuntimeConfig {
        self.config.read().clone()
    }

    pub fn set_config(&self, config: CronRuntimeConfig) {
        *self.config.write() = config;
    }

    fn zone(&self) -> Tz {
        self.config
            .read()
            .timezone
            .parse::<Tz>()
            .unwrap_or(chrono_tz::UTC)
    }

    // ── Job store ───────────────────────────────────────────────────

    fn load_jobs(&self) -> Vec<CronJob> {
        let lock = PathLocks::lock_for(&self.jobs_file);
        let _guard = lock.lock();
        let Ok(text) = std::fs::read_to_string(&self.jobs_file) else {
            return Vec::new();
        };
        let Ok(payload) = serde_json::from_str::<Value>(&text) else {
            return Vec::new();
        };
        payload
            .get("jobs")
            .and_then(Value::as_array)
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| serde_json::from_value(row.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn save_jobs(&self, jobs: &[CronJob]) -> Result<()> {
        let lock = PathLocks::lock_for(&self.jobs_file);
        let _guard = lock.lock();
        if let Some(parent) = self.jobs_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let payload = json!({"jobs": jobs});
        let text = serde_json::to_string_pretty(&payload)? + "\n";
        let tmp = self.jobs_file.with_extension("json.tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &self.jobs_file)?;
        Ok(())
    }

    pub fn list_jobs(&self) -> Vec<CronJob> {
        self.load_jobs()
    }

    pub fn get_job(&self, job_id: &str) -> Option<CronJob> {
        self.load_jobs().into_iter().find(|job| job.id == job_id)
    }

    pub fn upsert_job(&self, job: CronJob) -> Result<()> {
        let mut jobs = self.load_jobs();
        match jobs.iter_mut().find(|existing| existing.id == job.id) {
            Some(slot) => *slot = job,
            None => jobs.push(job),
        }
        self.save_jobs(&jobs)
    }

    pub fn delete_job(&self, job_id: &str) -> Result<bool> {
        let mut jobs = self.load_jobs();
        let before = jobs.len();
        jobs.retain(|job| job.id != job_id);
        if jobs.len() == before {
            return Ok(false);
        }
        self.save_jobs(&jobs)?;
        Ok(true)
    }

    // ── Job creation / schedule math ────────────────────────────────

    /// Validate the schedule and build a job with its first `next_run_ts`.
    pub fn create_job(
        &self,
        name: &str,
        schedule_type: ScheduleType,
        schedule: &str,
        prompt: &str,
    ) -> Result<CronJob> {
        let now_ts = now_secs();
        let tz = self.zone();
        let next_run_ts = match schedule_type {
            ScheduleType::At => parse_at_timestamp(schedule, tz)?,
            ScheduleType::Every => now_ts + parse_every_seconds(schedule)? as f64,
            ScheduleType::Cron => {
                let after = tz.timestamp_millis_opt((now_ts * 1000.0) as i64)
                    .earliest()
                    .ok_or_else(|| Error::Scheduler("clock out of range".into()))?;
                next_cron_time(schedule, after)?.timestamp_millis() as f64 / 1000.0
            }
        };

        let name = name.trim();
        Ok(CronJob {
            id: Uuid::new_v4().to_string(),
            name: if name.is_empty() { "cron-job".into() } else { name.into() },
            schedule_type,
            schedule: schedule.trim().to_string(),
            prompt: prompt.trim().to_string(),
            enabled: true,
            next_run_ts,
            created_at: now_ts,
            updated_at: now_ts,
            last_run_ts: 0.0,
            last_success_ts: 0.0,
            failure_count: 0,
            last_error: String::new(),
        })
    }

    pub fn create_and_store_job(
        &self,
        name: &str,
        schedule_type: ScheduleType,
        schedule: &str,
        prompt: &str,
    ) -> Result<CronJob> {
        let job = self.create_job(name, schedule_type, schedule, prompt)?;
        self.upsert_job(job.clone())?;
        Ok(job)
    }

    /// Next run after a successful execution. `None` disables (`at` jobs).
    fn compute_next_run(&self, job: &CronJob, now_ts: f64) -> Result<Option<f64>> {
        match job.schedule_type {
            ScheduleType::At => Ok(None),
            ScheduleType::Every => {
                Ok(Some(now_ts + parse_every_seconds(&job.schedule)? as f64))
            }
            ScheduleType::Cron => {
                let tz = self.zone();
                let after = tz
                    .timestamp_millis_opt((now_ts * 1000.0) as i64)
                    .earliest()
                    .ok_or_else(|| Error::Scheduler("clock out of range".into()))?;
                Ok(Some(
                    next_cron_time(&job.schedule, after)?.timestamp_millis() as f64 / 1000.0,
                ))
            }
        }
    }

    // ── History ─────────────────────────────────────────────────────

    pub fn query_runs(&self, limit: usize) -> Vec<Value> {
        jsonl::read_tail(&self.runs_file, limit)
    }

    pub fn query_failures(&self, limit: usize) -> Vec<Value> {
        jsonl::read_tail(&self.failures_file, limit)
    }

    // ── Execution ───────────────────────────────────────────────────

    async fn run_job(&self, job: &mut CronJob, now_ts: f64) {
        let session_id = format!("__cron__:{}", job.id);
        let request = TurnRequest {
            agent_id: self.agent_id.clone(),
            session_id: session_id.clone(),
            message: job.prompt.clone(),
            trigger: TriggerType::Cron,
        };

        match self.runner.run_turn(request).await {
            Ok(outcome) => {
                let text = outcome.text.trim().to_string();
                if !text.is_empty() {
                    let persist = self
                        .sessions
                        .save_message(&session_id, "user", &job.prompt, None)
                        .and_then(|_| {
                            self.sessions.save_message(&session_id, "assistant", &text, None)
                        });
                    if let Err(e) = persist {
                        tracing::warn!(error = %e, job_id = %job.id, "failed to persist cron exchange");
                    }
                }

                job.failure_count = 0;
                job.last_error = String::new();
                job.last_success_ts = now_ts;
                job.last_run_ts = now_ts;
                job.updated_at = now_ts;
                match self.compute_next_run(job, now_ts) {
                    Ok(Some(next)) => job.next_run_ts = next,
                    Ok(None) => {
                        job.enabled = false;
                        job.next_run_ts = 0.0;
                    }
                    Err(e) => {
                        // Schedule became unparseable; park the job.
                        job.enabled = false;
                        job.next_run_ts = 0.0;
                        job.last_error = e.to_string();
                    }
                }

                let preview: String = text.chars().take(200).collect();
                let row = json!({
                    "timestamp_ms": (now_ts * 1000.0) as i64,
                    "job_id": &job.id,
                    "name": &job.name,
                    "status": "ok",
                    "response_preview": preview,
                });
                if let Err(e) = jsonl::append_record(&self.runs_file, &row) {
                    tracing::warn!(error = %e, "failed to append cron run row");
                }
            }
            Err(e) => {
                let config = self.config();
                job.failure_count += 1;
                job.last_error = e.to_string();
                job.last_run_ts = now_ts;
                job.updated_at = now_ts;

                let exponent = job.failure_count.saturating_sub(1).min(20);
                let backoff = config
                    .retry_max_seconds
                    .min(config.retry_base_seconds.saturating_mul(1u64 << exponent))
                    .max(5);
                job.next_run_ts = now_ts + backoff as f64;
                if job.failure_count >= config.max_failures {
                    job.enabled = false;
                }

                let row = json!({
                    "timestamp_ms": (now_ts * 1000.0) as i64,
                    "job_id": &job.id,
                    "name": &job.name,
                    "status": "error",
                    "error": e.to_string(),
                    "failure_count": job.failure_count,
                    "next_run_ts": job.next_run_ts,
                    "disabled": !job.enabled,
                });
                if let Err(e) = jsonl::append_record(&self.failures_file, &row) {
                    tracing::warn!(error = %e, "failed to append cron failure row");
                }
                if let Err(e) = jsonl::trim_to_last(&self.failures_file, config.failure_retention) {
                    tracing::warn!(error = %e, "failed to trim cron failures");
                }
            }
        }
    }

    /// Execute one job immediately, ignoring `enabled`, and persist it.
    pub async fn run_job_now(&self, job_id: &str) -> Result<Option<CronJob>> {
        let _exec = self.exec_lock.lock().await;
        let Some(mut job) = self.get_job(job_id) else {
            return Ok(None);
        };
        self.run_job(&mut job, now_secs()).await;
        self.upsert_job(job.clone())?;
        Ok(Some(job))
    }

    /// Run every due enabled job. With nothing due, performs no writes.
    pub async fn tick_once(&self) {
        let _exec = self.exec_lock.lock().await;
        let mut jobs = self.load_jobs();
        if jobs.is_empty() {
            return;
        }

        let now_ts = now_secs();
        let mut changed = false;
        for job in jobs.iter_mut() {
            if !job.enabled || job.next_run_ts > now_ts {
                continue;
            }
            self.run_job(job, now_ts).await;
            changed = true;
        }
        if changed {
            if let Err(e) = self.save_jobs(&jobs) {
                tracing::warn!(error = %e, "failed to save cron jobs after tick");
            }
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

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
                let poll = scheduler.config().poll_interval_seconds.max(5);
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = tokio::time::sleep(std::time::Duration::from_secs(poll)) => {}
                }
            }
            tracing::debug!("cron scheduler stopped");
        });
        *slot = Some((stop_tx, handle));
    }

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
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct CountingRunner {
        calls: AtomicU32,
        fail: AtomicBool,
        reply: String,
    }

    impl CountingRunner {
        fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail: AtomicBool::new(false),
                reply: reply.to_string(),
            })
        }
    }

    #[async_trait]
    impl TurnRunner for CountingRunner {
        async fn run_turn(&self, _request: TurnRequest) -> Result<crate::TurnOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::Llm("boom".into()));
            }
            Ok(crate::TurnOutcome {
                text: self.reply.clone(),
                usage: Value::Null,
            })
        }
    }

    fn scheduler(dir: &Path, runner: Arc<CountingRunner>) -> CronScheduler {
        let sessions = Arc::new(SessionStore::new(dir).unwrap());
        CronScheduler::new(dir, "default", CronRuntimeConfig::default(), runner, sessions)
    }

    // ── Cron expression math ────────────────────────────────────────

    fn at(tz: Tz, y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Tz> {
        tz.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn star_fields_match_everything() {
        let dt = at(chrono_tz::UTC, 2026, 6, 15, 10, 0);
        assert!(cron_matches("* * * * *", &dt).unwrap());
    }

    #[test]
    fn step_lists_and_ranges_match() {
        let dt = at(chrono_tz::UTC, 2026, 6, 15, 10, 15);
        assert!(cron_matches("*/5 * * * *", &dt).unwrap());
        assert!(cron_matches("0,15,30,45 * * * *", &dt).unwrap());
        assert!(cron_matches("15 9-17 * * *", &dt).unwrap());
        assert!(!cron_matches("*/7 * * * *", &dt).unwrap());
    }

    #[test]
    fn weekday_zero_is_sunday() {
        // 2026-06-14 is a Sunday.
        let sunday = at(chrono_tz::UTC, 2026, 6, 14, 8, 0);
        assert!(cron_matches("0 8 * * 0", &sunday).unwrap());
        assert!(!cron_matches("0 8 * * 1", &sunday).unwrap());
    }

    #[test]
    fn malformed_expressions_error() {
        let dt = at(chrono_tz::UTC, 2026, 6, 15, 10, 0);
        assert!(cron_matches("* * * *", &dt).is_err());
        assert!(cron_matches("61 * * * *", &dt).is_err());
        assert!(cron_matches("*/0 * * * *", &dt).is_err());
    }

    #[test]
    fn next_cron_time_finds_the_following_minute() {
        let after = at(chrono_tz::UTC, 2026, 6, 15, 10, 12);
        let next = next_cron_time("30 * * * *", after).unwrap();
        assert_eq!(next.minute(), 30);
        assert_eq!(next.hour(), 10);
    }

    #[test]
    fn next_cron_time_is_strictly_in_the_future() {
        let after = at(chrono_tz::UTC, 2026, 6, 15, 10, 30);
        let next = next_cron_time("30 * * * *", after).unwrap();
        assert_eq!(next.hour(), 11);
    }

    #[test]
    fn at_timestamps_parse_rfc3339_and_naive() {
        assert!(parse_at_timestamp("2026-09-01T10:00:00Z", chrono_tz::UTC).is_ok());
        assert!(parse_at_timestamp("2026-09-01T10:00:00+02:00", chrono_tz::UTC).is_ok());
        assert!(parse_at_timestamp("2026-09-01 10:00:00", chrono_tz::UTC).is_ok());
        assert!(parse_at_timestamp("next tuesday", chrono_tz::UTC).is_err());
    }

    // ── Scheduler behaviour ─────────────────────────────────────────

    #[tokio::test]
    async fn tick_with_no_due_jobs_writes_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let runner = CountingRunner::new("pong");
        let scheduler = scheduler(dir.path(), runner.clone());
        let job = scheduler
            .create_and_store_job("later", ScheduleType::Every, "3600", "ping")
            .unwrap();

        let before = std::fs::read_to_string(&scheduler.jobs_file).unwrap();
        scheduler.tick_once().await;
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read_to_string(&scheduler.jobs_file).unwrap(), before);
        assert!(scheduler.query_runs(10).is_empty());
        assert!(scheduler.get_job(&job.id).is_some());
    }

    #[tokio::test]
    async fn due_job_runs_once_and_reschedules() {
        let dir = tempfile::TempDir::new().unwrap();
        let runner = CountingRunner::new("pong");
        let scheduler = scheduler(dir.path(), runner.clone());
        let mut job = scheduler
            .create_and_store_job("soon", ScheduleType::Every, "60", "ping")
            .unwrap();
        job.next_run_ts = now_secs() - 1.0;
        scheduler.upsert_job(job.clone()).unwrap();

        scheduler.tick_once().await;
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);

        let updated = scheduler.get_job(&job.id).unwrap();
        assert!(updated.enabled);
        assert!(updated.next_run_ts > now_secs() + 30.0);
        assert!(updated.last_success_ts > 0.0);

        let runs = scheduler.query_runs(10);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0]["status"], "ok");
        assert_eq!(runs[0]["response_preview"], "pong");
    }

    #[tokio::test]
    async fn at_job_fires_once_then_disables() {
        let dir = tempfile::TempDir::new().unwrap();
        let runner = CountingRunner::new("done");
        let scheduler = scheduler(dir.path(), runner.clone());
        // An `at` time in the past fires on the next tick (at-least-once).
        let mut job = scheduler
            .create_and_store_job("one-shot", ScheduleType::At, "2026-01-01T00:00:00Z", "go")
            .unwrap();
        job.next_run_ts = now_secs() - 1.0;
        scheduler.upsert_job(job.clone()).unwrap();

        scheduler.tick_once().await;
        let updated = scheduler.get_job(&job.id).unwrap();
        assert!(!updated.enabled);
        assert_eq!(updated.next_run_ts, 0.0);

        scheduler.tick_once().await;
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_back_off_and_disable_at_the_limit() {
        let dir = tempfile::TempDir::new().unwrap();
        let runner = CountingRunner::new("");
        runner.fail.store(true, Ordering::SeqCst);
        let sessions = Arc::new(SessionStore::new(dir.path()).unwrap());
        let config = CronRuntimeConfig {
            max_failures: 2,
            retry_base_seconds: 30,
            retry_max_seconds: 3600,
            ..Default::default()
        };
        let scheduler =
            CronScheduler::new(dir.path(), "default", config, runner.clone(), sessions);
        let mut job = scheduler
            .create_and_store_job("flaky", ScheduleType::Every, "60", "ping")
            .unwrap();

        job.next_run_ts = now_secs() - 1.0;
        scheduler.upsert_job(job.clone()).unwrap();
        scheduler.tick_once().await;
        let after_first = scheduler.get_job(&job.id).unwrap();
        assert_eq!(after_first.failure_count, 1);
        assert!(after_first.enabled);
        // Backoff of retry_base · 2^0 = 30s.
        assert!(after_first.next_run_ts > now_secs() + 20.0);

        let mut due_again = after_first.clone();
        due_again.next_run_ts = now_secs() - 1.0;
        scheduler.upsert_job(due_again).unwrap();
        scheduler.tick_once().await;
        let after_second = scheduler.get_job(&job.id).unwrap();
        assert_eq!(after_second.failure_count, 2);
        assert!(!after_second.enabled);

        let failures = scheduler.query_failures(10);
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0]["status"], "error");
        assert_eq!(failures[0]["disabled"], true);
    }

    #[tokio::test]
    async fn failure_file_is_trimmed_to_retention() {
        let dir = tempfile::TempDir::new().unwrap();
        let runner = CountingRunner::new("");
        runner.fail.store(true, Ordering::SeqCst);
        let sessions = Arc::new(SessionStore::new(dir.path()).unwrap());
        let config = CronRuntimeConfig {
            max_failures: 100,
            failure_retention: 3,
            ..Default::default()
        };
        let scheduler =
            CronScheduler::new(dir.path(), "default", config, runner.clone(), sessions);
        let job = scheduler
            .create_and_store_job("noisy", ScheduleType::Every, "60", "ping")
            .unwrap();

        for _ in 0..6 {
            let mut due = scheduler.get_job(&job.id).unwrap();
            due.next_run_ts = now_secs() - 1.0;
            scheduler.upsert_job(due).unwrap();
            scheduler.tick_once().await;
        }
        assert_eq!(scheduler.query_failures(100).len(), 3);
    }

    #[tokio::test]
    async fn run_job_now_ignores_enabled_and_appends_a_row() {
        let dir = tempfile::TempDir::new().unwrap();
        let runner = CountingRunner::new("manual run");
        let scheduler = scheduler(dir.path(), runner.clone());
        let mut job = scheduler
            .create_and_store_job("paused", ScheduleType::Every, "60", "ping")
            .unwrap();
        job.enabled = false;
        job.next_run_ts = 0.0;
        scheduler.upsert_job(job.clone()).unwrap();

        let ran = scheduler.run_job_now(&job.id).await.unwrap().unwrap();
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
        assert!(ran.last_run_ts > 0.0);
        assert_eq!(scheduler.query_runs(10).len(), 1);

        assert!(scheduler.run_job_now("no-such-id").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cron_exchange_is_persisted_to_its_session() {
        let dir = tempfile::TempDir::new().unwrap();
        let runner = CountingRunner::new("report ready");
        let scheduler = scheduler(dir.path(), runner);
        let job = scheduler
            .create_and_store_job("report", ScheduleType::Every, "60", "make a report")
            .unwrap();
        scheduler.run_job_now(&job.id).await.unwrap();

        let sessions = SessionStore::new(dir.path()).unwrap();
        let session = sessions
            .load(&format!("__cron__:{}", job.id), false)
            .unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[1].content, "report ready");
    }

    #[tokio::test]
    async fn delete_job_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let runner = CountingRunner::new("x");
        let scheduler = scheduler(dir.path(), runner);
        let job = scheduler
            .create_and_store_job("gone", ScheduleType::Every, "60", "ping")
            .unwrap();
        assert!(scheduler.delete_job(&job.id).unwrap());
        assert!(!scheduler.delete_job(&job.id).unwrap());
        assert!(scheduler.get_job(&job.id).is_none());
    }
}
