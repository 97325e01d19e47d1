//! Runtime configuration tree and the global ⊕ agent layering engine.
//!
//! Config files are JSON documents (`config.json` at the base dir, plus an
//! optional per-agent override in each workspace). The effective config is
//! `deep_merge(global, agent)` parsed leniently: unknown fields are ignored
//! and out-of-range values are clamped to their floors, so a hand-edited
//! file can never wedge the runtime.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::Result;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Leaf config types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// When workspace bootstrap files are injected into the system prompt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionMode {
    EveryTurn,
    FirstTurnOnly,
}

impl Default for InjectionMode {
    fn default() -> Self {
        Self::EveryTurn
    }
}

/// Which backend holds the chunk+embedding index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalEngine {
    Sqlite,
    Json,
}

impl Default for RetrievalEngine {
    fn default() -> Self {
        Self::Sqlite
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentExecutionConfig {
    pub max_steps: u32,
    pub max_retries: u32,
}

impl Default for AgentExecutionConfig {
    fn default() -> Self {
        Self {
            max_steps: 20,
            max_retries: 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmRuntimeConfig {
    pub temperature: f64,
    pub timeout_seconds: u64,
}

impl Default for LlmRuntimeConfig {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            timeout_seconds: 60,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalDomainConfig {
    pub top_k: usize,
    pub semantic_weight: f64,
    pub lexical_weight: f64,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for RetrievalDomainConfig {
    fn default() -> Self {
        Self {
            top_k: 3,
            semantic_weight: 0.7,
            lexical_weight: 0.3,
            chunk_size: 256,
            chunk_overlap: 32,
        }
    }
}

impl RetrievalDomainConfig {
    fn knowledge_default() -> Self {
        Self {
            chunk_size: 400,
            chunk_overlap: 80,
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalStorageConfig {
    pub engine: RetrievalEngine,
    pub db_path: String,
    pub fts_prefilter_k: usize,
}

impl Default for RetrievalStorageConfig {
    fn default() -> Self {
        Self {
            engine: RetrievalEngine::Sqlite,
            db_path: "storage/retrieval.db".into(),
            fts_prefilter_k: 20,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub memory: RetrievalDomainConfig,
    pub knowledge: RetrievalDomainConfig,
    pub storage: RetrievalStorageConfig,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            memory: RetrievalDomainConfig::default(),
            knowledge: RetrievalDomainConfig::knowledge_default(),
            storage: RetrievalStorageConfig::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolRetryGuardConfig {
    pub repeat_identical_failure_limit: u32,
}

impl Default for ToolRetryGuardConfig {
    fn default() -> Self {
        Self {
            repeat_identical_failure_limit: 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolTimeouts {
    pub terminal_seconds: u64,
    pub python_repl_seconds: u64,
    pub fetch_url_seconds: u64,
}

impl Default for ToolTimeouts {
    fn default() -> Self {
        Self {
            terminal_seconds: 30,
            python_repl_seconds: 30,
            fetch_url_seconds: 15,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolOutputLimits {
    pub terminal_chars: usize,
    pub fetch_url_chars: usize,
    pub read_file_chars: usize,
}

impl Default for ToolOutputLimits {
    fn default() -> Self {
        Self {
            terminal_chars: 5000,
            fetch_url_chars: 5000,
            read_file_chars: 10000,
        }
    }
}

/// Explicit-enable lists per trigger. For autonomous triggers these grant
/// tools beyond the trigger's permission ceiling; for chat a non-empty list
/// restricts the tool set instead.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutonomousToolsConfig {
    pub chat_enabled_tools: Vec<String>,
    pub heartbeat_enabled_tools: Vec<String>,
    pub cron_enabled_tools: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerApiConfig {
    pub api_enabled: bool,
    pub runs_query_default_limit: usize,
}

impl Default for SchedulerApiConfig {
    fn default() -> Self {
        Self {
            api_enabled: true,
            runs_query_default_limit: 100,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatRuntimeConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    pub timezone: String,
    pub active_start_hour: u32,
    pub active_end_hour: u32,
    pub session_id: String,
}

impl Default for HeartbeatRuntimeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_seconds: 300,
            timezone: "UTC".into(),
            active_start_hour: 9,
            active_end_hour: 21,
            session_id: "__heartbeat__".into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CronRuntimeConfig {
    pub enabled: bool,
    pub poll_interval_seconds: u64,
    pub timezone: String,
    pub max_failures: u32,
    pub retry_base_seconds: u64,
    pub retry_max_seconds: u64,
    pub failure_retention: usize,
}

impl Default for CronRuntimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_seconds: 20,
            timezone: "UTC".into(),
            max_failures: 8,
            retry_base_seconds: 30,
            retry_max_seconds: 3600,
            failure_retention: 200,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RuntimeConfig
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub rag_mode: bool,
    pub injection_mode: InjectionMode,
    pub bootstrap_max_chars: usize,
    pub bootstrap_total_max_chars: usize,
    pub agent_runtime: AgentExecutionConfig,
    pub llm_runtime: LlmRuntimeConfig,
    pub retrieval: RetrievalConfig,
    pub tool_retry_guard: ToolRetryGuardConfig,
    pub tool_timeouts: ToolTimeouts,
    pub tool_output_limits: ToolOutputLimits,
    pub autonomous_tools: AutonomousToolsConfig,
    pub scheduler: SchedulerApiConfig,
    pub heartbeat: HeartbeatRuntimeConfig,
    pub cron: CronRuntimeConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            rag_mode: false,
            injection_mode: InjectionMode::default(),
            bootstrap_max_chars: 20000,
            bootstrap_total_max_chars: 150000,
            agent_runtime: AgentExecutionConfig::default(),
            llm_runtime: LlmRuntimeConfig::default(),
            retrieval: RetrievalConfig::default(),
            tool_retry_guard: ToolRetryGuardConfig::default(),
            tool_timeouts: ToolTimeouts::default(),
            tool_output_limits: ToolOutputLimits::default(),
            autonomous_tools: AutonomousToolsConfig::default(),
            scheduler: SchedulerApiConfig::default(),
            heartbeat: HeartbeatRuntimeConfig::default(),
            cron: CronRuntimeConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Clamp every field to its documented floor so a hand-edited config can
    /// never produce a zero chunk size, a sub-second poll interval, etc.
    pub fn sanitize(&mut self) {
        if self.bootstrap_max_chars == 0 {
            self.bootstrap_max_chars = 20000;
        }
        if self.bootstrap_total_max_chars == 0 {
            self.bootstrap_total_max_chars = 150000;
        }
        self.agent_runtime.max_steps = self.agent_runtime.max_steps.max(1);
        self.llm_runtime.timeout_seconds = self.llm_runtime.timeout_seconds.max(5);
        for domain in [&mut self.retrieval.memory, &mut self.retrieval.knowledge] {
            domain.top_k = domain.top_k.max(1);
            domain.chunk_size = domain.chunk_size.max(64);
        }
        if self.retrieval.storage.db_path.trim().is_empty() {
            self.retrieval.storage.db_path = RetrievalStorageConfig::default().db_path;
        }
        self.retrieval.storage.fts_prefilter_k = self.retrieval.storage.fts_prefilter_k.max(1);
        self.tool_retry_guard.repeat_identical_failure_limit =
            self.tool_retry_guard.repeat_identical_failure_limit.max(1);
        self.scheduler.runs_query_default_limit = self.scheduler.runs_query_default_limit.max(1);
        self.heartbeat.interval_seconds = self.heartbeat.interval_seconds.max(30);
        self.heartbeat.active_start_hour %= 24;
        self.heartbeat.active_end_hour %= 24;
        if self.heartbeat.session_id.trim().is_empty() {
            self.heartbeat.session_id = HeartbeatRuntimeConfig::default().session_id;
        }
        self.cron.poll_interval_seconds = self.cron.poll_interval_seconds.max(5);
        self.cron.max_failures = self.cron.max_failures.max(1);
        self.cron.retry_base_seconds = self.cron.retry_base_seconds.max(5);
        self.cron.retry_max_seconds = self.cron.retry_max_seconds.max(30);
        self.cron.failure_retention = self.cron.failure_retention.max(1);
    }

    /// Serialize to the JSON payload persisted in `config.json`.
    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }

    /// Parse a payload leniently: unknown fields are ignored, missing ones
    /// default, and floors are applied afterwards.
    pub fn from_payload(payload: &Value) -> Self {
        let mut config: RuntimeConfig =
            serde_json::from_value(payload.clone()).unwrap_or_default();
        config.sanitize();
        config
    }

    /// Content-addressed digest of the canonical effective payload
    /// (object keys sorted, stable number formatting).
    pub fn digest(&self) -> String {
        let canonical = canonical_json(&self.to_payload());
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Layering: deep merge / deep diff
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Recursive merge: maps merge key-by-key, any other value overrides.
pub fn deep_merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut merged = base_map.clone();
            for (key, value) in overlay_map {
                let entry = match merged.get(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), entry);
            }
            Value::Object(merged)
        }
        _ => overlay.clone(),
    }
}

/// Recursive diff: keep only the keys of `candidate` whose value differs
/// from `baseline`. Writing back an agent override persists this delta, so
/// untouched fields keep inheriting from the global config.
pub fn deep_diff(candidate: &Value, baseline: &Value) -> Value {
    match (candidate, baseline) {
        (Value::Object(candidate_map), Value::Object(baseline_map)) => {
            let mut diff = Map::new();
            for (key, value) in candidate_map {
                match baseline_map.get(key) {
                    Some(base_value) if base_value == value => {}
                    Some(base_value) if value.is_object() && base_value.is_object() => {
                        let nested = deep_diff(value, base_value);
                        if nested.as_object().is_some_and(|m| !m.is_empty()) {
                            diff.insert(key.clone(), nested);
                        }
                    }
                    _ => {
                        diff.insert(key.clone(), value.clone());
                    }
                }
            }
            Value::Object(diff)
        }
        _ => candidate.clone(),
    }
}

/// Render a JSON value with object keys sorted recursively. Used for
/// digests so that serialization order never changes the hash.
pub fn canonical_json(value: &Value) -> String {
    fn render(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push('{');
                for (idx, key) in keys.iter().enumerate() {
                    if idx > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::to_string(key).unwrap_or_default());
                    out.push(':');
                    render(&map[*key], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        out.push(',');
                    }
                    render(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }
    let mut out = String::new();
    render(value, &mut out);
    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// File I/O
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn read_payload(path: &Path) -> Value {
    if !path.exists() {
        return Value::Object(Map::new());
    }
    std::fs::read_to_string(path)
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_else(|| Value::Object(Map::new()))
}

/// Load a single config file (missing file ⇒ defaults).
pub fn load_runtime_config(path: &Path) -> RuntimeConfig {
    RuntimeConfig::from_payload(&read_payload(path))
}

/// Effective config = deep_merge(global, agent), then sanitize.
pub fn load_effective_runtime_config(global_path: &Path, agent_path: &Path) -> RuntimeConfig {
    let merged = deep_merge(&read_payload(global_path), &read_payload(agent_path));
    RuntimeConfig::from_payload(&merged)
}

/// Persist the full payload atomically (temp file + rename).
pub fn save_runtime_config_to_path(path: &Path, config: &RuntimeConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let text = serde_json::to_string_pretty(&config.to_payload())? + "\n";
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, text)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Persist an agent override as the delta against baseline defaults, so an
/// unchanged field continues to inherit from the global config.
pub fn save_agent_override(path: &Path, config: &RuntimeConfig) -> Result<()> {
    let delta = deep_diff(&config.to_payload(), &RuntimeConfig::default().to_payload());
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let text = serde_json::to_string_pretty(&delta)? + "\n";
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, text)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Secrets (read once from the environment at startup)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Which service produces embeddings for the retrieval index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProvider {
    Openai,
    Disabled,
}

/// Provider endpoints and keys, read from the environment by the binary and
/// threaded through explicitly (never re-read ambiently).
#[derive(Clone, Debug)]
pub struct SecretConfig {
    pub llm_api_key: String,
    pub llm_base_url: String,
    pub llm_model: String,
    pub embedding_provider: EmbeddingProvider,
    pub embedding_api_key: String,
    pub embedding_base_url: String,
    pub embedding_model: String,
}

impl SecretConfig {
    pub fn from_env() -> Self {
        let env = |name: &str, default: &str| {
            std::env::var(name).unwrap_or_else(|_| default.to_string())
        };
        let provider = match env("WARREN_EMBEDDING_PROVIDER", "openai").as_str() {
            "disabled" => EmbeddingProvider::Disabled,
            _ => EmbeddingProvider::Openai,
        };
        Self {
            llm_api_key: env("WARREN_API_KEY", ""),
            llm_base_url: env("WARREN_BASE_URL", "https://api.deepseek.com"),
            llm_model: env("WARREN_MODEL", "deepseek-chat"),
            embedding_provider: provider,
            embedding_api_key: env("WARREN_EMBEDDING_API_KEY", ""),
            embedding_base_url: env("WARREN_EMBEDDING_BASE_URL", "https://api.openai.com/v1"),
            embedding_model: env("WARREN_EMBEDDING_MODEL", "text-embedding-3-small"),
        }
    }

    /// Names of required secrets that are missing.
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.llm_api_key.is_empty() {
            missing.push("WARREN_API_KEY");
        }
        if self.embedding_provider == EmbeddingProvider::Openai
            && self.embedding_api_key.is_empty()
        {
            missing.push("WARREN_EMBEDDING_API_KEY");
        }
        missing
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_pass_sanitize_unchanged() {
        let mut config = RuntimeConfig::default();
        let before = config.clone();
        config.sanitize();
        assert_eq!(config, before);
    }

    #[test]
    fn from_payload_clamps_floors() {
        let payload = json!({
            "retrieval": {"memory": {"chunk_size": 1, "top_k": 0}},
            "heartbeat": {"interval_seconds": 1, "active_start_hour": 27},
            "cron": {"poll_interval_seconds": 1, "retry_base_seconds": 0},
            "tool_retry_guard": {"repeat_identical_failure_limit": 0},
        });
        let config = RuntimeConfig::from_payload(&payload);
        assert_eq!(config.retrieval.memory.chunk_size, 64);
        assert_eq!(config.retrieval.memory.top_k, 1);
        assert_eq!(config.heartbeat.interval_seconds, 30);
        assert_eq!(config.heartbeat.active_start_hour, 3);
        assert_eq!(config.cron.poll_interval_seconds, 5);
        assert_eq!(config.cron.retry_base_seconds, 5);
        assert_eq!(config.tool_retry_guard.repeat_identical_failure_limit, 1);
    }

    #[test]
    fn from_payload_ignores_unknown_and_defaults_missing() {
        let payload = json!({"rag_mode": true, "no_such_key": 42});
        let config = RuntimeConfig::from_payload(&payload);
        assert!(config.rag_mode);
        assert_eq!(config.agent_runtime.max_steps, 20);
    }

    #[test]
    fn deep_merge_overrides_leaves_and_recurses_into_maps() {
        let base = json!({"a": {"x": 1, "y": 2}, "b": "keep"});
        let overlay = json!({"a": {"y": 9}, "c": true});
        let merged = deep_merge(&base, &overlay);
        assert_eq!(merged, json!({"a": {"x": 1, "y": 9}, "b": "keep", "c": true}));
    }

    #[test]
    fn deep_diff_keeps_only_changed_subtrees() {
        let baseline = json!({"a": {"x": 1, "y": 2}, "b": 3});
        let candidate = json!({"a": {"x": 1, "y": 5}, "b": 3});
        let diff = deep_diff(&candidate, &baseline);
        assert_eq!(diff, json!({"a": {"y": 5}}));
    }

    #[test]
    fn effective_config_layers_agent_over_global() {
        let dir = tempfile::TempDir::new().unwrap();
        let global = dir.path().join("config.json");
        let agent = dir.path().join("agent.json");
        std::fs::write(&global, r#"{"rag_mode": true, "heartbeat": {"timezone": "Asia/Tokyo"}}"#)
            .unwrap();
        std::fs::write(&agent, r#"{"heartbeat": {"enabled": true}}"#).unwrap();

        let effective = load_effective_runtime_config(&global, &agent);
        assert!(effective.rag_mode);
        assert!(effective.heartbeat.enabled);
        assert_eq!(effective.heartbeat.timezone, "Asia/Tokyo");
    }

    #[test]
    fn agent_override_persists_delta_only() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let mut config = RuntimeConfig::default();
        config.rag_mode = true;
        save_agent_override(&path, &config).unwrap();

        let written: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written, json!({"rag_mode": true}));
    }

    #[test]
    fn digest_is_stable_and_order_independent() {
        let config = RuntimeConfig::default();
        assert_eq!(config.digest(), config.digest());

        let mut changed = config.clone();
        changed.cron.max_failures = 3;
        assert_ne!(config.digest(), changed.digest());
    }

    #[test]
    fn canonical_json_sorts_object_keys() {
        let value = json!({"zebra": 1, "apple": {"y": 2, "x": 3}});
        assert_eq!(canonical_json(&value), r#"{"apple":{"x":3,"y":2},"zebra":1}"#);
    }

    #[test]
    fn save_and_reload_round_trips() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let mut config = RuntimeConfig::default();
        config.heartbeat.enabled = true;
        config.retrieval.storage.engine = RetrievalEngine::Json;
        save_runtime_config_to_path(&path, &config).unwrap();

        let loaded = load_runtime_config(&path);
        assert_eq!(loaded, config);
    }
}
