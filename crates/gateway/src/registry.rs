//! Agent registry: isolated workspaces and cached per-agent runtime state.
//!
//! Workspaces are seeded missing-only from `workspace-template/` (existing
//! files are never overwritten). Each cached runtime remembers the mtimes
//! of the global and agent `config.json`; a change to either triggers a
//! reload and a fresh effective-config digest on the next lookup. The LLM
//! client is rebuilt lazily when `(temperature, timeout)` changes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use warren_domain::config::{
    load_effective_runtime_config, EmbeddingProvider, RuntimeConfig, SecretConfig,
};
use warren_domain::{Error, Result};
use warren_retrieval::{Embedder, HttpEmbedder, NoopEmbedder, RetrievalIndex};
use warren_sessions::SessionStore;
use warren_storage::{AuditStore, UsageStore};

use crate::llm::{HttpLlmClient, LlmClient};

pub const DEFAULT_AGENT_ID: &str = "default";

const WORKSPACE_FILES: [&str; 6] = [
    "AGENTS.md",
    "SOUL.md",
    "IDENTITY.md",
    "USER.md",
    "HEARTBEAT.md",
    "BOOTSTRAP.md",
];

const MEMORY_PLACEHOLDER: &str = "# MEMORY\n\n- Keep this file concise.\n";

/// Everything a single agent's turns need, built once and cached.
pub struct AgentRuntime {
    pub agent_id: String,
    pub root_dir: PathBuf,
    pub config: RuntimeConfig,
    pub config_digest: String,
    pub sessions: Arc<SessionStore>,
    pub retrieval: Arc<RetrievalIndex>,
    pub audit: Arc<AuditStore>,
    pub usage: Arc<UsageStore>,
}

struct CachedRuntime {
    runtime: Arc<AgentRuntime>,
    global_mtime_ns: u128,
    agent_mtime_ns: u128,
}

pub struct AgentRegistry {
    base_dir: PathBuf,
    workspaces_dir: PathBuf,
    template_dir: PathBuf,
    secrets: SecretConfig,
    embedder: Arc<dyn Embedder>,
    runtimes: Mutex<HashMap<String, CachedRuntime>>,
    llm: Mutex<Option<(f64, u64, Arc<dyn LlmClient>)>>,
}

fn mtime_ns(path: &Path) -> u128 {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|duration| duration.as_nanos())
        .unwrap_or(0)
}

fn valid_agent_id(raw: &str) -> bool {
    !raw.is_empty()
        && raw.len() <= 64
        && raw
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
}

impl AgentRegistry {
    pub fn new(base_dir: &Path, secrets: SecretConfig) -> Result<Self> {
        let embedder: Arc<dyn Embedder> = match secrets.embedding_provider {
            EmbeddingProvider::Openai => Arc::new(HttpEmbedder::new(&secrets)?),
            EmbeddingProvider::Disabled => Arc::new(NoopEmbedder),
        };
        let registry = Self {
            base_dir: base_dir.to_path_buf(),
            workspaces_dir: base_dir.join("workspaces"),
            template_dir: base_dir.join("workspace-template"),
            secrets,
            embedder,
            runtimes: Mutex::new(HashMap::new()),
            llm: Mutex::new(None),
        };
        std::fs::create_dir_all(&registry.workspaces_dir)?;
        registry.ensure_template()?;
        Ok(registry)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn secrets(&self) -> &SecretConfig {
        &self.secrets
    }

    pub fn global_config_path(&self) -> PathBuf {
        self.base_dir.join("config.json")
    }

    pub fn agent_config_path(&self, agent_id: &str) -> Result<PathBuf> {
        let normalized = self.normalize_agent_id(Some(agent_id))?;
        Ok(self.workspaces_dir.join(normalized).join("config.json"))
    }

    /// Normalize and validate an agent id; empty/None means the default.
    pub fn normalize_agent_id(&self, agent_id: Option<&str>) -> Result<String> {
        let raw = agent_id.unwrap_or("").trim();
        if raw.is_empty() {
            return Ok(DEFAULT_AGENT_ID.to_string());
        }
        if !valid_agent_id(raw) {
            return Err(Error::Config(
                "agent_id must match [A-Za-z0-9_-]{1,64}".into(),
            ));
        }
        Ok(raw.to_string())
    }

    // ── Workspace seeding ───────────────────────────────────────────

    fn write_if_missing(path: &Path, default_text: &str) -> Result<()> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, default_text)?;
        Ok(())
    }

    fn ensure_template(&self) -> Result<()> {
        for dir in ["workspace", "memory", "knowledge"] {
            std::fs::create_dir_all(self.template_dir.join(dir))?;
        }
        for name in WORKSPACE_FILES {
            Self::write_if_missing(
                &self.template_dir.join("workspace").join(name),
                &format!("# {name}\n"),
            )?;
        }
        Self::write_if_missing(
            &self.template_dir.join("memory").join("MEMORY.md"),
            MEMORY_PLACEHOLDER,
        )?;
        Ok(())
    }

    /// Copy template files into the workspace, never overwriting.
    fn copy_tree_if_missing(source_dir: &Path, target_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(target_dir)?;
        if !source_dir.exists() {
            return Ok(());
        }
        for entry in std::fs::read_dir(source_dir)? {
            let entry = entry?;
            let source = entry.path();
            let target = target_dir.join(entry.file_name());
            if source.is_dir() {
                Self::copy_tree_if_missing(&source, &target)?;
            } else if source.is_file() && !target.exists() {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(&source, &target)?;
            }
        }
        Ok(())
    }

    fn sync_skills_snapshot(&self, workspace_root: &Path) -> Result<()> {
        let source = self.base_dir.join("SKILLS_SNAPSHOT.md");
        let target = workspace_root.join("SKILLS_SNAPSHOT.md");
        if source.exists() {
            std::fs::copy(&source, &target)?;
        } else if !target.exists() {
            std::fs::write(&target, "<available_skills>\n</available_skills>\n")?;
        }
        Ok(())
    }

    /// Legacy single-workspace layouts kept MEMORY.md at the workspace
    /// root. Move it under `memory/` when the canonical file is absent or
    /// still the template placeholder. Best-effort: failures are skipped.
    fn migrate_legacy_memory(workspace_root: &Path) {
        let legacy = workspace_root.join("MEMORY.md");
        if !legacy.is_file() {
            return;
        }
        let canonical = workspace_root.join("memory").join("MEMORY.md");
        let canonical_is_placeholder = std::fs::read_to_string(&canonical)
            .map(|text| text == MEMORY_PLACEHOLDER || text.trim().is_empty())
            .unwrap_or(true);
        if !canonical_is_placeholder {
            return;
        }
        let migrate = || -> std::io::Result<()> {
            std::fs::create_dir_all(canonical.parent().unwrap_or(workspace_root))?;
            let text = std::fs::read_to_string(&legacy)?;
            std::fs::write(&canonical, text)?;
            std::fs::remove_file(&legacy)
        };
        if let Err(e) = migrate() {
            tracing::debug!(error = %e, "legacy MEMORY.md migration skipped");
        }
    }

    fn workspace_root(&self, agent_id: &str) -> PathBuf {
        self.workspaces_dir.join(agent_id)
    }

    /// One-time import for the pre-multi-tenant layout, where the default
    /// agent's sessions lived at the base dir. Best-effort and
    /// missing-only, like the rest of the seeding.
    fn migrate_legacy_default_layout(&self, agent_id: &str, root: &Path) {
        if agent_id != DEFAULT_AGENT_ID {
            return;
        }
        let legacy_sessions = self.base_dir.join("sessions");
        let target_sessions = root.join("sessions");
        let has_sessions = std::fs::read_dir(&target_sessions)
            .map(|entries| {
                entries.flatten().any(|entry| {
                    entry.path().extension().and_then(|e| e.to_str()) == Some("json")
                })
            })
            .unwrap_or(false);
        if legacy_sessions.is_dir() && !has_sessions {
            if let Err(e) = Self::copy_tree_if_missing(&legacy_sessions, &target_sessions) {
                tracing::debug!(error = %e, "legacy session import skipped");
            }
        }

        let legacy_usage = self.base_dir.join("storage/usage/llm_usage.jsonl");
        let target_usage = root.join("storage/usage/llm_usage.jsonl");
        if legacy_usage.is_file() && !target_usage.exists() {
            let import = || -> std::io::Result<()> {
                std::fs::create_dir_all(target_usage.parent().unwrap_or(root))?;
                std::fs::copy(&legacy_usage, &target_usage).map(|_| ())
            };
            if let Err(e) = import() {
                tracing::debug!(error = %e, "legacy usage import skipped");
            }
        }
    }

    fn ensure_workspace(&self, agent_id: &str) -> Result<PathBuf> {
        let root = self.workspace_root(agent_id);
        std::fs::create_dir_all(&root)?;
        for dir in ["workspace", "memory", "knowledge"] {
            Self::copy_tree_if_missing(&self.template_dir.join(dir), &root.join(dir))?;
        }
        for rel in ["sessions/archive", "sessions/archived_sessions", "storage"] {
            std::fs::create_dir_all(root.join(rel))?;
        }
        Self::migrate_legacy_memory(&root);
        self.migrate_legacy_default_layout(agent_id, &root);
        self.sync_skills_snapshot(&root)?;
        Ok(root)
    }

    // ── Runtime resolution ──────────────────────────────────────────

    fn load_config(&self, agent_id: &str) -> RuntimeConfig {
        let agent_path = self.workspace_root(agent_id).join("config.json");
        load_effective_runtime_config(&self.global_config_path(), &agent_path)
    }

    fn build_runtime(&self, agent_id: &str) -> Result<CachedRuntime> {
        let root = self.ensure_workspace(agent_id)?;
        let config = self.load_config(agent_id);
        let audit = Arc::new(AuditStore::new(&root));
        audit.ensure_schema_descriptor()?;
        let runtime = AgentRuntime {
            agent_id: agent_id.to_string(),
            config_digest: config.digest(),
            sessions: Arc::new(SessionStore::new(&root)?),
            retrieval: Arc::new(RetrievalIndex::new(&root, self.embedder.clone())),
            usage: Arc::new(UsageStore::new(&root)),
            audit,
            config,
            root_dir: root.clone(),
        };
        Ok(CachedRuntime {
            runtime: Arc::new(runtime),
            global_mtime_ns: mtime_ns(&self.global_config_path()),
            agent_mtime_ns: mtime_ns(&root.join("config.json")),
        })
    }

    /// Resolve (and lazily create) an agent's runtime, reloading config
    /// when either layer's file changed on disk.
    pub fn get_runtime(&self, agent_id: &str) -> Result<Arc<AgentRuntime>> {
        let normalized = self.normalize_agent_id(Some(agent_id))?;
        let mut runtimes = self.runtimes.lock();
        if let Some(cached) = runtimes.get(&normalized) {
            let global_now = mtime_ns(&self.global_config_path());
            let agent_now = mtime_ns(&self.workspace_root(&normalized).join("config.json"));
            if cached.global_mtime_ns == global_now && cached.agent_mtime_ns == agent_now {
                return Ok(cached.runtime.clone());
            }
            tracing::info!(agent_id = %normalized, "config changed on disk, reloading runtime");
        }
        let rebuilt = self.build_runtime(&normalized)?;
        let runtime = rebuilt.runtime.clone();
        runtimes.insert(normalized, rebuilt);
        Ok(runtime)
    }

    /// The shared LLM client, rebuilt when `(temperature, timeout)` moved.
    pub fn llm_client(&self, config: &RuntimeConfig) -> Arc<dyn LlmClient> {
        let temperature = config.llm_runtime.temperature;
        let timeout = config.llm_runtime.timeout_seconds;
        let mut slot = self.llm.lock();
        if let Some((cached_temperature, cached_timeout, client)) = slot.as_ref() {
            if *cached_temperature == temperature && *cached_timeout == timeout {
                return client.clone();
            }
        }
        let client: Arc<dyn LlmClient> =
            Arc::new(HttpLlmClient::new(&self.secrets, temperature, timeout));
        *slot = Some((temperature, timeout, client.clone()));
        client
    }

    // ── Agent CRUD ──────────────────────────────────────────────────

    pub fn list_agents(&self) -> Vec<Value> {
        let Ok(entries) = std::fs::read_dir(&self.workspaces_dir) else {
            return Vec::new();
        };
        let mut rows: Vec<Value> = Vec::new();
        let mut dirs: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        dirs.sort();
        for dir in dirs {
            let Some(agent_id) = dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let count_json = |path: PathBuf| -> usize {
                std::fs::read_dir(path)
                    .map(|entries| {
                        entries
                            .flatten()
                            .filter(|entry| {
                                let path = entry.path();
                                path.is_file()
                                    && path.extension().and_then(|e| e.to_str()) == Some("json")
                            })
                            .count()
                    })
                    .unwrap_or(0)
            };
            let active = count_json(dir.join("sessions"));
            let archived = count_json(dir.join("sessions").join("archived_sessions"));
            let meta = std::fs::metadata(&dir).ok();
            let modified = meta
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);
            rows.push(json!({
                "agent_id": agent_id,
                "path": dir.to_string_lossy(),
                "created_at": modified,
                "updated_at": modified,
                "active_sessions": active,
                "archived_sessions": archived,
            }));
        }
        rows
    }

    /// Create a new agent workspace. Fails when the id already exists.
    pub fn create_agent(&self, agent_id: &str) -> Result<Value> {
        let normalized = self.normalize_agent_id(Some(agent_id))?;
        if self.workspace_root(&normalized).exists() {
            return Err(Error::Config(format!("Agent already exists: {normalized}")));
        }
        self.get_runtime(&normalized)?;
        self.list_agents()
            .into_iter()
            .find(|row| row.get("agent_id").and_then(Value::as_str) == Some(normalized.as_str()))
            .ok_or_else(|| Error::Other("failed to create agent".into()))
    }

    /// Delete an agent and its workspace tree. The default agent is kept.
    pub fn delete_agent(&self, agent_id: &str) -> Result<bool> {
        let normalized = self.normalize_agent_id(Some(agent_id))?;
        if normalized == DEFAULT_AGENT_ID {
            return Err(Error::Config("Default agent cannot be deleted".into()));
        }
        let root = self.workspace_root(&normalized);
        if !root.exists() {
            return Ok(false);
        }
        self.runtimes.lock().remove(&normalized);
        std::fs::remove_dir_all(&root)?;
        Ok(true)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
