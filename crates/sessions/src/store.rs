//! SessionStore — JSON-file-backed chat sessions with live-response
//! projection and history compression.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use warren_domain::{Error, Result};
use warren_storage::{now_secs, PathLocks};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Data model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<Value>>,
    /// Present only on the transient live projection, never persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            tool_calls: None,
            streaming: None,
            run_id: None,
        }
    }
}

/// Transient partial-assistant snapshot readers see mid-run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LiveResponse {
    pub run_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<Value>,
    pub updated_at: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Session {
    pub title: String,
    pub created_at: f64,
    pub updated_at: f64,
    pub compressed_context: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_response: Option<LiveResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<f64>,
}

impl Default for Session {
    fn default() -> Self {
        let now = now_secs();
        Self {
            title: "New Session".into(),
            created_at: now,
            updated_at: now,
            compressed_context: String::new(),
            messages: Vec::new(),
            live_response: None,
            archived_at: None,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub title: String,
    pub created_at: f64,
    pub updated_at: f64,
    pub archived: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SessionStore
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionStore {
    sessions_dir: PathBuf,
    archive_dir: PathBuf,
    archived_sessions_dir: PathBuf,
}

impl SessionStore {
    pub fn new(root_dir: &Path) -> Result<Self> {
        let sessions_dir = root_dir.join("sessions");
        let archive_dir = sessions_dir.join("archive");
        let archived_sessions_dir = sessions_dir.join("archived_sessions");
        std::fs::create_dir_all(&archive_dir)?;
        std::fs::create_dir_all(&archived_sessions_dir)?;
        Ok(Self {
            sessions_dir,
            archive_dir,
            archived_sessions_dir,
        })
    }

    fn session_path(&self, session_id: &str, archived: bool) -> PathBuf {
        let dir = if archived {
            &self.archived_sessions_dir
        } else {
            &self.sessions_dir
        };
        dir.join(format!("{session_id}.json"))
    }

    pub fn exists(&self, session_id: &str, archived: bool) -> bool {
        self.session_path(session_id, archived).exists()
    }

    fn write_payload(&self, path: &Path, session: &Session) -> Result<()> {
        let text = serde_json::to_string_pretty(session)? + "\n";
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn read_payload(&self, path: &Path) -> Result<Session> {
        let text = std::fs::read_to_string(path)?;
        let raw: Value = serde_json::from_str(&text)?;
        // Legacy layout: a bare message array. Upgrade in place.
        if raw.is_array() {
            let messages: Vec<ChatMessage> = serde_json::from_value(raw)?;
            let session = Session {
                messages,
                ..Session::default()
            };
            self.write_payload(path, &session)?;
            return Ok(session);
        }
        Ok(serde_json::from_value(raw)?)
    }

    /// Load a session; active sessions are created on first reference.
    pub fn load(&self, session_id: &str, archived: bool) -> Result<Session> {
        let path = self.session_path(session_id, archived);
        let lock = PathLocks::lock_for(&path);
        let _guard = lock.lock();
        if !path.exists() {
            if archived {
                return Err(Error::Other(format!(
                    "Archived session not found: {session_id}"
                )));
            }
            let session = Session::default();
            self.write_payload(&path, &session)?;
            return Ok(session);
        }
        self.read_payload(&path)
    }

    pub fn save(&self, session_id: &str, session: &mut Session, archived: bool) -> Result<()> {
        session.updated_at = now_secs();
        let path = self.session_path(session_id, archived);
        let lock = PathLocks::lock_for(&path);
        let _guard = lock.lock();
        self.write_payload(&path, session)
    }

    /// Load-modify-save under one lock acquisition.
    fn update<F>(&self, session_id: &str, mutate: F) -> Result<Session>
    where
        F: FnOnce(&mut Session),
    {
        let path = self.session_path(session_id, false);
        let lock = PathLocks::lock_for(&path);
        let _guard = lock.lock();
        let mut session = if path.exists() {
            self.read_payload(&path)?
        } else {
            let session = Session::default();
            self.write_payload(&path, &session)?;
            session
        };
        mutate(&mut session);
        session.updated_at = now_secs();
        self.write_payload(&path, &session)?;
        Ok(session)
    }

    // ── Listing ─────────────────────────────────────────────────────

    fn list_dir(&self, archived: bool) -> Vec<SessionSummary> {
        let dir = if archived {
            &self.archived_sessions_dir
        } else {
            &self.sessions_dir
        };
        let mut rows = Vec::new();
        let Ok(entries) = std::fs::read_dir(dir) else {
            return rows;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(session_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Ok(session) = self.load(session_id, archived) else {
                continue;
            };
            rows.push(SessionSummary {
                session_id: session_id.to_string(),
                title: session.title,
                created_at: session.created_at,
                updated_at: session.updated_at,
                archived,
            });
        }
        rows
    }

    /// Sessions in scope (`active` | `archived` | `all`), newest first.
    pub fn list(&self, scope: &str) -> Vec<SessionSummary> {
        let mut rows = Vec::new();
        if matches!(scope, "active" | "all") {
            rows.extend(self.list_dir(false));
        }
        if matches!(scope, "archived" | "all") {
            rows.extend(self.list_dir(true));
        }
        rows.sort_by(|a, b| {
            b.updated_at
                .partial_cmp(&a.updated_at)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        rows
    }

    // ── Title / lifecycle ───────────────────────────────────────────

    pub fn rename(&self, session_id: &str, title: &str) -> Result<Session> {
        self.update(session_id, |session| {
            session.title = title.trim().to_string();
        })
    }

    /// Set a title unless the candidate is blank.
    pub fn update_title(&self, session_id: &str, title: &str) -> Result<()> {
        self.update(session_id, |session| {
            let trimmed = title.trim();
            if !trimmed.is_empty() {
                session.title = trimmed.to_string();
            }
        })?;
        Ok(())
    }

    pub fn delete(&self, session_id: &str, archived: bool) -> bool {
        let path = self.session_path(session_id, archived);
        let lock = PathLocks::lock_for(&path);
        let _guard = lock.lock();
        path.exists() && std::fs::remove_file(&path).is_ok()
    }

    pub fn archive(&self, session_id: &str) -> Result<bool> {
        if !self.exists(session_id, false) {
            return Ok(false);
        }
        let mut session = self.load(session_id, false)?;
        session.archived_at = Some(now_secs());
        self.save(session_id, &mut session, true)?;
        self.delete(session_id, false);
        Ok(true)
    }

    pub fn restore(&self, session_id: &str) -> Result<bool> {
        if !self.exists(session_id, true) {
            return Ok(false);
        }
        let mut session = self.load(session_id, true)?;
        session.archived_at = None;
        self.save(session_id, &mut session, false)?;
        let path = self.session_path(session_id, true);
        let _ = std::fs::remove_file(path);
        Ok(true)
    }

    // ── Messages ────────────────────────────────────────────────────

    pub fn save_message(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
        tool_calls: Option<Vec<Value>>,
    ) -> Result<()> {
        self.update(session_id, |session| {
            let mut message = ChatMessage::new(role, content);
            if tool_calls.as_ref().is_some_and(|calls| !calls.is_empty()) {
                message.tool_calls = tool_calls;
            }
            session.messages.push(message);
        })?;
        Ok(())
    }

    // ── Live response ───────────────────────────────────────────────

    pub fn set_live_response(
        &self,
        session_id: &str,
        run_id: &str,
        content: &str,
        tool_calls: Vec<Value>,
    ) -> Result<()> {
        self.update(session_id, |session| {
            session.live_response = Some(LiveResponse {
                run_id: run_id.to_string(),
                content: content.to_string(),
                tool_calls,
                updated_at: now_secs(),
            });
        })?;
        Ok(())
    }

    /// Clear the live snapshot. With a run id, only that run's snapshot is
    /// cleared so a newer run's projection survives a stale clear.
    pub fn clear_live_response(&self, session_id: &str, run_id: Option<&str>) -> Result<()> {
        self.update(session_id, |session| {
            let matches = match (&session.live_response, run_id) {
                (Some(live), Some(run_id)) => live.run_id.trim() == run_id.trim(),
                (Some(_), None) => true,
                (None, _) => false,
            };
            if matches {
                session.live_response = None;
            }
        })?;
        Ok(())
    }

    /// Append the live projection (as a `streaming: true` assistant entry)
    /// to a message list when it has any content or tool calls.
    pub fn with_live_response(messages: &[ChatMessage], session: &Session) -> Vec<ChatMessage> {
        let mut merged = messages.to_vec();
        let Some(live) = &session.live_response else {
            return merged;
        };
        let content = live.content.trim();
        if content.is_empty() && live.tool_calls.is_empty() {
            return merged;
        }
        let mut entry = ChatMessage::new("assistant", content);
        entry.streaming = Some(true);
        if !live.tool_calls.is_empty() {
            entry.tool_calls = Some(live.tool_calls.clone());
        }
        if !live.run_id.trim().is_empty() {
            entry.run_id = Some(live.run_id.clone());
        }
        merged.push(entry);
        merged
    }

    // ── Agent history ───────────────────────────────────────────────

    /// History as the agent sees it: consecutive assistant messages merged,
    /// with the compressed-context summary prepended when present.
    pub fn load_for_agent(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        let session = self.load(session_id, false)?;
        let mut merged: Vec<ChatMessage> = Vec::with_capacity(session.messages.len());
        for message in &session.messages {
            if message.role == "assistant"
                && merged.last().is_some_and(|last| last.role == "assistant")
            {
                let last = merged.last_mut().expect("checked non-empty");
                last.content = format!("{}\n{}", last.content, message.content)
                    .trim()
                    .to_string();
                continue;
            }
            merged.push(message.clone());
        }

        let compressed = session.compressed_context.trim();
        if !compressed.is_empty() {
            merged.insert(
                0,
                ChatMessage::new(
                    "assistant",
                    format!("[Summary of Earlier Conversation]\n{compressed}"),
                ),
            );
        }
        Ok(merged)
    }

    // ── Compression ─────────────────────────────────────────────────

    /// Archive the first `n` messages to a timestamped snapshot, fold the
    /// summary into `compressed_context`, keep the remainder.
    pub fn compress_history(
        &self,
        session_id: &str,
        summary: &str,
        n: usize,
    ) -> Result<(usize, usize)> {
        let mut archived_count = 0;
        let mut remaining_count = 0;
        let archive_dir = self.archive_dir.clone();
        self.update(session_id, |session| {
            archived_count = n.min(session.messages.len());
            let to_archive: Vec<ChatMessage> =
                session.messages.drain(..archived_count).collect();
            remaining_count = session.messages.len();

            if archived_count > 0 {
                let snapshot_path =
                    archive_dir.join(format!("{session_id}_{}.json", now_secs() as i64));
                match serde_json::to_string_pretty(&to_archive) {
                    Ok(text) => {
                        if let Err(e) = std::fs::write(&snapshot_path, text + "\n") {
                            tracing::warn!(error = %e, "failed to write compression snapshot");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to serialize archive snapshot"),
                }
            }

            let trimmed_summary = summary.trim();
            if !trimmed_summary.is_empty() {
                let prior = session.compressed_context.trim();
                session.compressed_context = if prior.is_empty() {
                    trimmed_summary.to_string()
                } else {
                    format!("{prior}\n---\n{trimmed_summary}")
                };
            }
        })?;
        Ok((archived_count, remaining_count))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
