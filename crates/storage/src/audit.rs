//! Structured append-only audit store with stable record categories.
//!
//! Four JSONL files under `<root>/storage/audit/`, one schema per file:
//! `audit.run.v1`, `audit.step.v1`, `audit.tool_call.v1`,
//! `audit.message_link.v1`. Every line carries `schema`, `timestamp_ms`,
//! run/session identity, and the trigger type.

use std::path::{Path, PathBuf};

use serde_json::{json, Value};

use warren_domain::Result;

use crate::jsonl;
use crate::now_ms;

pub struct AuditStore {
    audit_dir: PathBuf,
    runs_file: PathBuf,
    steps_file: PathBuf,
    tool_calls_file: PathBuf,
    message_links_file: PathBuf,
}

impl AuditStore {
    pub fn new(root_dir: &Path) -> Self {
        let audit_dir = root_dir.join("storage").join("audit");
        Self {
            runs_file: audit_dir.join("runs.jsonl"),
            steps_file: audit_dir.join("steps.jsonl"),
            tool_calls_file: audit_dir.join("tool_calls.jsonl"),
            message_links_file: audit_dir.join("message_links.jsonl"),
            audit_dir,
        }
    }

    fn append(&self, file: &Path, mut payload: Value) -> Result<()> {
        if let Some(map) = payload.as_object_mut() {
            map.entry("timestamp_ms").or_insert(json!(now_ms()));
        }
        jsonl::append_record(file, &payload)
    }

    pub fn append_run(
        &self,
        run_id: &str,
        session_id: &str,
        trigger_type: &str,
        status: &str,
        details: Value,
    ) {
        let payload = json!({
            "schema": "audit.run.v1",
            "run_id": run_id,
            "session_id": session_id,
            "trigger_type": trigger_type,
            "status": status,
            "details": details,
        });
        if let Err(e) = self.append(&self.runs_file, payload) {
            tracing::warn!(error = %e, "failed to append run audit row");
        }
    }

    pub fn append_step(
        &self,
        run_id: &str,
        session_id: &str,
        trigger_type: &str,
        event: &str,
        details: Value,
    ) {
        let payload = json!({
            "schema": "audit.step.v1",
            "run_id": run_id,
            "session_id": session_id,
            "trigger_type": trigger_type,
            "event": event,
            "details": details,
        });
        if let Err(e) = self.append(&self.steps_file, payload) {
            tracing::warn!(error = %e, "failed to append step audit row");
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn append_tool_call(
        &self,
        run_id: &str,
        session_id: &str,
        trigger_type: &str,
        tool_name: &str,
        status: &str,
        duration_ms: u64,
        details: Value,
    ) {
        let payload = json!({
            "schema": "audit.tool_call.v1",
            "run_id": run_id,
            "session_id": session_id,
            "trigger_type": trigger_type,
            "tool_name": tool_name,
            "status": status,
            "duration_ms": duration_ms,
            "details": details,
        });
        if let Err(e) = self.append(&self.tool_calls_file, payload) {
            tracing::warn!(error = %e, "failed to append tool_call audit row");
        }
    }

    pub fn append_message_link(
        &self,
        run_id: &str,
        session_id: &str,
        role: &str,
        segment_index: usize,
        content: &str,
        details: Value,
    ) {
        let preview: String = content.chars().take(300).collect();
        let payload = json!({
            "schema": "audit.message_link.v1",
            "run_id": run_id,
            "session_id": session_id,
            "trigger_type": "chat",
            "role": role,
            "segment_index": segment_index,
            "content_preview": preview,
            "details": details,
        });
        if let Err(e) = self.append(&self.message_links_file, payload) {
            tracing::warn!(error = %e, "failed to append message_link audit row");
        }
    }

    /// Write the schema descriptor once, so readers can discover the files.
    pub fn ensure_schema_descriptor(&self) -> Result<()> {
        let path = self.audit_dir.join("SCHEMA.json");
        if path.exists() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.audit_dir)?;
        let descriptor = json!({
            "version": 1,
            "files": {
                "runs": "runs.jsonl",
                "steps": "steps.jsonl",
                "tool_calls": "tool_calls.jsonl",
                "message_links": "message_links.jsonl",
            },
            "schemas": {
                "runs": "audit.run.v1",
                "steps": "audit.step.v1",
                "tool_calls": "audit.tool_call.v1",
                "message_links": "audit.message_link.v1",
            },
        });
        std::fs::write(&path, serde_json::to_string_pretty(&descriptor)? + "\n")?;
        Ok(())
    }

    pub fn tool_calls_tail(&self, limit: usize) -> Vec<Value> {
        jsonl::read_tail(&self.tool_calls_file, limit)
    }

    pub fn runs_tail(&self, limit: usize) -> Vec<Value> {
        jsonl::read_tail(&self.runs_file, limit)
    }
}
