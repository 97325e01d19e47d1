//! `apply_patch` — apply a unified diff inside the workspace.
//!
//! Target paths are extracted from the `---`/`+++` headers and each must
//! pass the path guard before anything touches disk. The system `patch`
//! binary runs once with `--dry-run`, then for real.

use std::path::Path;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use warren_domain::tool::{ErrorCode, PermissionLevel, ToolResult};
use warren_domain::Result;

use crate::path_guard::resolve_workspace_path;
use crate::{Tool, ToolContext};

const MAX_PATCH_CHARS: usize = 200_000;
const TIMEOUT_SECONDS: u64 = 20;

fn normalize_patch_path(raw: &str) -> Option<String> {
    let mut candidate = raw.trim();
    if let Some((path, _)) = candidate.split_once('\t') {
        candidate = path.trim();
    }
    if matches!(candidate, "/dev/null" | "dev/null" | "") {
        return None;
    }
    let stripped = candidate
        .strip_prefix("a/")
        .or_else(|| candidate.strip_prefix("b/"))
        .unwrap_or(candidate);
    if matches!(stripped, "/dev/null" | "dev/null" | "") {
        return None;
    }
    Some(stripped.to_string())
}

/// Target files, hunk count, and the `-p` strip level of a unified diff.
fn patch_summary(patch_text: &str) -> (Vec<String>, usize, u32) {
    let mut files: Vec<String> = Vec::new();
    let mut hunks = 0;
    let mut strip_level = 0;
    for line in patch_text.lines() {
        if line.starts_with("@@") {
            hunks += 1;
        }
        if line.starts_with("--- a/") || line.starts_with("+++ b/") {
            strip_level = 1;
        }
        if let Some(rest) = line.strip_prefix("--- ").or_else(|| line.strip_prefix("+++ ")) {
            if let Some(path) = normalize_patch_path(rest) {
                if !files.contains(&path) {
                    files.push(path);
                }
            }
        }
    }
    files.sort();
    (files, hunks, strip_level)
}

pub struct ApplyPatchTool {
    root_dir: std::path::PathBuf,
}

impl ApplyPatchTool {
    pub fn new(root_dir: &Path) -> Self {
        Self {
            root_dir: root_dir.to_path_buf(),
        }
    }

    async fn run_patch(
        &self,
        patch_text: &str,
        dry_run: bool,
        strip_level: u32,
    ) -> std::io::Result<(i32, String)> {
        let mut cmd = Command::new("patch");
        cmd.arg(format!("-p{strip_level}"))
            .arg("--directory")
            .arg(&self.root_dir)
            .arg("--batch")
            .arg("--forward")
            .arg("--silent")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if dry_run {
            cmd.arg("--dry-run");
        }

        let mut child = cmd.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(patch_text.as_bytes()).await?;
            stdin.shutdown().await?;
        }
        let output = tokio::time::timeout(
            std::time::Duration::from_secs(TIMEOUT_SECONDS),
            child.wait_with_output(),
        )
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "patch timed out"))??;

        let combined = [
            String::from_utf8_lossy(&output.stdout).trim().to_string(),
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
        Ok((output.status.code().unwrap_or(-1), combined))
    }
}

#[async_trait]
impl Tool for ApplyPatchTool {
    fn name(&self) -> &'static str {
        "apply_patch"
    }

    fn description(&self) -> &'static str {
        "Apply a unified diff patch inside workspace root"
    }

    fn permission_level(&self) -> PermissionLevel {
        PermissionLevel::L1Write
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["input"],
            "properties": {
                "input": {"type": "string", "description": "Unified diff patch content"},
            }
        })
    }

    async fn run(&self, args: &Value, _context: &ToolContext) -> Result<ToolResult> {
        let started = Instant::now();
        let elapsed = |s: &Instant| s.elapsed().as_millis() as u64;

        let patch_text = args
            .get("input")
            .or_else(|| args.get("patch"))
            .and_then(Value::as_str)
            .unwrap_or("");
        if patch_text.trim().is_empty() {
            return Ok(ToolResult::failure(
                self.name(),
                ErrorCode::InvalidArgs,
                "Missing required 'input' argument",
                elapsed(&started),
            ));
        }
        if patch_text.len() > MAX_PATCH_CHARS {
            return Ok(ToolResult::failure(
                self.name(),
                ErrorCode::InvalidArgs,
                format!("Patch input exceeds max size of {MAX_PATCH_CHARS} chars"),
                elapsed(&started),
            ));
        }

        let (files, hunks, strip_level) = patch_summary(patch_text);
        if files.is_empty() {
            return Ok(ToolResult::failure(
                self.name(),
                ErrorCode::InvalidArgs,
                "Patch does not target any files",
                elapsed(&started),
            ));
        }
        for path in &files {
            if let Err(e) = resolve_workspace_path(&self.root_dir, path) {
                return Ok(ToolResult::failure(
                    self.name(),
                    ErrorCode::InvalidPath,
                    e.to_string(),
                    elapsed(&started),
                )
                .with_detail("path", json!(path)));
            }
        }

        let check = self.run_patch(patch_text, true, strip_level).await;
        match check {
            Ok((0, _)) => {}
            Ok((_, output)) => {
                return Ok(ToolResult::failure(
                    self.name(),
                    ErrorCode::Exec,
                    "Patch check failed",
                    elapsed(&started),
                )
                .with_detail("output", json!(output)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                return Ok(ToolResult::failure(
                    self.name(),
                    ErrorCode::Timeout,
                    format!("Patch command timed out after {TIMEOUT_SECONDS}s"),
                    elapsed(&started),
                )
                .retryable())
            }
            Err(e) => {
                return Ok(ToolResult::failure(
                    self.name(),
                    ErrorCode::Exec,
                    format!("Failed to execute patch command: {e}"),
                    elapsed(&started),
                ))
            }
        }

        match self.run_patch(patch_text, false, strip_level).await {
            Ok((0, _)) => {}
            Ok((_, output)) => {
                return Ok(ToolResult::failure(
                    self.name(),
                    ErrorCode::Exec,
                    "Patch apply failed",
                    elapsed(&started),
                )
                .with_detail("output", json!(output)))
            }
            Err(e) => {
                return Ok(ToolResult::failure(
                    self.name(),
                    ErrorCode::Io,
                    format!("Failed to execute patch command: {e}"),
                    elapsed(&started),
                ))
            }
        }

        let mut data = Map::new();
        data.insert("applied".into(), json!(true));
        data.insert("changed_files".into(), json!(files));
        data.insert("hunks_applied".into(), json!(hunks));
        Ok(ToolResult::success(self.name(), data, elapsed(&started), false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warren_domain::tool::TriggerType;

    const SAMPLE_PATCH: &str = "--- a/notes.txt\n+++ b/notes.txt\n@@ -1 +1 @@\n-old line\n+new line\n";

    #[test]
    fn summary_extracts_files_hunks_and_strip_level() {
        let (files, hunks, strip) = patch_summary(SAMPLE_PATCH);
        assert_eq!(files, vec!["notes.txt"]);
        assert_eq!(hunks, 1);
        assert_eq!(strip, 1);
    }

    #[test]
    fn dev_null_headers_are_ignored() {
        let patch = "--- /dev/null\n+++ b/created.txt\n@@ -0,0 +1 @@\n+hello\n";
        let (files, _, _) = patch_summary(patch);
        assert_eq!(files, vec!["created.txt"]);
    }

    #[tokio::test]
    async fn traversal_target_is_invalid_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let tool = ApplyPatchTool::new(dir.path());
        let ctx = ToolContext::new(dir.path(), TriggerType::Chat);
        let patch = "--- a/../outside.txt\n+++ b/../outside.txt\n@@ -1 +1 @@\n-a\n+b\n";
        let result = tool.run(&json!({"input": patch}), &ctx).await.unwrap();
        assert_eq!(result.error_code(), Some(ErrorCode::InvalidPath));
    }

    #[tokio::test]
    async fn applies_a_clean_patch() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "old line\n").unwrap();
        let tool = ApplyPatchTool::new(dir.path());
        let ctx = ToolContext::new(dir.path(), TriggerType::Chat);
        let result = tool.run(&json!({"input": SAMPLE_PATCH}), &ctx).await.unwrap();
        assert!(result.ok, "patch failed: {:?}", result.error);
        assert_eq!(result.data["hunks_applied"], 1);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("notes.txt")).unwrap(),
            "new line\n"
        );
    }

    #[tokio::test]
    async fn mismatched_patch_fails_the_dry_run() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "different content\n").unwrap();
        let tool = ApplyPatchTool::new(dir.path());
        let ctx = ToolContext::new(dir.path(), TriggerType::Chat);
        let result = tool.run(&json!({"input": SAMPLE_PATCH}), &ctx).await.unwrap();
        assert_eq!(result.error_code(), Some(ErrorCode::Exec));
        // Dry-run failure must leave the file untouched.
        assert_eq!(
            std::fs::read_to_string(dir.path().join("notes.txt")).unwrap(),
            "different content\n"
        );
    }

    #[tokio::test]
    async fn empty_patch_is_invalid_args() {
        let dir = tempfile::TempDir::new().unwrap();
        let tool = ApplyPatchTool::new(dir.path());
        let ctx = ToolContext::new(dir.path(), TriggerType::Chat);
        let result = tool.run(&json!({"input": "   "}), &ctx).await.unwrap();
        assert_eq!(result.error_code(), Some(ErrorCode::InvalidArgs));
    }
}
