//! `read_file` — read one workspace file with optional line slicing.

use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use warren_domain::tool::{ErrorCode, PermissionLevel, ToolResult};
use warren_domain::Result;

use crate::path_guard::resolve_workspace_path;
use crate::{Tool, ToolContext};

pub struct ReadFileTool {
    max_chars_default: usize,
}

impl ReadFileTool {
    pub fn new(max_chars_default: usize) -> Self {
        Self { max_chars_default }
    }
}

/// Slice `text` to the inclusive 1-based line range.
pub(crate) fn slice_lines(text: &str, start_line: Option<i64>, end_line: Option<i64>) -> String {
    if start_line.is_none() && end_line.is_none() {
        return text.to_string();
    }
    let lines: Vec<&str> = text.lines().collect();
    let start = start_line.map(|s| s.max(1) as usize).unwrap_or(1);
    let end = end_line
        .map(|e| (e.max(0) as usize).min(lines.len()))
        .unwrap_or(lines.len());
    if start > end {
        return String::new();
    }
    lines[start - 1..end].join("\n")
}

/// Truncate to `max_chars` characters with a marker; returns (text, truncated).
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> (String, bool) {
    if text.chars().count() <= max_chars {
        return (text.to_string(), false);
    }
    let cut: String = text.chars().take(max_chars).collect();
    (format!("{cut}\n...[truncated]"), true)
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &'static str {
        "read_file"
    }

    fn description(&self) -> &'static str {
        "Read workspace file content safely"
    }

    fn permission_level(&self) -> PermissionLevel {
        PermissionLevel::L0Read
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["path"],
            "properties": {
                "path": {"type": "string", "description": "Workspace-relative file path"},
                "start_line": {"type": "integer", "description": "Optional 1-based start line"},
                "end_line": {"type": "integer", "description": "Optional 1-based end line"},
                "max_chars": {"type": "integer", "description": "Optional max char limit"},
            }
        })
    }

    async fn run(&self, args: &Value, context: &ToolContext) -> Result<ToolResult> {
        let started = Instant::now();
        let elapsed = |s: &Instant| s.elapsed().as_millis() as u64;

        let path = args.get("path").and_then(Value::as_str).unwrap_or("");
        let start_line = args.get("start_line").and_then(Value::as_i64);
        let end_line = args.get("end_line").and_then(Value::as_i64);
        let max_chars = args
            .get("max_chars")
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or(self.max_chars_default)
            .max(1);

        let resolved = match resolve_workspace_path(&context.workspace_root, path) {
            Ok(resolved) => resolved,
            Err(e) => {
                return Ok(ToolResult::failure(
                    self.name(),
                    ErrorCode::InvalidPath,
                    e.to_string(),
                    elapsed(&started),
                ))
            }
        };
        if !resolved.is_file() {
            return Ok(ToolResult::failure(
                self.name(),
                ErrorCode::NotFound,
                format!("File not found: {path}"),
                elapsed(&started),
            ));
        }

        let bytes = std::fs::read(&resolved)?;
        let text = String::from_utf8_lossy(&bytes);
        let sliced = slice_lines(&text, start_line, end_line);
        let (content, truncated) = truncate_chars(&sliced, max_chars);

        let mut data = Map::new();
        data.insert("path".into(), json!(path));
        data.insert("content".into(), json!(content));
        data.insert("truncated".into(), json!(truncated));
        Ok(ToolResult::success(
            self.name(),
            data,
            elapsed(&started),
            truncated,
        ))
    }
}
