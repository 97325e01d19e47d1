//! `read_files` — batch file reads with per-path outcomes.
//!
//! A bad path never fails the call: its row carries an error object and the
//! top-level `partial` flag flips. Capped at 32 paths per invocation.

use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use warren_domain::tool::{ErrorCode, PermissionLevel, ToolResult};
use warren_domain::Result;

use crate::path_guard::resolve_workspace_path;
use crate::read_file::{slice_lines, truncate_chars};
use crate::{Tool, ToolContext};

const MAX_PATHS: usize = 32;

pub struct ReadFilesTool {
    max_chars_default: usize,
}

impl ReadFilesTool {
    pub fn new(max_chars_default: usize) -> Self {
        Self { max_chars_default }
    }
}

#[async_trait]
impl Tool for ReadFilesTool {
    fn name(&self) -> &'static str {
        "read_files"
    }

    fn description(&self) -> &'static str {
        "Read multiple workspace files safely"
    }

    fn permission_level(&self) -> PermissionLevel {
        PermissionLevel::L0Read
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["paths"],
            "properties": {
                "paths": {"type": "array", "items": {"type": "string"}},
                "start_line": {"type": "integer"},
                "end_line": {"type": "integer"},
                "max_chars": {"type": "integer"},
            }
        })
    }

    async fn run(&self, args: &Value, context: &ToolContext) -> Result<ToolResult> {
        let started = Instant::now();
        let elapsed = |s: &Instant| s.elapsed().as_millis() as u64;

        let Some(paths) = args.get("paths").and_then(Value::as_array) else {
            return Ok(ToolResult::failure(
                self.name(),
                ErrorCode::InvalidArgs,
                "Missing required 'paths' list argument",
                elapsed(&started),
            ));
        };
        if paths.is_empty() {
            return Ok(ToolResult::failure(
                self.name(),
                ErrorCode::InvalidArgs,
                "Missing required 'paths' list argument",
                elapsed(&started),
            ));
        }
        if paths.len() > MAX_PATHS {
            return Ok(ToolResult::failure(
                self.name(),
                ErrorCode::InvalidArgs,
                format!("paths length exceeds max of {MAX_PATHS}"),
                elapsed(&started),
            ));
        }

        let start_line = args.get("start_line").and_then(Value::as_i64);
        let end_line = args.get("end_line").and_then(Value::as_i64);
        let max_chars = args
            .get("max_chars")
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or(self.max_chars_default)
            .max(1);

        let mut results = Vec::with_capacity(paths.len());
        for raw_path in paths {
            let path = raw_path.as_str().unwrap_or_default().to_string();
            let resolved = match resolve_workspace_path(&context.workspace_root, &path) {
                Ok(resolved) => resolved,
                Err(e) => {
                    results.push(json!({
                        "ok": false,
                        "path": path,
                        "error": {"code": "E_INVALID_PATH", "message": e.to_string()},
                    }));
                    continue;
                }
            };
            if !resolved.is_file() {
                let message = format!("File not found: {path}");
                results.push(json!({
                    "ok": false,
                    "path": path,
                    "error": {"code": "E_NOT_FOUND", "message": message},
                }));
                continue;
            }

            let bytes = std::fs::read(&resolved)?;
            let text = String::from_utf8_lossy(&bytes);
            let sliced = slice_lines(&text, start_line, end_line);
            let (content, truncated) = truncate_chars(&sliced, max_chars);
            results.push(json!({
                "ok": true,
                "path": path,
                "content": content,
                "truncated": truncated,
            }));
        }

        let partial = results
            .iter()
            .any(|row| !row.get("ok").and_then(Value::as_bool).unwrap_or(false));
        let mut data = Map::new();
        data.insert("results".into(), Value::Array(results));
        data.insert("partial".into(), json!(partial));
        Ok(ToolResult::success(self.name(), data, elapsed(&started), false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warren_domain::tool::TriggerType;

    fn workspace() -> (tempfile::TempDir, ToolContext) {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("memory")).unwrap();
        std::fs::write(dir.path().join("memory/MEMORY.md"), "remember this\n").unwrap();
        let ctx = ToolContext::new(dir.path(), TriggerType::Chat);
        (dir, ctx)
    }

    #[tokio::test]
    async fn mixed_good_and_bad_paths_are_partial() {
        let (_dir, ctx) = workspace();
        let tool = ReadFilesTool::new(10000);
        let result = tool
            .run(
                &json!({"paths": ["memory/MEMORY.md", "../../etc/passwd"]}),
                &ctx,
            )
            .await
            .unwrap();
        assert!(result.ok);
        assert_eq!(result.data["partial"], true);
        let rows = result.data["results"].as_array().unwrap();
        assert_eq!(rows[0]["ok"], true);
        assert_eq!(rows[1]["ok"], false);
        assert_eq!(rows[1]["error"]["code"], "E_INVALID_PATH");
    }

    #[tokio::test]
    async fn all_good_paths_are_not_partial() {
        let (_dir, ctx) = workspace();
        let tool = ReadFilesTool::new(10000);
        let result = tool
            .run(&json!({"paths": ["memory/MEMORY.md"]}), &ctx)
            .await
            .unwrap();
        assert_eq!(result.data["partial"], false);
    }

    #[tokio::test]
    async fn missing_paths_argument_is_invalid() {
        let (_dir, ctx) = workspace();
        let tool = ReadFilesTool::new(10000);
        let result = tool.run(&json!({}), &ctx).await.unwrap();
        assert_eq!(result.error_code(), Some(ErrorCode::InvalidArgs));
    }

    #[tokio::test]
    async fn too_many_paths_is_invalid() {
        let (_dir, ctx) = workspace();
        let tool = ReadFilesTool::new(10000);
        let paths: Vec<String> = (0..33).map(|i| format!("f{i}.md")).collect();
        let result = tool.run(&json!({"paths": paths}), &ctx).await.unwrap();
        assert_eq!(result.error_code(), Some(ErrorCode::InvalidArgs));
    }
}
