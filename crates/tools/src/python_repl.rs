//! `python_repl` — run a Python snippet in an isolated child process.
//!
//! The snippet executes under `python3 -I` (isolated mode: no site
//! packages, no user paths, no inherited PYTHON* env) inside a harness
//! that exposes only an allow-list of builtins, so neither imports nor
//! file/process primitives are reachable. The wall-clock timeout kills
//! the child and returns `E_TIMEOUT`.

use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::process::Command;

use warren_domain::tool::{ErrorCode, PermissionLevel, ToolResult};
use warren_domain::Result;

use crate::read_file::truncate_chars;
use crate::{Tool, ToolContext};

/// Executes `sys.argv[1]` with only the allow-listed builtins in scope.
const HARNESS: &str = "\
import builtins, sys
names = ['abs', 'all', 'any', 'bool', 'dict', 'enumerate', 'filter', 'float',
         'int', 'len', 'list', 'map', 'max', 'min', 'print', 'range',
         'reversed', 'round', 'set', 'sorted', 'str', 'sum', 'tuple', 'zip']
safe = {name: getattr(builtins, name) for name in names}
exec(sys.argv[1], {'__builtins__': safe}, {})
";

pub struct PythonReplTool {
    timeout_seconds: u64,
    output_char_limit: usize,
}

impl PythonReplTool {
    pub fn new(timeout_seconds: u64, output_char_limit: usize) -> Self {
        Self {
            timeout_seconds,
            output_char_limit,
        }
    }
}

#[async_trait]
impl Tool for PythonReplTool {
    fn name(&self) -> &'static str {
        "python_repl"
    }

    fn description(&self) -> &'static str {
        "Execute Python snippets in an isolated child process"
    }

    fn permission_level(&self) -> PermissionLevel {
        PermissionLevel::L1Write
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["code"],
            "properties": {
                "code": {"type": "string", "description": "Python code snippet to execute"},
            }
        })
    }

    async fn run(&self, args: &Value, context: &ToolContext) -> Result<ToolResult> {
        let started = Instant::now();
        let elapsed = |s: &Instant| s.elapsed().as_millis() as u64;

        let code = args
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        if code.is_empty() {
            return Ok(ToolResult::failure(
                self.name(),
                ErrorCode::InvalidArgs,
                "Missing required 'code' argument",
                elapsed(&started),
            ));
        }

        let child = Command::new("python3")
            .arg("-I")
            .arg("-c")
            .arg(HARNESS)
            .arg(&code)
            .current_dir(&context.workspace_root)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => {
                return Ok(ToolResult::failure(
                    self.name(),
                    ErrorCode::Exec,
                    format!("Failed to start python3: {e}"),
                    elapsed(&started),
                ))
            }
        };

        let output = match tokio::time::timeout(
            std::time::Duration::from_secs(self.timeout_seconds.max(1)),
            child.wait_with_output(),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Ok(ToolResult::failure(
                    self.name(),
                    ErrorCode::Exec,
                    format!("Python execution failed: {e}"),
                    elapsed(&started),
                ))
            }
            Err(_) => {
                return Ok(ToolResult::failure(
                    self.name(),
                    ErrorCode::Timeout,
                    format!("Python execution timed out after {}s", self.timeout_seconds),
                    elapsed(&started),
                )
                .retryable())
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Ok(ToolResult::failure(
                self.name(),
                ErrorCode::Exec,
                "Python execution failed",
                elapsed(&started),
            )
            .with_detail("stderr", json!(stderr)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let (content, truncated) = truncate_chars(&stdout, self.output_char_limit);
        let mut data = Map::new();
        data.insert("output".into(), json!(content));
        data.insert("truncated".into(), json!(truncated));
        Ok(ToolResult::success(
            self.name(),
            data,
            elapsed(&started),
            truncated,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warren_domain::tool::TriggerType;

    fn context() -> (tempfile::TempDir, ToolContext) {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = ToolContext::new(dir.path(), TriggerType::Chat);
        (dir, ctx)
    }

    #[tokio::test]
    async fn executes_a_snippet() {
        let (_dir, ctx) = context();
        let tool = PythonReplTool::new(10, 5000);
        let result = tool
            .run(&json!({"code": "print(sum(range(5)))"}), &ctx)
            .await
            .unwrap();
        assert!(result.ok);
        assert_eq!(result.data["output"], "10");
    }

    #[tokio::test]
    async fn raising_code_is_an_exec_failure() {
        let (_dir, ctx) = context();
        let tool = PythonReplTool::new(10, 5000);
        let result = tool
            .run(&json!({"code": "raise ValueError('nope')"}), &ctx)
            .await
            .unwrap();
        assert_eq!(result.error_code(), Some(ErrorCode::Exec));
    }

    #[tokio::test]
    async fn infinite_loop_hits_the_timeout() {
        let (_dir, ctx) = context();
        let tool = PythonReplTool::new(1, 5000);
        let result = tool
            .run(&json!({"code": "while True: pass"}), &ctx)
            .await
            .unwrap();
        assert_eq!(result.error_code(), Some(ErrorCode::Timeout));
    }

    #[tokio::test]
    async fn imports_are_blocked_by_the_builtins_allow_list() {
        let (_dir, ctx) = context();
        let tool = PythonReplTool::new(10, 5000);
        let result = tool
            .run(&json!({"code": "import os\nprint(os.getcwd())"}), &ctx)
            .await
            .unwrap();
        assert_eq!(result.error_code(), Some(ErrorCode::Exec));
    }

    #[tokio::test]
    async fn empty_code_is_invalid_args() {
        let (_dir, ctx) = context();
        let tool = PythonReplTool::new(10, 5000);
        let result = tool.run(&json!({"code": "  "}), &ctx).await.unwrap();
        assert_eq!(result.error_code(), Some(ErrorCode::InvalidArgs));
    }
}
