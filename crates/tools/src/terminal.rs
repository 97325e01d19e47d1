//! `terminal` — shell execution inside the workspace root.
//!
//! Commands run through `/bin/bash -c` with a scrubbed environment: any
//! variable whose upper-cased name contains a credential marker is dropped
//! unless it is in the hard-keep set. Denied substrings are rejected before
//! spawning; the wall-clock timeout kills the child.

use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::process::Command;

use warren_domain::tool::{ErrorCode, PermissionLevel, ToolResult};
use warren_domain::Result;

use crate::read_file::truncate_chars;
use crate::{Tool, ToolContext};

const DENY_FRAGMENTS: [&str; 5] = ["rm -rf /", "mkfs", "shutdown", "reboot", ":(){ :|:& };:"];

const ENV_DROP_MARKERS: [&str; 7] = [
    "KEY", "TOKEN", "SECRET", "PASSWORD", "AUTH", "CREDENTIAL", "COOKIE",
];

const ENV_HARD_KEEP: [&str; 9] = [
    "PATH", "HOME", "LANG", "LC_ALL", "TERM", "USER", "SHELL", "TMPDIR", "PWD",
];

fn env_allowed(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    if ENV_HARD_KEEP.contains(&upper.as_str()) {
        return true;
    }
    !ENV_DROP_MARKERS.iter().any(|marker| upper.contains(marker))
}

pub struct TerminalTool {
    timeout_seconds: u64,
    output_char_limit: usize,
}

impl TerminalTool {
    pub fn new(timeout_seconds: u64, output_char_limit: usize) -> Self {
        Self {
            timeout_seconds,
            output_char_limit,
        }
    }
}

#[async_trait]
impl Tool for TerminalTool {
    fn name(&self) -> &'static str {
        "terminal"
    }

    fn description(&self) -> &'static str {
        "Execute shell commands in workspace sandbox"
    }

    fn permission_level(&self) -> PermissionLevel {
        PermissionLevel::L3System
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["command"],
            "properties": {
                "command": {"type": "string", "description": "Shell command to execute in workspace sandbox"},
                "timeout": {"type": "integer", "minimum": 1, "maximum": 300, "description": "Optional timeout in seconds"},
            }
        })
    }

    async fn run(&self, args: &Value, context: &ToolContext) -> Result<ToolResult> {
        let started = Instant::now();
        let elapsed = |s: &Instant| s.elapsed().as_millis() as u64;

        let command = args
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        if command.is_empty() {
            return Ok(ToolResult::failure(
                self.name(),
                ErrorCode::InvalidArgs,
                "Missing required 'command' argument",
                elapsed(&started),
            ));
        }

        let lowered = command.to_lowercase();
        if DENY_FRAGMENTS.iter().any(|frag| lowered.contains(frag)) {
            return Ok(ToolResult::failure(
                self.name(),
                ErrorCode::PolicyDenied,
                "Command contains denied fragment",
                elapsed(&started),
            )
            .with_detail("command", json!(command)));
        }

        // Per-call timeout, capped at the configured maximum.
        let timeout_seconds = args
            .get("timeout")
            .and_then(Value::as_u64)
            .map(|t| t.clamp(1, self.timeout_seconds.max(1)))
            .unwrap_or(self.timeout_seconds.max(1));

        let mut cmd = Command::new("/bin/bash");
        cmd.arg("-c")
            .arg(&command)
            .current_dir(&context.workspace_root)
            .env_clear()
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);
        for (name, value) in std::env::vars() {
            if env_allowed(&name) {
                cmd.env(name, value);
            }
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return Ok(ToolResult::failure(
                    self.name(),
                    ErrorCode::Exec,
                    format!("Failed to spawn shell: {e}"),
                    elapsed(&started),
                ))
            }
        };

        let output = match tokio::time::timeout(
            std::time::Duration::from_secs(timeout_seconds),
            child.wait_with_output(),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Ok(ToolResult::failure(
                    self.name(),
                    ErrorCode::Exec,
                    format!("Command failed: {e}"),
                    elapsed(&started),
                ))
            }
            // Timeout: the dropped child is killed via kill_on_drop.
            Err(_) => {
                return Ok(ToolResult::failure(
                    self.name(),
                    ErrorCode::Timeout,
                    format!("Command timed out after {timeout_seconds}s"),
                    elapsed(&started),
                )
                .retryable())
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let combined = format!("{stdout}\n{stderr}").trim().to_string();
        let (combined, truncated) = truncate_chars(&combined, self.output_char_limit);
        let (stdout_capped, _) = truncate_chars(&stdout, self.output_char_limit);
        let (stderr_capped, _) = truncate_chars(&stderr, self.output_char_limit);

        let mut data = Map::new();
        data.insert("exit_code".into(), json!(output.status.code().unwrap_or(-1)));
        data.insert("stdout".into(), json!(stdout_capped));
        data.insert("stderr".into(), json!(stderr_capped));
        data.insert("combined".into(), json!(combined));
        data.insert("truncated".into(), json!(truncated));
        Ok(ToolResult::success(
            self.name(),
            data,
            elapsed(&started),
            truncated,
        ))
    }
}
