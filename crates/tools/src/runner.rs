//! ToolRunner — the uniform execution protocol around every tool call.
//!
//! Order of operations: write the redacted `tool_start` audit line, check
//! policy, check the identical-failure guard, invoke the tool, then write
//! `tool_end` to both the JSONL log and the structured audit store. A
//! success clears the guard counter; a failure increments it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};

use warren_domain::tool::{ErrorCode, ToolResult};
use warren_storage::{jsonl, now_ms, AuditStore};

use crate::guard::RetryGuard;
use crate::policy::ToolPolicyEngine;
use crate::{Tool, ToolContext};

pub struct ToolRunner {
    policy: ToolPolicyEngine,
    guard: RetryGuard,
    repeat_identical_failure_limit: u32,
    audit_file: PathBuf,
    audit_store: Option<Arc<AuditStore>>,
}

impl ToolRunner {
    pub fn new(
        workspace_root: &std::path::Path,
        repeat_identical_failure_limit: u32,
        audit_store: Option<Arc<AuditStore>>,
    ) -> Self {
        Self {
            policy: ToolPolicyEngine::new(),
            guard: RetryGuard::new(),
            repeat_identical_failure_limit: repeat_identical_failure_limit.max(1),
            audit_file: workspace_root.join("storage").join("tool_audit.jsonl"),
            audit_store,
        }
    }

    fn write_audit(&self, payload: Value) {
        if let Err(e) = jsonl::append_record(&self.audit_file, &payload) {
            tracing::warn!(error = %e, "failed to write tool audit line");
        }
    }

    fn write_tool_end(
        &self,
        tool_name: &str,
        context: &ToolContext,
        duration_ms: u64,
        ok: bool,
        policy_decision: &str,
        extra: Value,
    ) {
        let mut payload = json!({
            "event": "tool_end",
            "tool": tool_name,
            "run_id": context.run_id.clone().unwrap_or_default(),
            "session_id": context.session_id.clone().unwrap_or_default(),
            "trigger_type": context.trigger_type.as_str(),
            "duration_ms": duration_ms,
            "ok": ok,
            "policy_decision": policy_decision,
            "timestamp_ms": now_ms(),
        });
        if let (Some(map), Some(extra_map)) = (payload.as_object_mut(), extra.as_object()) {
            for (key, value) in extra_map {
                map.insert(key.clone(), value.clone());
            }
        }
        self.write_audit(payload);
    }

    fn record_structured(
        &self,
        tool_name: &str,
        context: &ToolContext,
        status: &str,
        duration_ms: u64,
        details: Value,
    ) {
        if let Some(store) = &self.audit_store {
            store.append_tool_call(
                context.run_id.as_deref().unwrap_or(""),
                context.session_id.as_deref().unwrap_or(""),
                context.trigger_type.as_str(),
                tool_name,
                status,
                duration_ms,
                details,
            );
        }
    }

    /// Execute one tool invocation under the full protocol.
    pub async fn run_tool(
        &self,
        tool: &dyn Tool,
        args: &Value,
        context: &ToolContext,
    ) -> ToolResult {
        let started = Instant::now();
        let tool_name = tool.name();

        self.write_audit(json!({
            "event": "tool_start",
            "tool": tool_name,
            "run_id": context.run_id.clone().unwrap_or_default(),
            "session_id": context.session_id.clone().unwrap_or_default(),
            "trigger_type": context.trigger_type.as_str(),
            "args": args,
            "timestamp_ms": now_ms(),
        }));

        // ── Policy ──────────────────────────────────────────────────
        let decision = self.policy.is_allowed(
            tool_name,
            tool.permission_level(),
            context.trigger_type,
            &context.explicit_enabled_tools,
        );
        if !decision.allowed {
            let duration_ms = started.elapsed().as_millis() as u64;
            self.write_tool_end(
                tool_name,
                context,
                duration_ms,
                false,
                "denied",
                json!({"reason": decision.reason.clone()}),
            );
            self.record_structured(
                tool_name,
                context,
                "denied",
                duration_ms,
                json!({"reason": decision.reason.clone()}),
            );
            return ToolResult::failure(
                tool_name,
                ErrorCode::PolicyDenied,
                decision.reason,
                duration_ms,
            );
        }

        // ── Identical-failure guard ─────────────────────────────────
        let prior_failures = self.guard.failure_count(context, tool_name, args);
        if prior_failures >= self.repeat_identical_failure_limit {
            let duration_ms = started.elapsed().as_millis() as u64;
            let message = format!(
                "retry blocked: {prior_failures} identical failures recorded for '{tool_name}'"
            );
            self.write_tool_end(
                tool_name,
                context,
                duration_ms,
                false,
                "denied",
                json!({"reason": "repeat_identical_failure"}),
            );
            self.record_structured(
                tool_name,
                context,
                "denied",
                duration_ms,
                json!({"reason": "repeat_identical_failure", "failures": prior_failures}),
            );
            return ToolResult::failure(tool_name, ErrorCode::PolicyDenied, message, duration_ms);
        }

        // ── Invoke ──────────────────────────────────────────────────
        let result = match tool.run(args, context).await {
            Ok(result) => result,
            Err(e) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                tracing::warn!(tool = tool_name, error = %e, "tool raised an internal error");
                ToolResult::failure(
                    tool_name,
                    ErrorCode::Internal,
                    "Unhandled tool error",
                    duration_ms,
                )
                .with_detail("error", json!(e.to_string()))
            }
        };

        if result.ok {
            self.guard.clear(context, tool_name, args);
        } else {
            self.guard.record_failure(context, tool_name, args);
        }

        self.write_tool_end(
            tool_name,
            context,
            result.meta.duration_ms,
            result.ok,
            "allowed",
            json!({"truncated": result.meta.truncated}),
        );
        self.record_structured(
            tool_name,
            context,
            if result.ok { "ok" } else { "error" },
            result.meta.duration_ms,
            json!({"truncated": result.meta.truncated}),
        );
        result
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
