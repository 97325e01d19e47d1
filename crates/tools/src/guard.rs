//! Identical-failure retry guard.
//!
//! Counts consecutive failures per `(scope, tool, stable_json(args))` key.
//! Once the count reaches the configured limit the runner refuses further
//! identical executions with `E_POLICY_DENIED`. The scope is the run id (or
//! `session:trigger` for runless calls); the guard lives on the runner, so
//! counters are discarded when the run's runner is dropped.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;

use warren_domain::config::canonical_json;

use crate::ToolContext;

#[derive(Default)]
pub struct RetryGuard {
    failures: Mutex<HashMap<String, u32>>,
}

/// The scope a counter belongs to: run id when present, else session+trigger.
pub fn scope_key(context: &ToolContext) -> String {
    if let Some(run_id) = context.run_id.as_deref() {
        if !run_id.is_empty() {
            return run_id.to_string();
        }
    }
    let session = context.session_id.as_deref().unwrap_or("");
    format!("{session}:{}", context.trigger_type)
}

impl RetryGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(context: &ToolContext, tool_name: &str, args: &Value) -> String {
        format!(
            "{}|{}|{}",
            scope_key(context),
            tool_name,
            canonical_json(args)
        )
    }

    /// Recorded failure count for this exact invocation.
    pub fn failure_count(&self, context: &ToolContext, tool_name: &str, args: &Value) -> u32 {
        let key = Self::key(context, tool_name, args);
        *self.failures.lock().get(&key).unwrap_or(&0)
    }

    pub fn record_failure(&self, context: &ToolContext, tool_name: &str, args: &Value) {
        let key = Self::key(context, tool_name, args);
        *self.failures.lock().entry(key).or_insert(0) += 1;
    }

    pub fn clear(&self, context: &ToolContext, tool_name: &str, args: &Value) {
        let key = Self::key(context, tool_name, args);
        self.failures.lock().remove(&key);
    }
}
