//! Typed events for the run orchestrator and the LLM client seam.
//!
//! [`AgentEvent`] is what a turn emits toward subscribers (SSE clients,
//! schedulers draining a run). [`ProviderEvent`] is the alphabet the LLM
//! client produces while streaming one model call: token deltas (the
//! "messages" mode) interleaved with node-level content snapshots (the
//! "updates" mode), plus assembled tool calls and raw usage payloads.

use std::pin::Pin;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// One scored retrieval result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetrievalHit {
    pub text: String,
    pub score: f64,
    pub source: String,
}

/// A tool invocation requested by the model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub name: String,
    pub arguments: Value,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AgentEvent — what a run emits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Events emitted during one chat/heartbeat/cron turn, in stream order.
///
/// `done` is the last normal event and carries the canonical full content;
/// `error` is terminal. A `new_response` marks a segment boundary after a
/// completed tool call.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum AgentEvent {
    Retrieval {
        query: String,
        results: Vec<RetrievalHit>,
    },
    RunStart {
        run_id: String,
        attempt: u32,
    },
    AgentUpdate {
        run_id: String,
        node: String,
        message_count: usize,
        preview: String,
    },
    ToolStart {
        run_id: String,
        tool: String,
        input: Value,
    },
    ToolEnd {
        run_id: String,
        tool: String,
        output: String,
        ok: bool,
    },
    NewResponse {},
    Reasoning {
        run_id: String,
        content: String,
    },
    Token {
        content: String,
        source: String,
    },
    Usage {
        #[serde(flatten)]
        payload: Map<String, Value>,
    },
    Done {
        content: String,
        session_id: String,
        agent_id: String,
        run_id: String,
        token_source: String,
        usage: Value,
    },
    Error {
        error: String,
        run_id: String,
        attempt: u32,
    },
    Title {
        session_id: String,
        agent_id: String,
        title: String,
    },
}

impl AgentEvent {
    /// Wire name used for the SSE `event:` field.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentEvent::Retrieval { .. } => "retrieval",
            AgentEvent::RunStart { .. } => "run_start",
            AgentEvent::AgentUpdate { .. } => "agent_update",
            AgentEvent::ToolStart { .. } => "tool_start",
            AgentEvent::ToolEnd { .. } => "tool_end",
            AgentEvent::NewResponse {} => "new_response",
            AgentEvent::Reasoning { .. } => "reasoning",
            AgentEvent::Token { .. } => "token",
            AgentEvent::Usage { .. } => "usage",
            AgentEvent::Done { .. } => "done",
            AgentEvent::Error { .. } => "error",
            AgentEvent::Title { .. } => "title",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentEvent::Done { .. } | AgentEvent::Error { .. })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ProviderEvent — what one model call streams
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone, Debug)]
pub enum ProviderEvent {
    /// Incremental text from the "messages" stream.
    Token { text: String },
    /// Node-level full-content snapshot from the "updates" stream.
    ContentSnapshot { content: String },
    /// Reasoning/thinking text.
    Reasoning { text: String },
    /// A fully assembled tool invocation.
    ToolCall(ToolCallRequest),
    /// A raw usage payload as the provider reported it.
    Usage { payload: Value },
    /// The model call finished.
    Done,
}

/// Which of the two interleaved provider streams feeds `token` events.
///
/// Seeded on the first observed delta and pinned for the rest of the run;
/// the other stream's content is ignored to prevent duplication.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenSource {
    Messages,
    Updates,
}

impl TokenSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenSource::Messages => "messages",
            TokenSource::Updates => "updates",
        }
    }
}

/// Incremental diff between two cumulative content snapshots.
///
/// Snapshot streams re-send the full content each time; the delta is the
/// new suffix when the previous value is a prefix, the whole string on a
/// rewrite, and empty when nothing changed.
pub fn diff_incremental(previous: &str, current: &str) -> String {
    if current.is_empty() || current == previous {
        return String::new();
    }
    if previous.is_empty() {
        return current.to_string();
    }
    match current.strip_prefix(previous) {
        Some(suffix) => suffix.to_string(),
        None => current.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_matches_serialized_type_tag() {
        let event = AgentEvent::Token {
            content: "hi".into(),
            source: "messages".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], event.kind());
        assert_eq!(value["data"]["content"], "hi");
    }

    #[test]
    fn done_and_error_are_terminal() {
        let done = AgentEvent::Done {
            content: String::new(),
            session_id: String::new(),
            agent_id: String::new(),
            run_id: String::new(),
            token_source: "fallback".into(),
            usage: Value::Null,
        };
        assert!(done.is_terminal());
        assert!(!AgentEvent::NewResponse {}.is_terminal());
    }

    #[test]
    fn diff_incremental_handles_prefix_growth() {
        assert_eq!(diff_incremental("", "hello"), "hello");
        assert_eq!(diff_incremental("hello", "hello world"), " world");
        assert_eq!(diff_incremental("hello", "hello"), "");
        assert_eq!(diff_incremental("abc", "xyz"), "xyz");
        assert_eq!(diff_incremental("abc", ""), "");
    }
}
