//! `POST /api/chat` — run a chat turn, streamed (SSE) or buffered.
//!
//! Streaming requests register the run in the process-wide run map and read
//! from a bounded subscriber queue, so a client disconnect never cancels
//! generation. A concurrent request with a *different* message on the same
//! `(agent_id, session_id)` is rejected with `session_busy`; an identical
//! message re-attaches to the run already in flight.

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use warren_domain::stream::AgentEvent;
use warren_domain::tool::TriggerType;

use crate::runtime::TurnInput;
use crate::state::AppState;

use super::errors::{data, ApiError, ApiResult};

fn default_agent_id() -> String {
    "default".to_string()
}

fn default_stream() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    pub session_id: String,
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
    #[serde(default = "default_stream")]
    pub stream: bool,
}

pub async fn chat(
    State(state): State<AppState>,
    Json(body): Json<ChatRequest>,
) -> ApiResult<Response> {
    if body.message.trim().is_empty() {
        return Err(ApiError::validation("message must not be empty"));
    }
    if body.session_id.trim().is_empty() {
        return Err(ApiError::validation("session_id must not be empty"));
    }

    let runtime = state.registry.get_runtime(&body.agent_id)?;
    let agent_id = runtime.agent_id.clone();
    let session = runtime.sessions.load(&body.session_id, false)?;
    let is_first_turn = session.messages.is_empty();

    // Attach to an identical in-flight run; reject a different message.
    let active = match state.runs.get(&agent_id, &body.session_id).await {
        Some(active) if active.message == body.message => active,
        Some(_) => return Err(ApiError::session_busy()),
        None => {
            let events = state.engine.stream_turn(TurnInput {
                agent_id: agent_id.clone(),
                session_id: body.session_id.clone(),
                message: body.message.clone(),
                trigger: TriggerType::Chat,
                is_first_turn,
            });
            state
                .runs
                .clone()
                .begin(&agent_id, &body.session_id, &body.message, events)
                .await
        }
    };
    let queue = active.subscribe();

    if !body.stream {
        // Buffered mode: drain to completion and return the final shape.
        let mut content = String::new();
        let mut usage = Value::Object(Default::default());
        let mut error: Option<String> = None;
        while let Some(event) = queue.next().await {
            match event {
                AgentEvent::Done {
                    content: final_content,
                    usage: final_usage,
                    ..
                } => {
                    content = final_content;
                    if !final_usage.is_null() {
                        usage = final_usage;
                    }
                }
                AgentEvent::Error { error: message, .. } => error = Some(message),
                _ => {}
            }
        }
        if let Some(message) = error {
            return Err(ApiError::internal(message));
        }
        return Ok(data(json!({
            "content": content,
            "session_id": body.session_id,
            "agent_id": agent_id,
            "usage": usage,
        }))
        .into_response());
    }

    // SSE mode. The guard removes this subscriber when the client hangs
    // up; the producer keeps streaming for other subscribers.
    struct Unsubscribe {
        run: std::sync::Arc<crate::runtime::ActiveRun>,
        queue: std::sync::Arc<crate::runtime::SubscriberQueue>,
    }
    impl Drop for Unsubscribe {
        fn drop(&mut self) {
            self.run.unsubscribe(&self.queue);
        }
    }
    let guard = Unsubscribe {
        run: active.clone(),
        queue: queue.clone(),
    };

    // The queue closes with a sentinel once the producer finishes, so the
    // loop simply drains until then.
    let stream = async_stream::stream! {
        let guard = guard;
        while let Some(event) = guard.queue.next().await {
            let kind = event.kind();
            let payload = serde_json::to_value(&event)
                .ok()
                .and_then(|value| value.get("data").cloned())
                .unwrap_or(Value::Null);
            yield Ok::<_, std::convert::Infallible>(
                Event::default().event(kind).data(payload.to_string()),
            );
        }
    };

    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}
