//! The run orchestrator: one chat/heartbeat/cron turn end to end.
//!
//! A turn streams model output while interleaving tool execution. Two
//! provider modes arrive concurrently — token deltas ("messages") and
//! full-content snapshots ("updates") — and the first observed delta pins
//! the token source for the rest of the run; the other mode's content is
//! dropped to prevent duplication. Assistant *segments* (text between tool
//! calls) accumulate and are persisted on completion, token usage is folded
//! in per source id as monotonic deltas, and a live-response snapshot is
//! written to the session on a ≥350 ms cadence (immediately around tool
//! transitions) so readers see partial output without SSE.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use warren_domain::stream::{
    diff_incremental, AgentEvent, ProviderEvent, TokenSource, ToolCallRequest,
};
use warren_domain::tool::{ErrorCode, ToolResult, TriggerType};
use warren_domain::usage::{extract_usage_payload, UsageSources, UsageState};
use warren_domain::{Error, Result};
use warren_retrieval::Domain;
use warren_scheduler::{TurnOutcome, TurnRequest, TurnRunner};
use warren_sessions::ChatMessage;
use warren_tools::{build_all_tools, enabled_tools, explicit_enabled_tools, ToolContext, ToolRunner};

use crate::llm::{LlmChatRequest, LlmClient, LlmMessage, ToolDefinition};
use crate::pricing::estimate_cost;
use crate::prompt::PromptBuilder;
use crate::registry::{AgentRegistry, AgentRuntime};

const EVENT_CHANNEL_CAPACITY: usize = 512;
const LIVE_SNAPSHOT_CADENCE: Duration = Duration::from_millis(350);
const REASONING_PREVIEW_CHARS: usize = 1000;

/// Input to one turn.
#[derive(Clone, Debug)]
pub struct TurnInput {
    pub agent_id: String,
    pub session_id: String,
    pub message: String,
    pub trigger: TriggerType,
    pub is_first_turn: bool,
}

/// One assistant segment: text bounded by tool invocations.
#[derive(Clone, Debug, Default)]
struct Segment {
    content: String,
    tool_calls: Vec<Value>,
}

#[derive(Clone)]
pub struct TurnEngine {
    registry: Arc<AgentRegistry>,
    prompts: Arc<PromptBuilder>,
    /// Test seam: overrides the registry-provided client when set.
    llm_override: Option<Arc<dyn LlmClient>>,
}

impl TurnEngine {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self {
            registry,
            prompts: Arc::new(PromptBuilder::new()),
            llm_override: None,
        }
    }

    #[cfg(test)]
    pub fn with_llm(registry: Arc<AgentRegistry>, llm: Arc<dyn LlmClient>) -> Self {
        Self {
            registry,
            prompts: Arc::new(PromptBuilder::new()),
            llm_override: Some(llm),
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    fn llm_for(&self, config: &warren_domain::config::RuntimeConfig) -> Arc<dyn LlmClient> {
        match &self.llm_override {
            Some(client) => client.clone(),
            None => self.registry.llm_client(config),
        }
    }

    /// Start a turn; events arrive on the returned channel, ending with
    /// `done` or `error`. The producer task is independent of the caller.
    pub fn stream_turn(&self, input: TurnInput) -> mpsc::Receiver<AgentEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.run_inner(&input, &tx).await {
                tracing::warn!(error = %e, session_id = %input.session_id, "turn failed");
                let _ = tx
                    .send(AgentEvent::Error {
                        error: e.to_string(),
                        run_id: String::new(),
                        attempt: 0,
                    })
                    .await;
            }
        });
        rx
    }

    // ── Title / summary helpers ─────────────────────────────────────

    /// Short session title from a seed text; degrades to the seed itself.
    pub async fn generate_title(
        &self,
        config: &warren_domain::config::RuntimeConfig,
        seed: &str,
    ) -> String {
        let fallback = || {
            let short: String = seed.chars().take(40).collect();
            if short.trim().is_empty() {
                "New Session".to_string()
            } else {
                short.trim().to_string()
            }
        };
        let llm = self.llm_for(config);
        let seed_prefix: String = seed.chars().take(200).collect();
        let prompt = format!(
            "Generate a short session title in plain English, at most 10 words. \
             No quotes and no trailing punctuation. Return only the title.\nContent: {seed_prefix}"
        );
        match llm.complete(&prompt).await {
            Ok(response) => {
                let first_line = response.trim().lines().next().unwrap_or("").trim();
                let title: String = first_line
                    .split_whitespace()
                    .take(10)
                    .collect::<Vec<_>>()
                    .join(" ")
                    .chars()
                    .take(80)
                    .collect();
                if title.trim().is_empty() {
                    fallback()
                } else {
                    title.trim().to_string()
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "title generation failed, using seed");
                fallback()
            }
        }
    }

    /// Compress a span of history into a ≤500-char summary.
    pub async fn summarize_messages(
        &self,
        config: &warren_domain::config::RuntimeConfig,
        messages: &[ChatMessage],
    ) -> String {
        let corpus: String = messages
            .iter()
            .map(|message| {
                let content: String = message.content.chars().take(200).collect();
                format!("{}: {content}", message.role)
            })
            .collect::<Vec<_>>()
            .join("\n");
        let corpus_capped: String = corpus.chars().take(4000).collect();
        let prompt = format!(
            "Summarize the following conversation in under 500 characters. \
             Preserve key conclusions, user preferences, and unfinished tasks.\n{corpus_capped}"
        );
        let llm = self.llm_for(config);
        match llm.complete(&prompt).await {
            Ok(summary) => summary.trim().chars().take(500).collect(),
            Err(e) => {
                tracing::debug!(error = %e, "summary generation failed, using raw corpus");
                corpus_capped.chars().take(500).collect()
            }
        }
    }

    // ── The turn algorithm ──────────────────────────────────────────

    async fn run_inner(&self, input: &TurnInput, tx: &mpsc::Sender<AgentEvent>) -> Result<()> {
        let runtime = self.registry.get_runtime(&input.agent_id)?;
        let config = runtime.config.clone();
        let history = runtime.sessions.load_for_agent(&input.session_id)?;

        // 1. Retrieval (rag mode).
        let mut rag_context: Option<String> = None;
        if config.rag_mode {
            let hits = runtime
                .retrieval
                .retrieve(
                    Domain::Memory,
                    &input.message,
                    config.retrieval.memory.top_k,
                    &config.retrieval.memory,
                    &config.retrieval.storage,
                )
                .await;
            let _ = tx
                .send(AgentEvent::Retrieval {
                    query: input.message.clone(),
                    results: hits.clone(),
                })
                .await;
            if !hits.is_empty() {
                let rendered = hits
                    .iter()
                    .map(|hit| format!("- ({:.4}) {}", hit.score, hit.text))
                    .collect::<Vec<_>>()
                    .join("\n");
                rag_context = Some(format!("[Memory Retrieval Results]\n{rendered}"));
            }
        }

        // 2. System prompt and base messages.
        let pack = self
            .prompts
            .build(&runtime.root_dir, &config, config.rag_mode, input.is_first_turn);
        let llm = self.llm_for(&config);

        let mut base_messages: Vec<LlmMessage> = Vec::with_capacity(history.len() + 3);
        if !pack.prompt.is_empty() {
            base_messages.push(LlmMessage::system(pack.prompt.as_str()));
        }
        for message in &history {
            if message.content.is_empty() {
                continue;
            }
            if message.role == "assistant" {
                base_messages.push(LlmMessage::assistant(message.content.as_str()));
            } else {
                base_messages.push(LlmMessage::user(message.content.as_str()));
            }
        }
        if let Some(context) = &rag_context {
            base_messages.push(LlmMessage::system(context.as_str()));
        }
        base_messages.push(LlmMessage::user(input.message.as_str()));

        // 3. Cross-attempt accumulators.
        let mut usage_state = UsageState::default();
        let mut usage_sources = UsageSources::new();
        let mut segments: Vec<Segment> = Vec::new();
        let mut current = Segment::default();
        let mut token_source: Option<TokenSource> = None;
        let mut pending_new_response = false;
        let mut emitted_reasoning: HashSet<String> = HashSet::new();
        let mut emitted_agent_update = false;
        let mut fallback_final = String::new();
        let mut last_live = Instant::now()
            .checked_sub(LIVE_SNAPSHOT_CADENCE)
            .unwrap_or_else(Instant::now);

        let max_retries = config.agent_runtime.max_retries;
        for attempt in 0..=max_retries {
            let run_id = Uuid::new_v4().to_string();
            let _ = tx
                .send(AgentEvent::RunStart {
                    run_id: run_id.clone(),
                    attempt: attempt + 1,
                })
                .await;
            runtime.audit.append_run(
                &run_id,
                &input.session_id,
                input.trigger.as_str(),
                "started",
                json!({"attempt": attempt + 1}),
            );

            let outcome = self
                .drive_attempt(
                    input,
                    &runtime,
                    &config,
                    llm.as_ref(),
                    &base_messages,
                    &run_id,
                    tx,
                    &mut usage_state,
                    &mut usage_sources,
                    &mut segments,
                    &mut current,
                    &mut token_source,
                    &mut pending_new_response,
                    &mut emitted_reasoning,
                    &mut emitted_agent_update,
                    &mut fallback_final,
                    &mut last_live,
                )
                .await;

            match outcome {
                Ok(()) => return Ok(()),
                Err(e) => {
                    runtime.audit.append_run(
                        &run_id,
                        &input.session_id,
                        input.trigger.as_str(),
                        "failed",
                        json!({"attempt": attempt + 1, "error": e.to_string()}),
                    );
                    if attempt < max_retries {
                        let backoff = Duration::from_millis(500 * (1 << attempt.min(8)) as u64);
                        tracing::warn!(
                            error = %e,
                            attempt = attempt + 1,
                            "turn attempt failed, retrying"
                        );
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                    if let Err(clear) = runtime
                        .sessions
                        .clear_live_response(&input.session_id, None)
                    {
                        tracing::debug!(error = %clear, "live response clear failed");
                    }
                    let _ = tx
                        .send(AgentEvent::Error {
                            error: e.to_string(),
                            run_id,
                            attempt: attempt + 1,
                        })
                        .await;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// One attempt: stream model calls and interleave tool execution until
    /// a final answer or an error.
    #[allow(clippy::too_many_arguments)]
    async fn drive_attempt(
        &self,
        input: &TurnInput,
        runtime: &Arc<AgentRuntime>,
        config: &warren_domain::config::RuntimeConfig,
        llm: &dyn LlmClient,
        base_messages: &[LlmMessage],
        run_id: &str,
        tx: &mpsc::Sender<AgentEvent>,
        usage_state: &mut UsageState,
        usage_sources: &mut UsageSources,
        segments: &mut Vec<Segment>,
        current: &mut Segment,
        token_source: &mut Option<TokenSource>,
        pending_new_response: &mut bool,
        emitted_reasoning: &mut HashSet<String>,
        emitted_agent_update: &mut bool,
        fallback_final: &mut String,
        last_live: &mut Instant,
    ) -> Result<()> {
        // Tools filtered by policy for this trigger.
        let all_tools = build_all_tools(&runtime.root_dir, config, runtime.retrieval.clone());
        let tools = enabled_tools(&all_tools, config, input.trigger);
        let tool_defs: Vec<ToolDefinition> = tools
            .iter()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect();
        let runner = ToolRunner::new(
            &runtime.root_dir,
            config.tool_retry_guard.repeat_identical_failure_limit,
            Some(runtime.audit.clone()),
        );
        let mut tool_context = ToolContext::new(&runtime.root_dir, input.trigger);
        tool_context.explicit_enabled_tools = explicit_enabled_tools(config, input.trigger);
        tool_context.run_id = Some(run_id.to_string());
        tool_context.session_id = Some(input.session_id.clone());

        let mut messages: Vec<LlmMessage> = base_messages.to_vec();
        let mut llm_seq: u32 = 0;

        let flush_segment = |segments: &mut Vec<Segment>, current: &mut Segment| {
            if !current.content.trim().is_empty() || !current.tool_calls.is_empty() {
                segments.push(std::mem::take(current));
            } else {
                *current = Segment::default();
            }
        };

        for _step in 0..config.agent_runtime.max_steps {
            llm_seq += 1;
            let request = LlmChatRequest {
                messages: messages.clone(),
                tools: tool_defs.clone(),
            };
            let mut stream = llm.stream_chat(&request).await?;

            let mut pending_tool_calls: Vec<ToolCallRequest> = Vec::new();
            let mut snapshot_prev = String::new();

            while let Some(event) = stream.next().await {
                match event? {
                    ProviderEvent::Token { text } => {
                        if !matches!(*token_source, None | Some(TokenSource::Messages)) {
                            continue;
                        }
                        *token_source = Some(TokenSource::Messages);
                        if !*emitted_agent_update {
                            *emitted_agent_update = true;
                            let _ = tx
                                .send(AgentEvent::AgentUpdate {
                                    run_id: run_id.to_string(),
                                    node: "model".into(),
                                    message_count: 1,
                                    preview: "Streaming token output".into(),
                                })
                                .await;
                        }
                        if *pending_new_response {
                            *pending_new_response = false;
                            flush_segment(segments, current);
                            let _ = tx.send(AgentEvent::NewResponse {}).await;
                        }
                        current.content.push_str(&text);
                        let _ = tx
                            .send(AgentEvent::Token {
                                content: text,
                                source: TokenSource::Messages.as_str().into(),
                            })
                            .await;
                        self.maybe_live_snapshot(
                            runtime, input, run_id, segments, current, last_live, false,
                        );
                    }
                    ProviderEvent::ContentSnapshot { content } => {
                        *fallback_final = content.clone();
                        if token_source.is_some() {
                            continue;
                        }
                        let delta = diff_incremental(&snapshot_prev, &content);
                        snapshot_prev = content;
                        if delta.is_empty() {
                            continue;
                        }
                        *token_source = Some(TokenSource::Updates);
                        if !*emitted_agent_update {
                            *emitted_agent_update = true;
                            let _ = tx
                                .send(AgentEvent::AgentUpdate {
                                    run_id: run_id.to_string(),
                                    node: "model".into(),
                                    message_count: 1,
                                    preview: delta.chars().take(500).collect(),
                                })
                                .await;
                        }
                        if *pending_new_response {
                            *pending_new_response = false;
                            flush_segment(segments, current);
                            let _ = tx.send(AgentEvent::NewResponse {}).await;
                        }
                        current.content.push_str(&delta);
                        let _ = tx
                            .send(AgentEvent::Token {
                                content: delta,
                                source: TokenSource::Updates.as_str().into(),
                            })
                            .await;
                    }
                    ProviderEvent::Reasoning { text } => {
                        let normalized = text.trim().to_string();
                        if normalized.is_empty() || !emitted_reasoning.insert(normalized.clone()) {
                            continue;
                        }
                        let _ = tx
                            .send(AgentEvent::Reasoning {
                                run_id: run_id.to_string(),
                                content: normalized.chars().take(REASONING_PREVIEW_CHARS).collect(),
                            })
                            .await;
                    }
                    ProviderEvent::ToolCall(call) => pending_tool_calls.push(call),
                    ProviderEvent::Usage { payload } => {
                        let candidate = extract_usage_payload(&payload, llm.model());
                        let source_id = format!("llm_end:{run_id}:{llm_seq}");
                        if usage_sources.accumulate(usage_state, &source_id, &candidate) {
                            usage_state.normalize();
                            let _ = tx
                                .send(AgentEvent::Usage {
                                    payload: self.usage_event_payload(
                                        usage_state,
                                        run_id,
                                        &input.agent_id,
                                    ),
                                })
                                .await;
                        }
                    }
                    ProviderEvent::Done => break,
                }
            }

            // ── No tool calls: this was the final answer ────────────
            if pending_tool_calls.is_empty() {
                flush_segment(segments, current);
                let mut final_content = segments
                    .iter()
                    .map(|segment| segment.content.as_str())
                    .filter(|content| !content.is_empty())
                    .collect::<Vec<_>>()
                    .join("\n")
                    .trim()
                    .to_string();
                if final_content.is_empty() {
                    final_content = fallback_final.trim().to_string();
                }

                usage_state.normalize();
                let usage_record = self
                    .finalize_usage(runtime, input, run_id, usage_state)
                    .unwrap_or(Value::Null);

                let title = self
                    .persist_turn(runtime, input, run_id, segments, &final_content, config)
                    .await?;

                if let Err(e) = runtime
                    .sessions
                    .clear_live_response(&input.session_id, Some(run_id))
                {
                    tracing::debug!(error = %e, "live response clear failed");
                }
                runtime.audit.append_run(
                    run_id,
                    &input.session_id,
                    input.trigger.as_str(),
                    "completed",
                    json!({"segments": segments.len(), "chars": final_content.len()}),
                );

                let _ = tx
                    .send(AgentEvent::Done {
                        content: final_content,
                        session_id: input.session_id.clone(),
                        agent_id: input.agent_id.clone(),
                        run_id: run_id.to_string(),
                        token_source: token_source
                            .map(|source| source.as_str())
                            .unwrap_or("fallback")
                            .to_string(),
                        usage: usage_record,
                    })
                    .await;
                if let Some(title) = title {
                    let _ = tx
                        .send(AgentEvent::Title {
                            session_id: input.session_id.clone(),
                            agent_id: input.agent_id.clone(),
                            title,
                        })
                        .await;
                }
                return Ok(());
            }

            // ── Tool dispatch ───────────────────────────────────────
            let wire_calls: Vec<Value> = pending_tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": &call.call_id,
                        "type": "function",
                        "function": {
                            "name": &call.name,
                            "arguments": call.arguments.to_string(),
                        }
                    })
                })
                .collect();
            messages.push(LlmMessage {
                role: "assistant".into(),
                content: current.content.clone(),
                tool_calls: Some(Value::Array(wire_calls)),
                tool_call_id: None,
            });

            for call in &pending_tool_calls {
                let _ = tx
                    .send(AgentEvent::ToolStart {
                        run_id: run_id.to_string(),
                        tool: call.name.clone(),
                        input: call.arguments.clone(),
                    })
                    .await;
                runtime.audit.append_step(
                    run_id,
                    &input.session_id,
                    input.trigger.as_str(),
                    "tool_start",
                    json!({"tool": &call.name}),
                );
                current
                    .tool_calls
                    .push(json!({"tool": &call.name, "input": &call.arguments}));
                self.maybe_live_snapshot(
                    runtime, input, run_id, segments, current, last_live, true,
                );

                let result = match tools.iter().find(|tool| tool.name() == call.name) {
                    Some(tool) => runner.run_tool(tool.as_ref(), &call.arguments, &tool_context).await,
                    None => ToolResult::failure(
                        &call.name,
                        ErrorCode::NotFound,
                        format!("unknown tool: {}", call.name),
                        0,
                    ),
                };
                let output = serde_json::to_string(&result).unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "failed to serialize tool result");
                    String::from("{\"ok\":false}")
                });

                if let Some(last) = current.tool_calls.last_mut() {
                    last["output"] = json!(output.chars().take(2000).collect::<String>());
                }
                let _ = tx
                    .send(AgentEvent::ToolEnd {
                        run_id: run_id.to_string(),
                        tool: call.name.clone(),
                        output: output.clone(),
                        ok: result.ok,
                    })
                    .await;
                runtime.audit.append_step(
                    run_id,
                    &input.session_id,
                    input.trigger.as_str(),
                    "tool_end",
                    json!({"tool": &call.name, "ok": result.ok}),
                );
                messages.push(LlmMessage::tool_result(call.call_id.as_str(), output.as_str()));
                *pending_new_response = true;
                self.maybe_live_snapshot(
                    runtime, input, run_id, segments, current, last_live, true,
                );
            }
        }

        Err(Error::Llm(format!(
            "agent step limit reached ({})",
            config.agent_runtime.max_steps
        )))
    }

    // ── Persistence helpers ─────────────────────────────────────────

    /// Live-response snapshot on a cadence; `force` around tool
    /// transitions.
    fn maybe_live_snapshot(
        &self,
        runtime: &Arc<AgentRuntime>,
        input: &TurnInput,
        run_id: &str,
        segments: &[Segment],
        current: &Segment,
        last_live: &mut Instant,
        force: bool,
    ) {
        if !force && last_live.elapsed() < LIVE_SNAPSHOT_CADENCE {
            return;
        }
        *last_live = Instant::now();
        let mut content_parts: Vec<&str> = segments
            .iter()
            .map(|segment| segment.content.as_str())
            .filter(|content| !content.is_empty())
            .collect();
        if !current.content.is_empty() {
            content_parts.push(current.content.as_str());
        }
        let mut tool_calls: Vec<Value> = segments
            .iter()
            .flat_map(|segment| segment.tool_calls.iter().cloned())
            .collect();
        tool_calls.extend(current.tool_calls.iter().cloned());
        if let Err(e) = runtime.sessions.set_live_response(
            &input.session_id,
            run_id,
            &content_parts.join("\n"),
            tool_calls,
        ) {
            tracing::debug!(error = %e, "live response snapshot failed");
        }
    }

    fn usage_event_payload(
        &self,
        usage_state: &UsageState,
        run_id: &str,
        agent_id: &str,
    ) -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert("run_id".into(), json!(run_id));
        payload.insert("agent_id".into(), json!(agent_id));
        if let Ok(Value::Object(fields)) = serde_json::to_value(usage_state) {
            payload.extend(fields);
        }
        if let Value::Object(cost) = estimate_cost(usage_state) {
            payload.extend(cost);
        }
        payload
    }

    /// Append the usage record when any tokens were observed.
    fn finalize_usage(
        &self,
        runtime: &Arc<AgentRuntime>,
        input: &TurnInput,
        run_id: &str,
        usage_state: &UsageState,
    ) -> Option<Value> {
        if usage_state.numbers.total_tokens == 0 {
            return None;
        }
        let mut record = self.usage_event_payload(usage_state, run_id, &input.agent_id);
        record.insert("trigger_type".into(), json!(input.trigger.as_str()));
        record.insert("session_id".into(), json!(&input.session_id));
        let record = Value::Object(record);
        runtime.usage.append_record(&record);
        Some(record)
    }

    /// Persist the user message and every non-empty assistant segment (chat
    /// turns only; scheduler triggers persist through their own stores).
    /// Returns the generated title for first chat turns.
    async fn persist_turn(
        &self,
        runtime: &Arc<AgentRuntime>,
        input: &TurnInput,
        run_id: &str,
        segments: &[Segment],
        final_content: &str,
        config: &warren_domain::config::RuntimeConfig,
    ) -> Result<Option<String>> {
        if input.trigger != TriggerType::Chat {
            return Ok(None);
        }

        runtime
            .sessions
            .save_message(&input.session_id, "user", &input.message, None)?;
        runtime.audit.append_message_link(
            run_id,
            &input.session_id,
            "user",
            0,
            &input.message,
            json!({"source": "chat_persist"}),
        );

        let mut persisted_any = false;
        for (index, segment) in segments.iter().enumerate() {
            let content = segment.content.trim();
            if content.is_empty() {
                continue;
            }
            let tool_calls = if segment.tool_calls.is_empty() {
                None
            } else {
                Some(segment.tool_calls.clone())
            };
            runtime
                .sessions
                .save_message(&input.session_id, "assistant", content, tool_calls)?;
            runtime.audit.append_message_link(
                run_id,
                &input.session_id,
                "assistant",
                index,
                content,
                json!({"tool_call_count": segment.tool_calls.len()}),
            );
            persisted_any = true;
        }
        // Snapshot-only providers can finish without a flushed segment.
        if !persisted_any && !final_content.is_empty() {
            runtime
                .sessions
                .save_message(&input.session_id, "assistant", final_content, None)?;
            runtime.audit.append_message_link(
                run_id,
                &input.session_id,
                "assistant",
                0,
                final_content,
                json!({"tool_call_count": 0}),
            );
        }

        if input.is_first_turn {
            let title = self.generate_title(config, &input.message).await;
            runtime.sessions.update_title(&input.session_id, &title)?;
            return Ok(Some(title));
        }
        Ok(None)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler seam
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
impl TurnRunner for TurnEngine {
    async fn run_turn(&self, request: TurnRequest) -> Result<TurnOutcome> {
        let runtime = self.registry.get_runtime(&request.agent_id)?;
        let is_first_turn = runtime
            .sessions
            .load(&request.session_id, false)?
            .messages
            .is_empty();

        let mut rx = self.stream_turn(TurnInput {
            agent_id: request.agent_id,
            session_id: request.session_id,
            message: request.message,
            trigger: request.trigger,
            is_first_turn,
        });

        let mut outcome = TurnOutcome::default();
        let mut failure: Option<String> = None;
        while let Some(event) = rx.recv().await {
            match event {
                AgentEvent::Done { content, usage, .. } => {
                    outcome.text = content;
                    outcome.usage = usage;
                }
                AgentEvent::Error { error, .. } => failure = Some(error),
                _ => {}
            }
        }
        match failure {
            Some(error) => Err(Error::Llm(error)),
            None => Ok(outcome),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use warren_domain::config::{EmbeddingProvider, SecretConfig};
    use warren_domain::stream::BoxStream;

    /// Scripted LLM: each `stream_chat` call pops one event script.
    struct ScriptedLlm {
        scripts: Mutex<VecDeque<Vec<ProviderEvent>>>,
        fail_first: Mutex<bool>,
    }

    impl ScriptedLlm {
        fn new(scripts: Vec<Vec<ProviderEvent>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                fail_first: Mutex::new(false),
            })
        }

        fn failing_first(self: Arc<Self>) -> Arc<Self> {
            *self.fail_first.lock() = true;
            self
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn stream_chat(
            &self,
            _request: &LlmChatRequest,
        ) -> Result<BoxStream<'static, Result<ProviderEvent>>> {
            {
                let mut fail = self.fail_first.lock();
                if *fail {
                    *fail = false;
                    return Err(Error::Llm("transient provider failure".into()));
                }
            }
            let script = self
                .scripts
                .lock()
                .pop_front()
                .unwrap_or_else(|| vec![ProviderEvent::Done]);
            let stream = async_stream::stream! {
                for event in script {
                    yield Ok(event);
                }
            };
            Ok(Box::pin(stream))
        }

        async fn complete(&self, _prompt: &str) -> Result<String> {
            Ok("Scripted Title".into())
        }

        fn model(&self) -> &str {
            "deepseek-chat"
        }
    }

    fn secrets() -> SecretConfig {
        SecretConfig {
            llm_api_key: "k".into(),
            llm_base_url: "http://127.0.0.1:0".into(),
            llm_model: "deepseek-chat".into(),
            embedding_provider: EmbeddingProvider::Disabled,
            embedding_api_key: String::new(),
            embedding_base_url: String::new(),
            embedding_model: String::new(),
        }
    }

    fn engine_with(scripts: Vec<Vec<ProviderEvent>>) -> (tempfile::TempDir, TurnEngine) {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = Arc::new(AgentRegistry::new(dir.path(), secrets()).unwrap());
        let engine = TurnEngine::with_llm(registry, ScriptedLlm::new(scripts));
        (dir, engine)
    }

    fn chat_input(message: &str) -> TurnInput {
        TurnInput {
            agent_id: "default".into(),
            session_id: "s1".into(),
            message: message.into(),
            trigger: TriggerType::Chat,
            is_first_turn: true,
        }
    }

    async fn drain(mut rx: mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn tokens(parts: &[&str]) -> Vec<ProviderEvent> {
        let mut script: Vec<ProviderEvent> = parts
            .iter()
            .map(|part| ProviderEvent::Token {
                text: part.to_string(),
            })
            .collect();
        script.push(ProviderEvent::ContentSnapshot {
            content: parts.concat(),
        });
        script.push(ProviderEvent::Usage {
            payload: json!({"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}),
        });
        script.push(ProviderEvent::Done);
        script
    }

    #[tokio::test]
    async fn simple_turn_streams_tokens_and_persists() {
        let (_dir, engine) = engine_with(vec![tokens(&["Hello", " world"])]);
        let events = drain(engine.stream_turn(chat_input("hi"))).await;

        let token_count = events
            .iter()
            .filter(|event| matches!(event, AgentEvent::Token { .. }))
            .count();
        assert_eq!(token_count, 2);

        let done = events
            .iter()
            .find_map(|event| match event {
                AgentEvent::Done {
                    content,
                    token_source,
                    ..
                } => Some((content.clone(), token_source.clone())),
                _ => None,
            })
            .expect("done event");
        assert_eq!(done.0, "Hello world");
        assert_eq!(done.1, "messages");

        // Title generated on the first chat turn.
        assert!(events
            .iter()
            .any(|event| matches!(event, AgentEvent::Title { title, .. } if title == "Scripted Title")));

        let runtime = engine.registry().get_runtime("default").unwrap();
        let session = runtime.sessions.load("s1", false).unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].role, "user");
        assert_eq!(session.messages[1].content, "Hello world");
        assert_eq!(session.title, "Scripted Title");
        // No transient projection or streaming rows survive completion.
        assert!(session.live_response.is_none());
        assert!(session.messages.iter().all(|m| m.streaming.is_none()));
    }

    #[tokio::test]
    async fn snapshot_duplicate_of_tokens_is_dropped() {
        // The snapshot repeats the token content; the token source machine
        // must not double it.
        let (_dir, engine) = engine_with(vec![tokens(&["same text"])]);
        let events = drain(engine.stream_turn(chat_input("hi"))).await;
        let done_content = events
            .iter()
            .find_map(|event| match event {
                AgentEvent::Done { content, .. } => Some(content.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(done_content, "same text");
    }

    #[tokio::test]
    async fn snapshot_only_provider_uses_updates_source() {
        let script = vec![
            ProviderEvent::ContentSnapshot {
                content: "from updates".into(),
            },
            ProviderEvent::Done,
        ];
        let (_dir, engine) = engine_with(vec![script]);
        let events = drain(engine.stream_turn(chat_input("hi"))).await;

        let source = events
            .iter()
            .find_map(|event| match event {
                AgentEvent::Token { source, .. } => Some(source.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(source, "updates");
        let done_source = events
            .iter()
            .find_map(|event| match event {
                AgentEvent::Done { token_source, .. } => Some(token_source.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(done_source, "updates");
    }

    #[tokio::test]
    async fn tool_call_flow_emits_boundaries_and_persists_segments() {
        let first_call = vec![
            ProviderEvent::Token {
                text: "Let me check.".into(),
            },
            ProviderEvent::ToolCall(ToolCallRequest {
                call_id: "c1".into(),
                name: "read_file".into(),
                arguments: json!({"path": "memory/MEMORY.md"}),
            }),
            ProviderEvent::Done,
        ];
        let second_call = tokens(&["The file says hello."]);
        let (_dir, engine) = engine_with(vec![first_call, second_call]);
        let events = drain(engine.stream_turn(chat_input("what does memory say?"))).await;

        let kinds: Vec<&str> = events.iter().map(|event| event.kind()).collect();
        let tool_start = kinds.iter().position(|k| *k == "tool_start").unwrap();
        let tool_end = kinds.iter().position(|k| *k == "tool_end").unwrap();
        let new_response = kinds.iter().position(|k| *k == "new_response").unwrap();
        assert!(tool_start < tool_end);
        assert!(tool_end < new_response);
        // new_response precedes the first token of the next segment.
        let post_token = kinds
            .iter()
            .enumerate()
            .filter(|(_, k)| **k == "token")
            .map(|(idx, _)| idx)
            .find(|idx| *idx > new_response)
            .unwrap();
        assert!(new_response < post_token);

        let runtime = engine.registry().get_runtime("default").unwrap();
        let session = runtime.sessions.load("s1", false).unwrap();
        // user + two assistant segments.
        assert_eq!(session.messages.len(), 3);
        assert_eq!(session.messages[1].content, "Let me check.");
        assert!(session.messages[1].tool_calls.is_some());
        assert_eq!(session.messages[2].content, "The file says hello.");
    }

    #[tokio::test]
    async fn transient_failure_retries_then_succeeds() {
        let llm = ScriptedLlm::new(vec![tokens(&["recovered"])]).failing_first();
        let dir = tempfile::TempDir::new().unwrap();
        let registry = Arc::new(AgentRegistry::new(dir.path(), secrets()).unwrap());
        let engine = TurnEngine::with_llm(registry, llm);
        let events = drain(engine.stream_turn(chat_input("hi"))).await;

        let run_starts = events
            .iter()
            .filter(|event| matches!(event, AgentEvent::RunStart { .. }))
            .count();
        assert_eq!(run_starts, 2);
        assert!(events
            .iter()
            .any(|event| matches!(event, AgentEvent::Done { content, .. } if content == "recovered")));
    }

    #[tokio::test]
    async fn exhausted_retries_end_with_error() {
        let llm = ScriptedLlm::new(vec![]).failing_first();
        // One failure script and no replacement scripts; with max_retries
        // defaulting to 1 the second attempt yields empty-done instead, so
        // pin retries to zero via agent config.
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"agent_runtime": {"max_retries": 0}}"#,
        )
        .unwrap();
        let registry = Arc::new(AgentRegistry::new(dir.path(), secrets()).unwrap());
        let engine = TurnEngine::with_llm(registry, llm);
        let events = drain(engine.stream_turn(chat_input("hi"))).await;
        assert!(matches!(events.last().unwrap(), AgentEvent::Error { .. }));
    }

    #[tokio::test]
    async fn usage_is_recorded_once_with_positive_totals() {
        let (_dir, engine) = engine_with(vec![tokens(&["ok"])]);
        let events = drain(engine.stream_turn(chat_input("hi"))).await;
        assert!(events
            .iter()
            .any(|event| matches!(event, AgentEvent::Usage { .. })));

        let runtime = engine.registry().get_runtime("default").unwrap();
        let records = runtime
            .usage
            .query_records(&warren_storage::UsageQuery::last_day());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["total_tokens"], 15);
        assert_eq!(records[0]["trigger_type"], "chat");
    }

    #[tokio::test]
    async fn run_turn_seam_returns_final_text_without_persisting_chat() {
        let (_dir, engine) = engine_with(vec![tokens(&["cron says hi"])]);
        let outcome = engine
            .run_turn(TurnRequest {
                agent_id: "default".into(),
                session_id: "__cron__:j1".into(),
                message: "ping".into(),
                trigger: TriggerType::Cron,
                })
            .await
            .unwrap();
        assert_eq!(outcome.text, "cron says hi");

        // Cron turns do not persist through the orchestrator.
        let runtime = engine.registry().get_runtime("default").unwrap();
        let session = runtime.sessions.load("__cron__:j1", false).unwrap();
        assert!(session.messages.is_empty());
    }
}
