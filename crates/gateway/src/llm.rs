//! LLM client seam.
//!
//! The orchestrator depends on [`LlmClient`]; production wires in
//! [`HttpLlmClient`], an OpenAI-compatible `/chat/completions` adapter that
//! streams SSE `data:` payloads and assembles tool-call deltas. Tests use a
//! scripted implementation.
//!
//! The stream surfaces both provider modes: token deltas as they arrive
//! ("messages") and one full-content snapshot before `Done` ("updates"),
//! leaving de-duplication to the orchestrator's token-source machine.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use warren_domain::stream::{BoxStream, ProviderEvent, ToolCallRequest};
use warren_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One message on the provider wire (OpenAI-compatible roles).
#[derive(Clone, Debug, Serialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl LlmMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain("assistant", content)
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".into(),
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    fn plain(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

/// Tool definition advertised to the model.
#[derive(Clone, Debug, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Clone, Debug)]
pub struct LlmChatRequest {
    pub messages: Vec<LlmMessage>,
    pub tools: Vec<ToolDefinition>,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Stream one model call as provider events, ending with `Done`.
    async fn stream_chat(
        &self,
        request: &LlmChatRequest,
    ) -> Result<BoxStream<'static, Result<ProviderEvent>>>;

    /// One-shot completion used for titles and summaries.
    async fn complete(&self, prompt: &str) -> Result<String>;

    fn model(&self) -> &str;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE plumbing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pull complete `data:` payloads out of an SSE buffer. Events are
/// `\n\n`-delimited; a trailing partial event stays buffered.
pub(crate) fn drain_data_lines(buffer: &mut String) -> Vec<String> {
    let mut data_lines = Vec::new();
    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2);
        for line in block.lines() {
            if let Some(data) = line.trim().strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    data_lines.push(data.to_string());
                }
            }
        }
    }
    data_lines
}

/// Accumulates streamed chunks of one model turn.
#[derive(Default)]
struct StreamState {
    content: String,
    /// tool-call assembly keyed by index: (call_id, name, args_json).
    tool_calls: BTreeMap<u64, (String, String, String)>,
    usage: Option<Value>,
}

impl StreamState {
    /// Parse one `data:` payload, returning the immediate events.
    fn parse_chunk(&mut self, data: &str) -> Vec<Result<ProviderEvent>> {
        if data == "[DONE]" {
            return self.finish();
        }
        let Ok(chunk) = serde_json::from_str::<Value>(data) else {
            return Vec::new();
        };
        let mut events = Vec::new();

        if let Some(usage) = chunk.get("usage").filter(|u| u.is_object()) {
            self.usage = Some(usage.clone());
            events.push(Ok(ProviderEvent::Usage {
                payload: usage.clone(),
            }));
        }

        let Some(choice) = chunk
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
        else {
            return events;
        };
        let delta = choice.get("delta").unwrap_or(&Value::Null);

        if let Some(text) = delta.get("reasoning_content").and_then(Value::as_str) {
            if !text.is_empty() {
                events.push(Ok(ProviderEvent::Reasoning {
                    text: text.to_string(),
                }));
            }
        }
        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            if !text.is_empty() {
                self.content.push_str(text);
                events.push(Ok(ProviderEvent::Token {
                    text: text.to_string(),
                }));
            }
        }
        if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for call in calls {
                let index = call.get("index").and_then(Value::as_u64).unwrap_or(0);
                let slot = self.tool_calls.entry(index).or_default();
                if let Some(id) = call.get("id").and_then(Value::as_str) {
                    slot.0 = id.to_string();
                }
                if let Some(function) = call.get("function") {
                    if let Some(name) = function.get("name").and_then(Value::as_str) {
                        slot.1.push_str(name);
                    }
                    if let Some(args) = function.get("arguments").and_then(Value::as_str) {
                        slot.2.push_str(args);
                    }
                }
            }
        }
        events
    }

    /// Emit assembled tool calls, the final content snapshot, and `Done`.
    fn finish(&mut self) -> Vec<Result<ProviderEvent>> {
        let mut events = Vec::new();
        for (index, (call_id, name, args_json)) in std::mem::take(&mut self.tool_calls) {
            let arguments = if args_json.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str(&args_json).unwrap_or_else(|e| {
                    tracing::warn!(
                        tool = %name,
                        error = %e,
                        "tool call arguments are not valid JSON; defaulting to empty object"
                    );
                    json!({})
                })
            };
            let call_id = if call_id.is_empty() {
                format!("call_{index}")
            } else {
                call_id
            };
            events.push(Ok(ProviderEvent::ToolCall(ToolCallRequest {
                call_id,
                name,
                arguments,
            })));
        }
        if !self.content.is_empty() {
            events.push(Ok(ProviderEvent::ContentSnapshot {
                content: std::mem::take(&mut self.content),
            }));
        }
        events.push(Ok(ProviderEvent::Done));
        events
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct HttpLlmClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f64,
}

impl HttpLlmClient {
    pub fn new(
        secrets: &warren_domain::config::SecretConfig,
        temperature: f64,
        timeout_seconds: u64,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_seconds.max(5)))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: secrets.llm_base_url.trim_end_matches('/').to_string(),
            api_key: secrets.llm_api_key.clone(),
            model: secrets.llm_model.clone(),
            temperature,
        }
    }

    fn request_body(&self, request: &LlmChatRequest, stream: bool) -> Value {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    }
                })
            })
            .collect();
        let mut body = json!({
            "model": &self.model,
            "messages": &request.messages,
            "temperature": self.temperature,
            "stream": stream,
        });
        if stream {
            body["stream_options"] = json!({"include_usage": true});
        }
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
        }
        body
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn stream_chat(
        &self,
        request: &LlmChatRequest,
    ) -> Result<BoxStream<'static, Result<ProviderEvent>>> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(request, true))
            .send()
            .await
            .map_err(|e| Error::Llm(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Llm(format!(
                "provider returned {status}: {}",
                body.chars().take(300).collect::<String>()
            )));
        }

        let stream = async_stream::stream! {
            let mut response = response;
            let mut buffer = String::new();
            let mut state = StreamState::default();
            let mut done_emitted = false;

            loop {
                match response.chunk().await {
                    Ok(Some(bytes)) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        for data in drain_data_lines(&mut buffer) {
                            for event in state.parse_chunk(&data) {
                                if matches!(event, Ok(ProviderEvent::Done)) {
                                    done_emitted = true;
                                }
                                yield event;
                            }
                            if done_emitted {
                                break;
                            }
                        }
                        if done_emitted {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(Error::Llm(e.to_string()));
                        return;
                    }
                }
            }
            if !done_emitted {
                for event in state.finish() {
                    yield event;
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let request = LlmChatRequest {
            messages: vec![LlmMessage::user(prompt)],
            tools: Vec::new(),
        };
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(&request, false))
            .send()
            .await
            .map_err(|e| Error::Llm(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::Llm(format!(
                "provider returned {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::Llm(e.to_string()))?;
        Ok(body["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string())
    }

    fn model(&self) -> &str {
        &self.model
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
