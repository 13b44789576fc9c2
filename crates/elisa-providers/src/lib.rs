//! The `LanguageModel` capability: spec §1 names the LLM vendor SDK as an
//! external collaborator and abstracts it behind this boundary. This crate
//! supplies the concrete OpenAI-compatible chat-completions implementation
//! the rest of the stack drives, the way the reference engine's provider
//! crate supplies a concrete `OpenAICompatibleProvider` behind its own
//! vendor-agnostic `Provider` trait.

use std::pin::Pin;
use std::str;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".into(), content: content.into(), tool_call_id: None, tool_calls: None }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".into(), content: content.into(), tool_call_id: None, tool_calls: None }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
            tool_call_id: None,
            tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".into(),
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_input_tokens: u64,
    pub reasoning_tokens: u64,
}

/// One turn of a tool-calling loop: the assistant's text (possibly empty
/// when it only emitted tool calls), any tool calls it requested, and the
/// token usage for that turn.
#[derive(Debug, Clone, Default)]
pub struct TurnResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: TokenUsage,
    pub finish_reason: String,
}

/// Streaming text delta callback. The dispatcher debounces these into
/// ~100ms coalesced chunks before forwarding them as `agent_output` events
/// (spec §4.7) — this trait just hands over raw deltas as they arrive.
pub type OnTextDelta<'a> = dyn FnMut(&str) + Send + 'a;

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Runs exactly one turn: sends `messages` (+ `tools`, when non-empty)
    /// to the model and returns once the model finishes that turn (either
    /// with plain text or a batch of tool calls). Must observe `cancel`
    /// promptly — spec §4.7/§5 require the in-flight model call to abort
    /// immediately on cancellation.
    async fn complete_turn(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
        model_override: Option<&str>,
        cancel: CancellationToken,
        on_text: &mut OnTextDelta<'_>,
    ) -> anyhow::Result<TurnResponse>;
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub default_model: String,
    pub workshop_code: Option<String>,
    pub student_id: Option<String>,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            default_model: "gpt-5.2".to_string(),
            workshop_code: None,
            student_id: None,
        }
    }
}

pub struct OpenAiLanguageModel {
    config: OpenAiConfig,
    client: Client,
}

impl OpenAiLanguageModel {
    pub fn new(config: OpenAiConfig) -> Self {
        let client = Client::builder().build().unwrap_or_else(|_| Client::new());
        Self { config, client }
    }

    fn wire_tools(tools: &[ToolSchema]) -> Vec<Value> {
        tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.input_schema,
                    }
                })
            })
            .collect()
    }

    fn wire_messages(messages: &[ChatMessage]) -> Vec<Value> {
        messages
            .iter()
            .map(|m| {
                let mut value = json!({ "role": m.role, "content": m.content });
                if let Some(id) = &m.tool_call_id {
                    value["tool_call_id"] = json!(id);
                }
                if let Some(calls) = &m.tool_calls {
                    value["tool_calls"] = json!(calls
                        .iter()
                        .map(|c| json!({
                            "id": c.id,
                            "type": "function",
                            "function": {"name": c.name, "arguments": c.arguments.to_string()},
                        }))
                        .collect::<Vec<_>>());
                }
                value
            })
            .collect()
    }
}

#[async_trait]
impl LanguageModel for OpenAiLanguageModel {
    async fn complete_turn(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
        model_override: Option<&str>,
        cancel: CancellationToken,
        on_text: &mut OnTextDelta<'_>,
    ) -> anyhow::Result<TurnResponse> {
        let model = model_override
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.config.default_model.as_str());

        let mut body = json!({
            "model": model,
            "messages": Self::wire_messages(messages),
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        let wire_tools = Self::wire_tools(tools);
        if !wire_tools.is_empty() {
            body["tools"] = Value::Array(wire_tools);
            body["tool_choice"] = json!("auto");
        }

        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let mut req = self.client.post(url).json(&body);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }
        if let Some(code) = &self.config.workshop_code {
            req = req.header("X-Workshop-Code", code);
        }
        if let Some(student) = &self.config.student_id {
            req = req.header("X-Student-Id", student);
        }

        tracing::debug!(model, tool_count = tools.len(), "dispatching chat completion turn");

        let resp = tokio::select! {
            _ = cancel.cancelled() => anyhow::bail!("request cancelled"),
            result = req.send() => result?,
        };

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            tracing::warn!(%status, "chat completion request failed");
            anyhow::bail!("provider request failed with status {status}: {text}");
        }

        let mut byte_stream = stream_frames(resp, cancel.clone());
        let mut text = String::new();
        let mut tool_calls: Vec<PartialToolCall> = Vec::new();
        let mut usage = TokenUsage::default();
        let mut finish_reason = String::new();

        while let Some(frame) = byte_stream.next().await {
            let frame = frame?;
            for line in frame.lines() {
                let Some(payload) = line.strip_prefix("data: ") else { continue };
                let payload = payload.trim();
                if payload == "[DONE]" {
                    continue;
                }
                let Ok(value) = serde_json::from_str::<Value>(payload) else { continue };

                if let Some(u) = value.get("usage") {
                    usage.input_tokens = u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(usage.input_tokens);
                    usage.output_tokens = u.get("completion_tokens").and_then(Value::as_u64).unwrap_or(usage.output_tokens);
                    usage.cached_input_tokens = u
                        .get("prompt_tokens_details")
                        .and_then(|d| d.get("cached_tokens"))
                        .and_then(Value::as_u64)
                        .unwrap_or(usage.cached_input_tokens);
                    usage.reasoning_tokens = u
                        .get("completion_tokens_details")
                        .and_then(|d| d.get("reasoning_tokens"))
                        .and_then(Value::as_u64)
                        .unwrap_or(usage.reasoning_tokens);
                }

                let Some(choice) = value.get("choices").and_then(|c| c.as_array()).and_then(|c| c.first()) else {
                    continue;
                };
                let delta = choice.get("delta").cloned().unwrap_or_default();

                if let Some(chunk) = delta.get("content").and_then(Value::as_str) {
                    if !chunk.is_empty() {
                        text.push_str(chunk);
                        on_text(chunk);
                    }
                }

                if let Some(calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                    for call in calls {
                        let index = call.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                        while tool_calls.len() <= index {
                            tool_calls.push(PartialToolCall::default());
                        }
                        let slot = &mut tool_calls[index];
                        if let Some(id) = call.get("id").and_then(Value::as_str) {
                            slot.id = id.to_string();
                        }
                        if let Some(function) = call.get("function") {
                            if let Some(name) = function.get("name").and_then(Value::as_str) {
                                slot.name.push_str(name);
                            }
                            if let Some(args) = function.get("arguments").and_then(Value::as_str) {
                                slot.arguments.push_str(args);
                            }
                        }
                    }
                }

                if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
                    if !reason.is_empty() {
                        finish_reason = reason.to_string();
                    }
                }
            }
        }

        let tool_calls = tool_calls
            .into_iter()
            .filter(|t| !t.name.is_empty())
            .map(|t| ToolCallRequest {
                id: if t.id.is_empty() { format!("call_{}", fnv_hex(&t.name)) } else { t.id },
                name: t.name,
                arguments: serde_json::from_str(&t.arguments).unwrap_or(json!({})),
            })
            .collect();

        Ok(TurnResponse { content: text, tool_calls, usage, finish_reason })
    }
}

#[derive(Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

fn fnv_hex(seed: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    seed.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

fn stream_frames(
    resp: reqwest::Response,
    cancel: CancellationToken,
) -> Pin<Box<dyn Stream<Item = anyhow::Result<String>> + Send>> {
    let mut bytes = resp.bytes_stream();
    let stream = try_stream! {
        let mut buffer = String::new();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                chunk = bytes.next() => chunk,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;
            buffer.push_str(str::from_utf8(&chunk).unwrap_or_default());
            while let Some(pos) = buffer.find("\n\n") {
                let frame = buffer[..pos].to_string();
                buffer = buffer[pos + 2..].to_string();
                yield frame;
            }
        }
    };
    Box::pin(stream)
}

/// Error classification (spec §4.7): maps a thrown/returned error to a
/// stable marker. These patterns come from the vendor's own error shapes,
/// so classification lives at the provider boundary rather than in the
/// dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Timeout,
    ContextWindowExceeded,
    OutputLimitReached,
    Other,
}

const CONTEXT_WINDOW_PATTERNS: &[&str] = &[
    "context_length_exceeded",
    "too many tokens",
    "prompt too long",
    "maximum context length",
];

const OUTPUT_LIMIT_PATTERNS: &[&str] = &[
    "max_tokens",
    "could not finish the message",
    "completion length",
];

pub fn classify_error(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();
    if lower.contains("timed out") || lower.contains("timeout") {
        return ErrorClass::Timeout;
    }
    if CONTEXT_WINDOW_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ErrorClass::ContextWindowExceeded;
    }
    if OUTPUT_LIMIT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ErrorClass::OutputLimitReached;
    }
    ErrorClass::Other
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_context_window_overflow() {
        assert_eq!(classify_error("Error: context_length_exceeded for model"), ErrorClass::ContextWindowExceeded);
        assert_eq!(classify_error("prompt too long for this model"), ErrorClass::ContextWindowExceeded);
    }

    #[test]
    fn classifies_output_limit_overflow() {
        assert_eq!(classify_error("stopped due to max_tokens"), ErrorClass::OutputLimitReached);
    }

    #[test]
    fn classifies_timeout() {
        assert_eq!(classify_error("request timed out after 300s"), ErrorClass::Timeout);
    }

    #[test]
    fn unmatched_errors_classify_as_other() {
        assert_eq!(classify_error("rate limited"), ErrorClass::Other);
    }

    #[test]
    fn chat_message_constructors_set_expected_roles() {
        assert_eq!(ChatMessage::system("s").role, "system");
        assert_eq!(ChatMessage::user("u").role, "user");
        assert_eq!(ChatMessage::tool("id1", "r").tool_call_id.as_deref(), Some("id1"));
    }
}
