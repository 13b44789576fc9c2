//! Agent Dispatcher (spec §4.7): one LLM call with streaming, a
//! tool-calling loop, timeout, cancellation, and error classification.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use elisa_providers::{ChatMessage, ErrorClass, LanguageModel, ToolCallRequest};
use elisa_tools::{ToolCallRecord, ToolSandbox};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Not part of the sandboxed tool allowlist (§4.8) — intercepted by the
/// dispatcher itself and routed to the question-suspension mechanism
/// instead of `ToolSandbox::execute`.
pub const ASK_QUESTION_TOOL: &str = "AskQuestion";

pub const MAX_COMPLETION_TOKENS_START: u32 = 4_000;
pub const MAX_COMPLETION_TOKENS_STEP: u32 = 4_000;
pub const MAX_COMPLETION_TOKENS_CAP: u32 = 12_000;
pub const DEFAULT_TIMEOUT_SEC: u64 = 300;
const STREAM_DEBOUNCE: Duration = Duration::from_millis(100);

/// Per-1k-token pricing used only to populate `AgentResult::cost_usd`; no
/// vendor billing API is consulted (spec §1 treats the LLM SDK as an
/// external collaborator).
const INPUT_COST_PER_1K: f64 = 0.005;
const OUTPUT_COST_PER_1K: f64 = 0.015;

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub max_turns: u32,
    pub max_completion_tokens: u32,
    pub timeout_sec: u64,
    pub allowed_tools: Vec<String>,
    pub enable_streaming: bool,
    pub enable_tool_calling: bool,
    pub model_override: Option<String>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            max_turns: crate::prompts::MAX_TURNS_DEFAULT,
            max_completion_tokens: MAX_COMPLETION_TOKENS_START,
            timeout_sec: DEFAULT_TIMEOUT_SEC,
            allowed_tools: ToolSandbox::all_schemas().into_iter().map(|s| s.name).collect(),
            enable_streaming: true,
            enable_tool_calling: true,
            model_override: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AgentResult {
    pub success: bool,
    pub summary: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_input_tokens: u64,
    pub reasoning_tokens: u64,
    pub tool_calls: Vec<ToolCallRecord>,
    pub cost_usd: f64,
}

/// How the dispatcher answers a tool-originated question (§9 design note:
/// a future/promise keyed by task id). The executor implements this over
/// `elisa_core::QuestionRegistry` plus an `agent_question` event emission.
#[async_trait]
pub trait QuestionPort: Send + Sync {
    async fn ask(&self, question_args: Value) -> Value;
}

pub struct NoQuestions;

#[async_trait]
impl QuestionPort for NoQuestions {
    async fn ask(&self, _question_args: Value) -> Value {
        serde_json::json!({})
    }
}

pub async fn dispatch(
    system_prompt: &str,
    user_prompt: &str,
    sandbox: &ToolSandbox,
    model: &dyn LanguageModel,
    questions: &dyn QuestionPort,
    options: &DispatchOptions,
    cancel: CancellationToken,
    mut on_output: impl FnMut(&str) + Send,
) -> AgentResult {
    let mut history = vec![ChatMessage::system(system_prompt), ChatMessage::user(user_prompt)];
    let schemas = sandbox.schemas_for(&options.allowed_tools);
    let tool_schemas: Vec<elisa_providers::ToolSchema> = schemas
        .iter()
        .map(|s| elisa_providers::ToolSchema {
            name: s.name.clone(),
            description: s.description.clone(),
            input_schema: s.input_schema.clone(),
        })
        .collect();

    let mut result = AgentResult { success: false, ..Default::default() };

    for _turn in 0..options.max_turns {
        if cancel.is_cancelled() {
            result.summary = "Agent was cancelled".to_string();
            return result;
        }

        let mut buffer = String::new();
        let mut last_flush = Instant::now();
        let enable_streaming = options.enable_streaming;
        let mut on_text = |chunk: &str| {
            if !enable_streaming {
                return;
            }
            buffer.push_str(chunk);
            if last_flush.elapsed() >= STREAM_DEBOUNCE {
                on_output(&buffer);
                buffer.clear();
                last_flush = Instant::now();
            }
        };

        let turn_tools: &[elisa_providers::ToolSchema] =
            if options.enable_tool_calling { &tool_schemas } else { &[] };

        let turn = tokio::time::timeout(
            Duration::from_secs(options.timeout_sec),
            model.complete_turn(
                &history,
                turn_tools,
                options.model_override.as_deref(),
                cancel.clone(),
                &mut on_text,
            ),
        )
        .await;

        if !buffer.is_empty() {
            on_output(&buffer);
        }

        let response = match turn {
            Err(_) => {
                result.summary = format!("Agent timed out after {} seconds", options.timeout_sec);
                return result;
            }
            Ok(Err(err)) => {
                let message = err.to_string();
                result.summary = match elisa_providers::classify_error(&message) {
                    ErrorClass::Timeout => format!("Agent timed out after {} seconds", options.timeout_sec),
                    ErrorClass::ContextWindowExceeded => format!("CONTEXT_WINDOW_EXCEEDED: {message}"),
                    ErrorClass::OutputLimitReached => format!("OUTPUT_LIMIT_REACHED: {message}"),
                    ErrorClass::Other => message,
                };
                return result;
            }
            Ok(Ok(response)) => response,
        };

        result.input_tokens += response.usage.input_tokens;
        result.output_tokens += response.usage.output_tokens;
        result.cached_input_tokens += response.usage.cached_input_tokens;
        result.reasoning_tokens += response.usage.reasoning_tokens;

        if response.tool_calls.is_empty() {
            result.success = true;
            result.summary = response.content;
            result.cost_usd = estimate_cost(result.input_tokens, result.output_tokens);
            return result;
        }

        history.push(ChatMessage::assistant(response.content.clone(), response.tool_calls.clone()));

        let outcomes = run_tool_calls(sandbox, questions, &response.tool_calls, cancel.clone()).await;
        for (call, record) in response.tool_calls.iter().zip(outcomes.iter()) {
            history.push(ChatMessage::tool(call.id.clone(), record.result.output.clone()));
        }
        result.tool_calls.extend(outcomes);
    }

    result.summary = format!("Agent exhausted its turn budget of {}", options.max_turns);
    result.cost_usd = estimate_cost(result.input_tokens, result.output_tokens);
    result
}

/// Executes every tool call from one assistant turn concurrently (spec
/// §4.7 step 5), routing `AskQuestion` calls to the question port instead
/// of the sandbox.
async fn run_tool_calls(
    sandbox: &ToolSandbox,
    questions: &dyn QuestionPort,
    calls: &[ToolCallRequest],
    cancel: CancellationToken,
) -> Vec<ToolCallRecord> {
    let futures = calls.iter().map(|call| {
        let cancel = cancel.clone();
        async move {
            let result = if call.name == ASK_QUESTION_TOOL {
                let answer = questions.ask(call.arguments.clone()).await;
                elisa_tools::ToolResult::ok(answer.to_string())
            } else {
                sandbox.execute(&call.name, call.arguments.clone(), cancel).await
            };
            ToolCallRecord {
                id: call.id.clone(),
                name: call.name.clone(),
                arguments: call.arguments.clone(),
                result,
            }
        }
    });
    futures::future::join_all(futures).await
}

fn estimate_cost(input_tokens: u64, output_tokens: u64) -> f64 {
    (input_tokens as f64 / 1000.0) * INPUT_COST_PER_1K + (output_tokens as f64 / 1000.0) * OUTPUT_COST_PER_1K
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use elisa_providers::{OnTextDelta, TurnResponse};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct ScriptedModel {
        turns: Arc<Vec<TurnResponse>>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn complete_turn(
            &self,
            _messages: &[ChatMessage],
            _tools: &[elisa_providers::ToolSchema],
            _model_override: Option<&str>,
            _cancel: CancellationToken,
            on_text: &mut OnTextDelta<'_>,
        ) -> anyhow::Result<TurnResponse> {
            let idx = self.calls.fetch_add(1, Ordering::SeqCst);
            let turn = self.turns.get(idx).cloned().unwrap_or_default();
            if !turn.content.is_empty() {
                on_text(&turn.content);
            }
            Ok(turn)
        }
    }

    fn sandbox() -> (TempDir, ToolSandbox) {
        let dir = TempDir::new().unwrap();
        let sandbox = ToolSandbox::new(dir.path());
        (dir, sandbox)
    }

    #[tokio::test]
    async fn finalizes_on_first_turn_with_no_tool_calls() {
        let (_dir, sandbox) = sandbox();
        let model = ScriptedModel {
            turns: Arc::new(vec![TurnResponse { content: "all done".to_string(), ..Default::default() }]),
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let result = dispatch(
            "system",
            "user",
            &sandbox,
            &model,
            &NoQuestions,
            &DispatchOptions::default(),
            CancellationToken::new(),
            |_| {},
        )
        .await;
        assert!(result.success);
        assert_eq!(result.summary, "all done");
    }

    #[tokio::test]
    async fn cancelled_before_first_turn_fails_immediately() {
        let (_dir, sandbox) = sandbox();
        let model = ScriptedModel { turns: Arc::new(vec![]), calls: Arc::new(AtomicUsize::new(0)) };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = dispatch(
            "system",
            "user",
            &sandbox,
            &model,
            &NoQuestions,
            &DispatchOptions::default(),
            cancel,
            |_| {},
        )
        .await;
        assert!(!result.success);
        assert_eq!(result.summary, "Agent was cancelled");
    }

    #[tokio::test]
    async fn executes_tool_calls_then_finalizes_next_turn() {
        let (_dir, sandbox) = sandbox();
        let model = ScriptedModel {
            turns: Arc::new(vec![
                TurnResponse {
                    content: String::new(),
                    tool_calls: vec![ToolCallRequest {
                        id: "call_1".to_string(),
                        name: "Write".to_string(),
                        arguments: serde_json::json!({"file_path": "a.txt", "content": "hi"}),
                    }],
                    ..Default::default()
                },
                TurnResponse { content: "wrote the file".to_string(), ..Default::default() },
            ]),
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let result = dispatch(
            "system",
            "user",
            &sandbox,
            &model,
            &NoQuestions,
            &DispatchOptions::default(),
            CancellationToken::new(),
            |_| {},
        )
        .await;
        assert!(result.success);
        assert_eq!(result.tool_calls.len(), 1);
        assert!(result.tool_calls[0].result.success);
    }

    #[test]
    fn classifies_timeout_marker_text() {
        assert_eq!(elisa_providers::classify_error("request timed out"), ErrorClass::Timeout);
    }
}
