//! Event vocabulary (spec §6) and HTTP/WS wire DTOs.
//!
//! `EngineEvent` is the single typed envelope published on a session's event
//! bus and forwarded verbatim, one JSON document per frame, to the session's
//! WebSocket subscriber. The event vocabulary is fixed; see `EventKind`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use elisa_types::{
    CommitRecord, JudgeResult, RestartMode, Spec, TaskStatus, TestPhaseSummary, TestResult,
};

/// The fixed vocabulary from spec §6. Kept as `&'static str` rather than an
/// enum discriminant so the wire payload is just `{"type": "...", ...}`,
/// matching how the rest of the stack tags its event frames.
pub mod event_kind {
    pub const SESSION_STARTED: &str = "session_started";
    pub const PLANNING_STARTED: &str = "planning_started";
    pub const PLAN_READY: &str = "plan_ready";
    pub const TASK_STARTED: &str = "task_started";
    pub const TASK_COMPLETED: &str = "task_completed";
    pub const TASK_FAILED: &str = "task_failed";
    pub const AGENT_SPAWNED: &str = "agent_spawned";
    pub const AGENT_STATUS: &str = "agent_status";
    pub const AGENT_OUTPUT: &str = "agent_output";
    pub const AGENT_MESSAGE: &str = "agent_message";
    pub const AGENT_QUESTION: &str = "agent_question";
    pub const TOOL_USE: &str = "tool_use";
    pub const TOOL_RESULT: &str = "tool_result";
    pub const CODE_GENERATED: &str = "code_generated";
    pub const CODE_REVIEW_STARTED: &str = "code_review_started";
    pub const CODE_REVIEW_COMPLETE: &str = "code_review_complete";
    pub const TEST_STARTED: &str = "test_started";
    pub const TEST_RESULT: &str = "test_result";
    pub const TEST_PHASE_COMPLETE: &str = "test_phase_complete";
    pub const DEPLOY_STARTED: &str = "deploy_started";
    pub const DEPLOY_PROGRESS: &str = "deploy_progress";
    pub const DEPLOY_COMPLETE: &str = "deploy_complete";
    pub const TEACHING_MOMENT: &str = "teaching_moment";
    pub const WORKSPACE_CREATED: &str = "workspace_created";
    pub const COMMIT_CREATED: &str = "commit_created";
    pub const JUDGE_STARTED: &str = "judge_started";
    pub const JUDGE_RESULT: &str = "judge_result";
    pub const HUMAN_GATE: &str = "human_gate";
    pub const SESSION_COMPLETE: &str = "session_complete";
    pub const ERROR: &str = "error";
}

/// `task_id = "__judge__"` is reserved for the judge override gate.
pub const JUDGE_GATE_TASK_ID: &str = "__judge__";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub session_id: String,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: Value,
}

impl EngineEvent {
    pub fn new(session_id: impl Into<String>, kind: &str, payload: Value) -> Self {
        Self {
            kind: kind.to_string(),
            session_id: session_id.into(),
            at: Utc::now(),
            payload,
        }
    }

    pub fn session_started(session_id: impl Into<String>) -> Self {
        let session_id = session_id.into();
        Self::new(
            session_id.clone(),
            event_kind::SESSION_STARTED,
            serde_json::json!({ "session_id": session_id }),
        )
    }

    pub fn error(session_id: impl Into<String>, message: impl Into<String>, recoverable: bool) -> Self {
        Self::new(
            session_id,
            event_kind::ERROR,
            serde_json::json!({ "message": message.into(), "recoverable": recoverable }),
        )
    }

    pub fn human_gate(session_id: impl Into<String>, task_id: &str, question: &str, context: Value) -> Self {
        Self::new(
            session_id,
            event_kind::HUMAN_GATE,
            serde_json::json!({ "task_id": task_id, "question": question, "context": context }),
        )
    }
}

// --- HTTP request/response DTOs (spec §6 table) -----------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub api_key: ApiKeyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_error: Option<String>,
    pub agent_sdk: AgentSdkStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ready,
    Degraded,
    Offline,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyStatus {
    Valid,
    Invalid,
    Missing,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentSdkStatus {
    Found,
    NotFound,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InternalConfigRequest {
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct InternalConfigResponse {
    pub api_key: ApiKeyStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkspaceSaveRequest {
    pub workspace_path: String,
    #[serde(default)]
    pub workspace_json: Value,
    #[serde(default)]
    pub skills: Value,
    #[serde(default)]
    pub rules: Value,
    #[serde(default)]
    pub portals: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceSaveResponse {
    pub status: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkspaceLoadRequest {
    pub workspace_path: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct WorkspaceLoadResponse {
    pub workspace: Value,
    pub skills: Value,
    pub rules: Value,
    pub portals: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkspaceInspectRequest {
    pub workspace_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceInspection {
    pub exists: bool,
    pub is_empty: bool,
    pub file_count: u64,
    pub src_file_count: u64,
    pub test_file_count: u64,
    pub has_git: bool,
    pub top_files: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkspaceResetRequest {
    pub workspace_path: String,
    pub mode: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceResetResponse {
    pub status: &'static str,
    pub mode: String,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSessionRequest {
    pub spec: Value,
    #[serde(default)]
    pub workspace_path: Option<String>,
    #[serde(default)]
    pub restart_mode: RestartMode,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GateRequest {
    pub approved: bool,
    #[serde(default)]
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnswerRequest {
    pub task_id: String,
    pub answers: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct WsHello {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub session_id: String,
}

/// The `judge` field of `session_complete`, carrying the human-override
/// adjustment alongside the judge's own verdict.
#[derive(Debug, Clone, Serialize)]
pub struct SessionCompleteJudge {
    pub score: u32,
    pub threshold: u32,
    pub raw_passed: bool,
    pub overridden: bool,
    pub passed: bool,
    pub blocking_issues: Vec<String>,
}

impl From<&JudgeResult> for SessionCompleteJudge {
    fn from(j: &JudgeResult) -> Self {
        Self {
            score: j.score,
            threshold: j.threshold,
            raw_passed: j.raw_passed,
            overridden: j.overridden,
            passed: j.passed,
            blocking_issues: j.blocking_issues.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionCompletePayload {
    pub summary: String,
    pub judge: SessionCompleteJudge,
    pub suggestions: Vec<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub name: String,
    pub status: TaskStatus,
    pub agent_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitsResponse {
    pub commits: Vec<CommitRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestResultsResponse {
    pub results: Vec<TestResult>,
    pub summary: TestPhaseSummary,
}

/// Re-exported so `elisa-server` doesn't need a direct `elisa-types` import
/// purely to accept a spec payload.
pub fn parse_spec(value: Value) -> Result<Spec, serde_json::Error> {
    Spec::from_value(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_event_serializes_type_tag_flattened() {
        let event = EngineEvent::new("s1", event_kind::TASK_STARTED, serde_json::json!({"task_id": "t1"}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "task_started");
        assert_eq!(value["task_id"], "t1");
        assert_eq!(value["session_id"], "s1");
    }

    #[test]
    fn human_gate_for_judge_uses_reserved_task_id() {
        let event = EngineEvent::human_gate("s1", JUDGE_GATE_TASK_ID, "Accept this build?", Value::Null);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["task_id"], "__judge__");
    }
}
