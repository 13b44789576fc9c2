use serde::{Deserialize, Serialize};

use crate::spec::AgentRole;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

/// Non-empty only when the task is `Failed` as a consequence of a
/// predecessor's terminal failure rather than its own dispatch exhausting
/// retries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    DispatchExhausted,
    PredecessorFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub description: String,
    pub status: TaskStatus,
    pub agent_name: String,
    #[serde(default)]
    pub predecessors: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub failure_reason: Option<FailureReason>,
}

impl Task {
    pub fn new(id: impl Into<String>, name: impl Into<String>, agent_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            status: TaskStatus::Pending,
            agent_name: agent_name.into(),
            predecessors: Vec::new(),
            acceptance_criteria: Vec::new(),
            retry_count: 0,
            failure_reason: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, TaskStatus::Done | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Working,
    Done,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub name: String,
    pub role: AgentRole,
    pub persona: String,
    pub status: AgentStatus,
}

impl Agent {
    pub fn new(name: impl Into<String>, role: AgentRole, persona: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role,
            persona: persona.into(),
            status: AgentStatus::Idle,
        }
    }
}
