use serde::{Deserialize, Serialize};

use crate::spec::DeploymentTarget;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NuggetType {
    Success,
    PartialSuccess,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunOutcome {
    pub tasks_done: u32,
    pub tasks_total: u32,
    pub tests_passed: u32,
    pub tests_total: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage_pct: Option<f64>,
    pub total_tokens: u64,
    pub cost_usd: f64,
    pub judge_score: u32,
    pub judge_overridden: bool,
    pub success: bool,
}

impl RunOutcome {
    pub fn completion_ratio(&self) -> f64 {
        if self.tasks_total == 0 {
            0.0
        } else {
            self.tasks_done as f64 / self.tasks_total as f64
        }
    }

    pub fn judge_quality(&self) -> f64 {
        self.judge_score as f64 / 100.0
    }
}

/// One entry in the append-only build-memory record. Deduped by session id
/// (later write wins), truncated to `BuildMemory`'s max-records cap, FIFO.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub session_id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub goal: String,
    pub project_type: String,
    pub nugget_type: NuggetType,
    pub deployment_target: DeploymentTarget,
    pub keywords: Vec<String>,
    pub skills_used: Vec<String>,
    pub rules_used: Vec<String>,
    pub commit_highlights: Vec<String>,
    pub outcome: RunOutcome,
}
