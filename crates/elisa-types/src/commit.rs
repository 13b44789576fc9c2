use serde::{Deserialize, Serialize};

/// Produced per successful task by the version store. Commits are ordered
/// by creation; deletion is not modeled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRecord {
    pub hash: String,
    pub short_hash: String,
    pub message: String,
    pub agent_name: String,
    pub task_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub changed_paths: Vec<String>,
}
