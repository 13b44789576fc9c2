use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeCheck {
    pub name: String,
    pub score: u32,
    pub max_score: u32,
    pub passed: bool,
    pub details: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeResult {
    pub score: u32,
    pub threshold: u32,
    pub passed: bool,
    pub checks: Vec<JudgeCheck>,
    pub blocking_issues: Vec<String>,
    /// The judge's own verdict, before any human override.
    #[serde(default)]
    pub raw_passed: bool,
    #[serde(default)]
    pub overridden: bool,
}
