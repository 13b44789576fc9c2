use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub passed: bool,
    pub details: String,
}

/// Phase aggregate emitted as `test_phase_complete`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TestPhaseSummary {
    pub passed: u32,
    pub failed: u32,
    pub total: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage_details: Option<String>,
}

impl TestPhaseSummary {
    pub fn from_results(results: &[TestResult], coverage_pct: Option<f64>) -> Self {
        let passed = results.iter().filter(|r| r.passed).count() as u32;
        let total = results.len() as u32;
        Self {
            passed,
            failed: total - passed,
            total,
            coverage_pct,
            coverage_details: None,
        }
    }
}
