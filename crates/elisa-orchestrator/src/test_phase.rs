//! Test Phase (spec §4.11): runs the project's own test suite inside the
//! workspace, normalizes the results, and emits one `test_result` event per
//! test plus a `test_phase_complete` aggregate.
//!
//! Which command actually runs tests is project-type-specific (`cargo
//! test`, `npm test`, a PlatformIO harness...) and is an external
//! capability in the same sense as the LLM vendor SDK (spec §1) — this
//! module depends on it through the `TestRunner` trait rather than
//! hard-coding one toolchain.

use std::path::Path;

use async_trait::async_trait;
use elisa_core::event_bus::EventBus;
use elisa_types::spec::{BehavioralTest, Workflow};
use elisa_types::{TestPhaseSummary, TestResult};
use elisa_wire::{event_kind, EngineEvent};
use serde_json::json;

#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run_tests(&self, workspace: &Path, behavioral_tests: &[BehavioralTest]) -> anyhow::Result<RunnerOutput>;
}

#[derive(Debug, Clone, Default)]
pub struct RunnerOutput {
    pub results: Vec<TestResult>,
    pub coverage_pct: Option<f64>,
}

/// No concrete test-execution harness lives in this workspace; used when
/// no project-specific runner was wired up.
#[derive(Default)]
pub struct NullTestRunner;

#[async_trait]
impl TestRunner for NullTestRunner {
    async fn run_tests(&self, _workspace: &Path, _behavioral_tests: &[BehavioralTest]) -> anyhow::Result<RunnerOutput> {
        Ok(RunnerOutput::default())
    }
}

/// Everything the pipeline controller needs to retain from one test phase
/// run: the aggregate the judge consumes plus the raw per-test results the
/// controller's `getTestResults()` accessor surfaces.
#[derive(Debug, Clone, Default)]
pub struct TestPhaseOutcome {
    pub summary: TestPhaseSummary,
    pub results: Vec<TestResult>,
}

/// Skips entirely (no `test_started`/`test_phase_complete` events at all)
/// when testing is disabled and the spec declares no behavioral tests —
/// there is nothing to verify and nothing worth reporting.
pub async fn run(
    bus: &EventBus,
    session_id: &str,
    workspace: &Path,
    workflow: &Workflow,
    runner: &dyn TestRunner,
) -> Option<TestPhaseOutcome> {
    if !workflow.testing_enabled && workflow.behavioral_tests.is_empty() {
        return None;
    }

    bus.publish(EngineEvent::new(session_id, event_kind::TEST_STARTED, json!({})));

    let output = match runner.run_tests(workspace, &workflow.behavioral_tests).await {
        Ok(output) => output,
        Err(err) => {
            bus.publish(EngineEvent::error(session_id, format!("test phase failed: {err}"), true));
            RunnerOutput::default()
        }
    };

    for result in &output.results {
        bus.publish(EngineEvent::new(
            session_id,
            event_kind::TEST_RESULT,
            serde_json::to_value(result).unwrap_or(json!({})),
        ));
    }

    let summary = TestPhaseSummary::from_results(&output.results, output.coverage_pct);
    bus.publish(EngineEvent::new(
        session_id,
        event_kind::TEST_PHASE_COMPLETE,
        serde_json::to_value(&summary).unwrap_or(json!({})),
    ));
    Some(TestPhaseOutcome { summary, results: output.results })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedRunner(RunnerOutput);

    #[async_trait]
    impl TestRunner for FixedRunner {
        async fn run_tests(&self, _workspace: &Path, _behavioral_tests: &[BehavioralTest]) -> anyhow::Result<RunnerOutput> {
            Ok(self.0.clone())
        }
    }

    fn workflow(testing_enabled: bool, behavioral_tests: Vec<BehavioralTest>) -> Workflow {
        Workflow { testing_enabled, behavioral_tests, ..Default::default() }
    }

    #[tokio::test]
    async fn skips_entirely_when_testing_disabled_and_no_behavioral_tests() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let result = run(&bus, "s1", Path::new("/tmp"), &workflow(false, vec![]), &NullTestRunner).await;
        assert!(result.is_none());
        drop(bus);
        assert!(rx.recv().await.is_err());
    }

    #[tokio::test]
    async fn aggregates_pass_fail_counts() {
        let bus = EventBus::new();
        let output = RunnerOutput {
            results: vec![
                TestResult { name: "a".to_string(), passed: true, details: String::new() },
                TestResult { name: "b".to_string(), passed: false, details: "boom".to_string() },
            ],
            coverage_pct: Some(80.0),
        };
        let outcome = run(&bus, "s1", Path::new("/tmp"), &workflow(true, vec![]), &FixedRunner(output))
            .await
            .unwrap();
        assert_eq!(outcome.summary.passed, 1);
        assert_eq!(outcome.summary.failed, 1);
        assert_eq!(outcome.summary.total, 2);
        assert_eq!(outcome.summary.coverage_pct, Some(80.0));
        assert_eq!(outcome.results.len(), 2);
    }

    #[tokio::test]
    async fn runs_when_behavioral_tests_exist_even_if_testing_disabled() {
        let bus = EventBus::new();
        let tests = vec![BehavioralTest { when: "x".to_string(), then: "y".to_string() }];
        let result = run(&bus, "s1", Path::new("/tmp"), &workflow(false, tests), &NullTestRunner).await;
        assert!(result.is_some());
    }
}
