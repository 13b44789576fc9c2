//! Judge Phase (spec §4.13): a deterministic, weighted scorer over the
//! finished build — no model call, just keyword coverage and task/test
//! bookkeeping — with a human override gate when the score falls short.

use std::collections::HashSet;
use std::path::Path;

use elisa_core::event_bus::EventBus;
use elisa_core::suspension::{GateAnswer, GateSlot};
use elisa_types::spec::Workflow;
use elisa_types::text::keyword_coverage;
use elisa_types::{CommitRecord, JudgeCheck, JudgeResult, Task, TaskStatus, TestPhaseSummary};
use elisa_wire::{event_kind, EngineEvent, JUDGE_GATE_TASK_ID};
use serde_json::json;

const TASK_COMPLETION_MAX: u32 = 35;
const TEST_HEALTH_MAX: u32 = 25;
const REQUIREMENT_TRACEABILITY_MAX: u32 = 25;
const BEHAVIORAL_TRACEABILITY_MAX: u32 = 15;

const MAX_SOURCE_FILES: usize = 80;
const MAX_CORPUS_BYTES: usize = 180_000;
const SOURCE_EXTENSIONS: &[&str] = &[
    "rs", "ts", "tsx", "js", "jsx", "py", "go", "java", "kt", "c", "h", "cpp", "hpp", "toml", "json", "yaml", "yml",
    "md",
];

pub async fn run(
    bus: &EventBus,
    gate: &GateSlot,
    session_id: &str,
    workspace: &Path,
    tasks: &[Task],
    commits: &[CommitRecord],
    test_summary: Option<&TestPhaseSummary>,
    workflow: &Workflow,
    threshold: u32,
) -> JudgeResult {
    bus.publish(EngineEvent::new(session_id, event_kind::JUDGE_STARTED, json!({})));

    let corpus = build_corpus(workspace, tasks, commits, test_summary).await;

    let task_completion = task_completion_check(tasks);
    let test_health = test_health_check(test_summary);
    let requirement_traceability = requirement_traceability_check(tasks, &corpus);
    let behavioral_traceability = behavioral_traceability_check(workflow, &corpus);

    let checks = vec![task_completion, test_health, requirement_traceability, behavioral_traceability];

    let total_score: u32 = checks.iter().map(|c| c.score).sum();
    let total_max: u32 = checks.iter().map(|c| c.max_score).sum();
    let score = if total_max == 0 { 0 } else { ((total_score as f64 * 100.0) / total_max as f64).round() as u32 };

    let blocking_issues: Vec<String> = checks
        .iter()
        .filter(|c| matches!(c.name.as_str(), "task_completion" | "behavioral_traceability"))
        .filter(|c| !c.passed)
        .map(|c| c.details.clone())
        .collect();

    let raw_passed = score >= threshold && blocking_issues.is_empty();

    let mut result =
        JudgeResult { score, threshold, passed: raw_passed, checks, blocking_issues, raw_passed, overridden: false };

    bus.publish(EngineEvent::new(
        session_id,
        event_kind::JUDGE_RESULT,
        serde_json::to_value(&result).unwrap_or(json!({})),
    ));

    if !result.passed {
        bus.publish(EngineEvent::human_gate(
            session_id,
            JUDGE_GATE_TASK_ID,
            "This build scored below the acceptance threshold. Accept it anyway?",
            serde_json::to_value(&result).unwrap_or(json!({})),
        ));
        let rx = gate.open().await;
        let answer = rx.await.unwrap_or(GateAnswer { approved: false, feedback: None });
        if answer.approved {
            result.passed = true;
            result.overridden = true;
        }
    }

    result
}

fn task_completion_check(tasks: &[Task]) -> JudgeCheck {
    let failed: Vec<&Task> = tasks.iter().filter(|t| t.status == TaskStatus::Failed).collect();
    let all_done = !tasks.is_empty() && tasks.iter().all(|t| t.status == TaskStatus::Done);
    let passed = all_done && failed.is_empty();
    let details = if passed {
        format!("all {} task(s) completed", tasks.len())
    } else {
        format!("{} task(s) failed or incomplete out of {}", tasks.len() - tasks.iter().filter(|t| t.status == TaskStatus::Done).count(), tasks.len())
    };
    JudgeCheck {
        name: "task_completion".to_string(),
        score: if passed { TASK_COMPLETION_MAX } else { 0 },
        max_score: TASK_COMPLETION_MAX,
        passed,
        details,
    }
}

fn test_health_check(test_summary: Option<&TestPhaseSummary>) -> JudgeCheck {
    let passed = match test_summary {
        None => true,
        Some(summary) => summary.failed == 0,
    };
    let details = match test_summary {
        None => "no tests required".to_string(),
        Some(summary) => format!("{}/{} test(s) passed", summary.passed, summary.total),
    };
    JudgeCheck {
        name: "test_health".to_string(),
        score: if passed { TEST_HEALTH_MAX } else { 0 },
        max_score: TEST_HEALTH_MAX,
        passed,
        details,
    }
}

fn requirement_traceability_check(tasks: &[Task], corpus: &HashSet<String>) -> JudgeCheck {
    let coverages: Vec<f64> = tasks
        .iter()
        .flat_map(|t| t.acceptance_criteria.iter())
        .map(|c| keyword_coverage(c, corpus))
        .collect();
    let avg = average(&coverages);
    let passed = avg >= 0.6;
    JudgeCheck {
        name: "requirement_traceability".to_string(),
        score: scaled_score(avg, 0.6, REQUIREMENT_TRACEABILITY_MAX),
        max_score: REQUIREMENT_TRACEABILITY_MAX,
        passed,
        details: format!("average acceptance-criteria keyword coverage {:.0}%", avg * 100.0),
    }
}

fn behavioral_traceability_check(workflow: &Workflow, corpus: &HashSet<String>) -> JudgeCheck {
    if workflow.behavioral_tests.is_empty() {
        return JudgeCheck {
            name: "behavioral_traceability".to_string(),
            score: BEHAVIORAL_TRACEABILITY_MAX,
            max_score: BEHAVIORAL_TRACEABILITY_MAX,
            passed: true,
            details: "no behavioral tests declared".to_string(),
        };
    }
    let coverages: Vec<f64> = workflow
        .behavioral_tests
        .iter()
        .map(|bt| keyword_coverage(&format!("{} {}", bt.when, bt.then), corpus))
        .collect();
    let avg = average(&coverages);
    let passed = avg >= 0.5;
    JudgeCheck {
        name: "behavioral_traceability".to_string(),
        score: scaled_score(avg, 0.5, BEHAVIORAL_TRACEABILITY_MAX),
        max_score: BEHAVIORAL_TRACEABILITY_MAX,
        passed,
        details: format!("average behavioral-test keyword coverage {:.0}%", avg * 100.0),
    }
}

fn average(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Awards partial credit proportional to how close coverage got to the
/// passing threshold, capped at the check's max score.
fn scaled_score(avg: f64, threshold: f64, max: u32) -> u32 {
    if avg >= threshold {
        max
    } else {
        ((avg / threshold).clamp(0.0, 1.0) * max as f64).round() as u32
    }
}

async fn build_corpus(
    workspace: &Path,
    tasks: &[Task],
    commits: &[CommitRecord],
    test_summary: Option<&TestPhaseSummary>,
) -> HashSet<String> {
    let mut text = String::new();
    for task in tasks {
        text.push_str(&task.name);
        text.push(' ');
        text.push_str(&task.description);
        text.push(' ');
        for criterion in &task.acceptance_criteria {
            text.push_str(criterion);
            text.push(' ');
        }
    }
    for commit in commits {
        text.push_str(&commit.message);
        text.push(' ');
    }
    if let Some(summary) = test_summary {
        if let Some(details) = &summary.coverage_details {
            text.push_str(details);
            text.push(' ');
        }
    }

    for source in collect_source_files(workspace).await {
        text.push_str(&source);
        text.push(' ');
    }

    elisa_types::text::keywords(&text).into_iter().collect()
}

/// Walks the workspace breadth-first up to `MAX_SOURCE_FILES` files under
/// `MAX_CORPUS_BYTES` total, skipping VCS and dependency directories — a
/// plain recursive `read_dir` walk in the same style as the sandbox's `LS`
/// tool, since nothing in the dependency stack provides directory walking.
async fn collect_source_files(root: &Path) -> Vec<String> {
    let mut out = Vec::new();
    let mut total_bytes = 0usize;
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        if out.len() >= MAX_SOURCE_FILES || total_bytes >= MAX_CORPUS_BYTES {
            break;
        }
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(r) => r,
            Err(_) => continue,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if out.len() >= MAX_SOURCE_FILES || total_bytes >= MAX_CORPUS_BYTES {
                break;
            }
            let path = entry.path();
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();
            if name.starts_with('.') || name == "node_modules" || name == "target" || name == "dist" {
                continue;
            }
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if is_dir {
                stack.push(path);
                continue;
            }
            let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if !SOURCE_EXTENSIONS.contains(&extension) {
                continue;
            }
            if let Ok(contents) = tokio::fs::read_to_string(&path).await {
                let take = contents.len().min(MAX_CORPUS_BYTES - total_bytes);
                total_bytes += take;
                out.push(contents[..take].to_string());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use elisa_types::spec::BehavioralTest;
    use tempfile::TempDir;

    fn done_task(id: &str) -> Task {
        let mut t = Task::new(id, "increment the counter", "Builder Bot");
        t.status = TaskStatus::Done;
        t.acceptance_criteria = vec!["increment the counter value".to_string()];
        t
    }

    #[tokio::test]
    async fn task_completion_check_fails_when_a_task_is_not_done() {
        let mut failed = done_task("task-2");
        failed.status = TaskStatus::Failed;
        let tasks = vec![done_task("task-1"), failed];
        let check = task_completion_check(&tasks);
        assert!(!check.passed);
        assert_eq!(check.score, 0);
    }

    #[tokio::test]
    async fn test_health_passes_when_no_tests_were_required() {
        let check = test_health_check(None);
        assert!(check.passed);
        assert_eq!(check.score, TEST_HEALTH_MAX);
    }

    #[tokio::test]
    async fn behavioral_traceability_defaults_to_full_score_with_no_behavioral_tests() {
        let workflow = Workflow::default();
        let corpus: HashSet<String> = HashSet::new();
        let check = behavioral_traceability_check(&workflow, &corpus);
        assert!(check.passed);
        assert_eq!(check.score, BEHAVIORAL_TRACEABILITY_MAX);
    }

    #[tokio::test]
    async fn scores_high_when_corpus_echoes_acceptance_criteria() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("main.rs"), "fn increment_the_counter_value() {}").await.unwrap();
        let tasks = vec![done_task("task-1")];
        let corpus = build_corpus(dir.path(), &tasks, &[], None).await;
        let check = requirement_traceability_check(&tasks, &corpus);
        assert!(check.passed, "expected coverage to clear 0.6, got {}", check.details);
    }

    #[tokio::test]
    async fn opens_a_human_gate_when_the_score_is_below_threshold() {
        let bus = EventBus::new();
        let gate = GateSlot::new();
        let dir = TempDir::new().unwrap();

        let mut failed = done_task("task-1");
        failed.status = TaskStatus::Failed;
        let tasks = vec![failed];
        let workflow = Workflow { behavioral_tests: vec![BehavioralTest { when: "x".to_string(), then: "y".to_string() }], ..Default::default() };

        let gate_clone = gate.clone();
        let answerer = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            gate_clone.answer(GateAnswer { approved: true, feedback: Some("looks fine".to_string()) }).await
        });

        let result = run(&bus, &gate, "s1", dir.path(), &tasks, &[], None, &workflow, 70).await;
        assert!(answerer.await.unwrap());
        assert!(result.overridden);
        assert!(result.passed);
        assert!(!result.raw_passed);
    }
}
