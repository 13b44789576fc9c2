//! Build Memory (spec §4.13): an append-only record of prior runs that
//! seeds the planner with similar-run context and suggests reusable
//! patterns from past successes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use elisa_types::spec::DeploymentTarget;
use elisa_types::text::{jaccard, keywords};
use elisa_types::{MemoryRecord, NuggetType};
use tokio::sync::RwLock;

pub const DEFAULT_MAX_RECORDS: usize = 200;
const MIN_PLANNER_SIMILARITY: f64 = 0.2;
const MIN_PATTERN_SIMILARITY: f64 = 0.18;
const MAX_SIMILAR_RUNS: usize = 3;
const MAX_SUGGESTED_PATTERNS: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type MemoryResult<T> = Result<T, MemoryError>;

/// A prior run surfaced to the planner, ranked by similarity to the
/// incoming spec.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SimilarRun {
    pub session_id: String,
    pub goal: String,
    pub similarity: f64,
    pub outcome: elisa_types::RunOutcome,
    pub skills_used: Vec<String>,
    pub rules_used: Vec<String>,
    pub pitfalls: Vec<String>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PlannerContext {
    pub similar_runs: Vec<SimilarRun>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ReusablePattern {
    pub session_id: String,
    pub description: String,
    pub score: f64,
}

/// Append-only, FIFO-capped (default 200), JSON-file-backed build memory.
/// Dedup by session id — a later write for the same session replaces the
/// earlier one in place rather than appending a duplicate.
#[derive(Clone)]
pub struct BuildMemory {
    path: Arc<PathBuf>,
    max_records: usize,
    records: Arc<RwLock<Vec<MemoryRecord>>>,
}

impl BuildMemory {
    pub async fn open(path: impl Into<PathBuf>) -> MemoryResult<Self> {
        Self::open_with_cap(path, DEFAULT_MAX_RECORDS).await
    }

    pub async fn open_with_cap(path: impl Into<PathBuf>, max_records: usize) -> MemoryResult<Self> {
        let path = path.into();
        let records = load(&path).await?;
        Ok(Self { path: Arc::new(path), max_records, records: Arc::new(RwLock::new(records)) })
    }

    /// Records a completed run, deduping by session id (later wins),
    /// enforcing the FIFO cap, and persisting atomically.
    pub async fn record_run(&self, record: MemoryRecord) -> MemoryResult<()> {
        let mut records = self.records.write().await;
        if let Some(existing) = records.iter_mut().find(|r| r.session_id == record.session_id) {
            *existing = record;
        } else {
            records.push(record);
        }
        if records.len() > self.max_records {
            let overflow = records.len() - self.max_records;
            records.drain(0..overflow);
        }
        persist(&self.path, &records).await?;
        Ok(())
    }

    pub async fn all(&self) -> Vec<MemoryRecord> {
        self.records.read().await.clone()
    }

    /// Up to three similar prior runs, weighted
    /// `0.6*jaccard(keywords) + 0.25*sameType + 0.15*sameDeploy + 0.05*successBonus`,
    /// floor 0.2.
    pub async fn planner_context(
        &self,
        goal_keywords: &[String],
        project_type: &str,
        deployment_target: DeploymentTarget,
    ) -> PlannerContext {
        let records = self.records.read().await;
        let mut scored: Vec<(f64, &MemoryRecord)> = records
            .iter()
            .map(|record| {
                let kw = jaccard(goal_keywords, &record.keywords);
                let same_type = if record.project_type == project_type { 1.0 } else { 0.0 };
                let same_deploy = if record.deployment_target == deployment_target { 1.0 } else { 0.0 };
                let success_bonus = if record.outcome.success { 1.0 } else { 0.0 };
                let score = 0.6 * kw + 0.25 * same_type + 0.15 * same_deploy + 0.05 * success_bonus;
                (score, record)
            })
            .filter(|(score, _)| *score >= MIN_PLANNER_SIMILARITY)
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let similar_runs = scored
            .into_iter()
            .take(MAX_SIMILAR_RUNS)
            .map(|(similarity, record)| SimilarRun {
                session_id: record.session_id.clone(),
                goal: record.goal.clone(),
                similarity,
                outcome: record.outcome.clone(),
                skills_used: record.skills_used.clone(),
                rules_used: record.rules_used.clone(),
                pitfalls: if matches!(record.nugget_type, NuggetType::Failure | NuggetType::PartialSuccess) {
                    record.commit_highlights.clone()
                } else {
                    Vec::new()
                },
            })
            .collect();

        PlannerContext { similar_runs }
    }

    /// Suggestions drawn from the build-memory layer, attached to
    /// `session_complete` (spec §4.1). Weighted
    /// `similarity * (0.35 + 0.65*completionRate) * (0.4 + 0.6*judgeQuality)`, floor
    /// 0.18, top 4. Deduplicated by normalized description text, excluding anything
    /// already present in `current_patterns` (the current spec's own skills/rules).
    pub async fn suggest_reusable_patterns(
        &self,
        goal_keywords: &[String],
        current_patterns: &[String],
    ) -> Vec<ReusablePattern> {
        let excluded: std::collections::HashSet<String> =
            current_patterns.iter().map(|p| normalize_pattern(p)).collect();
        let records = self.records.read().await;
        let mut suggestions: Vec<ReusablePattern> = records
            .iter()
            .filter(|r| r.outcome.success)
            .filter_map(|record| {
                let similarity = jaccard(goal_keywords, &record.keywords);
                let completion = record.outcome.completion_ratio();
                let judge_quality = record.outcome.judge_quality();
                let score = similarity * (0.35 + 0.65 * completion) * (0.4 + 0.6 * judge_quality);
                if score < MIN_PATTERN_SIMILARITY {
                    return None;
                }
                let description = record
                    .skills_used
                    .first()
                    .or_else(|| record.rules_used.first())
                    .or_else(|| record.commit_highlights.first())
                    .cloned()
                    .unwrap_or_else(|| record.goal.clone());
                if excluded.contains(&normalize_pattern(&description)) {
                    return None;
                }
                Some((normalize_pattern(&description), ReusablePattern { session_id: record.session_id.clone(), description, score }))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .fold(Vec::<(String, ReusablePattern)>::new(), |mut deduped, (key, pattern)| {
                match deduped.iter_mut().find(|(k, _)| *k == key) {
                    Some((_, existing)) if existing.score < pattern.score => *existing = pattern,
                    Some(_) => {}
                    None => deduped.push((key, pattern)),
                }
                deduped
            })
            .into_iter()
            .map(|(_, pattern)| pattern)
            .collect();
        suggestions.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        suggestions.truncate(MAX_SUGGESTED_PATTERNS);
        suggestions
    }
}

fn normalize_pattern(text: &str) -> String {
    text.trim().to_lowercase()
}

/// De-duplicated, order-preserving keywords from a goal string, used by
/// callers building `planner_context`/`suggest_reusable_patterns` inputs.
pub fn goal_keywords(goal: &str) -> Vec<String> {
    keywords(goal)
}

#[derive(serde::Serialize, serde::Deserialize)]
struct MemoryDocument {
    version: u32,
    records: Vec<MemoryRecord>,
}

async fn load(path: &Path) -> MemoryResult<Vec<MemoryRecord>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(serde_json::from_slice::<MemoryDocument>(&bytes).map(|doc| doc.records).unwrap_or_default()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

async fn persist(path: &Path, records: &[MemoryRecord]) -> MemoryResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let document = MemoryDocument { version: 1, records: records.to_vec() };
    let bytes = serde_json::to_vec_pretty(&document)?;
    elisa_core::config::write_atomic(path, &bytes).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use elisa_types::RunOutcome;
    use tempfile::TempDir;

    fn sample_record(session_id: &str, goal: &str, success: bool) -> MemoryRecord {
        MemoryRecord {
            session_id: session_id.to_string(),
            created_at: Utc::now(),
            goal: goal.to_string(),
            project_type: "web_app".to_string(),
            nugget_type: if success { NuggetType::Success } else { NuggetType::Failure },
            deployment_target: DeploymentTarget::Web,
            keywords: goal_keywords(goal),
            skills_used: vec!["routing".to_string()],
            rules_used: vec!["no-unwrap".to_string()],
            commit_highlights: vec!["implemented counter widget".to_string()],
            outcome: RunOutcome {
                tasks_done: 4,
                tasks_total: 4,
                tests_passed: 10,
                tests_total: 10,
                coverage_pct: Some(90.0),
                total_tokens: 5000,
                cost_usd: 0.5,
                judge_score: 85,
                judge_overridden: false,
                success,
            },
        }
    }

    #[tokio::test]
    async fn record_run_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("memory.json");
        let memory = BuildMemory::open(&path).await.unwrap();
        memory.record_run(sample_record("s1", "Build a counter app", true)).await.unwrap();

        let reopened = BuildMemory::open(&path).await.unwrap();
        assert_eq!(reopened.all().await.len(), 1);
    }

    #[tokio::test]
    async fn dedup_by_session_id_keeps_later_write() {
        let dir = TempDir::new().unwrap();
        let memory = BuildMemory::open(dir.path().join("memory.json")).await.unwrap();
        memory.record_run(sample_record("s1", "Build a counter app", false)).await.unwrap();
        memory.record_run(sample_record("s1", "Build a counter app, retried", true)).await.unwrap();

        let all = memory.all().await;
        assert_eq!(all.len(), 1);
        assert!(all[0].outcome.success);
    }

    #[tokio::test]
    async fn fifo_cap_drops_oldest() {
        let dir = TempDir::new().unwrap();
        let memory = BuildMemory::open_with_cap(dir.path().join("memory.json"), 2).await.unwrap();
        memory.record_run(sample_record("s1", "goal one", true)).await.unwrap();
        memory.record_run(sample_record("s2", "goal two", true)).await.unwrap();
        memory.record_run(sample_record("s3", "goal three", true)).await.unwrap();

        let all = memory.all().await;
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|r| r.session_id != "s1"));
    }

    #[tokio::test]
    async fn planner_context_ranks_similar_goals_first() {
        let dir = TempDir::new().unwrap();
        let memory = BuildMemory::open(dir.path().join("memory.json")).await.unwrap();
        memory.record_run(sample_record("s1", "Build a counter web app with increment button", true)).await.unwrap();
        memory.record_run(sample_record("s2", "Flash firmware onto an esp32 sensor node", true)).await.unwrap();

        let context = memory
            .planner_context(&goal_keywords("Build a counter app"), "web_app", DeploymentTarget::Web)
            .await;
        assert!(!context.similar_runs.is_empty());
        assert_eq!(context.similar_runs[0].session_id, "s1");
    }

    #[tokio::test]
    async fn suggest_reusable_patterns_only_draws_from_successes() {
        let dir = TempDir::new().unwrap();
        let memory = BuildMemory::open(dir.path().join("memory.json")).await.unwrap();
        memory.record_run(sample_record("s1", "Build a counter web app", true)).await.unwrap();
        memory.record_run(sample_record("s2", "Build a counter web app", false)).await.unwrap();

        let suggestions = memory.suggest_reusable_patterns(&goal_keywords("Build a counter web app"), &[]).await;
        assert!(suggestions.iter().all(|s| s.session_id == "s1"));
    }

    #[tokio::test]
    async fn suggest_reusable_patterns_excludes_patterns_already_in_the_current_spec() {
        let dir = TempDir::new().unwrap();
        let memory = BuildMemory::open(dir.path().join("memory.json")).await.unwrap();
        let mut record = sample_record("s1", "Build a counter web app", true);
        record.skills_used = vec!["routing helper".to_string()];
        memory.record_run(record).await.unwrap();

        let suggestions = memory
            .suggest_reusable_patterns(&goal_keywords("Build a counter web app"), &["Routing Helper".to_string()])
            .await;
        assert!(suggestions.is_empty());
    }

    #[tokio::test]
    async fn suggest_reusable_patterns_caps_at_four() {
        let dir = TempDir::new().unwrap();
        let memory = BuildMemory::open(dir.path().join("memory.json")).await.unwrap();
        for i in 0..6 {
            let mut record = sample_record(&format!("s{i}"), "Build a counter web app with increment button", true);
            record.skills_used = vec![format!("pattern {i}")];
            memory.record_run(record).await.unwrap();
        }
        let suggestions =
            memory.suggest_reusable_patterns(&goal_keywords("Build a counter web app with increment button"), &[]).await;
        assert!(suggestions.len() <= 4);
    }
}
