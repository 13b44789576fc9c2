//! Context Manager (spec §4.5): per-task predecessor summaries capped at a
//! configurable word budget, injected into successor prompts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use elisa_core::config::write_atomic;
use tokio::sync::RwLock;

pub const DEFAULT_WORD_BUDGET: usize = 2000;

#[derive(Clone)]
pub struct ContextManager {
    root: PathBuf,
    word_budget: usize,
    summaries: Arc<RwLock<HashMap<String, String>>>,
}

impl ContextManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_word_budget(root, DEFAULT_WORD_BUDGET)
    }

    pub fn with_word_budget(root: impl Into<PathBuf>, word_budget: usize) -> Self {
        Self { root: root.into(), word_budget, summaries: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Text block to inject into a task's prompt: the successor-visible
    /// summaries of its direct predecessors, concatenated and truncated to
    /// the word budget.
    pub async fn context_for(&self, predecessor_ids: &[String]) -> String {
        let summaries = self.summaries.read().await;
        let mut words_used = 0usize;
        let mut blocks = Vec::new();
        for id in predecessor_ids {
            let Some(summary) = summaries.get(id) else { continue };
            let words: Vec<&str> = summary.split_whitespace().collect();
            if words_used >= self.word_budget {
                break;
            }
            let remaining = self.word_budget - words_used;
            let taken: Vec<&str> = words.into_iter().take(remaining).collect();
            words_used += taken.len();
            blocks.push(format!("### {id}\n{}", taken.join(" ")));
        }
        blocks.join("\n\n")
    }

    /// Records a task's result summary, writes `comms/<taskId>_summary.md`,
    /// and atomically updates `context/nugget_context.md`.
    pub async fn record_result(&self, task_id: &str, summary: String) -> anyhow::Result<()> {
        self.summaries.write().await.insert(task_id.to_string(), summary.clone());

        let comms_path = self.elisa_dir().join("comms").join(format!("{task_id}_summary.md"));
        if let Some(parent) = comms_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&comms_path, &summary).await?;

        let nugget_path = self.elisa_dir().join("context").join("nugget_context.md");
        let rendered = self.render_nugget_context().await;
        write_atomic(&nugget_path, rendered.as_bytes()).await?;
        Ok(())
    }

    async fn render_nugget_context(&self) -> String {
        let summaries = self.summaries.read().await;
        let mut ids: Vec<&String> = summaries.keys().collect();
        ids.sort();
        ids.into_iter()
            .map(|id| format!("## {id}\n{}", summaries.get(id).cloned().unwrap_or_default()))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn elisa_dir(&self) -> PathBuf {
        self.root.join(".elisa")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn record_result_writes_comms_file() {
        let dir = TempDir::new().unwrap();
        let manager = ContextManager::new(dir.path());
        manager.record_result("t1", "built the widget".to_string()).await.unwrap();
        let path = dir.path().join(".elisa/comms/t1_summary.md");
        assert_eq!(tokio::fs::read_to_string(path).await.unwrap(), "built the widget");
    }

    #[tokio::test]
    async fn context_for_concatenates_predecessor_summaries() {
        let dir = TempDir::new().unwrap();
        let manager = ContextManager::new(dir.path());
        manager.record_result("a", "alpha summary".to_string()).await.unwrap();
        manager.record_result("b", "beta summary".to_string()).await.unwrap();
        let ctx = manager.context_for(&["a".to_string(), "b".to_string()]).await;
        assert!(ctx.contains("alpha summary"));
        assert!(ctx.contains("beta summary"));
    }

    #[tokio::test]
    async fn context_for_respects_word_budget() {
        let dir = TempDir::new().unwrap();
        let manager = ContextManager::with_word_budget(dir.path(), 3);
        manager.record_result("a", "one two three four five".to_string()).await.unwrap();
        let ctx = manager.context_for(&["a".to_string()]).await;
        assert_eq!(ctx.split_whitespace().filter(|w| !w.starts_with('#')).count(), 3);
    }

    #[tokio::test]
    async fn nugget_context_updates_atomically() {
        let dir = TempDir::new().unwrap();
        let manager = ContextManager::new(dir.path());
        manager.record_result("a", "first".to_string()).await.unwrap();
        let content = tokio::fs::read_to_string(dir.path().join(".elisa/context/nugget_context.md"))
            .await
            .unwrap();
        assert!(content.contains("first"));
    }
}
