//! `GitVersionStore` (spec §4.3, SPEC_FULL §2): a `git`-CLI-backed
//! implementation of the Version Store capability, shelling to the system
//! `git` binary the way the runtime already does for MCP stdio transports.

use std::path::{Path, PathBuf};

use chrono::Utc;
use elisa_types::CommitRecord;
use tokio::process::Command;

const IGNORED_PATHS: &[&str] = &[".elisa/logs/", ".elisa/status/", "*.tmp", "*.cache"];

#[derive(Clone)]
pub struct GitVersionStore;

impl GitVersionStore {
    pub fn new() -> Self {
        Self
    }

    /// Idempotent: writes `.gitignore` for transient build state, seeds a
    /// README when absent, and creates the initial commit iff something
    /// was staged.
    pub async fn init_repo(&self, path: &Path, goal: &str) -> anyhow::Result<()> {
        if !path.join(".git").exists() {
            run_git(path, &["init"]).await?;
        }

        let gitignore = path.join(".gitignore");
        if !gitignore.exists() {
            tokio::fs::write(&gitignore, IGNORED_PATHS.join("\n") + "\n").await?;
        }

        let readme = path.join("README.md");
        if !readme.exists() {
            tokio::fs::write(&readme, format!("# {goal}\n")).await?;
        }

        run_git(path, &["add", "-A"]).await?;
        if has_staged_changes(path).await? {
            run_git(path, &["commit", "-m", "Initial commit", "--allow-empty-message"]).await?;
        }
        Ok(())
    }

    /// Stages everything under `path` and commits. Returns `None` if
    /// nothing was staged.
    pub async fn commit(
        &self,
        path: &Path,
        message: &str,
        agent_name: &str,
        task_id: &str,
    ) -> anyhow::Result<Option<CommitRecord>> {
        run_git(path, &["add", "-A"]).await?;
        if !has_staged_changes(path).await? {
            return Ok(None);
        }

        let changed_paths = staged_paths(path).await?;
        run_git(path, &["commit", "-m", message]).await?;
        let full_hash = run_git_capture(path, &["rev-parse", "HEAD"]).await?;
        let short_hash = run_git_capture(path, &["rev-parse", "--short", "HEAD"]).await?;

        Ok(Some(CommitRecord {
            hash: full_hash.trim().to_string(),
            short_hash: short_hash.trim().to_string(),
            message: message.to_string(),
            agent_name: agent_name.to_string(),
            task_id: task_id.to_string(),
            timestamp: Utc::now(),
            changed_paths,
        }))
    }

    /// Missing on the first commit (no parent) — returns empty rather
    /// than erroring.
    pub async fn diff_summary(&self, path: &Path, sha: &str) -> anyhow::Result<Vec<String>> {
        let output = Command::new("git")
            .current_dir(path)
            .args(["diff-tree", "--no-commit-id", "--name-only", "-r", sha])
            .output()
            .await?;
        if !output.status.success() {
            return Ok(Vec::new());
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .filter(|l| !l.is_empty())
            .collect())
    }

    pub async fn status(&self, path: &Path) -> anyhow::Result<Vec<String>> {
        let output = run_git_capture(path, &["status", "--porcelain"]).await?;
        Ok(output.lines().map(str::to_string).collect())
    }
}

impl Default for GitVersionStore {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_git(path: &Path, args: &[&str]) -> anyhow::Result<()> {
    let output = Command::new("git").current_dir(path).args(args).output().await?;
    if !output.status.success() {
        anyhow::bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}

async fn run_git_capture(path: &Path, args: &[&str]) -> anyhow::Result<String> {
    let output = Command::new("git").current_dir(path).args(args).output().await?;
    if !output.status.success() {
        anyhow::bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

async fn has_staged_changes(path: &Path) -> anyhow::Result<bool> {
    let output = Command::new("git")
        .current_dir(path)
        .args(["diff", "--cached", "--name-only"])
        .output()
        .await?;
    Ok(!String::from_utf8_lossy(&output.stdout).trim().is_empty())
}

async fn staged_paths(path: &Path) -> anyhow::Result<Vec<String>> {
    let output = Command::new("git")
        .current_dir(path)
        .args(["diff", "--cached", "--name-only"])
        .output()
        .await?;
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::to_string)
        .filter(|l| !l.is_empty())
        .collect())
}

#[allow(dead_code)]
fn state_dir(path: &Path) -> PathBuf {
    path.join(".git")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn has_system_git() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn init_repo_seeds_readme_and_commits() {
        if !has_system_git() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let store = GitVersionStore::new();
        store.init_repo(dir.path(), "a test goal").await.unwrap();
        assert!(dir.path().join("README.md").exists());
        assert!(dir.path().join(".git").exists());
    }

    #[tokio::test]
    async fn commit_returns_none_when_nothing_staged() {
        if !has_system_git() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let store = GitVersionStore::new();
        store.init_repo(dir.path(), "goal").await.unwrap();
        let record = store.commit(dir.path(), "no-op", "builder", "t1").await.unwrap();
        assert!(record.is_none());
    }

    #[tokio::test]
    async fn commit_records_changed_paths() {
        if !has_system_git() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let store = GitVersionStore::new();
        store.init_repo(dir.path(), "goal").await.unwrap();
        tokio::fs::write(dir.path().join("src.txt"), "content").await.unwrap();
        let record = store
            .commit(dir.path(), "add src", "builder", "t1")
            .await
            .unwrap()
            .expect("commit expected");
        assert!(record.changed_paths.iter().any(|p| p == "src.txt"));
        assert_eq!(record.agent_name, "builder");
    }
}
