//! Workspace Manager (spec §4.2): provisions the jailed directory `W`,
//! performs clean-vs-continue resets, and runs stale-metadata cleanup
//! before each build and each agent dispatch.

use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use elisa_types::RestartMode;
use ignore::WalkBuilder;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Subdirectories rebuilt on every stale-metadata cleanup. Never `logs/`,
/// `src/`, `tests/`, or the design files.
const METADATA_DIRS: &[&str] = &["comms", "context", "status"];

const DESIGN_FILES: &[&str] = &[
    "workspace.json",
    "skills.json",
    "rules.json",
    "portals.json",
    "nugget.json",
];

const WALK_NODE_CAP: usize = 8_000;
const SKIPPED_ENTRIES: &[&str] = &[".git", "node_modules"];

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("PATH_ESCAPE: `{0}` escapes working directory")]
    PathEscape(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceInspection {
    pub exists: bool,
    pub is_empty: bool,
    pub file_count: usize,
    pub src_file_count: usize,
    pub test_file_count: usize,
    pub has_git: bool,
    pub top_files: Vec<String>,
}

#[derive(Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every boundary-crossing path argument must resolve inside `W`.
    pub fn validate_path(&self, candidate: &str) -> Result<PathBuf, WorkspaceError> {
        let joined = if Path::new(candidate).is_absolute() {
            PathBuf::from(candidate)
        } else {
            self.root.join(candidate)
        };
        let mut normalized = PathBuf::new();
        for component in joined.components() {
            match component {
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(WorkspaceError::PathEscape(candidate.to_string()));
                    }
                }
                Component::CurDir => {}
                other => normalized.push(other),
            }
        }
        if !normalized.starts_with(&self.root) {
            return Err(WorkspaceError::PathEscape(candidate.to_string()));
        }
        Ok(normalized)
    }

    /// Provisions `W` if absent, honoring `continue` (preserve everything)
    /// vs `clean` (remove generated sources/tests and metadata, keep logs
    /// and design files). Returns `true` the first time `W` is created for
    /// this session, callers use that to emit `workspace_created` once.
    pub async fn provision(&self, mode: RestartMode) -> Result<bool, WorkspaceError> {
        let already_existed = tokio::fs::metadata(&self.root).await.is_ok();
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::create_dir_all(self.elisa_dir()).await?;
        tokio::fs::create_dir_all(self.elisa_dir().join("logs")).await?;

        if already_existed && mode == RestartMode::Clean {
            self.remove_if_exists(self.root.join("src")).await?;
            self.remove_if_exists(self.root.join("tests")).await?;
            for dir in METADATA_DIRS {
                self.remove_if_exists(self.elisa_dir().join(dir)).await?;
            }
        }

        self.ensure_metadata_dirs().await?;
        Ok(!already_existed)
    }

    /// Removes and recreates `comms/`, `context/`, `status/` under
    /// `.elisa`. Run before each build and before each agent dispatch.
    pub async fn stale_metadata_cleanup(&self) -> Result<(), WorkspaceError> {
        for dir in METADATA_DIRS {
            self.remove_if_exists(self.elisa_dir().join(dir)).await?;
        }
        self.ensure_metadata_dirs().await
    }

    async fn ensure_metadata_dirs(&self) -> Result<(), WorkspaceError> {
        for dir in METADATA_DIRS {
            tokio::fs::create_dir_all(self.elisa_dir().join(dir)).await?;
        }
        Ok(())
    }

    async fn remove_if_exists(&self, path: PathBuf) -> Result<(), WorkspaceError> {
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn elisa_dir(&self) -> PathBuf {
        self.root.join(".elisa")
    }

    pub fn design_file_paths(&self) -> Vec<PathBuf> {
        DESIGN_FILES.iter().map(|f| self.root.join(f)).collect()
    }

    /// Bounded walk of up to 8,000 nodes, skipping `.git`, `node_modules`,
    /// and anything under `.elisa*`.
    pub async fn inspect(&self) -> WorkspaceInspection {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || inspect_blocking(&root))
            .await
            .unwrap_or_else(|_| WorkspaceInspection {
                exists: false,
                is_empty: true,
                file_count: 0,
                src_file_count: 0,
                test_file_count: 0,
                has_git: false,
                top_files: Vec::new(),
            })
    }

    /// One entry per existing source file, each a `path: <signatures>` line
    /// of extracted function/class signatures (spec §4.6). Empty when `W`
    /// has no source files yet, so the prompt assembler omits the section.
    pub async fn structural_digest(&self) -> Vec<String> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || structural_digest_blocking(&root)).await.unwrap_or_default()
    }
}

fn signature_regexes() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // Rust: fn/pub fn, struct, enum, trait, impl headers.
            r"^\s*(pub(\([^)]*\))?\s+)?(async\s+)?fn\s+\w+[^{;]*[{;]",
            r"^\s*(pub(\([^)]*\))?\s+)?(struct|enum|trait)\s+\w+",
            r"^\s*impl(\s*<[^>]*>)?\s+[\w:]+",
            // TypeScript/JavaScript: function/class/export declarations.
            r"^\s*(export\s+)?(default\s+)?(async\s+)?function\s+\w+[^{]*",
            r"^\s*(export\s+)?(default\s+)?class\s+\w+",
            // Python: def/class.
            r"^\s*def\s+\w+\([^)]*\)\s*(->\s*[\w\[\], ]+)?:",
            r"^\s*class\s+\w+",
            // Go: func declarations.
            r"^\s*func\s+(\([^)]*\)\s+)?\w+\([^)]*\)[^{]*",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static signature pattern is valid"))
        .collect()
    })
}

fn structural_digest_blocking(root: &Path) -> Vec<String> {
    let mut digest = Vec::new();
    for sub in ["src", "tests"] {
        let dir = root.join(sub);
        if !dir.exists() {
            continue;
        }
        let walker = WalkBuilder::new(&dir).hidden(false).build();
        for entry in walker.flatten() {
            if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
                continue;
            }
            let path = entry.path();
            let Ok(contents) = std::fs::read_to_string(path) else { continue };
            let signatures: Vec<String> = contents
                .lines()
                .filter(|line| signature_regexes().iter().any(|re| re.is_match(line)))
                .map(|line| line.trim().to_string())
                .collect();
            if signatures.is_empty() {
                continue;
            }
            let relative = path.strip_prefix(root).unwrap_or(path).to_string_lossy().to_string();
            digest.push(format!("{relative}: {}", signatures.join(" | ")));
        }
    }
    digest
}

fn inspect_blocking(root: &Path) -> WorkspaceInspection {
    if !root.exists() {
        return WorkspaceInspection {
            exists: false,
            is_empty: true,
            file_count: 0,
            src_file_count: 0,
            test_file_count: 0,
            has_git: false,
            top_files: Vec::new(),
        };
    }

    let mut file_count = 0usize;
    let mut src_file_count = 0usize;
    let mut test_file_count = 0usize;
    let mut top_files = Vec::new();
    let mut visited = 0usize;
    let has_git = root.join(".git").exists();

    let walker = WalkBuilder::new(root)
        .hidden(false)
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            !SKIPPED_ENTRIES.contains(&name.as_str()) && !name.starts_with(".elisa")
        })
        .build();

    for entry in walker.flatten() {
        visited += 1;
        if visited > WALK_NODE_CAP {
            break;
        }
        if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }
        file_count += 1;
        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .to_string();
        if relative.starts_with("src/") {
            src_file_count += 1;
        }
        if relative.starts_with("tests/") {
            test_file_count += 1;
        }
        if top_files.len() < 50 {
            top_files.push(relative);
        }
    }

    WorkspaceInspection {
        exists: true,
        is_empty: file_count == 0,
        file_count,
        src_file_count,
        test_file_count,
        has_git,
        top_files,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn provision_creates_metadata_dirs() {
        let dir = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(dir.path());
        let created = manager.provision(RestartMode::Continue).await.unwrap();
        assert!(created);
        for sub in METADATA_DIRS {
            assert!(manager.elisa_dir().join(sub).exists());
        }
    }

    #[tokio::test]
    async fn clean_mode_removes_src_and_tests_but_keeps_logs_and_design_files() {
        let dir = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(dir.path());
        manager.provision(RestartMode::Continue).await.unwrap();
        tokio::fs::create_dir_all(dir.path().join("src")).await.unwrap();
        tokio::fs::write(dir.path().join("src/main.rs"), "fn main(){}").await.unwrap();
        tokio::fs::write(manager.elisa_dir().join("logs/session-1.log"), "{}").await.unwrap();
        tokio::fs::write(dir.path().join("workspace.json"), "{}").await.unwrap();

        manager.provision(RestartMode::Clean).await.unwrap();

        assert!(!dir.path().join("src").exists());
        assert!(manager.elisa_dir().join("logs/session-1.log").exists());
        assert!(dir.path().join("workspace.json").exists());
    }

    #[tokio::test]
    async fn stale_metadata_cleanup_does_not_touch_src() {
        let dir = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(dir.path());
        manager.provision(RestartMode::Continue).await.unwrap();
        tokio::fs::create_dir_all(dir.path().join("src")).await.unwrap();
        tokio::fs::write(dir.path().join("src/keep.rs"), "x").await.unwrap();
        tokio::fs::write(manager.elisa_dir().join("comms/a.md"), "x").await.unwrap();

        manager.stale_metadata_cleanup().await.unwrap();

        assert!(dir.path().join("src/keep.rs").exists());
        assert!(!manager.elisa_dir().join("comms/a.md").exists());
    }

    #[test]
    fn validate_path_rejects_escape() {
        let manager = WorkspaceManager::new("/tmp/elisa-ws");
        assert!(manager.validate_path("../../etc/passwd").is_err());
        assert!(manager.validate_path("src/main.rs").is_ok());
    }

    #[tokio::test]
    async fn structural_digest_extracts_signatures_and_is_empty_with_no_sources() {
        let dir = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(dir.path());
        assert!(manager.structural_digest().await.is_empty());

        tokio::fs::create_dir_all(dir.path().join("src")).await.unwrap();
        tokio::fs::write(
            dir.path().join("src/counter.rs"),
            "pub struct Counter { value: i32 }\n\nimpl Counter {\n    pub fn increment(&mut self) {\n        self.value += 1;\n    }\n}\n",
        )
        .await
        .unwrap();

        let digest = manager.structural_digest().await;
        assert_eq!(digest.len(), 1);
        assert!(digest[0].starts_with("src/counter.rs: "));
        assert!(digest[0].contains("pub struct Counter"));
        assert!(digest[0].contains("pub fn increment"));
    }

    #[tokio::test]
    async fn inspect_reports_counts() {
        let dir = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(dir.path());
        tokio::fs::create_dir_all(dir.path().join("src")).await.unwrap();
        tokio::fs::write(dir.path().join("src/a.rs"), "x").await.unwrap();
        let inspection = manager.inspect().await;
        assert!(inspection.exists);
        assert_eq!(inspection.src_file_count, 1);
    }
}
