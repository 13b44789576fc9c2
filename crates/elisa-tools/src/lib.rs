//! The Tool Sandbox (spec §4.8): a fixed allowlist of file/search/shell
//! tools an agent dispatch may call, every path argument jailed to the
//! session's workspace root.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
    #[serde(default)]
    pub metadata: Value,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self { success: true, output: output.into(), metadata: json!({}) }
    }

    pub fn err(output: impl Into<String>) -> Self {
        Self { success: false, output: output.into(), metadata: json!({}) }
    }
}

/// Emitted alongside `tool_use`/`tool_result` events and appended to the
/// dispatcher's per-turn message history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub arguments: Value,
    pub result: ToolResult,
}

const MAX_TOOL_OUTPUT_CHARS: usize = 10_000;
const TRUNCATION_MARKER: &str = "\n[Output truncated]";
const DEFAULT_BASH_TIMEOUT: Duration = Duration::from_secs(30);

pub fn truncate_output(output: String) -> String {
    if output.chars().count() <= MAX_TOOL_OUTPUT_CHARS {
        return output;
    }
    let truncated: String = output.chars().take(MAX_TOOL_OUTPUT_CHARS).collect();
    format!("{truncated}{TRUNCATION_MARKER}")
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("PATH_ESCAPE: `{0}` escapes working directory")]
    PathEscape(String),
    #[error("String not found in file")]
    StringNotFound,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;
    async fn execute(&self, root: &Path, args: Value, cancel: CancellationToken) -> ToolResult;
}

/// Resolves a path argument against the jailed root `W`, lexically —
/// `W` need not exist on disk for `Write` to target a new file. Resolution
/// outside `W` fails with `PATH_ESCAPE` (spec §4.2, §8 jail invariant).
pub fn resolve_in_jail(root: &Path, candidate: &str) -> Result<PathBuf, SandboxError> {
    let joined = if Path::new(candidate).is_absolute() {
        PathBuf::from(candidate)
    } else {
        root.join(candidate)
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(SandboxError::PathEscape(candidate.to_string()));
                }
            }
            Component::CurDir => {}
            other => normalized.push(other),
        }
    }

    if !normalized.starts_with(root) {
        return Err(SandboxError::PathEscape(candidate.to_string()));
    }
    Ok(normalized)
}

fn denied(err: SandboxError) -> ToolResult {
    ToolResult::err(err.to_string())
}

// --- Read --------------------------------------------------------------

pub struct ReadTool;

#[async_trait]
impl Tool for ReadTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "Read".to_string(),
            description: "Read a file's contents, optionally a line range".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "file_path": {"type": "string"},
                    "offset": {"type": "integer"},
                    "limit": {"type": "integer"},
                },
                "required": ["file_path"],
            }),
        }
    }

    async fn execute(&self, root: &Path, args: Value, _cancel: CancellationToken) -> ToolResult {
        let file_path = args["file_path"].as_str().unwrap_or("");
        let path = match resolve_in_jail(root, file_path) {
            Ok(p) => p,
            Err(e) => return denied(e),
        };
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) => return ToolResult::err(format!("failed to read {}: {e}", path.display())),
        };
        let offset = args["offset"].as_u64().unwrap_or(0) as usize;
        let limit = args["limit"].as_u64().map(|l| l as usize);
        let lines: Vec<&str> = content.lines().collect();
        let slice = lines
            .iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .enumerate()
            .map(|(i, line)| format!("{:>6}\t{}", offset + i + 1, line))
            .collect::<Vec<_>>()
            .join("\n");
        ToolResult::ok(slice)
    }
}

// --- Write ---------------------------------------------------------------

pub struct WriteTool;

#[async_trait]
impl Tool for WriteTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "Write".to_string(),
            description: "Write content to a file, creating parent directories as needed"
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "file_path": {"type": "string"},
                    "content": {"type": "string"},
                },
                "required": ["file_path", "content"],
            }),
        }
    }

    async fn execute(&self, root: &Path, args: Value, _cancel: CancellationToken) -> ToolResult {
        let file_path = args["file_path"].as_str().unwrap_or("");
        let content = args["content"].as_str().unwrap_or("");
        let path = match resolve_in_jail(root, file_path) {
            Ok(p) => p,
            Err(e) => return denied(e),
        };
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ToolResult::err(format!("failed to create parent directories: {e}"));
            }
        }
        match tokio::fs::write(&path, content).await {
            Ok(()) => ToolResult::ok(format!("wrote {} bytes to {}", content.len(), path.display())),
            Err(e) => ToolResult::err(format!("failed to write {}: {e}", path.display())),
        }
    }
}

// --- Edit ------------------------------------------------------------------

pub struct EditTool;

#[async_trait]
impl Tool for EditTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "Edit".to_string(),
            description: "Replace an exact substring match in a file".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "file_path": {"type": "string"},
                    "old_string": {"type": "string"},
                    "new_string": {"type": "string"},
                },
                "required": ["file_path", "old_string", "new_string"],
            }),
        }
    }

    async fn execute(&self, root: &Path, args: Value, _cancel: CancellationToken) -> ToolResult {
        let file_path = args["file_path"].as_str().unwrap_or("");
        let old_string = args["old_string"].as_str().unwrap_or("");
        let new_string = args["new_string"].as_str().unwrap_or("");
        let path = match resolve_in_jail(root, file_path) {
            Ok(p) => p,
            Err(e) => return denied(e),
        };
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) => return ToolResult::err(format!("failed to read {}: {e}", path.display())),
        };
        match apply_single_edit(&content, old_string, new_string) {
            Ok(updated) => match tokio::fs::write(&path, updated).await {
                Ok(()) => ToolResult::ok(format!("edited {}", path.display())),
                Err(e) => ToolResult::err(format!("failed to write {}: {e}", path.display())),
            },
            Err(e) => denied(e),
        }
    }
}

fn apply_single_edit(content: &str, old: &str, new: &str) -> Result<String, SandboxError> {
    if !content.contains(old) {
        return Err(SandboxError::StringNotFound);
    }
    Ok(content.replacen(old, new, 1))
}

// --- MultiEdit ---------------------------------------------------------

pub struct MultiEditTool;

#[async_trait]
impl Tool for MultiEditTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "MultiEdit".to_string(),
            description: "Apply a sequence of exact-substring edits to a file; the first missing match fails the whole call".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "file_path": {"type": "string"},
                    "edits": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "old_string": {"type": "string"},
                                "new_string": {"type": "string"},
                            },
                            "required": ["old_string", "new_string"],
                        },
                    },
                },
                "required": ["file_path", "edits"],
            }),
        }
    }

    async fn execute(&self, root: &Path, args: Value, _cancel: CancellationToken) -> ToolResult {
        let file_path = args["file_path"].as_str().unwrap_or("");
        let path = match resolve_in_jail(root, file_path) {
            Ok(p) => p,
            Err(e) => return denied(e),
        };
        let mut content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) => return ToolResult::err(format!("failed to read {}: {e}", path.display())),
        };
        let edits = args["edits"].as_array().cloned().unwrap_or_default();
        for (idx, edit) in edits.iter().enumerate() {
            let old = edit["old_string"].as_str().unwrap_or("");
            let new = edit["new_string"].as_str().unwrap_or("");
            match apply_single_edit(&content, old, new) {
                Ok(updated) => content = updated,
                Err(_) => {
                    return ToolResult::err(format!(
                        "String not found in file (edit {} of {})",
                        idx + 1,
                        edits.len()
                    ))
                }
            }
        }
        match tokio::fs::write(&path, content).await {
            Ok(()) => ToolResult::ok(format!("applied {} edits to {}", edits.len(), path.display())),
            Err(e) => ToolResult::err(format!("failed to write {}: {e}", path.display())),
        }
    }
}

// --- Glob --------------------------------------------------------------

pub struct GlobTool;

#[async_trait]
impl Tool for GlobTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "Glob".to_string(),
            description: "Find files under the workspace matching a glob pattern".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string"},
                    "path": {"type": "string"},
                },
                "required": ["pattern"],
            }),
        }
    }

    async fn execute(&self, root: &Path, args: Value, _cancel: CancellationToken) -> ToolResult {
        let pattern = args["pattern"].as_str().unwrap_or("*");
        let base = match resolve_in_jail(root, args["path"].as_str().unwrap_or(".")) {
            Ok(p) => p,
            Err(e) => return denied(e),
        };
        let full_pattern = base.join(pattern);
        let Some(pattern_str) = full_pattern.to_str() else {
            return ToolResult::err("pattern is not valid UTF-8".to_string());
        };
        let entries = match glob::glob(pattern_str) {
            Ok(e) => e,
            Err(e) => return ToolResult::err(format!("invalid glob pattern: {e}")),
        };
        let mut matches = Vec::new();
        for entry in entries.flatten() {
            if entry.starts_with(root) {
                matches.push(entry.display().to_string());
            }
            if matches.len() >= 200 {
                break;
            }
        }
        matches.sort();
        ToolResult::ok(matches.join("\n"))
    }
}

// --- Grep ----------------------------------------------------------------

pub struct GrepTool;

#[async_trait]
impl Tool for GrepTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "Grep".to_string(),
            description: "Regex search over files under the workspace".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string"},
                    "path": {"type": "string"},
                    "glob": {"type": "string"},
                },
                "required": ["pattern"],
            }),
        }
    }

    async fn execute(&self, root: &Path, args: Value, _cancel: CancellationToken) -> ToolResult {
        let pattern = args["pattern"].as_str().unwrap_or("");
        let base = match resolve_in_jail(root, args["path"].as_str().unwrap_or(".")) {
            Ok(p) => p,
            Err(e) => return denied(e),
        };
        let regex = match Regex::new(pattern) {
            Ok(r) => r,
            Err(e) => return ToolResult::err(format!("invalid regex: {e}")),
        };
        let glob_filter = args["glob"].as_str().map(|g| g.to_string());

        let mut hits = Vec::new();
        for entry in ignore::WalkBuilder::new(&base).hidden(false).build().flatten() {
            if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
                continue;
            }
            let path = entry.path();
            if let Some(filter) = &glob_filter {
                if let Ok(pat) = glob::Pattern::new(filter) {
                    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                    if !pat.matches(name) {
                        continue;
                    }
                }
            }
            let Ok(content) = tokio::fs::read_to_string(path).await else { continue };
            for (idx, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    hits.push(format!("{}:{}:{}", path.display(), idx + 1, line));
                    if hits.len() >= 200 {
                        return ToolResult::ok(hits.join("\n"));
                    }
                }
            }
        }
        ToolResult::ok(hits.join("\n"))
    }
}

// --- LS ----------------------------------------------------------------

pub struct LsTool;

#[async_trait]
impl Tool for LsTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "LS".to_string(),
            description: "List the entries of a directory under the workspace".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
            }),
        }
    }

    async fn execute(&self, root: &Path, args: Value, _cancel: CancellationToken) -> ToolResult {
        let path = match resolve_in_jail(root, args["path"].as_str().unwrap_or(".")) {
            Ok(p) => p,
            Err(e) => return denied(e),
        };
        let mut entries = match tokio::fs::read_dir(&path).await {
            Ok(r) => r,
            Err(e) => return ToolResult::err(format!("failed to list {}: {e}", path.display())),
        };
        let mut names = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let suffix = if entry.path().is_dir() { "/" } else { "" };
            names.push(format!("{}{suffix}", entry.file_name().to_string_lossy()));
        }
        names.sort();
        ToolResult::ok(names.join("\n"))
    }
}

// --- Bash ----------------------------------------------------------------

pub struct BashTool;

/// Commands rejected outright (spec §4.8): network clients, remote VCS
/// writes, package installers, and anything that would leak the stripped
/// environment back out.
fn blocklist_patterns() -> &'static [(&'static str, &'static str)] {
    &[
        (r"(?i)\b(curl|wget|ssh|scp)\b", "network client"),
        (r"(?i)git\s+push", "remote VCS write"),
        (r"(?i)git\s+remote", "remote VCS write"),
        (r"(?i)\b(pip|pip3)\s+install\b", "package installer"),
        (r"(?i)\bnpm\s+install\b", "package installer"),
        (r"(?i)\b(env|printenv|export)\b", "environment leakage"),
        (r"\$\{?[A-Za-z_][A-Za-z0-9_]*\}?", "environment leakage"),
    ]
}

pub fn check_bash_blocklist(command: &str) -> Option<String> {
    for (pattern, reason) in blocklist_patterns() {
        if Regex::new(pattern).ok()?.is_match(command) {
            return Some(format!("Command blocked by security policy: {reason} (`{pattern}`)"));
        }
    }
    None
}

#[async_trait]
impl Tool for BashTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "Bash".to_string(),
            description: "Run a shell command under a jailed, stripped-environment bash -c"
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string"},
                    "timeout_sec": {"type": "integer"},
                },
                "required": ["command"],
            }),
        }
    }

    async fn execute(&self, root: &Path, args: Value, cancel: CancellationToken) -> ToolResult {
        let command = args["command"].as_str().unwrap_or("");
        if let Some(reason) = check_bash_blocklist(command) {
            return ToolResult { success: false, output: reason, metadata: json!({"blocked": true}) };
        }

        let wait = DEFAULT_BASH_TIMEOUT.min(Duration::from_secs(
            args["timeout_sec"].as_u64().unwrap_or(30).max(1),
        ));

        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(command)
            .current_dir(root)
            .env_clear()
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Ok(path_var) = std::env::var("PATH") {
            cmd.env("PATH", path_var);
        }

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => return ToolResult::err(format!("failed to spawn command: {e}")),
        };

        let output = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return ToolResult { success: false, output: "command cancelled".to_string(), metadata: json!({"cancelled": true}) };
            }
            result = timeout(wait, child.wait_with_output()) => result,
        };

        match output {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                let combined = if stderr.is_empty() {
                    stdout.to_string()
                } else {
                    format!("{stdout}\n--- stderr ---\n{stderr}")
                };
                ToolResult {
                    success: output.status.success(),
                    output: combined,
                    metadata: json!({"exit_code": output.status.code()}),
                }
            }
            Ok(Err(e)) => ToolResult::err(format!("command failed: {e}")),
            Err(_) => ToolResult { success: false, output: format!("Command timed out after {}s", wait.as_secs()), metadata: json!({"timed_out": true}) },
        }
    }
}

// --- Notebook tools ------------------------------------------------------

pub struct NotebookReadTool;

#[async_trait]
impl Tool for NotebookReadTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "NotebookRead".to_string(),
            description: "Read the cells of a Jupyter notebook".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {"notebook_path": {"type": "string"}},
                "required": ["notebook_path"],
            }),
        }
    }

    async fn execute(&self, root: &Path, args: Value, _cancel: CancellationToken) -> ToolResult {
        let notebook_path = args["notebook_path"].as_str().unwrap_or("");
        let path = match resolve_in_jail(root, notebook_path) {
            Ok(p) => p,
            Err(e) => return denied(e),
        };
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) => return ToolResult::err(format!("failed to read {}: {e}", path.display())),
        };
        let notebook: Value = match serde_json::from_str(&content) {
            Ok(v) => v,
            Err(e) => return ToolResult::err(format!("invalid notebook JSON: {e}")),
        };
        let cells = notebook["cells"].as_array().cloned().unwrap_or_default();
        let mut rendered = Vec::new();
        for (idx, cell) in cells.iter().enumerate() {
            let cell_type = cell["cell_type"].as_str().unwrap_or("code");
            let source = join_source(&cell["source"]);
            rendered.push(format!("[{idx}] ({cell_type})\n{source}"));
        }
        ToolResult::ok(rendered.join("\n\n"))
    }
}

fn join_source(value: &Value) -> String {
    match value {
        Value::Array(lines) => lines.iter().filter_map(|l| l.as_str()).collect::<Vec<_>>().join(""),
        Value::String(s) => s.clone(),
        _ => String::new(),
    }
}

pub struct NotebookEditTool;

#[async_trait]
impl Tool for NotebookEditTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "NotebookEdit".to_string(),
            description: "Replace the source of one cell in a Jupyter notebook".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "notebook_path": {"type": "string"},
                    "cell_index": {"type": "integer"},
                    "new_source": {"type": "string"},
                },
                "required": ["notebook_path", "cell_index", "new_source"],
            }),
        }
    }

    async fn execute(&self, root: &Path, args: Value, _cancel: CancellationToken) -> ToolResult {
        let notebook_path = args["notebook_path"].as_str().unwrap_or("");
        let path = match resolve_in_jail(root, notebook_path) {
            Ok(p) => p,
            Err(e) => return denied(e),
        };
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) => return ToolResult::err(format!("failed to read {}: {e}", path.display())),
        };
        let mut notebook: Value = match serde_json::from_str(&content) {
            Ok(v) => v,
            Err(e) => return ToolResult::err(format!("invalid notebook JSON: {e}")),
        };
        let cell_index = args["cell_index"].as_u64().unwrap_or(0) as usize;
        let new_source = args["new_source"].as_str().unwrap_or("");
        let Some(cell) = notebook["cells"].get_mut(cell_index) else {
            return ToolResult::err(format!("cell index {cell_index} out of range"));
        };
        cell["source"] = json!(new_source);
        let serialized = match serde_json::to_string_pretty(&notebook) {
            Ok(s) => s,
            Err(e) => return ToolResult::err(format!("failed to serialize notebook: {e}")),
        };
        match tokio::fs::write(&path, serialized).await {
            Ok(()) => ToolResult::ok(format!("updated cell {cell_index} of {}", path.display())),
            Err(e) => ToolResult::err(format!("failed to write {}: {e}", path.display())),
        }
    }
}

// --- Registry ------------------------------------------------------------

/// Executes the fixed allowlist of tools against one jailed workspace root.
/// One sandbox per dispatch's working directory.
#[derive(Clone)]
pub struct ToolSandbox {
    root: PathBuf,
}

impl ToolSandbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn tool_for(name: &str) -> Option<Box<dyn Tool>> {
        match name {
            "Read" => Some(Box::new(ReadTool)),
            "Write" => Some(Box::new(WriteTool)),
            "Edit" => Some(Box::new(EditTool)),
            "MultiEdit" => Some(Box::new(MultiEditTool)),
            "Glob" => Some(Box::new(GlobTool)),
            "Grep" => Some(Box::new(GrepTool)),
            "LS" => Some(Box::new(LsTool)),
            "Bash" => Some(Box::new(BashTool)),
            "NotebookRead" => Some(Box::new(NotebookReadTool)),
            "NotebookEdit" => Some(Box::new(NotebookEditTool)),
            _ => None,
        }
    }

    pub fn all_schemas() -> Vec<ToolSchema> {
        [
            "Read", "Write", "Edit", "MultiEdit", "Glob", "Grep", "LS", "Bash", "NotebookRead",
            "NotebookEdit",
        ]
        .iter()
        .filter_map(|name| Self::tool_for(name))
        .map(|tool| tool.schema())
        .collect()
    }

    pub fn schemas_for(&self, allowed: &[String]) -> Vec<ToolSchema> {
        Self::all_schemas()
            .into_iter()
            .filter(|schema| allowed.iter().any(|a| a == &schema.name))
            .collect()
    }

    /// Executes one tool call, always returning a `ToolResult` — an unknown
    /// tool name or a sandbox violation becomes an error result, never a
    /// propagated `Err`, since the caller feeds this straight back to the
    /// model as a tool message.
    pub async fn execute(&self, name: &str, args: Value, cancel: CancellationToken) -> ToolResult {
        let Some(tool) = Self::tool_for(name) else {
            return ToolResult::err(format!("Unknown tool: {name}"));
        };
        let mut result = tool.execute(&self.root, args, cancel).await;
        result.output = truncate_output(result.output);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sandbox() -> (TempDir, ToolSandbox) {
        let dir = TempDir::new().unwrap();
        let sandbox = ToolSandbox::new(dir.path());
        (dir, sandbox)
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (_dir, sandbox) = sandbox();
        let cancel = CancellationToken::new();
        sandbox
            .execute("Write", json!({"file_path": "src/main.rs", "content": "fn main() {}"}), cancel.clone())
            .await;
        let result = sandbox.execute("Read", json!({"file_path": "src/main.rs"}), cancel).await;
        assert!(result.success);
        assert!(result.output.contains("fn main()"));
    }

    #[tokio::test]
    async fn path_escape_is_rejected() {
        let (_dir, sandbox) = sandbox();
        let cancel = CancellationToken::new();
        let result = sandbox.execute("Read", json!({"file_path": "../../etc/passwd"}), cancel).await;
        assert!(!result.success);
        assert!(result.output.contains("PATH_ESCAPE") || result.output.contains("escapes working directory"));
    }

    #[tokio::test]
    async fn edit_requires_exact_match() {
        let (_dir, sandbox) = sandbox();
        let cancel = CancellationToken::new();
        sandbox
            .execute("Write", json!({"file_path": "a.txt", "content": "hello world"}), cancel.clone())
            .await;
        let result = sandbox
            .execute("Edit", json!({"file_path": "a.txt", "old_string": "goodbye", "new_string": "hi"}), cancel)
            .await;
        assert!(!result.success);
        assert_eq!(result.output, "String not found in file");
    }

    #[tokio::test]
    async fn multi_edit_fails_whole_call_on_first_missing_match() {
        let (_dir, sandbox) = sandbox();
        let cancel = CancellationToken::new();
        sandbox
            .execute("Write", json!({"file_path": "a.txt", "content": "alpha beta"}), cancel.clone())
            .await;
        let result = sandbox
            .execute(
                "MultiEdit",
                json!({
                    "file_path": "a.txt",
                    "edits": [
                        {"old_string": "alpha", "new_string": "ALPHA"},
                        {"old_string": "missing", "new_string": "x"},
                    ],
                }),
                cancel.clone(),
            )
            .await;
        assert!(!result.success);
        let unchanged = sandbox.execute("Read", json!({"file_path": "a.txt"}), cancel).await;
        // first edit partially applied to file not rewritten since write happens after full loop
        assert!(unchanged.output.contains("alpha beta"));
    }

    #[tokio::test]
    async fn bash_blocklist_rejects_curl() {
        let (_dir, sandbox) = sandbox();
        let cancel = CancellationToken::new();
        let result = sandbox
            .execute("Bash", json!({"command": "curl http://example.com"}), cancel)
            .await;
        assert!(!result.success);
        assert!(result.output.starts_with("Command blocked by security policy"));
    }

    #[tokio::test]
    async fn bash_blocklist_rejects_env_var_expansion() {
        let (_dir, sandbox) = sandbox();
        let cancel = CancellationToken::new();
        let result = sandbox.execute("Bash", json!({"command": "echo $HOME"}), cancel).await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn bash_runs_allowed_commands() {
        let (_dir, sandbox) = sandbox();
        let cancel = CancellationToken::new();
        let result = sandbox.execute("Bash", json!({"command": "echo hi"}), cancel).await;
        assert!(result.success);
        assert!(result.output.contains("hi"));
    }

    #[tokio::test]
    async fn glob_only_returns_matches_inside_jail() {
        let (_dir, sandbox) = sandbox();
        let cancel = CancellationToken::new();
        sandbox
            .execute("Write", json!({"file_path": "src/lib.rs", "content": "pub fn x() {}"}), cancel.clone())
            .await;
        let result = sandbox.execute("Glob", json!({"pattern": "src/*.rs"}), cancel).await;
        assert!(result.output.contains("lib.rs"));
    }

    #[test]
    fn truncate_output_adds_marker_past_limit() {
        let long = "a".repeat(MAX_TOOL_OUTPUT_CHARS + 10);
        let truncated = truncate_output(long);
        assert!(truncated.ends_with("[Output truncated]"));
    }
}
