//! Configuration layering: defaults < `<state_dir>/config.json` < process
//! environment. One constructor (`EngineConfig::from_env`) so every consumer
//! agrees on parsing and defaulting, rather than scattering `std::env::var`
//! calls through the codebase (spec §6, SPEC_FULL §1.3).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

fn default_model() -> String {
    "gpt-5.2".to_string()
}

fn default_fallback_model() -> String {
    "gpt-4.1".to_string()
}

fn default_judge_min_score() -> u32 {
    70
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default = "default_model")]
    pub openai_model: String,
    #[serde(default)]
    pub openai_base_url: Option<String>,
    #[serde(default)]
    pub openai_workshop_code: Option<String>,
    #[serde(default)]
    pub openai_student_id: Option<String>,
    #[serde(default = "default_fallback_model")]
    pub output_limit_fallback_model: String,
    #[serde(default = "default_judge_min_score")]
    pub judge_min_score: u32,
    #[serde(default)]
    pub memory_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            openai_model: default_model(),
            openai_base_url: None,
            openai_workshop_code: None,
            openai_student_id: None,
            output_limit_fallback_model: default_fallback_model(),
            judge_min_score: default_judge_min_score(),
            memory_path: None,
        }
    }
}

impl EngineConfig {
    /// Layers defaults, then `<state_dir>/config.json` if present, then the
    /// process environment (highest precedence). A malformed or missing
    /// config file is treated as empty rather than a hard failure — config
    /// is advisory, the environment is authoritative.
    pub async fn from_env(state_dir: &Path) -> Self {
        let mut config = Self::default();

        let config_path = state_dir.join("config.json");
        if let Ok(bytes) = fs::read(&config_path).await {
            if let Ok(from_file) = serde_json::from_slice::<EngineConfig>(&bytes) {
                config = from_file;
            }
        }

        if let Ok(v) = std::env::var("OPENAI_API_KEY") {
            if !v.trim().is_empty() {
                config.openai_api_key = Some(v);
            }
        }
        if let Ok(v) = std::env::var("OPENAI_MODEL") {
            if !v.trim().is_empty() {
                config.openai_model = v;
            }
        }
        if let Ok(v) = std::env::var("OPENAI_BASE_URL") {
            if !v.trim().is_empty() {
                config.openai_base_url = Some(v);
            }
        }
        if let Ok(v) = std::env::var("OPENAI_WORKSHOP_CODE") {
            if !v.trim().is_empty() {
                config.openai_workshop_code = Some(v);
            }
        }
        if let Ok(v) = std::env::var("OPENAI_STUDENT_ID") {
            if !v.trim().is_empty() {
                config.openai_student_id = Some(v);
            }
        }
        if let Ok(v) = std::env::var("OUTPUT_LIMIT_FALLBACK_MODEL") {
            if !v.trim().is_empty() {
                config.output_limit_fallback_model = v;
            }
        }
        if let Ok(v) = std::env::var("JUDGE_MIN_SCORE") {
            if let Ok(parsed) = v.trim().parse::<u32>() {
                config.judge_min_score = parsed.min(100);
            }
        }
        if let Ok(v) = std::env::var("MEMORY_PATH") {
            if !v.trim().is_empty() {
                config.memory_path = Some(PathBuf::from(v));
            }
        }

        config
    }

    pub fn memory_path_or_default(&self, state_dir: &Path) -> PathBuf {
        self.memory_path
            .clone()
            .unwrap_or_else(|| state_dir.join("build_memory.json"))
    }

    pub fn has_api_key(&self) -> bool {
        self.openai_api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }
}

/// Writes `value` to `path` via temp-file + rename so readers never observe
/// a half-written file. Shared by config persistence and the build-memory
/// store (spec §5 "atomic via temp-file then rename").
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension(format!(
        "{}.tmp-{}",
        path.extension().and_then(|e| e.to_str()).unwrap_or("json"),
        uuid::Uuid::new_v4()
    ));
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn env_overrides_file_and_defaults() {
        std::env::set_var("JUDGE_MIN_SCORE", "55");
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::from_env(dir.path()).await;
        assert_eq!(config.judge_min_score, 55);
        assert_eq!(config.openai_model, "gpt-5.2");
        std::env::remove_var("JUDGE_MIN_SCORE");
    }

    #[tokio::test]
    async fn write_atomic_round_trips_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.json");
        write_atomic(&path, b"{\"a\":1}").await.unwrap();
        let read_back = fs::read_to_string(&path).await.unwrap();
        assert_eq!(read_back, "{\"a\":1}");
    }
}
