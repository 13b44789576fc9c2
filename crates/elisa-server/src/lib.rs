//! Session API surface (spec §6): one `AppState` shared across every HTTP
//! and WebSocket handler, wrapping the `SessionStore`/`CancellationRegistry`
//! primitives and the process-wide `PipelineDeps` every session's
//! `PipelineController` is built from.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use elisa_core::cancellation::CancellationRegistry;
use elisa_core::session_store::SessionStore;
use elisa_orchestrator::controller::{PipelineController, PipelineDeps};
use rand::Rng;
use tokio::sync::RwLock;

mod http;

pub use http::serve;

/// Server-level configuration that doesn't belong on `PipelineDeps` (which
/// is purely pipeline inputs) but gates the HTTP surface itself.
#[derive(Clone)]
pub struct ServerConfig {
    pub workspaces_root: PathBuf,
    pub dev_mode: bool,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let workspaces_root = std::env::var("ELISA_WORKSPACES_ROOT")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".elisa-workspaces"));
        let dev_mode = std::env::var("ELISA_DEV_MODE").map(|v| v == "1").unwrap_or(false);
        Self { workspaces_root, dev_mode }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionStore,
    pub cancellations: CancellationRegistry,
    pub controllers: Arc<RwLock<HashMap<String, Arc<PipelineController>>>>,
    pub deps: PipelineDeps,
    pub config: ServerConfig,
    pub api_token: Arc<String>,
}

impl AppState {
    pub fn new(deps: PipelineDeps, config: ServerConfig) -> Self {
        let cancellations = CancellationRegistry::new();
        Self {
            sessions: SessionStore::new(cancellations.clone()),
            cancellations,
            controllers: Arc::new(RwLock::new(HashMap::new())),
            deps,
            config,
            api_token: Arc::new(resolve_api_token()),
        }
    }

    /// Resolves a caller-supplied `workspace_path` to an absolute path
    /// jailed under `config.workspaces_root` — the caller can address any
    /// subdirectory of the allowed root but never escape it.
    pub fn resolve_workspace_path(&self, workspace_path: &str) -> Result<PathBuf, &'static str> {
        let candidate = Path::new(workspace_path);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.config.workspaces_root.join(candidate)
        };
        let mut normalized = PathBuf::new();
        for component in joined.components() {
            match component {
                std::path::Component::ParentDir => {
                    if !normalized.pop() {
                        return Err("workspace_path escapes the allowed root");
                    }
                }
                std::path::Component::CurDir => {}
                other => normalized.push(other),
            }
        }
        if !normalized.starts_with(&self.config.workspaces_root) {
            return Err("workspace_path escapes the allowed root");
        }
        Ok(normalized)
    }
}

/// A random bearer token printed once at startup, unless the operator
/// pinned one via `ELISA_AUTH_TOKEN` (useful for scripted/dev deployments).
fn resolve_api_token() -> String {
    if let Ok(token) = std::env::var("ELISA_AUTH_TOKEN") {
        let trimmed = token.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    let mut rng = rand::thread_rng();
    (0..32).map(|_| format!("{:x}", rng.gen_range(0..16))).collect()
}
