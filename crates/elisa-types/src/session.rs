use serde::{Deserialize, Serialize};

use crate::Spec;

/// Drawn from `{idle, planning, executing, testing, deploying, judging,
/// done, error}`. Transitions monotonically forward except `cancel`, which
/// jumps straight to `Done`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Planning,
    Executing,
    Testing,
    Deploying,
    Judging,
    Done,
    Error,
}

impl SessionState {
    /// Forward order of the happy-path state machine; used only to assert
    /// monotonicity in tests, not to drive transitions.
    pub fn rank(self) -> u8 {
        match self {
            SessionState::Idle => 0,
            SessionState::Planning => 1,
            SessionState::Executing => 2,
            SessionState::Testing => 3,
            SessionState::Deploying => 4,
            SessionState::Judging => 5,
            SessionState::Done => 6,
            SessionState::Error => 6,
        }
    }
}

/// `continue` preserves everything in the workspace; `clean` resets the
/// workspace but preserves logs and design files, see
/// `elisa_runtime::workspace`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RestartMode {
    #[default]
    Continue,
    Clean,
}

/// A build run. Owns at most one pending gate resolver and at most one
/// pending question resolver per task id; see `elisa_core::suspension`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub state: SessionState,
    pub spec: Spec,
    pub workspace_path: String,
    pub restart_mode: RestartMode,
    pub user_workspace: bool,
    #[serde(default)]
    pub cancelled: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Session {
    pub fn new(id: String, spec: Spec, workspace_path: String, restart_mode: RestartMode) -> Self {
        Self {
            id,
            state: SessionState::Idle,
            spec,
            user_workspace: !workspace_path.trim().is_empty(),
            workspace_path,
            restart_mode,
            cancelled: false,
            created_at: chrono::Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, SessionState::Done | SessionState::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cancel_jumps_straight_to_done_regardless_of_rank() {
        let mut session = Session::new(
            "s1".to_string(),
            Spec::from_value(json!({"goal": "g"})).unwrap(),
            "/tmp/w".to_string(),
            RestartMode::Continue,
        );
        session.state = SessionState::Executing;
        session.cancelled = true;
        session.state = SessionState::Done;
        assert!(session.is_terminal());
    }
}
