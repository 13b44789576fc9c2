//! Lifecycle of `Session` records: creation, lookup by id, and pruning
//! (spec §4.14). The store holds sessions in memory only — no persistent
//! multi-session scheduling across process restarts, per the stated
//! non-goals.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use elisa_types::{RestartMode, Session, SessionState, Spec};

use crate::cancellation::CancellationRegistry;
use crate::event_bus::EventBus;
use crate::suspension::{GateSlot, QuestionRegistry};

pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(3600);
pub const DEFAULT_PRUNE_TICK: Duration = Duration::from_secs(600);
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(300);

/// Everything a pipeline controller needs for one session: the record
/// itself plus its private event bus and suspension primitives.
#[derive(Clone)]
pub struct SessionHandle {
    pub id: String,
    pub session: Arc<RwLock<Session>>,
    pub bus: EventBus,
    pub gate: GateSlot,
    pub questions: QuestionRegistry,
    terminal_at: Arc<RwLock<Option<chrono::DateTime<Utc>>>>,
}

impl SessionHandle {
    pub async fn mark_terminal(&self) {
        let mut slot = self.terminal_at.write().await;
        if slot.is_none() {
            *slot = Some(Utc::now());
        }
    }

    pub async fn is_terminal(&self) -> bool {
        self.terminal_at.read().await.is_some()
    }
}

#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
    cancellations: CancellationRegistry,
    max_age: Duration,
    grace_period: Duration,
}

impl SessionStore {
    pub fn new(cancellations: CancellationRegistry) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            cancellations,
            max_age: DEFAULT_MAX_AGE,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn with_limits(mut self, max_age: Duration, grace_period: Duration) -> Self {
        self.max_age = max_age;
        self.grace_period = grace_period;
        self
    }

    pub async fn create(&self, spec: Spec, workspace_path: String, restart_mode: RestartMode) -> SessionHandle {
        let id = Uuid::new_v4().to_string();
        let session = Session::new(id.clone(), spec, workspace_path, restart_mode);
        let handle = SessionHandle {
            id: id.clone(),
            session: Arc::new(RwLock::new(session)),
            bus: EventBus::new(),
            gate: GateSlot::new(),
            questions: QuestionRegistry::new(),
            terminal_at: Arc::new(RwLock::new(None)),
        };
        self.sessions.write().await.insert(id, handle.clone());
        handle
    }

    pub async fn get(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// One pruning pass: removes sessions whose terminal grace period has
    /// elapsed, or that have exceeded the max age regardless of state.
    pub async fn prune_once(&self) {
        let now = Utc::now();
        let mut to_remove = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for (id, handle) in sessions.iter() {
                let session = handle.session.read().await;
                let age = now.signed_duration_since(session.created_at);
                let aged_out = age.to_std().map(|d| d > self.max_age).unwrap_or(false);
                let grace_elapsed = match *handle.terminal_at.read().await {
                    Some(terminal_at) => now
                        .signed_duration_since(terminal_at)
                        .to_std()
                        .map(|d| d > self.grace_period)
                        .unwrap_or(false),
                    None => false,
                };
                if aged_out || grace_elapsed {
                    to_remove.push(id.clone());
                }
            }
        }
        if to_remove.is_empty() {
            return;
        }
        let mut sessions = self.sessions.write().await;
        for id in &to_remove {
            sessions.remove(id);
            self.cancellations.remove(id).await;
        }
        tracing::info!(count = to_remove.len(), "pruned sessions");
    }

    pub fn spawn_pruner(self, tick: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                self.prune_once().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec() -> Spec {
        Spec::from_value(json!({"goal": "Counter"})).unwrap()
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = SessionStore::new(CancellationRegistry::new());
        let handle = store.create(spec(), "/tmp/w".into(), RestartMode::Continue).await;
        let fetched = store.get(&handle.id).await.unwrap();
        assert_eq!(fetched.session.read().await.id, handle.id);
    }

    #[tokio::test]
    async fn prune_removes_sessions_past_grace_period() {
        let store = SessionStore::new(CancellationRegistry::new())
            .with_limits(Duration::from_secs(3600), Duration::from_millis(1));
        let handle = store.create(spec(), "/tmp/w".into(), RestartMode::Continue).await;
        handle.mark_terminal().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.prune_once().await;
        assert!(store.get(&handle.id).await.is_none());
    }

    #[tokio::test]
    async fn non_terminal_session_is_not_pruned_before_max_age() {
        let store = SessionStore::new(CancellationRegistry::new())
            .with_limits(Duration::from_secs(3600), Duration::from_millis(1));
        let handle = store.create(spec(), "/tmp/w".into(), RestartMode::Continue).await;
        store.prune_once().await;
        assert!(store.get(&handle.id).await.is_some());
    }

    #[tokio::test]
    async fn session_state_starts_idle_and_is_not_terminal() {
        let store = SessionStore::new(CancellationRegistry::new());
        let handle = store.create(spec(), "/tmp/w".into(), RestartMode::Continue).await;
        assert_eq!(handle.session.read().await.state, SessionState::Idle);
        assert!(!handle.is_terminal().await);
    }
}
