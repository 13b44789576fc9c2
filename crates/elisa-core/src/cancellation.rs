//! Per-session cancellation (spec §5). `cancel()` is idempotent: it sets a
//! single flag, which is observed by the in-flight dispatch, every running
//! tool, and the scheduler's next readiness check.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn token_for(&self, session_id: &str) -> CancellationToken {
        if let Some(token) = self.tokens.read().await.get(session_id) {
            return token.clone();
        }
        let mut tokens = self.tokens.write().await;
        tokens
            .entry(session_id.to_string())
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    /// Idempotent: cancelling an already-cancelled or unknown session is a
    /// no-op, never an error.
    pub async fn cancel(&self, session_id: &str) {
        if let Some(token) = self.tokens.read().await.get(session_id) {
            token.cancel();
        }
    }

    pub async fn is_cancelled(&self, session_id: &str) -> bool {
        self.tokens
            .read()
            .await
            .get(session_id)
            .is_some_and(|t| t.is_cancelled())
    }

    pub async fn remove(&self, session_id: &str) {
        self.tokens.write().await.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_after_done_is_idempotent() {
        let registry = CancellationRegistry::new();
        let token = registry.token_for("s1").await;
        registry.cancel("s1").await;
        assert!(token.is_cancelled());
        // Calling again must not panic or change observable state.
        registry.cancel("s1").await;
        assert!(registry.is_cancelled("s1").await);
    }

    #[tokio::test]
    async fn unknown_session_cancel_is_a_no_op() {
        let registry = CancellationRegistry::new();
        registry.cancel("never-created").await;
        assert!(!registry.is_cancelled("never-created").await);
    }
}
