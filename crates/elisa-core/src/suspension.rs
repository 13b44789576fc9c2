//! Gate and question suspension primitives (spec §9 design note): a
//! dispatch in progress suspends by registering a resolver keyed by session
//! or task id, and resumes when the matching `answer*` call arrives. Exactly
//! one outstanding resolver per key; answering a missing key is a silent
//! no-op rather than an error, since the dispatch that would have consumed
//! it may already have moved on (timeout, cancellation).

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};

#[derive(Debug, Clone)]
pub struct GateAnswer {
    pub approved: bool,
    pub feedback: Option<String>,
}

/// At most one pending gate per session (the executor retry ladder and the
/// judge override gate are mutually exclusive in time within one session).
#[derive(Clone, Default)]
pub struct GateSlot {
    inner: Arc<Mutex<Option<oneshot::Sender<GateAnswer>>>>,
}

impl GateSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new pending gate, returning the receiver the caller
    /// awaits. Overwrites any previous unconsumed resolver — the executor
    /// never opens a second gate while one is outstanding, but this keeps
    /// the primitive safe if it ever did.
    pub async fn open(&self) -> oneshot::Receiver<GateAnswer> {
        let (tx, rx) = oneshot::channel();
        *self.inner.lock().await = Some(tx);
        rx
    }

    /// Resolves the pending gate, if any. Returns `true` if a waiter was
    /// actually woken.
    pub async fn answer(&self, answer: GateAnswer) -> bool {
        if let Some(tx) = self.inner.lock().await.take() {
            tx.send(answer).is_ok()
        } else {
            false
        }
    }
}

/// One pending question resolver per task id.
#[derive(Clone, Default)]
pub struct QuestionRegistry {
    inner: Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>>,
}

impl QuestionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn open(&self, task_id: &str) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().await.insert(task_id.to_string(), tx);
        rx
    }

    /// A silent no-op when `task_id` has no pending resolver, per the
    /// design note.
    pub async fn answer(&self, task_id: &str, answers: Value) -> bool {
        if let Some(tx) = self.inner.lock().await.remove(task_id) {
            tx.send(answers).is_ok()
        } else {
            false
        }
    }
}
