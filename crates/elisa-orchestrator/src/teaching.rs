//! Teaching engine (SPEC_FULL §2): an external capability the executor
//! consults after each successful task for an optional `teaching_moment`.
//! No concrete teaching model lives in this workspace — the default
//! implementation is a no-op, matching the spec's treatment of the LLM
//! vendor SDK and other abstracted collaborators (spec §1).

use async_trait::async_trait;
use elisa_types::Task;

#[async_trait]
pub trait TeachingEngine: Send + Sync {
    /// Called once per successfully completed task. `None` suppresses the
    /// `teaching_moment` event for that task.
    async fn teaching_moment(&self, task: &Task, summary: &str) -> Option<String>;
}

#[derive(Default)]
pub struct NoopTeachingEngine;

#[async_trait]
impl TeachingEngine for NoopTeachingEngine {
    async fn teaching_moment(&self, _task: &Task, _summary: &str) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_engine_never_produces_a_moment() {
        let engine = NoopTeachingEngine;
        let task = Task::new("t1", "Build", "builder");
        assert!(engine.teaching_moment(&task, "done").await.is_none());
    }
}
