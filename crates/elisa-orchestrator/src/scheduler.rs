//! DAG Scheduler (spec §4.4): topological readiness, bounded-concurrency
//! dispatch, completion propagation. A `failed` task does not automatically
//! propagate to dependents — the executor decides (see §4.10) whether to
//! cascade `failed/predecessor_failed`.

use std::collections::HashMap;

use elisa_types::{Task, TaskStatus};

pub const DEFAULT_CONCURRENCY: usize = 3;

/// Owns the task set for one build and yields ready batches. Tie-break on
/// equal readiness is insertion order, tracked by `order`.
pub struct DagScheduler {
    tasks: HashMap<String, Task>,
    order: Vec<String>,
    concurrency: usize,
    in_flight: usize,
}

impl DagScheduler {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self::with_concurrency(tasks, DEFAULT_CONCURRENCY)
    }

    pub fn with_concurrency(tasks: Vec<Task>, concurrency: usize) -> Self {
        let order = tasks.iter().map(|t| t.id.clone()).collect();
        let tasks = tasks.into_iter().map(|t| (t.id.clone(), t)).collect();
        Self { tasks, order, concurrency: concurrency.max(1), in_flight: 0 }
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn all_terminal(&self) -> bool {
        self.tasks.values().all(|t| t.is_terminal())
    }

    /// All predecessors of `id` are `done`.
    fn is_ready(&self, task: &Task) -> bool {
        task.status == TaskStatus::Pending
            && task
                .predecessors
                .iter()
                .all(|p| self.tasks.get(p).map(|t| t.status == TaskStatus::Done).unwrap_or(false))
    }

    /// A maximal batch of ready tasks up to the remaining concurrency slots,
    /// in insertion order. Marks the returned tasks `in_progress` and
    /// reserves a slot for each.
    pub fn next_batch(&mut self) -> Vec<Task> {
        let capacity = self.concurrency.saturating_sub(self.in_flight);
        if capacity == 0 {
            return Vec::new();
        }
        let ready_ids: Vec<String> = self
            .order
            .iter()
            .filter(|id| self.tasks.get(*id).map(|t| self.is_ready(t)).unwrap_or(false))
            .take(capacity)
            .cloned()
            .collect();

        let mut batch = Vec::with_capacity(ready_ids.len());
        for id in ready_ids {
            if let Some(task) = self.tasks.get_mut(&id) {
                task.status = TaskStatus::InProgress;
                self.in_flight += 1;
                batch.push(task.clone());
            }
        }
        batch
    }

    /// Reports a task's terminal outcome, freeing its concurrency slot and
    /// making dependents eligible for re-evaluation on the next `next_batch`.
    pub fn complete(&mut self, id: &str, status: TaskStatus) {
        if let Some(task) = self.tasks.get_mut(id) {
            if task.status == TaskStatus::InProgress {
                self.in_flight = self.in_flight.saturating_sub(1);
            }
            task.status = status;
        }
    }

    pub fn mark_failed_reason(&mut self, id: &str, reason: elisa_types::FailureReason) {
        if let Some(task) = self.tasks.get_mut(id) {
            task.failure_reason = Some(reason);
        }
    }

    pub fn set_retry_count(&mut self, id: &str, count: u32) {
        if let Some(task) = self.tasks.get_mut(id) {
            task.retry_count = count;
        }
    }

    /// Direct dependents of `id` that are still pending — candidates for a
    /// `predecessor_failed` cascade decision by the executor.
    pub fn pending_dependents_of(&self, id: &str) -> Vec<String> {
        self.order
            .iter()
            .filter(|candidate_id| {
                self.tasks
                    .get(*candidate_id)
                    .map(|t| t.status == TaskStatus::Pending && t.predecessors.iter().any(|p| p == id))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> Vec<Task> {
        self.order.iter().filter_map(|id| self.tasks.get(id).cloned()).collect()
    }
}

/// Verifies the dependency graph is acyclic and every predecessor id
/// resolves to a known task, per the Task invariants (spec §3).
pub fn validate_acyclic(tasks: &[Task]) -> Result<(), String> {
    let ids: std::collections::HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    for task in tasks {
        for pred in &task.predecessors {
            if !ids.contains(pred.as_str()) {
                return Err(format!("task `{}` references unknown predecessor `{pred}`", task.id));
            }
        }
    }

    let mut state: HashMap<&str, u8> = HashMap::new();
    for task in tasks {
        if visit(task.id.as_str(), tasks, &mut state).is_err() {
            return Err(format!("dependency graph contains a cycle through `{}`", task.id));
        }
    }
    Ok(())
}

fn visit<'a>(id: &'a str, tasks: &'a [Task], state: &mut HashMap<&'a str, u8>) -> Result<(), ()> {
    match state.get(id) {
        Some(1) => return Err(()),
        Some(2) => return Ok(()),
        _ => {}
    }
    state.insert(id, 1);
    if let Some(task) = tasks.iter().find(|t| t.id == id) {
        for pred in &task.predecessors {
            visit(pred.as_str(), tasks, state)?;
        }
    }
    state.insert(id, 2);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, preds: &[&str]) -> Task {
        let mut t = Task::new(id, id, "builder");
        t.predecessors = preds.iter().map(|s| s.to_string()).collect();
        t
    }

    #[test]
    fn validate_acyclic_rejects_cycles() {
        let tasks = vec![task("a", &["b"]), task("b", &["a"])];
        assert!(validate_acyclic(&tasks).is_err());
    }

    #[test]
    fn validate_acyclic_rejects_unknown_predecessor() {
        let tasks = vec![task("a", &["ghost"])];
        assert!(validate_acyclic(&tasks).is_err());
    }

    #[test]
    fn validate_acyclic_accepts_dag() {
        let tasks = vec![task("a", &[]), task("b", &["a"]), task("c", &["a", "b"])];
        assert!(validate_acyclic(&tasks).is_ok());
    }

    #[test]
    fn next_batch_respects_concurrency_cap() {
        let tasks = vec![task("a", &[]), task("b", &[]), task("c", &[]), task("d", &[])];
        let mut scheduler = DagScheduler::with_concurrency(tasks, 2);
        let batch = scheduler.next_batch();
        assert_eq!(batch.len(), 2);
        assert_eq!(scheduler.next_batch().len(), 0);
    }

    #[test]
    fn completing_a_task_unblocks_its_dependent() {
        let tasks = vec![task("a", &[]), task("b", &["a"])];
        let mut scheduler = DagScheduler::with_concurrency(tasks, 3);
        let batch = scheduler.next_batch();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, "a");

        scheduler.complete("a", TaskStatus::Done);
        let batch = scheduler.next_batch();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, "b");
    }

    #[test]
    fn failed_task_does_not_auto_propagate() {
        let tasks = vec![task("a", &[]), task("b", &["a"])];
        let mut scheduler = DagScheduler::with_concurrency(tasks, 3);
        scheduler.next_batch();
        scheduler.complete("a", TaskStatus::Failed);
        assert!(scheduler.next_batch().is_empty());
        assert_eq!(scheduler.pending_dependents_of("a"), vec!["b".to_string()]);
    }

    #[test]
    fn insertion_order_tie_break() {
        let tasks = vec![task("z", &[]), task("a", &[]), task("m", &[])];
        let mut scheduler = DagScheduler::with_concurrency(tasks, 1);
        assert_eq!(scheduler.next_batch()[0].id, "z");
        scheduler.complete("z", TaskStatus::Done);
        assert_eq!(scheduler.next_batch()[0].id, "a");
    }
}
