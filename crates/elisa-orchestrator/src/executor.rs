//! Executor Phase (spec §4.10): drives the DAG scheduler's ready batches
//! concurrently, dispatching one agent per task with the retry ladder,
//! compact-context and fallback-model recovery, human-gate escalation, and
//! per-task commits.
//!
//! Scheduling granularity: `DagScheduler` is a synchronous pull-based API
//! (`next_batch`/`complete`), not a notify-on-completion one. This executor
//! keeps a `FuturesUnordered` pool of in-flight task dispatches and refills
//! it from `next_batch()` every time the pool changes shape, so a freed
//! concurrency slot is reused as soon as any one task finishes rather than
//! only at wave boundaries.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use elisa_core::event_bus::EventBus;
use elisa_core::suspension::{GateAnswer, GateSlot, QuestionRegistry};
use elisa_core::token_tracker::TokenTracker;
use elisa_providers::LanguageModel;
use elisa_runtime::version_store::GitVersionStore;
use elisa_runtime::workspace::WorkspaceManager;
use elisa_types::spec::BehavioralTest;
use elisa_types::{Agent, AgentSpec, CommitRecord, FailureReason, Task, TaskStatus};
use elisa_wire::{event_kind, EngineEvent};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::context::ContextManager;
use crate::dispatcher::{self, DispatchOptions, QuestionPort};
use crate::planner::Plan;
use crate::prompts::{assemble_system_prompt, assemble_user_prompt, max_turns_for_attempt, WorkspaceSnapshot};
use crate::scheduler::DagScheduler;
use crate::teaching::TeachingEngine;
use elisa_tools::ToolSandbox;

/// Dispatch attempts exhausted before the executor opens a human gate.
pub const RETRY_LIMIT: u32 = 2;

pub struct ExecutorOutcome {
    pub tasks: Vec<Task>,
    pub commits: Vec<CommitRecord>,
    /// Set when a human gate rejected a task's retry-exhaustion prompt
    /// (spec §4.10(f) / §7): the whole run is terminated, not just the task.
    pub fatal_error: Option<String>,
}

enum TaskOutcome {
    Done { commit: Option<CommitRecord>, summary: String },
    Failed { reason: FailureReason, retry_count: u32 },
    Fatal { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureClass {
    ContextWindowExceeded,
    OutputLimitReached,
    Other,
}

fn classify_failure(summary: &str) -> FailureClass {
    if summary.starts_with("CONTEXT_WINDOW_EXCEEDED") {
        FailureClass::ContextWindowExceeded
    } else if summary.starts_with("OUTPUT_LIMIT_REACHED") {
        FailureClass::OutputLimitReached
    } else {
        FailureClass::Other
    }
}

pub struct Executor {
    pub session_id: String,
    pub bus: EventBus,
    pub gate: GateSlot,
    pub questions: QuestionRegistry,
    pub cancel: CancellationToken,
    pub sandbox: ToolSandbox,
    pub model: Arc<dyn LanguageModel>,
    pub version_store: GitVersionStore,
    pub workspace: WorkspaceManager,
    pub context: ContextManager,
    pub teaching: Arc<dyn TeachingEngine>,
    pub behavioral_tests: Vec<BehavioralTest>,
    pub output_limit_fallback_model: String,
    pub retry_limit: u32,
    pub tokens: TokenTracker,
}

impl Executor {
    pub async fn run(&self, plan: Plan) -> ExecutorOutcome {
        let mut scheduler = DagScheduler::new(plan.tasks.clone());
        let mut commits = Vec::new();
        let mut fatal_error = None;
        let mut in_flight: FuturesUnordered<Pin<Box<dyn Future<Output = (String, TaskOutcome)> + Send + '_>>> =
            FuturesUnordered::new();

        loop {
            if !self.cancel.is_cancelled() {
                for task in scheduler.next_batch() {
                    let agent = plan.agent_map.get(&task.agent_name).cloned();
                    in_flight.push(Box::pin(self.run_task(task, agent)));
                }
            }

            if in_flight.is_empty() {
                if scheduler.all_terminal() || self.cancel.is_cancelled() {
                    break;
                }
                tokio::task::yield_now().await;
                continue;
            }

            let Some((task_id, outcome)) = in_flight.next().await else { break };
            match outcome {
                TaskOutcome::Done { commit, summary } => {
                    scheduler.complete(&task_id, TaskStatus::Done);
                    let _ = self.context.record_result(&task_id, summary).await;
                    if let Some(record) = commit {
                        commits.push(record);
                    }
                }
                TaskOutcome::Failed { reason, retry_count } => {
                    scheduler.mark_failed_reason(&task_id, reason);
                    scheduler.set_retry_count(&task_id, retry_count);
                    scheduler.complete(&task_id, TaskStatus::Failed);
                    self.bus.publish(EngineEvent::new(
                        &self.session_id,
                        event_kind::TASK_FAILED,
                        json!({"task_id": task_id, "reason": reason, "retry_count": retry_count}),
                    ));
                    self.cascade_predecessor_failure(&mut scheduler, &task_id);
                }
                TaskOutcome::Fatal { message } => {
                    scheduler.mark_failed_reason(&task_id, FailureReason::DispatchExhausted);
                    scheduler.complete(&task_id, TaskStatus::Failed);
                    self.bus.publish(EngineEvent::new(
                        &self.session_id,
                        event_kind::TASK_FAILED,
                        json!({"task_id": task_id, "reason": FailureReason::DispatchExhausted}),
                    ));
                    fatal_error.get_or_insert(message);
                    self.cancel.cancel();
                }
            }
        }

        ExecutorOutcome { tasks: scheduler.snapshot(), commits, fatal_error }
    }

    /// A `failed` task's still-pending dependents, transitively: the whole
    /// downstream subgraph is unreachable once one of its ancestors failed,
    /// not just its direct successors.
    fn cascade_predecessor_failure(&self, scheduler: &mut DagScheduler, failed_id: &str) {
        let mut queue = scheduler.pending_dependents_of(failed_id);
        let mut seen: HashSet<String> = HashSet::new();
        while let Some(id) = queue.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            queue.extend(scheduler.pending_dependents_of(&id));
            scheduler.mark_failed_reason(&id, FailureReason::PredecessorFailed);
            scheduler.complete(&id, TaskStatus::Failed);
            self.bus.publish(EngineEvent::new(
                &self.session_id,
                event_kind::TASK_FAILED,
                json!({"task_id": id, "reason": FailureReason::PredecessorFailed}),
            ));
        }
    }

    async fn run_task(&self, task: Task, agent: Option<Agent>) -> (String, TaskOutcome) {
        let task_id = task.id.clone();
        let Some(agent) = agent else {
            return (task_id, TaskOutcome::Failed { reason: FailureReason::DispatchExhausted, retry_count: 0 });
        };

        self.bus.publish(EngineEvent::new(
            &self.session_id,
            event_kind::TASK_STARTED,
            json!({"task_id": task_id, "agent_name": agent.name}),
        ));

        let agent_spec = AgentSpec { name: agent.name.clone(), role: agent.role, persona: agent.persona.clone() };
        let predecessor_context = self.context.context_for(&task.predecessors).await;

        let mut attempt = 0u32;
        let mut compact_mode = false;
        let mut model_override: Option<String> = None;

        loop {
            let _ = self.workspace.stale_metadata_cleanup().await;
            let snapshot = if compact_mode {
                WorkspaceSnapshot::default()
            } else {
                let inspection = self.workspace.inspect().await;
                let structural_digest = self.workspace.structural_digest().await;
                WorkspaceSnapshot { manifest: inspection.top_files, structural_digest }
            };

            let system_prompt = assemble_system_prompt(&agent_spec, max_turns_for_attempt(attempt));
            let user_prompt = assemble_user_prompt(
                &task,
                agent.role,
                &predecessor_context,
                &snapshot,
                &self.behavioral_tests,
                attempt,
            );

            let options = DispatchOptions {
                max_turns: max_turns_for_attempt(attempt),
                max_completion_tokens: (dispatcher::MAX_COMPLETION_TOKENS_START
                    + attempt * dispatcher::MAX_COMPLETION_TOKENS_STEP)
                    .min(dispatcher::MAX_COMPLETION_TOKENS_CAP),
                timeout_sec: dispatcher::DEFAULT_TIMEOUT_SEC,
                allowed_tools: ToolSandbox::all_schemas().into_iter().map(|s| s.name).collect(),
                enable_streaming: true,
                enable_tool_calling: true,
                model_override: model_override.clone(),
            };

            let question_port = RegistryQuestionPort {
                questions: self.questions.clone(),
                bus: self.bus.clone(),
                session_id: self.session_id.clone(),
                task_id: task_id.clone(),
            };

            let bus = self.bus.clone();
            let session_id = self.session_id.clone();
            let output_task_id = task_id.clone();
            let result = dispatcher::dispatch(
                &system_prompt,
                &user_prompt,
                &self.sandbox,
                self.model.as_ref(),
                &question_port,
                &options,
                self.cancel.clone(),
                move |chunk| {
                    bus.publish(EngineEvent::new(
                        &session_id,
                        event_kind::AGENT_OUTPUT,
                        json!({"task_id": output_task_id, "text": chunk}),
                    ));
                },
            )
            .await;

            self.tokens.record(
                result.input_tokens,
                result.output_tokens,
                result.cached_input_tokens,
                result.reasoning_tokens,
                result.cost_usd,
            );

            for record in &result.tool_calls {
                self.bus.publish(EngineEvent::new(
                    &self.session_id,
                    event_kind::TOOL_USE,
                    json!({"task_id": task_id, "tool": record.name, "arguments": record.arguments}),
                ));
                self.bus.publish(EngineEvent::new(
                    &self.session_id,
                    event_kind::TOOL_RESULT,
                    json!({"task_id": task_id, "tool": record.name, "success": record.result.success}),
                ));
            }

            if result.success {
                let commit = self
                    .version_store
                    .commit(
                        self.workspace.root(),
                        &format!("{}: {}", agent.name, task.name),
                        &agent.name,
                        &task.id,
                    )
                    .await
                    .unwrap_or(None);

                if let Some(record) = &commit {
                    self.bus.publish(EngineEvent::new(
                        &self.session_id,
                        event_kind::COMMIT_CREATED,
                        serde_json::to_value(record).unwrap_or(json!({})),
                    ));
                }

                self.bus.publish(EngineEvent::new(
                    &self.session_id,
                    event_kind::TASK_COMPLETED,
                    json!({"task_id": task_id, "agent_name": agent.name}),
                ));

                if let Some(moment) = self.teaching.teaching_moment(&task, &result.summary).await {
                    self.bus.publish(EngineEvent::new(
                        &self.session_id,
                        event_kind::TEACHING_MOMENT,
                        json!({"task_id": task_id, "moment": moment}),
                    ));
                }

                return (task_id, TaskOutcome::Done { commit, summary: result.summary });
            }

            match classify_failure(&result.summary) {
                FailureClass::ContextWindowExceeded => compact_mode = true,
                FailureClass::OutputLimitReached => model_override = Some(self.output_limit_fallback_model.clone()),
                FailureClass::Other => {}
            }

            attempt += 1;
            if attempt <= self.retry_limit {
                continue;
            }

            // Retries exhausted: a human gate decides whether the build
            // continues without this task (approve) or the whole run
            // terminates (reject) — spec §4.10(f), §7.
            self.bus.publish(EngineEvent::human_gate(
                &self.session_id,
                &task_id,
                "retry_exhausted",
                json!({"summary": result.summary, "retry_count": attempt}),
            ));
            let rx = self.gate.open().await;
            let answer = rx.await.unwrap_or(GateAnswer { approved: false, feedback: None });
            if answer.approved {
                return (
                    task_id,
                    TaskOutcome::Failed { reason: FailureReason::DispatchExhausted, retry_count: attempt },
                );
            }
            return (
                task_id,
                TaskOutcome::Fatal {
                    message: format!(
                        "Build stopped: human gate rejected retrying task `{task_id}` after {attempt} attempts: {}",
                        result.summary
                    ),
                },
            );
        }
    }
}

struct RegistryQuestionPort {
    questions: QuestionRegistry,
    bus: EventBus,
    session_id: String,
    task_id: String,
}

#[async_trait]
impl QuestionPort for RegistryQuestionPort {
    async fn ask(&self, question_args: Value) -> Value {
        self.bus.publish(EngineEvent::new(
            &self.session_id,
            event_kind::AGENT_QUESTION,
            json!({"task_id": self.task_id, "question": question_args}),
        ));
        let rx = self.questions.open(&self.task_id).await;
        rx.await.unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, preds: &[&str]) -> Task {
        let mut t = Task::new(id, id, "builder");
        t.predecessors = preds.iter().map(|s| s.to_string()).collect();
        t
    }

    fn executor_for_cascade_test() -> Executor {
        Executor {
            session_id: "s1".to_string(),
            bus: EventBus::new(),
            gate: GateSlot::new(),
            questions: QuestionRegistry::new(),
            cancel: CancellationToken::new(),
            sandbox: ToolSandbox::new(std::env::temp_dir()),
            model: Arc::new(NeverCalledModel),
            version_store: GitVersionStore::new(),
            workspace: WorkspaceManager::new(std::env::temp_dir().join("elisa-executor-test")),
            context: ContextManager::new(std::env::temp_dir().join("elisa-executor-test")),
            teaching: Arc::new(crate::teaching::NoopTeachingEngine),
            behavioral_tests: Vec::new(),
            output_limit_fallback_model: "gpt-4.1".to_string(),
            retry_limit: RETRY_LIMIT,
            tokens: TokenTracker::new(),
        }
    }

    struct NeverCalledModel;
    #[async_trait]
    impl LanguageModel for NeverCalledModel {
        async fn complete_turn(
            &self,
            _messages: &[elisa_providers::ChatMessage],
            _tools: &[elisa_providers::ToolSchema],
            _model_override: Option<&str>,
            _cancel: CancellationToken,
            _on_text: &mut elisa_providers::OnTextDelta<'_>,
        ) -> anyhow::Result<elisa_providers::TurnResponse> {
            unreachable!("not dispatched in this test")
        }
    }

    #[test]
    fn classify_failure_reads_the_dispatcher_prefix() {
        assert_eq!(classify_failure("CONTEXT_WINDOW_EXCEEDED: too long"), FailureClass::ContextWindowExceeded);
        assert_eq!(classify_failure("OUTPUT_LIMIT_REACHED: truncated"), FailureClass::OutputLimitReached);
        assert_eq!(classify_failure("some other error"), FailureClass::Other);
    }

    #[test]
    fn cascade_marks_the_whole_transitive_downstream_subgraph_failed() {
        let tasks = vec![task("a", &[]), task("b", &["a"]), task("c", &["b"]), task("d", &[])];
        let mut scheduler = DagScheduler::new(tasks);
        scheduler.next_batch();
        scheduler.complete("a", TaskStatus::Failed);

        let executor = executor_for_cascade_test();
        executor.cascade_predecessor_failure(&mut scheduler, "a");

        let snapshot = scheduler.snapshot();
        let b = snapshot.iter().find(|t| t.id == "b").unwrap();
        let c = snapshot.iter().find(|t| t.id == "c").unwrap();
        let d = snapshot.iter().find(|t| t.id == "d").unwrap();
        assert_eq!(b.status, TaskStatus::Failed);
        assert_eq!(b.failure_reason, Some(FailureReason::PredecessorFailed));
        assert_eq!(c.status, TaskStatus::Failed);
        assert_eq!(c.failure_reason, Some(FailureReason::PredecessorFailed));
        assert_eq!(d.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn missing_agent_fails_without_dispatching() {
        let executor = executor_for_cascade_test();
        let (id, outcome) = executor.run_task(task("t1", &[]), None).await;
        assert_eq!(id, "t1");
        assert!(matches!(outcome, TaskOutcome::Failed { reason: FailureReason::DispatchExhausted, retry_count: 0 }));
    }

    struct AlwaysFailsModel;
    #[async_trait]
    impl LanguageModel for AlwaysFailsModel {
        async fn complete_turn(
            &self,
            _messages: &[elisa_providers::ChatMessage],
            _tools: &[elisa_providers::ToolSchema],
            _model_override: Option<&str>,
            _cancel: CancellationToken,
            _on_text: &mut elisa_providers::OnTextDelta<'_>,
        ) -> anyhow::Result<elisa_providers::TurnResponse> {
            Err(anyhow::anyhow!("scripted failure"))
        }
    }

    fn executor_with_failing_model(gate: GateSlot) -> Executor {
        Executor {
            session_id: "s1".to_string(),
            bus: EventBus::new(),
            gate,
            questions: QuestionRegistry::new(),
            cancel: CancellationToken::new(),
            sandbox: ToolSandbox::new(std::env::temp_dir()),
            model: Arc::new(AlwaysFailsModel),
            version_store: GitVersionStore::new(),
            workspace: WorkspaceManager::new(std::env::temp_dir().join("elisa-executor-gate-test")),
            context: ContextManager::new(std::env::temp_dir().join("elisa-executor-gate-test")),
            teaching: Arc::new(crate::teaching::NoopTeachingEngine),
            behavioral_tests: Vec::new(),
            output_limit_fallback_model: "gpt-4.1".to_string(),
            retry_limit: RETRY_LIMIT,
            tokens: TokenTracker::new(),
        }
    }

    #[tokio::test]
    async fn gate_approval_marks_the_task_failed_with_its_retry_count_instead_of_retrying() {
        let gate = GateSlot::new();
        let executor = executor_with_failing_model(gate.clone());

        let gate_clone = gate.clone();
        let answerer = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            gate_clone.answer(GateAnswer { approved: true, feedback: None }).await
        });

        let (id, outcome) = executor.run_task(task("t1", &[]), Some(Agent::new("Builder Bot", elisa_types::spec::AgentRole::Builder, ""))).await;
        assert!(answerer.await.unwrap());
        assert_eq!(id, "t1");
        match outcome {
            TaskOutcome::Failed { reason, retry_count } => {
                assert_eq!(reason, FailureReason::DispatchExhausted);
                assert_eq!(retry_count, RETRY_LIMIT + 1);
            }
            other => panic!("expected Failed on gate approval, got a different outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn gate_rejection_terminates_the_run_instead_of_merely_failing_the_task() {
        let gate = GateSlot::new();
        let executor = executor_with_failing_model(gate.clone());

        let gate_clone = gate.clone();
        let answerer = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            gate_clone.answer(GateAnswer { approved: false, feedback: None }).await
        });

        let (id, outcome) = executor.run_task(task("t1", &[]), Some(Agent::new("Builder Bot", elisa_types::spec::AgentRole::Builder, ""))).await;
        assert!(answerer.await.unwrap());
        assert_eq!(id, "t1");
        match outcome {
            TaskOutcome::Fatal { message } => assert!(message.contains("Build stopped")),
            other => panic!("expected Fatal on gate rejection, got a different outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn a_fatal_gate_rejection_surfaces_on_the_executor_outcome_and_stops_scheduling() {
        let gate = GateSlot::new();
        let executor = executor_with_failing_model(gate.clone());

        let gate_clone = gate.clone();
        let answerer = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            gate_clone.answer(GateAnswer { approved: false, feedback: None }).await
        });

        let mut plan_tasks = vec![task("t1", &[])];
        plan_tasks[0].agent_name = "Builder Bot".to_string();
        let agent_map = std::collections::HashMap::from([(
            "Builder Bot".to_string(),
            Agent::new("Builder Bot", elisa_types::spec::AgentRole::Builder, ""),
        )]);
        let plan = Plan {
            tasks: plan_tasks,
            agents: vec![Agent::new("Builder Bot", elisa_types::spec::AgentRole::Builder, "")],
            agent_map,
            task_map: std::collections::HashMap::new(),
            plan_explanation: String::new(),
        };

        let outcome = executor.run(plan).await;
        assert!(answerer.await.unwrap());
        assert!(outcome.fatal_error.is_some());
        assert!(outcome.fatal_error.unwrap().contains("Build stopped"));
        assert_eq!(outcome.tasks[0].status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn successful_task_emits_commit_created_before_task_completed() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = WorkspaceManager::new(dir.path());
        workspace.provision(elisa_types::RestartMode::Continue).await.unwrap();
        let version_store = GitVersionStore::new();
        version_store.init_repo(workspace.root(), "goal").await.unwrap();
        tokio::fs::create_dir_all(workspace.root().join("src")).await.unwrap();
        tokio::fs::write(workspace.root().join("src/main.rs"), "fn main() {}").await.unwrap();

        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let executor = Executor {
            session_id: "s1".to_string(),
            bus: bus.clone(),
            gate: GateSlot::new(),
            questions: QuestionRegistry::new(),
            cancel: CancellationToken::new(),
            sandbox: ToolSandbox::new(workspace.root()),
            model: Arc::new(OneShotSuccessModel),
            version_store,
            workspace: workspace.clone(),
            context: ContextManager::new(workspace.root()),
            teaching: Arc::new(crate::teaching::NoopTeachingEngine),
            behavioral_tests: Vec::new(),
            output_limit_fallback_model: "gpt-4.1".to_string(),
            retry_limit: RETRY_LIMIT,
            tokens: TokenTracker::new(),
        };

        let (_id, outcome) =
            executor.run_task(task("t1", &[]), Some(Agent::new("Builder Bot", elisa_types::spec::AgentRole::Builder, ""))).await;
        assert!(matches!(outcome, TaskOutcome::Done { .. }));
        drop(executor);
        drop(bus);

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind);
        }
        let completed_idx = kinds.iter().position(|k| k == event_kind::TASK_COMPLETED);
        let commit_idx = kinds.iter().position(|k| k == event_kind::COMMIT_CREATED);
        assert!(completed_idx.is_some() && commit_idx.is_some());
        assert!(commit_idx < completed_idx, "expected commit_created before task_completed, got {kinds:?}");
    }

    struct OneShotSuccessModel;
    #[async_trait]
    impl LanguageModel for OneShotSuccessModel {
        async fn complete_turn(
            &self,
            _messages: &[elisa_providers::ChatMessage],
            _tools: &[elisa_providers::ToolSchema],
            _model_override: Option<&str>,
            _cancel: CancellationToken,
            _on_text: &mut elisa_providers::OnTextDelta<'_>,
        ) -> anyhow::Result<elisa_providers::TurnResponse> {
            Ok(elisa_providers::TurnResponse { content: "done".to_string(), ..Default::default() })
        }
    }
}
