//! Pipeline Controller (spec §4.1): the per-session state machine that
//! composes every phase — plan, portal init, execute, test, deploy, judge,
//! complete — into one `run()`, and owns the session's suspension and
//! cancellation wiring.
//!
//! The judge's human-override gate is handled entirely inside
//! [`crate::judge::run`] — this controller only reacts to the `JudgeResult`
//! it returns. Cascade failure propagation is likewise entirely the
//! executor's concern (see `crate::executor::cascade_predecessor_failure`).

use std::path::PathBuf;
use std::sync::Arc;

use elisa_core::session_store::SessionHandle;
use elisa_core::suspension::GateAnswer;
use elisa_core::token_tracker::{TokenSnapshot, TokenTracker};
use elisa_memory::BuildMemory;
use elisa_providers::LanguageModel;
use elisa_runtime::mcp::McpRegistry;
use elisa_runtime::portals::PortalRegistry;
use elisa_runtime::version_store::GitVersionStore;
use elisa_runtime::workspace::WorkspaceManager;
use elisa_tools::ToolSandbox;
use elisa_types::{
    CommitRecord, MemoryRecord, NuggetType, PortalKind, RestartMode, RunOutcome, SessionState, Spec,
    Task, TaskStatus, TestResult,
};
use elisa_wire::{event_kind, EngineEvent, SessionCompleteJudge, SessionCompletePayload};
use serde_json::json;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::context::ContextManager;
use crate::deploy_phase;
use crate::executor::Executor;
use crate::judge;
use crate::planner;
use crate::teaching::TeachingEngine;
use crate::test_phase::{self, TestPhaseOutcome, TestRunner};

/// External capabilities and tunables the controller depends on but does not
/// own the lifecycle of: the LLM client, the project's test/teaching
/// capabilities, and the process-wide build-memory store (spec §9's "global
/// mutable state" note — one store is shared across every session).
#[derive(Clone)]
pub struct PipelineDeps {
    pub model: Arc<dyn LanguageModel>,
    pub test_runner: Arc<dyn TestRunner>,
    pub teaching: Arc<dyn TeachingEngine>,
    pub memory: BuildMemory,
    pub output_limit_fallback_model: String,
    pub judge_threshold: u32,
    pub retry_limit: u32,
}

/// Drives exactly one run for one session. Constructed by the server from a
/// `SessionHandle` (id, `Session` record, event bus, gate, question
/// registry) plus the process-wide `PipelineDeps` and a per-session
/// cancellation token.
pub struct PipelineController {
    handle: SessionHandle,
    cancel: CancellationToken,
    deps: PipelineDeps,
    tasks: RwLock<Vec<Task>>,
    commits: RwLock<Vec<CommitRecord>>,
    test_outcome: RwLock<Option<TestPhaseOutcome>>,
    tokens: TokenTracker,
}

impl PipelineController {
    pub fn new(handle: SessionHandle, cancel: CancellationToken, deps: PipelineDeps) -> Self {
        Self {
            handle,
            cancel,
            deps,
            tasks: RwLock::new(Vec::new()),
            commits: RwLock::new(Vec::new()),
            test_outcome: RwLock::new(None),
            tokens: TokenTracker::new(),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn answer_gate(&self, approved: bool, feedback: Option<String>) -> bool {
        self.handle.gate.answer(GateAnswer { approved, feedback }).await
    }

    pub async fn answer_question(&self, task_id: &str, answers: serde_json::Value) -> bool {
        self.handle.questions.answer(task_id, answers).await
    }

    pub async fn commits(&self) -> Vec<CommitRecord> {
        self.commits.read().await.clone()
    }

    pub async fn test_results(&self) -> Vec<TestResult> {
        self.test_outcome.read().await.as_ref().map(|o| o.results.clone()).unwrap_or_default()
    }

    pub fn token_usage(&self) -> TokenSnapshot {
        self.tokens.snapshot()
    }

    /// Drives `plan -> (portal init) -> execute -> test -> deploy -> judge
    /// -> complete`. A cancellation observed between any two phases
    /// short-circuits straight to a terminal `error(recoverable=false)` —
    /// there is no partial `session_complete` for a cancelled run.
    pub async fn run(&self) {
        let session_id = self.handle.id.clone();
        self.handle.bus.publish(EngineEvent::session_started(&session_id));

        let spec = self.handle.session.read().await.spec.clone();
        let workspace_path = self.handle.session.read().await.workspace_path.clone();
        let restart_mode = self.handle.session.read().await.restart_mode;

        let workspace = WorkspaceManager::new(PathBuf::from(workspace_path));
        let created = match workspace.provision(restart_mode).await {
            Ok(created) => created,
            Err(err) => return self.fail(&format!("workspace provisioning failed: {err}")).await,
        };
        if created {
            self.handle.bus.publish(EngineEvent::new(&session_id, event_kind::WORKSPACE_CREATED, json!({})));
        }

        let version_store = GitVersionStore::new();
        if let Err(err) = version_store.init_repo(workspace.root(), &spec.goal).await {
            tracing::warn!(session_id = %session_id, error = %err, "version store init failed, continuing without version control");
        }

        if self.bail_if_cancelled(&session_id).await {
            return;
        }

        self.set_state(SessionState::Planning).await;
        self.handle.bus.publish(EngineEvent::new(&session_id, event_kind::PLANNING_STARTED, json!({})));
        let plan = match planner::plan(&spec, &self.deps.memory).await {
            Ok(plan) => plan,
            Err(err) => return self.fail(&format!("{err}")).await,
        };
        self.handle.bus.publish(EngineEvent::new(
            &session_id,
            event_kind::PLAN_READY,
            json!({"task_count": plan.tasks.len(), "explanation": plan.plan_explanation}),
        ));

        if self.bail_if_cancelled(&session_id).await {
            return;
        }

        let portals = self.init_portals(&spec, &workspace).await;

        if self.bail_if_cancelled(&session_id).await {
            portals.teardown_all().await;
            return;
        }

        self.set_state(SessionState::Executing).await;
        let executor = Executor {
            session_id: session_id.clone(),
            bus: self.handle.bus.clone(),
            gate: self.handle.gate.clone(),
            questions: self.handle.questions.clone(),
            cancel: self.cancel.clone(),
            sandbox: ToolSandbox::new(workspace.root()),
            model: self.deps.model.clone(),
            version_store,
            workspace: workspace.clone(),
            context: ContextManager::new(workspace.root()),
            teaching: self.deps.teaching.clone(),
            behavioral_tests: spec.workflow.behavioral_tests.clone(),
            output_limit_fallback_model: self.deps.output_limit_fallback_model.clone(),
            retry_limit: self.deps.retry_limit,
            tokens: self.tokens.clone(),
        };
        let outcome = executor.run(plan).await;
        *self.tasks.write().await = outcome.tasks.clone();
        *self.commits.write().await = outcome.commits.clone();

        if let Some(message) = outcome.fatal_error {
            self.fail(&message).await;
            portals.teardown_all().await;
            return;
        }

        if self.bail_if_cancelled(&session_id).await {
            portals.teardown_all().await;
            return;
        }

        self.set_state(SessionState::Testing).await;
        let test_outcome =
            test_phase::run(&self.handle.bus, &session_id, workspace.root(), &spec.workflow, self.deps.test_runner.as_ref()).await;
        *self.test_outcome.write().await = test_outcome.clone();

        if self.bail_if_cancelled(&session_id).await {
            portals.teardown_all().await;
            return;
        }

        self.set_state(SessionState::Deploying).await;
        deploy_phase::run(&self.handle.bus, &session_id, workspace.root(), &spec.deployment, &spec.portals, &portals).await;
        portals.teardown_serial().await;

        if self.bail_if_cancelled(&session_id).await {
            portals.teardown_all().await;
            return;
        }

        self.set_state(SessionState::Judging).await;
        let judge_result = judge::run(
            &self.handle.bus,
            &self.handle.gate,
            &session_id,
            workspace.root(),
            &outcome.tasks,
            &outcome.commits,
            test_outcome.as_ref().map(|o| &o.summary),
            &spec.workflow,
            self.deps.judge_threshold,
        )
        .await;

        portals.teardown_all().await;

        if !judge_result.passed {
            self.record_memory(&spec, &outcome.tasks, &outcome.commits, test_outcome.as_ref(), &judge_result, false).await;
            self.fail(&format!(
                "Judge below threshold: Build stopped ({} blocking issue(s))",
                judge_result.blocking_issues.len()
            ))
            .await;
            return;
        }

        // No skill/rule-authoring capability ships in this port (see DESIGN.md),
        // so there is nothing of the current spec's own to exclude suggestions by.
        let suggestions = self.deps.memory.suggest_reusable_patterns(&spec.keywords(), &[]).await;
        let done = outcome.tasks.iter().filter(|t| t.status == TaskStatus::Done).count();
        let summary = format!("Completed {done}/{total} tasks for \"{goal}\".", total = outcome.tasks.len(), goal = spec.goal);

        self.record_memory(&spec, &outcome.tasks, &outcome.commits, test_outcome.as_ref(), &judge_result, true).await;
        self.set_state(SessionState::Done).await;
        self.handle.mark_terminal().await;

        self.handle.bus.publish(EngineEvent::new(
            &session_id,
            event_kind::SESSION_COMPLETE,
            serde_json::to_value(SessionCompletePayload {
                summary,
                judge: SessionCompleteJudge::from(&judge_result),
                suggestions: suggestions
                    .into_iter()
                    .map(|s| serde_json::to_value(s).unwrap_or(json!({})))
                    .collect(),
            })
            .unwrap_or(json!({})),
        ));
    }

    async fn bail_if_cancelled(&self, session_id: &str) -> bool {
        if !self.cancel.is_cancelled() {
            return false;
        }
        self.handle.bus.publish(EngineEvent::error(session_id, "session cancelled", false));
        self.set_state(SessionState::Done).await;
        self.handle.mark_terminal().await;
        true
    }

    async fn fail(&self, message: &str) {
        tracing::error!(session_id = %self.handle.id, message, "pipeline failed");
        self.handle.bus.publish(EngineEvent::error(&self.handle.id, message.to_string(), false));
        self.set_state(SessionState::Error).await;
        self.handle.mark_terminal().await;
    }

    async fn set_state(&self, state: SessionState) {
        self.handle.session.write().await.state = state;
    }

    async fn init_portals(&self, spec: &Spec, workspace: &WorkspaceManager) -> PortalRegistry {
        let mcp = McpRegistry::new_with_state_file(workspace.elisa_dir().join("portals.json"));
        let portals = PortalRegistry::new(mcp);
        if !deploy_phase::should_initialize_portals(&spec.portals) {
            return portals;
        }
        for portal in &spec.portals {
            match portal.kind {
                PortalKind::Serial => portals.register_serial(portal.name.clone()).await,
                PortalKind::Mcp => {
                    portals.mcp().add(portal.name.clone(), portal.transport.clone().unwrap_or_default()).await;
                    portals.mcp().connect(&portal.name).await;
                }
            }
        }
        portals
    }

    async fn record_memory(
        &self,
        spec: &Spec,
        tasks: &[Task],
        commits: &[CommitRecord],
        test_outcome: Option<&TestPhaseOutcome>,
        judge_result: &elisa_types::JudgeResult,
        success: bool,
    ) {
        let tasks_done = tasks.iter().filter(|t| t.status == TaskStatus::Done).count() as u32;
        let snapshot = self.tokens.snapshot();
        let outcome = RunOutcome {
            tasks_done,
            tasks_total: tasks.len() as u32,
            tests_passed: test_outcome.map(|o| o.summary.passed).unwrap_or(0),
            tests_total: test_outcome.map(|o| o.summary.total).unwrap_or(0),
            coverage_pct: test_outcome.and_then(|o| o.summary.coverage_pct),
            total_tokens: snapshot.input_tokens + snapshot.output_tokens,
            cost_usd: snapshot.cost_usd,
            judge_score: judge_result.score,
            judge_overridden: judge_result.overridden,
            success,
        };
        let nugget_type = if success && judge_result.overridden {
            NuggetType::PartialSuccess
        } else if success {
            NuggetType::Success
        } else {
            NuggetType::Failure
        };
        let record = MemoryRecord {
            session_id: self.handle.id.clone(),
            created_at: chrono::Utc::now(),
            goal: spec.goal.clone(),
            project_type: spec.r#type.clone(),
            nugget_type,
            deployment_target: spec.deployment.target,
            keywords: spec.keywords(),
            skills_used: Vec::new(),
            rules_used: Vec::new(),
            commit_highlights: commits.iter().map(|c| c.message.clone()).collect(),
            outcome,
        };
        if let Err(err) = self.deps.memory.record_run(record).await {
            tracing::warn!(session_id = %self.handle.id, error = %err, "failed to record run to build memory");
        }
    }
}
