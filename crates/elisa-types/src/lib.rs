//! Shared data model for the Elisa build orchestrator (spec §3): Session,
//! Spec, Task, Agent, Commit, TestResult, JudgeResult, MemoryRecord.

pub mod commit;
pub mod judge;
pub mod memory;
pub mod session;
pub mod spec;
pub mod task;
pub mod test_result;
pub mod text;

pub use commit::CommitRecord;
pub use judge::{JudgeCheck, JudgeResult};
pub use memory::{MemoryRecord, NuggetType, RunOutcome};
pub use session::{RestartMode, Session, SessionState};
pub use spec::{
    AgentRole, AgentSpec, BehavioralTest, Deployment, DeploymentTarget, PortalKind, PortalSpec,
    Requirement, Spec, Workflow,
};
pub use task::{Agent, AgentStatus, FailureReason, Task, TaskStatus};
pub use test_result::{TestPhaseSummary, TestResult};
