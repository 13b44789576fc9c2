//! Planner (spec §4.9): turns a spec into `{tasks, agents, task_map,
//! agent_map, plan_explanation}`, seeded with build-memory context.
//!
//! The spec leaves the requirement-to-task derivation unspecified beyond
//! "agents are lifted from `spec.agents`". This implementation assigns one
//! task per requirement in declaration order, chained as a linear
//! dependency (task *i* depends on task *i-1*) so the graph is trivially
//! acyclic, round-robins tasks across the declared `builder` agents, and
//! appends a single review task — depending on every build task — when
//! `workflow.review_enabled` and a `reviewer` agent is declared.

use std::collections::HashMap;

use elisa_memory::BuildMemory;
use elisa_types::spec::AgentRole;
use elisa_types::{Agent, AgentStatus, Spec, Task};

use crate::scheduler::validate_acyclic;

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("PLAN_INVALID: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub tasks: Vec<Task>,
    pub agents: Vec<Agent>,
    pub task_map: HashMap<String, Task>,
    pub agent_map: HashMap<String, Agent>,
    pub plan_explanation: String,
}

pub async fn plan(spec: &Spec, memory: &BuildMemory) -> Result<Plan, PlanError> {
    if spec.agents.is_empty() {
        return Err(PlanError::Invalid("spec declares no agents".to_string()));
    }

    let agents: Vec<Agent> = spec
        .agents
        .iter()
        .map(|a| Agent::new(a.name.clone(), a.role, a.persona.clone()))
        .collect();

    let builders: Vec<&Agent> = agents.iter().filter(|a| a.role == AgentRole::Builder).collect();
    let fallback_assignee = builders.first().copied().unwrap_or(&agents[0]);

    let mut tasks = Vec::new();
    if spec.requirements.is_empty() {
        let mut task = Task::new("task-1", spec.goal.clone(), fallback_assignee.name.clone());
        task.description = spec.goal.clone();
        task.acceptance_criteria = vec![spec.goal.clone()];
        tasks.push(task);
    } else {
        for (idx, requirement) in spec.requirements.iter().enumerate() {
            let assignee = if builders.is_empty() {
                fallback_assignee
            } else {
                builders[idx % builders.len()]
            };
            let id = format!("task-{}", idx + 1);
            let mut task = Task::new(&id, requirement_name(requirement), assignee.name.clone());
            task.description = requirement.description.clone();
            task.acceptance_criteria = vec![requirement.description.clone()];
            if idx > 0 {
                task.predecessors = vec![format!("task-{idx}")];
            }
            tasks.push(task);
        }
    }

    if spec.workflow.review_enabled {
        if let Some(reviewer) = agents.iter().find(|a| a.role == AgentRole::Reviewer) {
            let predecessors: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
            let mut review = Task::new("task-review", "Review implementation", reviewer.name.clone());
            review.description = "Review the implementation against every requirement's acceptance criteria.".to_string();
            review.predecessors = predecessors;
            tasks.push(review);
        }
    }

    for task in &tasks {
        if !agents.iter().any(|a| a.name == task.agent_name) {
            return Err(PlanError::Invalid(format!(
                "task `{}` assigned to undeclared agent `{}`",
                task.id, task.agent_name
            )));
        }
    }
    validate_acyclic(&tasks).map_err(PlanError::Invalid)?;

    let context = memory
        .planner_context(&spec.keywords(), &spec.r#type, spec.deployment.target)
        .await;

    let mut explanation = format!(
        "Planned {} task(s) across {} agent(s) for goal \"{}\".",
        tasks.len(),
        agents.len(),
        spec.goal
    );
    if !context.similar_runs.is_empty() {
        explanation.push_str(&format!(
            " Drew on {} similar prior run(s), most similar: \"{}\" ({}% match).",
            context.similar_runs.len(),
            context.similar_runs[0].goal,
            (context.similar_runs[0].similarity * 100.0).round() as i64
        ));
    }

    let task_map = tasks.iter().map(|t| (t.id.clone(), t.clone())).collect();
    let agent_map = agents.iter().map(|a| (a.name.clone(), agent_idle(a))).collect();

    Ok(Plan { tasks, agents, task_map, agent_map, plan_explanation: explanation })
}

fn agent_idle(agent: &Agent) -> Agent {
    let mut a = agent.clone();
    a.status = AgentStatus::Idle;
    a
}

fn requirement_name(requirement: &elisa_types::Requirement) -> String {
    let words: Vec<&str> = requirement.description.split_whitespace().take(6).collect();
    if words.is_empty() {
        requirement.r#type.clone()
    } else {
        words.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use elisa_types::spec::{AgentSpec, Requirement};
    use serde_json::json;
    use tempfile::TempDir;

    async fn memory() -> BuildMemory {
        let dir = TempDir::new().unwrap();
        BuildMemory::open(dir.path().join("memory.json")).await.unwrap()
    }

    fn spec_with(requirements: Vec<Requirement>, agents: Vec<AgentSpec>) -> Spec {
        let mut spec = Spec::from_value(json!({"goal": "Counter app"})).unwrap();
        spec.requirements = requirements;
        spec.agents = agents;
        spec
    }

    #[tokio::test]
    async fn rejects_spec_with_no_agents() {
        let spec = spec_with(vec![], vec![]);
        let result = plan(&spec, &memory().await).await;
        assert!(matches!(result, Err(PlanError::Invalid(_))));
    }

    #[tokio::test]
    async fn chains_requirements_into_a_linear_dag() {
        let spec = spec_with(
            vec![
                Requirement { r#type: "feature".to_string(), description: "increment the count".to_string() },
                Requirement { r#type: "feature".to_string(), description: "reset the count".to_string() },
            ],
            vec![AgentSpec { name: "Builder Bot".to_string(), role: AgentRole::Builder, persona: String::new() }],
        );
        let result = plan(&spec, &memory().await).await.unwrap();
        assert_eq!(result.tasks.len(), 2);
        assert_eq!(result.tasks[1].predecessors, vec!["task-1".to_string()]);
    }

    #[tokio::test]
    async fn review_task_depends_on_every_build_task_when_enabled() {
        let mut spec = spec_with(
            vec![Requirement { r#type: "feature".to_string(), description: "increment the count".to_string() }],
            vec![
                AgentSpec { name: "Builder Bot".to_string(), role: AgentRole::Builder, persona: String::new() },
                AgentSpec { name: "Reviewer Bot".to_string(), role: AgentRole::Reviewer, persona: String::new() },
            ],
        );
        spec.workflow.review_enabled = true;
        let result = plan(&spec, &memory().await).await.unwrap();
        let review = result.tasks.iter().find(|t| t.id == "task-review").unwrap();
        assert_eq!(review.predecessors, vec!["task-1".to_string()]);
    }

    #[tokio::test]
    async fn tasks_round_robin_across_builder_agents() {
        let spec = spec_with(
            vec![
                Requirement { r#type: "feature".to_string(), description: "a".to_string() },
                Requirement { r#type: "feature".to_string(), description: "b".to_string() },
            ],
            vec![
                AgentSpec { name: "Alpha".to_string(), role: AgentRole::Builder, persona: String::new() },
                AgentSpec { name: "Beta".to_string(), role: AgentRole::Builder, persona: String::new() },
            ],
        );
        let result = plan(&spec, &memory().await).await.unwrap();
        assert_eq!(result.tasks[0].agent_name, "Alpha");
        assert_eq!(result.tasks[1].agent_name, "Beta");
    }
}
