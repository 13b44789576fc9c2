//! Prompt Assembler (spec §4.6): a pure function of (task, agent, role,
//! workspace snapshot, attempt, workflow). Builds the system and user
//! prompts for one dispatch.

use elisa_types::spec::{AgentRole, BehavioralTest};
use elisa_types::{AgentSpec, Task};

pub const MAX_TURNS_DEFAULT: u32 = 25;
pub const MAX_TURNS_RETRY_INCREMENT: u32 = 10;

/// Files already present under `W/src` and `W/tests`, relative paths.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceSnapshot {
    pub manifest: Vec<String>,
    /// Extracted function/class signatures, one entry per source file. Only
    /// emitted when non-empty.
    pub structural_digest: Vec<String>,
}

pub fn assemble_system_prompt(agent: &AgentSpec, max_turns: u32) -> String {
    let role_line = match agent.role {
        AgentRole::Builder => "You are the builder agent: implement the task's requirements in the workspace.",
        AgentRole::Tester => "You are the tester agent: write and run tests that verify the task's acceptance criteria.",
        AgentRole::Reviewer => "You are the reviewer agent: review the existing implementation for correctness and quality.",
        AgentRole::Custom => "You are a custom agent assigned a specific role in this build.",
    };

    let mut prompt = format!(
        "{role_line}\n\nYour name is {} and your persona is: {}\n",
        agent.name,
        if agent.persona.trim().is_empty() { "(none specified)" } else { agent.persona.as_str() }
    );

    prompt.push_str("\n## Turn Efficiency\n");
    prompt.push_str(&format!(
        "You have a limited budget of {max_turns} turns for this task. Read the file manifest \
         and structural digest before acting, so you don't waste turns re-discovering the workspace.\n"
    ));
    match agent.role {
        AgentRole::Tester | AgentRole::Reviewer => {
            prompt.push_str(
                "Prioritize testing/review over exploration: begin within your first 3 turns.\n",
            );
        }
        _ => {}
    }

    prompt.push_str("\n## Thinking Steps\n");
    prompt.push_str(
        "Consult the file manifest and structural digest below before making changes; do not \
         re-derive what they already tell you.\n",
    );

    prompt
}

pub fn assemble_user_prompt(
    task: &Task,
    role: AgentRole,
    predecessor_context: &str,
    snapshot: &WorkspaceSnapshot,
    behavioral_tests: &[BehavioralTest],
    attempt: u32,
) -> String {
    let mut sections = Vec::new();

    if attempt >= 1 {
        sections.push(format!(
            "## Retry Attempt {attempt}\nThe previous attempt at this task did not succeed. Skip \
             orientation and go straight to implementation.\n"
        ));
    }

    sections.push(format!(
        "## Task: {}\n{}\n\n### Acceptance Criteria\n{}",
        task.name,
        task.description,
        task.acceptance_criteria.iter().map(|c| format!("- {c}")).collect::<Vec<_>>().join("\n")
    ));

    if !predecessor_context.is_empty() {
        sections.push(format!("## Context From Predecessors\n{predecessor_context}"));
    }

    sections.push(format!(
        "## FILES ALREADY IN WORKSPACE\n{}",
        if snapshot.manifest.is_empty() {
            "(workspace is currently empty)".to_string()
        } else {
            snapshot.manifest.join("\n")
        }
    ));

    if !snapshot.structural_digest.is_empty() {
        sections.push(format!("## Structural Digest\n{}", snapshot.structural_digest.join("\n")));
    }

    if role == AgentRole::Tester && !behavioral_tests.is_empty() {
        let rendered = behavioral_tests
            .iter()
            .map(|bt| format!("When {}, then {}.", bt.when, bt.then))
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!("## Behavioral Tests to Verify\n{rendered}"));
    }

    sections.join("\n\n")
}

pub fn max_turns_for_attempt(attempt: u32) -> u32 {
    MAX_TURNS_DEFAULT + attempt * MAX_TURNS_RETRY_INCREMENT
}

#[cfg(test)]
mod tests {
    use super::*;
    use elisa_types::spec::AgentRole;

    fn agent(role: AgentRole) -> AgentSpec {
        AgentSpec { name: "Ada".to_string(), role, persona: "precise and terse".to_string() }
    }

    fn task() -> Task {
        let mut t = Task::new("t1", "Build counter", "Ada");
        t.description = "Add an increment button".to_string();
        t.acceptance_criteria = vec!["counter increments on click".to_string()];
        t
    }

    #[test]
    fn retry_header_only_appears_on_attempt_ge_one() {
        let prompt0 = assemble_user_prompt(&task(), AgentRole::Builder, "", &WorkspaceSnapshot::default(), &[], 0);
        assert!(!prompt0.contains("Retry Attempt"));
        let prompt1 = assemble_user_prompt(&task(), AgentRole::Builder, "", &WorkspaceSnapshot::default(), &[], 1);
        assert!(prompt1.contains("## Retry Attempt 1"));
    }

    #[test]
    fn digest_appears_after_manifest_when_present() {
        let snapshot = WorkspaceSnapshot {
            manifest: vec!["src/main.rs".to_string()],
            structural_digest: vec!["fn main()".to_string()],
        };
        let prompt = assemble_user_prompt(&task(), AgentRole::Builder, "", &snapshot, &[], 0);
        let manifest_idx = prompt.find("FILES ALREADY IN WORKSPACE").unwrap();
        let digest_idx = prompt.find("Structural Digest").unwrap();
        assert!(manifest_idx < digest_idx);
    }

    #[test]
    fn behavioral_tests_only_rendered_for_tester_role() {
        let tests = vec![BehavioralTest { when: "clicked".to_string(), then: "count increments".to_string() }];
        let builder_prompt = assemble_user_prompt(&task(), AgentRole::Builder, "", &WorkspaceSnapshot::default(), &tests, 0);
        assert!(!builder_prompt.contains("Behavioral Tests to Verify"));
        let tester_prompt = assemble_user_prompt(&task(), AgentRole::Tester, "", &WorkspaceSnapshot::default(), &tests, 0);
        assert!(tester_prompt.contains("When clicked, then count increments."));
    }

    #[test]
    fn tester_and_reviewer_get_priority_guidance() {
        let system = assemble_system_prompt(&agent(AgentRole::Tester), MAX_TURNS_DEFAULT);
        assert!(system.contains("Prioritize testing/review"));
        let builder_system = assemble_system_prompt(&agent(AgentRole::Builder), MAX_TURNS_DEFAULT);
        assert!(!builder_system.contains("Prioritize testing/review"));
    }

    #[test]
    fn max_turns_increases_with_attempt() {
        assert_eq!(max_turns_for_attempt(0), 25);
        assert_eq!(max_turns_for_attempt(1), 35);
        assert_eq!(max_turns_for_attempt(2), 45);
    }
}
