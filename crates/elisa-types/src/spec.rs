use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The declarative input document: goal, requirements, agents, workflow,
/// deployment. Treated as an open document — unknown fields never fail
/// construction, per the design note on dynamic spec payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spec {
    pub goal: String,
    #[serde(default = "default_project_type")]
    pub r#type: String,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
    #[serde(default)]
    pub portals: Vec<PortalSpec>,
    #[serde(default)]
    pub deployment: Deployment,
    #[serde(default)]
    pub workflow: Workflow,

    /// Anything the typed fields above don't name. Parsed defensively so a
    /// new editor field never breaks an in-flight session.
    #[serde(flatten)]
    pub extra: std::collections::BTreeMap<String, Value>,
}

fn default_project_type() -> String {
    "generic".to_string()
}

impl Spec {
    /// Coerces a loosely-typed JSON document into a `Spec`, never failing on
    /// unknown or missing optional fields.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Tokens drawn from goal + requirement descriptions, used by the
    /// planner's memory lookup and the judge's keyword-coverage scorer.
    pub fn keywords(&self) -> Vec<String> {
        let mut text = self.goal.clone();
        for r in &self.requirements {
            text.push(' ');
            text.push_str(&r.description);
        }
        crate::text::tokenize(&text)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Requirement {
    pub r#type: String,
    pub description: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Builder,
    Tester,
    Reviewer,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    pub role: AgentRole,
    #[serde(default)]
    pub persona: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalSpec {
    pub name: String,
    pub kind: PortalKind,
    #[serde(default)]
    pub transport: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PortalKind {
    Mcp,
    Serial,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentTarget {
    #[default]
    Preview,
    Web,
    Esp32,
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Deployment {
    #[serde(default)]
    pub target: DeploymentTarget,
    #[serde(default)]
    pub auto_flash: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehavioralTest {
    pub when: String,
    pub then: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Workflow {
    #[serde(default = "default_true")]
    pub testing_enabled: bool,
    #[serde(default)]
    pub review_enabled: bool,
    #[serde(default)]
    pub human_gates: bool,
    #[serde(default)]
    pub behavioral_tests: Vec<BehavioralTest>,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fields_do_not_fail_construction() {
        let value = serde_json::json!({
            "goal": "Counter",
            "requirements": [{"type": "feature", "description": "increment count"}],
            "agents": [{"name": "Builder Bot", "role": "builder", "persona": "friendly"}],
            "deployment": {"target": "preview"},
            "workflow": {"testing_enabled": false},
            "future_field_from_a_newer_editor": {"anything": true}
        });
        let spec = Spec::from_value(value).unwrap();
        assert_eq!(spec.goal, "Counter");
        assert_eq!(spec.deployment.target, DeploymentTarget::Preview);
        assert!(!spec.workflow.testing_enabled);
        assert!(spec.extra.contains_key("future_field_from_a_newer_editor"));
    }

    #[test]
    fn defaults_apply_when_sections_are_absent() {
        let value = serde_json::json!({"goal": "Minimal"});
        let spec = Spec::from_value(value).unwrap();
        assert!(spec.workflow.testing_enabled);
        assert_eq!(spec.deployment.target, DeploymentTarget::Preview);
        assert!(spec.agents.is_empty());
    }
}
