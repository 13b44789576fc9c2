//! Deploy Phase (spec §4.12): conditional web/hardware/portal deploy driven
//! by `spec.deployment.target` and portal presence, torn down
//! unconditionally on exit.

use std::path::Path;
use std::process::Stdio;

use elisa_core::event_bus::EventBus;
use elisa_runtime::portals::{PortalKind as RuntimePortalKind, PortalRegistry};
use elisa_types::spec::{Deployment, DeploymentTarget, PortalKind, PortalSpec};
use elisa_wire::{event_kind, EngineEvent};
use serde_json::json;
use tokio::process::Command;

#[derive(Debug, Clone, Default)]
pub struct DeploySummary {
    pub web_deployed: bool,
    pub hardware_deployed: bool,
    pub details: Vec<String>,
}

pub fn should_deploy_web(deployment: &Deployment) -> bool {
    matches!(deployment.target, DeploymentTarget::Web | DeploymentTarget::Both)
}

pub fn should_deploy_hardware(deployment: &Deployment) -> bool {
    matches!(deployment.target, DeploymentTarget::Esp32 | DeploymentTarget::Both) && deployment.auto_flash
}

pub fn should_initialize_portals(portals: &[PortalSpec]) -> bool {
    !portals.is_empty()
}

pub fn should_deploy_portals(deployment: &Deployment, portals: &[PortalSpec]) -> bool {
    should_deploy_hardware(deployment) && portals.iter().any(|p| p.kind == PortalKind::Serial)
}

/// Flashes every declared serial portal that `should_deploy_portals` selects.
/// Callers must have already registered those portals with `portals`
/// (the pipeline's portal-init stage does this, lazily, before the executor
/// runs) — this phase only opens/flashes what is already known to it.
pub async fn run(
    bus: &EventBus,
    session_id: &str,
    workspace: &Path,
    deployment: &Deployment,
    portals_spec: &[PortalSpec],
    portals: &PortalRegistry,
) -> DeploySummary {
    let mut summary = DeploySummary::default();

    if !should_deploy_web(deployment) && !should_deploy_portals(deployment, portals_spec) {
        return summary;
    }

    bus.publish(EngineEvent::new(session_id, event_kind::DEPLOY_STARTED, json!({"target": deployment.target})));

    if should_deploy_web(deployment) {
        match spawn_web_build(workspace).await {
            Ok(tail) => {
                summary.web_deployed = true;
                summary.details.push("web build succeeded".to_string());
                bus.publish(EngineEvent::new(
                    session_id,
                    event_kind::DEPLOY_PROGRESS,
                    json!({"stage": "web", "output": tail}),
                ));
            }
            Err(err) => {
                summary.details.push(format!("web build failed: {err}"));
                bus.publish(EngineEvent::new(
                    session_id,
                    event_kind::DEPLOY_PROGRESS,
                    json!({"stage": "web", "error": err}),
                ));
            }
        }
    }

    if should_deploy_portals(deployment, portals_spec) {
        for portal in portals_spec.iter().filter(|p| p.kind == PortalKind::Serial) {
            match portals.initialize(RuntimePortalKind::Serial, &portal.name).await {
                Ok(()) => {
                    summary.hardware_deployed = true;
                    summary.details.push(format!("flashed {}", portal.name));
                    bus.publish(EngineEvent::new(
                        session_id,
                        event_kind::DEPLOY_PROGRESS,
                        json!({"stage": "hardware", "portal": portal.name}),
                    ));
                }
                Err(err) => {
                    summary.details.push(format!("flash failed for {}: {err}", portal.name));
                    bus.publish(EngineEvent::new(
                        session_id,
                        event_kind::DEPLOY_PROGRESS,
                        json!({"stage": "hardware", "portal": portal.name, "error": err}),
                    ));
                }
            }
        }
    }

    bus.publish(EngineEvent::new(
        session_id,
        event_kind::DEPLOY_COMPLETE,
        json!({"web_deployed": summary.web_deployed, "hardware_deployed": summary.hardware_deployed}),
    ));

    summary
}

/// Spawns the workspace's own build command and waits for it, the way
/// `elisa_runtime::mcp` spawns stdio MCP servers — a shell child process
/// rather than an embedded build-system crate (spec §1 treats per-project
/// toolchains as external collaborators).
async fn spawn_web_build(workspace: &Path) -> Result<String, String> {
    if !workspace.join("package.json").exists() {
        return Err("no package.json found in workspace".to_string());
    }

    let output = Command::new("sh")
        .current_dir(workspace)
        .args(["-lc", "npm run build"])
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| e.to_string())?;

    let tail: String = String::from_utf8_lossy(&output.stdout)
        .lines()
        .rev()
        .take(20)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect::<Vec<_>>()
        .join("\n");

    if !output.status.success() {
        return Err(String::from_utf8_lossy(&output.stderr).trim().to_string());
    }
    Ok(tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(target: DeploymentTarget, auto_flash: bool) -> Deployment {
        Deployment { target, auto_flash }
    }

    #[test]
    fn web_deploy_predicate_covers_web_and_both() {
        assert!(should_deploy_web(&deployment(DeploymentTarget::Web, false)));
        assert!(should_deploy_web(&deployment(DeploymentTarget::Both, false)));
        assert!(!should_deploy_web(&deployment(DeploymentTarget::Preview, false)));
    }

    #[test]
    fn hardware_deploy_requires_auto_flash() {
        assert!(!should_deploy_hardware(&deployment(DeploymentTarget::Esp32, false)));
        assert!(should_deploy_hardware(&deployment(DeploymentTarget::Esp32, true)));
    }

    #[test]
    fn portal_deploy_requires_a_declared_serial_portal() {
        let mcp_only = vec![PortalSpec { name: "x".to_string(), kind: PortalKind::Mcp, transport: None }];
        assert!(!should_deploy_portals(&deployment(DeploymentTarget::Esp32, true), &mcp_only));
        let serial = vec![PortalSpec { name: "esp32-0".to_string(), kind: PortalKind::Serial, transport: None }];
        assert!(should_deploy_portals(&deployment(DeploymentTarget::Esp32, true), &serial));
    }

    #[tokio::test]
    async fn skips_entirely_when_no_deploy_target_applies() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let dir = tempfile::tempdir().unwrap();
        let portals = PortalRegistry::new(elisa_runtime::McpRegistry::new_with_state_file(
            dir.path().join("portals.json"),
        ));
        let summary = run(&bus, "s1", dir.path(), &deployment(DeploymentTarget::Preview, false), &[], &portals).await;
        assert!(!summary.web_deployed && !summary.hardware_deployed);
        drop(bus);
        assert!(rx.recv().await.is_err());
    }
}
