//! Portal registry (spec §4.12, SPEC_FULL §2): MCP portals use the
//! stdio-spawn registry in [`crate::mcp`]; serial/hardware portals are
//! represented by a `SerialPortal` trait object with a stub implementation
//! (opening a real serial device is an external capability per spec §1).
//! The deploy phase initializes/tears down both uniformly.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::mcp::McpRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortalKind {
    Mcp,
    Serial,
}

#[async_trait]
pub trait SerialPortal: Send + Sync {
    fn name(&self) -> &str;
    async fn open(&self) -> Result<(), String>;
    async fn close(&self) -> Result<(), String>;
    async fn is_open(&self) -> bool;
}

/// Stub: no physical device driver lives in this workspace (spec §1 lists
/// "serial/USB hardware driver" as an abstracted external capability).
pub struct NullSerialPortal {
    name: String,
    open: RwLock<bool>,
}

impl NullSerialPortal {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), open: RwLock::new(false) }
    }
}

#[async_trait]
impl SerialPortal for NullSerialPortal {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> Result<(), String> {
        *self.open.write().await = true;
        Ok(())
    }

    async fn close(&self) -> Result<(), String> {
        *self.open.write().await = false;
        Ok(())
    }

    async fn is_open(&self) -> bool {
        *self.open.read().await
    }
}

/// Initializes declared portals lazily before the executor runs and tears
/// all of them down unconditionally on exit, swallowing errors.
#[derive(Clone)]
pub struct PortalRegistry {
    mcp: McpRegistry,
    serial: Arc<RwLock<HashMap<String, Arc<dyn SerialPortal>>>>,
}

impl PortalRegistry {
    pub fn new(mcp: McpRegistry) -> Self {
        Self { mcp, serial: Arc::new(RwLock::new(HashMap::new())) }
    }

    pub fn mcp(&self) -> &McpRegistry {
        &self.mcp
    }

    pub async fn register_serial(&self, name: impl Into<String>) {
        let name = name.into();
        self.serial
            .write()
            .await
            .insert(name.clone(), Arc::new(NullSerialPortal::new(name)));
    }

    /// Initializes a declared MCP or serial portal by name, called lazily
    /// before the executor phase when `shouldInitializePortals` holds.
    pub async fn initialize(&self, kind: PortalKind, name: &str) -> Result<(), String> {
        match kind {
            PortalKind::Mcp => {
                if self.mcp.connect(name).await {
                    Ok(())
                } else {
                    Err(format!("failed to connect MCP portal `{name}`"))
                }
            }
            PortalKind::Serial => {
                let serial = self.serial.read().await;
                match serial.get(name) {
                    Some(portal) => portal.open().await,
                    None => Err(format!("unknown serial portal `{name}`")),
                }
            }
        }
    }

    /// Closes all handles unconditionally, swallowing errors, called both
    /// on teardown and, for serial handles specifically, during normal
    /// `complete` before the summary event so the device is freed promptly.
    pub async fn teardown_all(&self) {
        let mcp_names: Vec<String> = self.mcp.list().await.into_keys().collect();
        for name in mcp_names {
            let _ = self.mcp.disconnect(&name).await;
        }
        let serial = self.serial.read().await;
        for portal in serial.values() {
            let _ = portal.close().await;
        }
    }

    pub async fn teardown_serial(&self) {
        let serial = self.serial.read().await;
        for portal in serial.values() {
            let _ = portal.close().await;
        }
    }
}
