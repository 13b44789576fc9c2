pub mod mcp;
pub mod portals;
pub mod version_store;
pub mod workspace;

pub use mcp::{McpRegistry, McpServer};
pub use portals::{NullSerialPortal, PortalKind, PortalRegistry, SerialPortal};
pub use version_store::GitVersionStore;
pub use workspace::{WorkspaceError, WorkspaceInspection, WorkspaceManager};
