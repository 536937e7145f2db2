//! Upstream MCP client management.
//!
//! Connects to configured tool servers, namespaces their tools into one
//! registry keyed by sanitized `<server>__<tool>` names, and keeps that
//! registry in sync with the config file through the reload sequence.
//! In-process "virtual" servers register through the same descriptor shape.

pub mod builtin;
pub mod descriptor;
pub mod manager;
pub mod reload;

pub use descriptor::{ToolDescriptor, ToolListEntry};
pub use manager::{ServerToolInfo, UpstreamManager};
pub use reload::{ChangeSet, ConfigReloader};
