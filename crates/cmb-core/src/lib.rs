//! Shared types for the codemode bridge: the error taxonomy, executor
//! metadata, and the identifier sanitizer used everywhere a namespaced tool
//! name crosses a public surface.

pub mod error;
pub mod names;

pub use error::BridgeError;
pub use names::{TOOL_NAME_DELIMITER, namespaced_tool_name, sanitize_identifier};

use serde::{Deserialize, Serialize};

/// Session ID used for the stdio transport and for sessionless internal
/// calls. HTTP sessions use a UUIDv4 instead.
pub const SINGLETON_SESSION_ID: &str = "__singleton__";

/// Describes the sandbox backend chosen at boot and why.
///
/// Captured once when the first runtime is created and reported verbatim by
/// the `status` tool for the rest of the process lifetime, even if a later
/// re-creation picks a different backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorInfo {
    /// Backend identifier (`vm`, `deno`, `container`, `vm-insecure`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Why this backend was selected.
    pub reason: String,
    /// Wall-clock execution timeout in seconds.
    pub timeout: u64,
}
