//! Host⇄sandbox message protocol for out-of-process backends.
//!
//! One JSON document per line in each direction. Correlation IDs are scoped
//! per direction: `execute` ids are allocated by the host, `tool-call` ids
//! by the sandbox.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages written by the host onto the child's stdin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HostMessage {
    Execute {
        id: u64,
        code: String,
        /// Sanitized tool names callable during this execution.
        tools: Vec<String>,
    },
    ToolResult {
        id: u64,
        result: Value,
    },
    ToolError {
        id: u64,
        error: String,
    },
    Heartbeat,
    Shutdown,
}

/// Messages read by the host from the child's stdout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SandboxMessage {
    Ready,
    Heartbeat,
    ToolCall {
        id: u64,
        name: String,
        args: Value,
    },
    Result {
        id: u64,
        result: Value,
        #[serde(default)]
        logs: Vec<String>,
    },
    /// With an `id`: one execution failed. Without: the runner itself is
    /// going down.
    Error {
        #[serde(default)]
        id: Option<u64>,
        error: ErrorPayload,
        #[serde(default)]
        logs: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}
