//! Sandboxed snippet execution.
//!
//! Three isolation backends share one contract: run a snippet with a table
//! of callable tools, capture console output, and come back with either a
//! value or an error message. The in-process QuickJS backend talks to tools
//! directly; the Deno child and container backends speak a newline-delimited
//! JSON protocol over the child's stdio.

pub mod child;
pub mod factory;
pub mod normalize;
pub mod protocol;
pub mod vm;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use cmb_core::BridgeError;

pub use factory::{BackendKind, SandboxFactory};

/// Async closure that executes one upstream (or virtual) tool call.
///
/// Errors are plain strings: they surface inside the sandbox as rejected
/// promises carrying the upstream's message.
pub type ToolHandler = Arc<
    dyn Fn(serde_json::Value) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, String>> + Send>>
        + Send
        + Sync,
>;

/// Sanitized tool name → handler, snapshotted per execute.
pub type ToolTable = HashMap<String, ToolHandler>;

/// Outcome of one snippet execution.
///
/// `error` carries script failures, timeouts and memory exhaustion; the
/// `Err` side of [`SandboxRuntime::execute`] is reserved for the runtime
/// itself becoming unusable.
#[derive(Debug, Default)]
pub struct Execution {
    pub value: Option<serde_json::Value>,
    pub error: Option<String>,
    pub logs: Vec<String>,
}

impl Execution {
    pub fn ok(value: serde_json::Value, logs: Vec<String>) -> Self {
        Self {
            value: Some(value),
            error: None,
            logs,
        }
    }

    pub fn failed(error: impl Into<String>, logs: Vec<String>) -> Self {
        Self {
            value: None,
            error: Some(error.into()),
            logs,
        }
    }
}

/// Common capability surface of every sandbox backend.
#[async_trait::async_trait]
pub trait SandboxRuntime: Send + Sync + std::fmt::Debug {
    /// Run one snippet against a snapshot of callable tools.
    async fn execute(&self, code: &str, tools: ToolTable) -> Result<Execution, BridgeError>;

    /// Tear the runtime down. Idempotent; cancels heartbeats and kills any
    /// child process or container.
    async fn dispose(&self);
}

/// Convenience for building a [`ToolHandler`] from an async closure.
pub fn tool_handler<F, Fut>(f: F) -> ToolHandler
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, String>> + Send + 'static,
{
    Arc::new(move |args| Box::pin(f(args)))
}
