//! Tool descriptors: the unit the registry, the discovery tools, and the
//! sandbox tool table all share.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use rmcp::RoleClient;
use rmcp::model::{CallToolRequestParam, CallToolResult};
use rmcp::service::Peer;
use serde_json::Value;

use cmb_core::namespaced_tool_name;

/// In-process executor for virtual servers.
pub type VirtualHandler = Arc<
    dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value, String>> + Send>> + Send + Sync,
>;

enum ToolExecutor {
    /// Forwarded to the owning upstream client.
    Remote(Peer<RoleClient>),
    /// Runs inside the bridge process.
    Virtual(VirtualHandler),
}

/// One namespaced tool.
///
/// Descriptors are created at connect time, replaced atomically when their
/// server reconnects, and removed on disconnect.
pub struct ToolDescriptor {
    /// Sanitized public name, `<server>__<tool>` after identifier cleanup.
    pub name: String,
    /// Owning server, as named in the config.
    pub server: String,
    /// Original un-namespaced tool name, used for upstream dispatch.
    pub tool_name: String,
    pub description: String,
    /// Normalized input schema (always an object schema).
    pub input_schema: Value,
    /// The upstream schema exactly as received.
    pub raw_input_schema: Value,
    pub output_schema: Option<Value>,
    executor: ToolExecutor,
}

/// Flat listing row used by discovery.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ToolListEntry {
    pub server: String,
    pub name: String,
    pub description: String,
}

impl ToolDescriptor {
    pub fn remote(server: &str, tool: rmcp::model::Tool, peer: Peer<RoleClient>) -> Self {
        let raw = Value::Object((*tool.input_schema).clone());
        Self {
            name: namespaced_tool_name(server, &tool.name),
            server: server.to_string(),
            tool_name: tool.name.to_string(),
            description: tool
                .description
                .as_deref()
                .unwrap_or_default()
                .to_string(),
            input_schema: normalize_schema(&raw),
            raw_input_schema: raw,
            output_schema: tool
                .output_schema
                .as_ref()
                .map(|schema| Value::Object((**schema).clone())),
            executor: ToolExecutor::Remote(peer),
        }
    }

    pub fn virtual_tool(
        server: &str,
        tool_name: &str,
        description: &str,
        input_schema: Value,
        output_schema: Option<Value>,
        handler: VirtualHandler,
    ) -> Self {
        Self {
            name: namespaced_tool_name(server, tool_name),
            server: server.to_string(),
            tool_name: tool_name.to_string(),
            description: description.to_string(),
            input_schema: normalize_schema(&input_schema),
            raw_input_schema: input_schema,
            output_schema,
            executor: ToolExecutor::Virtual(handler),
        }
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self.executor, ToolExecutor::Virtual(_))
    }

    /// Run the tool. Errors are strings so they can feed a rejected promise
    /// in the sandbox unchanged.
    pub async fn execute(&self, args: Value) -> Result<Value, String> {
        match &self.executor {
            ToolExecutor::Virtual(handler) => handler(args).await,
            ToolExecutor::Remote(peer) => {
                let mut request = CallToolRequestParam::new(self.tool_name.clone());
                if let Some(arguments) = args.as_object().cloned() {
                    request = request.with_arguments(arguments);
                }
                let result = peer
                    .call_tool(request)
                    .await
                    .map_err(|e| format!("upstream '{}' failed: {e}", self.server))?;
                call_result_to_value(result)
            }
        }
    }

    pub fn list_entry(&self) -> ToolListEntry {
        ToolListEntry {
            server: self.server.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
        }
    }
}

/// Upstream schemas are occasionally missing `type`/`properties`; the
/// normalized form always carries both so downstream rendering can rely on
/// the shape.
fn normalize_schema(raw: &Value) -> Value {
    let mut schema = match raw {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    schema
        .entry("type")
        .or_insert_with(|| Value::String("object".into()));
    schema
        .entry("properties")
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    Value::Object(schema)
}

fn call_result_to_value(result: CallToolResult) -> Result<Value, String> {
    let first_text = result
        .content
        .iter()
        .find_map(|item| item.as_text().map(|t| t.text.clone()));

    if result.is_error.unwrap_or(false) {
        return Err(first_text.unwrap_or_else(|| "tool call failed".to_string()));
    }

    match first_text {
        // Upstream text payloads are frequently JSON; pass structure through
        // when they are, raw text otherwise.
        Some(text) => Ok(serde_json::from_str(&text).unwrap_or(Value::String(text))),
        None => Ok(Value::Null),
    }
}
