//! Virtual `utils` server shipped with the bridge.
//!
//! These tools run in-process and are exposed to snippets only; they are
//! not registered as top-level MCP tools.

use std::sync::Arc;

use serde_json::{Value, json};

use crate::descriptor::ToolDescriptor;
use crate::manager::UpstreamManager;

pub const UTILS_SERVER_NAME: &str = "utils";

/// Register the built-in YAML helpers.
pub async fn register_utils(manager: &UpstreamManager) {
    manager
        .register_server(UTILS_SERVER_NAME, vec![yaml_parse(), yaml_stringify()])
        .await;
}

fn yaml_parse() -> ToolDescriptor {
    ToolDescriptor::virtual_tool(
        UTILS_SERVER_NAME,
        "yaml_parse",
        "Parse a YAML document into a JSON value",
        json!({
            "type": "object",
            "properties": {
                "text": {"type": "string", "description": "YAML source text"}
            },
            "required": ["text"]
        }),
        None,
        Arc::new(|args| {
            Box::pin(async move {
                let text = args
                    .get("text")
                    .and_then(Value::as_str)
                    .ok_or_else(|| "missing required parameter 'text'".to_string())?;
                serde_yaml::from_str::<Value>(text)
                    .map_err(|e| format!("invalid YAML: {e}"))
            })
        }),
    )
}

fn yaml_stringify() -> ToolDescriptor {
    ToolDescriptor::virtual_tool(
        UTILS_SERVER_NAME,
        "yaml_stringify",
        "Render a JSON value as a YAML document",
        json!({
            "type": "object",
            "properties": {
                "value": {"description": "Value to render"}
            },
            "required": ["value"]
        }),
        Some(json!({
            "type": "object",
            "properties": {"yaml": {"type": "string"}}
        })),
        Arc::new(|args| {
            Box::pin(async move {
                let value = args
                    .get("value")
                    .cloned()
                    .ok_or_else(|| "missing required parameter 'value'".to_string())?;
                let yaml = serde_yaml::to_string(&value)
                    .map_err(|e| format!("value is not representable as YAML: {e}"))?;
                Ok(json!({"yaml": yaml}))
            })
        }),
    )
}
