//! Type-definition rendering for `get_function_schema`.
//!
//! Turns a tool's JSON schemas into a TypeScript-style snippet: a JSDoc
//! block describing each parameter, the input type, the output type, and
//! the function declaration a snippet author would call.

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value;

use cmb_upstream::ToolDescriptor;

/// Process-wide memo keyed by sanitized tool name. Must be cleared on live
/// reload so descriptor changes become visible.
#[derive(Default)]
pub struct SchemaCache {
    rendered: RwLock<HashMap<String, String>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_render(&self, tool: &ToolDescriptor) -> String {
        if let Ok(cache) = self.rendered.read()
            && let Some(hit) = cache.get(&tool.name)
        {
            return hit.clone();
        }

        let rendered = render_type_definition(tool);
        if let Ok(mut cache) = self.rendered.write() {
            cache.insert(tool.name.clone(), rendered.clone());
        }
        rendered
    }

    pub fn clear(&self) {
        if let Ok(mut cache) = self.rendered.write() {
            cache.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.rendered.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Render the full snippet for one tool.
pub fn render_type_definition(tool: &ToolDescriptor) -> String {
    let type_base = pascal_case(&tool.name);
    let input_type = format!("{type_base}Input");
    let output_type = format!("{type_base}Output");

    let mut out = String::new();

    out.push_str("/**\n");
    if !tool.description.is_empty() {
        for line in tool.description.lines() {
            out.push_str(" * ");
            out.push_str(line);
            out.push('\n');
        }
    }
    for (name, description, optional) in parameter_docs(&tool.input_schema) {
        out.push_str(" * @param ");
        out.push_str(&name);
        if optional {
            out.push_str(" (optional)");
        }
        if !description.is_empty() {
            out.push_str(" - ");
            out.push_str(&description);
        }
        out.push('\n');
    }
    out.push_str(" */\n");

    out.push_str(&format!(
        "declare function {}(input: {input_type}): Promise<{output_type}>;\n\n",
        tool.name
    ));

    out.push_str(&format!(
        "type {input_type} = {};\n",
        render_type(&tool.input_schema, 0)
    ));

    match &tool.output_schema {
        Some(schema) => out.push_str(&format!(
            "\ntype {output_type} = {};\n",
            render_type(schema, 0)
        )),
        None => out.push_str(&format!("\ntype {output_type} = unknown;\n")),
    }

    out
}

fn parameter_docs(schema: &Value) -> Vec<(String, String, bool)> {
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Vec::new();
    };
    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    properties
        .iter()
        .map(|(name, prop)| {
            let description = prop
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            (name.clone(), description, !required.contains(&name.as_str()))
        })
        .collect()
}

/// Render a JSON schema as a TypeScript type expression.
fn render_type(schema: &Value, depth: usize) -> String {
    // Bail out on degenerate nesting rather than recursing forever.
    if depth > 6 {
        return "unknown".to_string();
    }

    if let Some(values) = schema.get("enum").and_then(Value::as_array) {
        let variants: Vec<String> = values
            .iter()
            .map(|v| serde_json::to_string(v).unwrap_or_else(|_| "unknown".into()))
            .collect();
        if !variants.is_empty() {
            return variants.join(" | ");
        }
    }

    match schema.get("type").and_then(Value::as_str) {
        Some("string") => "string".to_string(),
        Some("number") | Some("integer") => "number".to_string(),
        Some("boolean") => "boolean".to_string(),
        Some("null") => "null".to_string(),
        Some("array") => {
            let item = schema
                .get("items")
                .map(|items| render_type(items, depth + 1))
                .unwrap_or_else(|| "unknown".to_string());
            format!("{item}[]")
        }
        Some("object") | None => render_object(schema, depth),
        Some(_) => "unknown".to_string(),
    }
}

fn render_object(schema: &Value, depth: usize) -> String {
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return "Record<string, unknown>".to_string();
    };
    if properties.is_empty() {
        return "Record<string, unknown>".to_string();
    }

    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let indent = "  ".repeat(depth + 1);
    let closing = "  ".repeat(depth);
    let mut out = String::from("{\n");
    for (name, prop) in properties {
        let marker = if required.contains(&name.as_str()) { "" } else { "?" };
        out.push_str(&format!(
            "{indent}{name}{marker}: {};\n",
            render_type(prop, depth + 1)
        ));
    }
    out.push_str(&format!("{closing}}}"));
    out
}

fn pascal_case(name: &str) -> String {
    name.split(['_', '-'])
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn sample_tool() -> ToolDescriptor {
        ToolDescriptor::virtual_tool(
            "files",
            "read",
            "Read a file from the workspace",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "File path to read"},
                    "limit": {"type": "integer", "description": "Max bytes"}
                },
                "required": ["path"]
            }),
            Some(json!({
                "type": "object",
                "properties": {"content": {"type": "string"}},
                "required": ["content"]
            })),
            Arc::new(|_| Box::pin(async { Ok(serde_json::Value::Null) })),
        )
    }

    #[test]
    fn renders_declaration_and_both_types() {
        let rendered = render_type_definition(&sample_tool());
        assert!(rendered.contains("declare function files__read(input: FilesReadInput): Promise<FilesReadOutput>;"));
        assert!(rendered.contains("type FilesReadInput = {"));
        assert!(rendered.contains("path: string;"));
        assert!(rendered.contains("limit?: number;"));
        assert!(rendered.contains("type FilesReadOutput = {"));
        assert!(rendered.contains("content: string;"));
    }

    #[test]
    fn jsdoc_lists_every_parameter() {
        let rendered = render_type_definition(&sample_tool());
        assert!(rendered.contains(" * Read a file from the workspace"));
        assert!(rendered.contains(" * @param path - File path to read"));
        assert!(rendered.contains(" * @param limit (optional) - Max bytes"));
    }

    #[test]
    fn missing_output_schema_renders_unknown() {
        let tool = ToolDescriptor::virtual_tool(
            "x",
            "y",
            "",
            json!({"type": "object", "properties": {}}),
            None,
            Arc::new(|_| Box::pin(async { Ok(serde_json::Value::Null) })),
        );
        let rendered = render_type_definition(&tool);
        assert!(rendered.contains("type XYOutput = unknown;"));
        assert!(rendered.contains("type XYInput = Record<string, unknown>;"));
    }

    #[test]
    fn enums_arrays_and_nesting_render() {
        let tool = ToolDescriptor::virtual_tool(
            "svc",
            "op",
            "",
            json!({
                "type": "object",
                "properties": {
                    "mode": {"enum": ["fast", "slow"]},
                    "tags": {"type": "array", "items": {"type": "string"}},
                    "nested": {
                        "type": "object",
                        "properties": {"deep": {"type": "boolean"}},
                        "required": ["deep"]
                    }
                },
                "required": ["mode"]
            }),
            None,
            Arc::new(|_| Box::pin(async { Ok(serde_json::Value::Null) })),
        );
        let rendered = render_type_definition(&tool);
        assert!(rendered.contains("mode: \"fast\" | \"slow\";"));
        assert!(rendered.contains("tags?: string[];"));
        assert!(rendered.contains("deep: boolean;"));
    }

    #[test]
    fn cache_memoizes_until_cleared() {
        let cache = SchemaCache::new();
        let tool = sample_tool();

        assert!(cache.is_empty());
        let first = cache.get_or_render(&tool);
        assert_eq!(cache.len(), 1);
        let second = cache.get_or_render(&tool);
        assert_eq!(first, second);

        cache.clear();
        assert!(cache.is_empty());
    }
}
