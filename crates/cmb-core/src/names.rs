//! Tool-name namespacing and identifier sanitization.
//!
//! Upstream tools are keyed internally as `<server>__<tool>`. Before that
//! name is exposed anywhere outside the registry (discovery tools, the
//! in-sandbox `codemode` object, MCP tool lists) it is sanitized into a
//! valid identifier: non-identifier characters become `_`, a leading digit
//! gets a `_` prefix, and reserved words get a `_` suffix.

use sha2::{Digest, Sha256};

/// Separates the server name from the tool name in a namespaced tool name.
pub const TOOL_NAME_DELIMITER: &str = "__";

/// Hard cap on exposed tool-name length. Longer names are truncated with a
/// digest tail so distinct tools stay distinct.
const MAX_TOOL_NAME_LENGTH: usize = 64;

const RESERVED_WORDS: &[&str] = &[
    "await", "break", "case", "catch", "class", "const", "continue", "debugger",
    "default", "delete", "do", "else", "enum", "export", "extends", "false",
    "finally", "for", "function", "if", "import", "in", "instanceof", "let",
    "new", "null", "return", "static", "super", "switch", "this", "throw",
    "true", "try", "typeof", "var", "void", "while", "with", "yield",
];

/// Sanitize a single name segment into a valid identifier.
pub fn sanitize_identifier(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();

    if out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }

    if RESERVED_WORDS.contains(&out.as_str()) {
        out.push('_');
    }

    out
}

/// Build the public (sanitized, length-capped) name for a tool.
pub fn namespaced_tool_name(server: &str, tool: &str) -> String {
    let qualified = format!(
        "{}{}{}",
        sanitize_identifier(server),
        TOOL_NAME_DELIMITER,
        sanitize_identifier(tool)
    );

    if qualified.len() <= MAX_TOOL_NAME_LENGTH {
        return qualified;
    }

    let mut hasher = Sha256::new();
    hasher.update(qualified.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    let tail = &digest[..16];
    let prefix_len = MAX_TOOL_NAME_LENGTH - tail.len();
    format!("{}{}", &qualified[..prefix_len], tail)
}
