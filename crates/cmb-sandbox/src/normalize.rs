//! Snippet shape normalization.
//!
//! The eval tool accepts either a single (possibly async) arrow-function
//! expression, used as-is, or a bag of statements that gets wrapped into an
//! async closure whose final expression statement becomes the return value.
//! The scanner tracks nesting and string/template/comment state so splitting
//! on `;` only happens at the top level; it never needs a full JS parser.

/// Normalize a snippet into a callable expression string.
pub fn normalize_snippet(code: &str) -> String {
    let trimmed = code.trim();
    if trimmed.is_empty() {
        return "(async () => { return null; })".to_string();
    }

    if is_arrow_expression(trimmed) {
        return format!("({trimmed})");
    }

    let statements = split_top_level(trimmed);
    let mut body = String::new();
    let count = statements.len();
    for (index, stmt) in statements.into_iter().enumerate() {
        let stmt = stmt.trim();
        if stmt.is_empty() {
            continue;
        }
        if index + 1 == count && !starts_with_statement_keyword(stmt) {
            body.push_str("return ");
        }
        body.push_str(stmt);
        body.push(';');
        body.push(' ');
    }

    format!("(async () => {{ {} }})", body.trim_end())
}

/// True when the snippet reads as one arrow-function expression.
fn is_arrow_expression(code: &str) -> bool {
    let rest = code.strip_prefix("async").map(str::trim_start).unwrap_or(code);

    let params_end = if rest.starts_with('(') {
        match matching_paren(rest) {
            Some(end) => end + 1,
            None => return false,
        }
    } else {
        let ident_len = rest
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '$')
            .count();
        if ident_len == 0 {
            return false;
        }
        ident_len
    };

    rest[params_end..].trim_start().starts_with("=>")
}

/// Index of the `)` matching the `(` at position 0.
fn matching_paren(code: &str) -> Option<usize> {
    let mut scanner = Scanner::default();
    for (index, c) in code.char_indices() {
        scanner.step(c);
        if scanner.depth == 0 && c == ')' && !scanner.in_literal() {
            return Some(index);
        }
    }
    None
}

/// Split on `;` at nesting depth zero, outside strings and comments.
fn split_top_level(code: &str) -> Vec<String> {
    let mut scanner = Scanner::default();
    let mut parts = Vec::new();
    let mut current = String::new();

    for c in code.chars() {
        if c == ';' && scanner.depth == 0 && !scanner.in_literal() {
            parts.push(std::mem::take(&mut current));
            continue;
        }
        scanner.step(c);
        current.push(c);
    }
    if !current.trim().is_empty() {
        parts.push(current);
    }
    parts
}

fn starts_with_statement_keyword(stmt: &str) -> bool {
    const KEYWORDS: &[&str] = &[
        "const", "let", "var", "return", "if", "for", "while", "do", "switch",
        "function", "class", "throw", "try", "break", "continue",
    ];
    let word: String = stmt
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    KEYWORDS.contains(&word.as_str())
}

/// Tracks nesting depth and literal state, character by character.
#[derive(Default)]
struct Scanner {
    depth: i32,
    quote: Option<char>,
    escaped: bool,
    line_comment: bool,
    block_comment: bool,
    previous: Option<char>,
}

impl Scanner {
    fn in_literal(&self) -> bool {
        self.quote.is_some() || self.line_comment || self.block_comment
    }

    fn step(&mut self, c: char) {
        let previous = self.previous.replace(c);

        if self.line_comment {
            if c == '\n' {
                self.line_comment = false;
            }
            return;
        }
        if self.block_comment {
            if previous == Some('*') && c == '/' {
                self.block_comment = false;
            }
            return;
        }
        if let Some(quote) = self.quote {
            if self.escaped {
                self.escaped = false;
            } else if c == '\\' {
                self.escaped = true;
            } else if c == quote {
                self.quote = None;
            }
            return;
        }

        match c {
            '\'' | '"' | '`' => self.quote = Some(c),
            '/' if previous == Some('/') => self.line_comment = true,
            '*' if previous == Some('/') => self.block_comment = true,
            '(' | '[' | '{' => self.depth += 1,
            ')' | ']' | '}' => self.depth -= 1,
            _ => {}
        }
    }
}
