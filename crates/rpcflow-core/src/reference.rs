//! `${...}` reference parsing and resolution.
//!
//! References select values from step results, the flow context, step
//! metadata, and loop scope variables. Two shapes are supported:
//!
//! - a reference spanning an entire string resolves to the raw value at
//!   the path (which may be any JSON type);
//! - references embedded in a larger string are replaced by their value's
//!   text form, with objects and arrays rendered as compact JSON.
//!
//! Paths use dotted names, bracketed indices, bracketed quoted keys, and
//! bracketed expressions that are themselves evaluated. A resolved value
//! that is itself a reference string is resolved again; a visited set per
//! top-level call catches self-referential chains.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde_json::Value;

use crate::error::{FlowError, Result};
use crate::scope::ScopeChain;

/// Reference root naming the flow context.
pub const CONTEXT_ROOT: &str = "context";
/// Reference root naming the current step's metadata.
pub const METADATA_ROOT: &str = "metadata";

// ---------------------------------------------------------------------------
// Evaluation hook
// ---------------------------------------------------------------------------

/// Evaluates a bracketed sub-expression during path resolution. Implemented
/// by the expression evaluator; kept as a trait so path parsing stays pure.
pub trait ExprEval {
    fn eval_in_env(&self, expr: &str, env: &ResolveEnv<'_>) -> Result<Value>;
}

// ---------------------------------------------------------------------------
// Resolution environment
// ---------------------------------------------------------------------------

/// Everything a reference can resolve against.
#[derive(Debug, Clone, Copy)]
pub struct ResolveEnv<'a> {
    /// Step results (as JSON), keyed by step name.
    pub results: &'a HashMap<String, Value>,
    /// The flow's immutable context.
    pub context: &'a HashMap<String, Value>,
    /// The current step's metadata.
    pub metadata: &'a HashMap<String, Value>,
    /// In-scope loop/transform variables.
    pub scope: &'a ScopeChain,
}

impl ResolveEnv<'_> {
    /// Root names a reference could start with, for error messages.
    pub fn available_roots(&self) -> Vec<String> {
        let mut roots = self.scope.names();
        roots.push(CONTEXT_ROOT.to_string());
        roots.push(METADATA_ROOT.to_string());
        let mut steps: Vec<String> = self.results.keys().cloned().collect();
        steps.sort();
        roots.extend(steps);
        roots
    }
}

// ---------------------------------------------------------------------------
// Path grammar
// ---------------------------------------------------------------------------

/// One segment of a parsed reference path.
#[derive(Debug, Clone, PartialEq)]
pub enum PathSegment {
    /// A dotted name, bracketed quoted key, or the root identifier.
    Key(String),
    /// A bracketed integer index.
    Index(usize),
    /// A bracketed expression, evaluated at resolution time.
    Expr(String),
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$' || c == '-'
}

fn is_operator_char(c: char) -> bool {
    matches!(c, '+' | '*' | '/' | '%' | '=' | '<' | '>' | '!' | '&' | '|' | '?')
}

fn syntax_error(path: &str, message: impl Into<String>) -> FlowError {
    FlowError::PathSyntax {
        path: path.to_string(),
        message: message.into(),
    }
}

/// Parse the text between `${` and `}` into path segments.
pub fn parse_path(raw: &str) -> Result<Vec<PathSegment>> {
    let chars: Vec<char> = raw.chars().collect();
    if chars.is_empty() {
        return Err(syntax_error(raw, "empty reference"));
    }

    let mut segments = Vec::new();
    let mut i = 0;

    // Root identifier.
    if is_operator_char(chars[0]) || chars[0] == '-' || chars[0] == '.' {
        return Err(syntax_error(raw, "operator in identifier position"));
    }
    if !is_ident_start(chars[0]) {
        return Err(syntax_error(raw, format!("unexpected character '{}'", chars[0])));
    }
    let mut root = String::new();
    while i < chars.len() && is_ident_char(chars[i]) {
        root.push(chars[i]);
        i += 1;
    }
    segments.push(PathSegment::Key(root));

    while i < chars.len() {
        match chars[i] {
            '.' => {
                i += 1;
                if i >= chars.len() {
                    return Err(syntax_error(raw, "trailing dot"));
                }
                if chars[i] == '.' || chars[i] == '[' {
                    return Err(syntax_error(raw, "empty segment"));
                }
                if is_operator_char(chars[i]) || chars[i] == '-' {
                    return Err(syntax_error(raw, "operator in identifier position"));
                }
                if !is_ident_start(chars[i]) && !chars[i].is_ascii_digit() {
                    return Err(syntax_error(
                        raw,
                        format!("unexpected character '{}'", chars[i]),
                    ));
                }
                let mut name = String::new();
                while i < chars.len() && is_ident_char(chars[i]) {
                    name.push(chars[i]);
                    i += 1;
                }
                segments.push(PathSegment::Key(name));
            }
            '[' => {
                let (content, end) = scan_bracket(&chars, i, raw)?;
                if content.is_empty() {
                    return Err(syntax_error(raw, "empty brackets"));
                }
                segments.push(classify_bracket(&content));
                i = end + 1;
            }
            other => {
                return Err(syntax_error(raw, format!("unexpected character '{other}'")));
            }
        }
    }

    Ok(segments)
}

/// Scan a bracketed segment starting at `open` (the `[`). Returns the
/// content and the index of the matching `]`.
fn scan_bracket(chars: &[char], open: usize, raw: &str) -> Result<(String, usize)> {
    let mut depth = 1usize;
    let mut in_quote: Option<char> = None;
    let mut content = String::new();
    let mut i = open + 1;
    while i < chars.len() {
        let c = chars[i];
        match in_quote {
            Some(q) => {
                if c == q {
                    in_quote = None;
                }
                content.push(c);
            }
            None => match c {
                '\'' | '"' => {
                    in_quote = Some(c);
                    content.push(c);
                }
                '[' => {
                    depth += 1;
                    content.push(c);
                }
                ']' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok((content.trim().to_string(), i));
                    }
                    content.push(c);
                }
                _ => content.push(c),
            },
        }
        i += 1;
    }
    Err(syntax_error(raw, "unclosed bracket"))
}

fn classify_bracket(content: &str) -> PathSegment {
    let chars: Vec<char> = content.chars().collect();
    if chars.len() >= 2 {
        let first = chars[0];
        let last = chars[chars.len() - 1];
        if (first == '\'' || first == '"') && last == first {
            let inner: String = chars[1..chars.len() - 1].iter().collect();
            if !inner.contains(first) {
                return PathSegment::Key(inner);
            }
        }
    }
    if !chars.is_empty() && chars.iter().all(|c| c.is_ascii_digit()) {
        if let Ok(index) = content.parse::<usize>() {
            return PathSegment::Index(index);
        }
    }
    PathSegment::Expr(content.to_string())
}

// ---------------------------------------------------------------------------
// Template scanning
// ---------------------------------------------------------------------------

/// A piece of a string template: literal text or a `${...}` reference.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    Text(String),
    Ref(String),
}

/// Split a string into literal text and reference parts. Reference bodies
/// may nest further `${...}` inside brackets.
pub fn parse_template(text: &str) -> Result<Vec<TemplatePart>> {
    let chars: Vec<char> = text.chars().collect();
    let mut parts = Vec::new();
    let mut buf = String::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '$' && i + 1 < chars.len() && chars[i + 1] == '{' {
            let close = find_closing_brace(&chars, i + 2)
                .ok_or_else(|| syntax_error(text, "unclosed reference"))?;
            if !buf.is_empty() {
                parts.push(TemplatePart::Text(std::mem::take(&mut buf)));
            }
            let content: String = chars[i + 2..close].iter().collect();
            parts.push(TemplatePart::Ref(content));
            i = close + 1;
        } else {
            buf.push(chars[i]);
            i += 1;
        }
    }
    if !buf.is_empty() {
        parts.push(TemplatePart::Text(buf));
    }
    Ok(parts)
}

/// Index of the `}` matching an opening `${`, starting the scan just after
/// the `{`. Quote- and nesting-aware.
pub(crate) fn find_closing_brace(chars: &[char], start: usize) -> Option<usize> {
    let mut depth = 1usize;
    let mut in_quote: Option<char> = None;
    let mut i = start;
    while i < chars.len() {
        let c = chars[i];
        match in_quote {
            Some(q) => {
                if c == q {
                    in_quote = None;
                }
            }
            None => match c {
                '\'' | '"' => in_quote = Some(c),
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(i);
                    }
                }
                _ => {}
            },
        }
        i += 1;
    }
    None
}

/// Whether a string contains any reference marker.
pub fn is_reference_string(text: &str) -> bool {
    text.contains("${")
}

/// All first path segments of every `${...}` occurrence in `text`,
/// including references nested inside brackets.
pub fn extract_reference_roots(text: &str) -> BTreeSet<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut roots = BTreeSet::new();
    let mut i = 0;
    while i + 1 < chars.len() {
        if chars[i] == '$' && chars[i + 1] == '{' {
            let mut j = i + 2;
            let mut root = String::new();
            while j < chars.len() && is_ident_char(chars[j]) {
                root.push(chars[j]);
                j += 1;
            }
            if !root.is_empty() {
                roots.insert(root);
            }
            // Keep scanning inside the body to catch nested references.
            i += 2;
        } else {
            i += 1;
        }
    }
    roots
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Resolve a string that may contain references.
///
/// A single reference spanning the whole string returns the raw value at
/// the path; embedded references render as text. Strings without any
/// marker pass through unchanged.
pub fn resolve_template(text: &str, env: &ResolveEnv<'_>, eval: &dyn ExprEval) -> Result<Value> {
    let mut visited = HashSet::new();
    resolve_template_inner(text, env, eval, &mut visited)
}

fn resolve_template_inner(
    text: &str,
    env: &ResolveEnv<'_>,
    eval: &dyn ExprEval,
    visited: &mut HashSet<String>,
) -> Result<Value> {
    let parts = parse_template(text)?;
    match parts.as_slice() {
        [TemplatePart::Ref(raw)] => resolve_path(raw, env, eval, visited),
        _ => {
            let mut out = String::new();
            for part in &parts {
                match part {
                    TemplatePart::Text(t) => out.push_str(t),
                    TemplatePart::Ref(raw) => {
                        let value = resolve_path(raw, env, eval, visited)?;
                        out.push_str(&value_to_text(&value)?);
                    }
                }
            }
            Ok(Value::String(out))
        }
    }
}

/// Resolve one parsed reference path against the environment.
pub fn resolve_path(
    raw: &str,
    env: &ResolveEnv<'_>,
    eval: &dyn ExprEval,
    visited: &mut HashSet<String>,
) -> Result<Value> {
    if !visited.insert(raw.to_string()) {
        return Err(FlowError::CircularReference {
            path: raw.to_string(),
        });
    }

    let segments = parse_path(raw)?;
    let root = match &segments[0] {
        PathSegment::Key(k) => k.as_str(),
        _ => return Err(syntax_error(raw, "reference must start with an identifier")),
    };

    let mut current = lookup_root(root, raw, env)?;
    for segment in &segments[1..] {
        current = match segment {
            PathSegment::Key(key) => access_key(&current, key, raw)?,
            PathSegment::Index(index) => access_index(&current, *index, raw)?,
            PathSegment::Expr(expr) => {
                let key = eval.eval_in_env(expr, env)?;
                match key {
                    Value::String(s) => access_key(&current, &s, raw)?,
                    Value::Number(n) => {
                        let index = n.as_u64().ok_or_else(|| FlowError::PropertyAccess {
                            path: raw.to_string(),
                            segment: expr.clone(),
                            message: "bracket expression must yield a non-negative integer"
                                .to_string(),
                        })?;
                        access_index(&current, index as usize, raw)?
                    }
                    other => {
                        return Err(FlowError::PropertyAccess {
                            path: raw.to_string(),
                            segment: expr.clone(),
                            message: format!(
                                "bracket expression must yield a string or integer, got {}",
                                type_name(&other)
                            ),
                        });
                    }
                }
            }
        };
    }

    // A resolved value that is itself a reference string resolves again;
    // the visited set bounds self-referential chains.
    if let Value::String(s) = &current {
        if is_reference_string(s) {
            let resolved = resolve_template_inner(&s.clone(), env, eval, visited)?;
            visited.remove(raw);
            return Ok(resolved);
        }
    }

    visited.remove(raw);
    Ok(current)
}

fn lookup_root(root: &str, raw: &str, env: &ResolveEnv<'_>) -> Result<Value> {
    if let Some(value) = env.scope.lookup(root) {
        return Ok(value.clone());
    }
    if root == CONTEXT_ROOT {
        return Ok(Value::Object(
            env.context
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ));
    }
    if root == METADATA_ROOT {
        return Ok(Value::Object(
            env.metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ));
    }
    if let Some(value) = env.results.get(root) {
        return Ok(value.clone());
    }
    Err(FlowError::UnknownReference {
        root: root.to_string(),
        path: raw.to_string(),
        available: env.available_roots(),
    })
}

/// Navigate one object key. Exported for the expression evaluator's member
/// access, which shares the failure modes.
pub fn access_key(value: &Value, key: &str, path: &str) -> Result<Value> {
    match value {
        Value::Object(map) => map.get(key).cloned().ok_or_else(|| FlowError::PropertyAccess {
            path: path.to_string(),
            segment: key.to_string(),
            message: format!("property '{key}' not found"),
        }),
        other => Err(FlowError::PropertyAccess {
            path: path.to_string(),
            segment: key.to_string(),
            message: format!("cannot access property of {}", type_name(other)),
        }),
    }
}

/// Navigate one array index.
pub fn access_index(value: &Value, index: usize, path: &str) -> Result<Value> {
    match value {
        Value::Array(items) => items.get(index).cloned().ok_or_else(|| {
            FlowError::PropertyAccess {
                path: path.to_string(),
                segment: index.to_string(),
                message: format!("index {index} out of bounds (length {})", items.len()),
            }
        }),
        other => Err(FlowError::PropertyAccess {
            path: path.to_string(),
            segment: index.to_string(),
            message: format!("cannot index into {}", type_name(other)),
        }),
    }
}

/// Recursively resolve every reference-bearing string inside a value.
/// Whole-string references keep their raw type; embedded ones render as
/// text.
pub fn resolve_value(value: &Value, env: &ResolveEnv<'_>, eval: &dyn ExprEval) -> Result<Value> {
    match value {
        Value::String(s) if is_reference_string(s) => resolve_template(s, env, eval),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(resolve_value(item, env, eval)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve_value(v, env, eval)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Text form of a value for embedding into a larger string. Non-primitive
/// values serialize as compact JSON.
pub fn value_to_text(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Null => Ok("null".to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        other => serde_json::to_string(other).map_err(|e| FlowError::InvalidReference {
            message: format!("failed to serialize referenced value: {e}"),
        }),
    }
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
