//! Deterministic, model-free structural repair (cascade layer 1).
//!
//! Everything in this module is a pure function of its input: given the
//! same malformed text, it produces the same corrected output on every
//! call. The fixes cover the common ways models mangle JSON:
//!
//! - prose or markdown fences wrapped around the payload
//! - truncated output (unbalanced braces/brackets, unterminated strings)
//! - trailing commas
//! - near-miss field names (`sectionTitle` for `title`, `Sections` for
//!   `sections`)

use serde_json::Value;

use crate::schema::OutputSchema;

/// Attempts to recover a schema-valid value from raw model output without
/// any model call.
///
/// Returns `None` when no deterministic fix produces a value that passes
/// schema validation.
#[must_use]
pub fn auto_repair(raw: &str, schema: &OutputSchema) -> Option<Value> {
    let value = parse_lenient(raw)?;
    let value = coerce_field_names(value, schema);
    match schema.validate(&value) {
        Ok(()) => Some(value),
        Err(_) => None,
    }
}

/// Best-effort parse of raw model output into JSON, applying structural
/// fixes but no schema-driven coercion.
#[must_use]
pub(crate) fn parse_lenient(raw: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str(raw) {
        return Some(value);
    }

    let stripped = strip_code_fences(raw);
    if let Ok(value) = serde_json::from_str(stripped) {
        return Some(value);
    }

    let span = extract_json_span(stripped)?;
    if let Ok(value) = serde_json::from_str(span) {
        return Some(value);
    }

    let repaired = balance_delimiters(&remove_trailing_commas(span));
    serde_json::from_str(&repaired).ok()
}

/// Returns the contents of the first markdown code fence, if the text is
/// fenced; otherwise returns the input unchanged.
pub(crate) fn strip_code_fences(raw: &str) -> &str {
    let Some(open) = raw.find("```") else {
        return raw;
    };
    let after_fence = &raw[open + 3..];
    // Skip an optional language tag on the fence line.
    let body_start = after_fence.find('\n').map_or(0, |i| i + 1);
    let body = &after_fence[body_start..];
    match body.find("```") {
        Some(close) => &body[..close],
        // Unterminated fence: take everything after the opener.
        None => body,
    }
}

/// Returns the span from the first `{` or `[` to the last matching closer
/// candidate. The span may still be unbalanced; later passes fix that.
pub(crate) fn extract_json_span(raw: &str) -> Option<&str> {
    let start = raw.find(['{', '['])?;
    let opener = raw.as_bytes()[start];
    let closer = if opener == b'{' { '}' } else { ']' };
    match raw.rfind(closer) {
        Some(end) if end > start => Some(&raw[start..=end]),
        // No closer at all: hand the truncated tail to the balancer.
        _ => Some(&raw[start..]),
    }
}

/// Removes commas that directly precede a closing brace or bracket.
pub(crate) fn remove_trailing_commas(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in raw.char_indices() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            ',' => {
                let next_significant = raw[i + 1..].chars().find(|ch| !ch.is_whitespace());
                if !matches!(next_significant, Some('}' | ']')) {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }

    out
}

/// Closes unterminated strings and appends missing closing delimiters.
pub(crate) fn balance_delimiters(raw: &str) -> String {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in raw.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&c) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }

    let mut out = String::from(raw);
    // Drop a dangling comma left by truncation mid-list.
    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    if in_string {
        out.push('"');
    }
    if out.ends_with(',') {
        out.pop();
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

/// Renames top-level keys that are near misses of schema field names.
///
/// A key matches a schema field when both normalize to the same token
/// (lowercased, separators removed). Exact-name fields are never touched,
/// and a near miss is only applied when the schema field is absent.
#[must_use]
pub(crate) fn coerce_field_names(value: Value, schema: &OutputSchema) -> Value {
    let Value::Object(mut map) = value else {
        return value;
    };

    for spec in &schema.fields {
        if map.contains_key(&spec.name) {
            continue;
        }
        let wanted = normalize_key(&spec.name);
        let near_miss = map
            .keys()
            .find(|k| normalize_key(k) == wanted)
            .cloned();
        if let Some(key) = near_miss {
            if let Some(v) = map.remove(&key) {
                map.insert(spec.name.clone(), v);
            }
        }
    }

    Value::Object(map)
}

fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '_' && *c != '-' && *c != ' ')
        .flat_map(char::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldKind, OutputSchema};
    use serde_json::json;

    fn schema() -> OutputSchema {
        OutputSchema::new("course_outline")
            .field("title", FieldKind::String)
            .field("description", FieldKind::String)
            .field("sections", FieldKind::Array)
    }

    #[test]
    fn valid_json_passes_through() {
        let raw = r#"{"title": "T", "description": "D", "sections": []}"#;
        let value = auto_repair(raw, &schema()).unwrap();
        assert_eq!(value["title"], "T");
    }

    #[test]
    fn strips_markdown_fences() {
        let raw = "Here is the course:\n```json\n{\"title\": \"T\", \"description\": \"D\", \"sections\": []}\n```\nHope this helps!";
        assert!(auto_repair(raw, &schema()).is_some());
    }

    #[test]
    fn extracts_object_from_surrounding_prose() {
        let raw = "Sure! {\"title\": \"T\", \"description\": \"D\", \"sections\": []} Let me know.";
        assert!(auto_repair(raw, &schema()).is_some());
    }

    #[test]
    fn removes_trailing_commas() {
        let raw = r#"{"title": "T", "description": "D", "sections": [1, 2,],}"#;
        let value = auto_repair(raw, &schema()).unwrap();
        assert_eq!(value["sections"], json!([1, 2]));
    }

    #[test]
    fn balances_truncated_output() {
        let raw = r#"{"title": "T", "description": "D", "sections": [{"heading": "Basics""#;
        let value = auto_repair(raw, &schema()).unwrap();
        assert_eq!(value["sections"][0]["heading"], "Basics");
    }

    #[test]
    fn coerces_near_miss_field_names() {
        let raw = r#"{"Title": "T", "description": "D", "Sections": []}"#;
        let value = auto_repair(raw, &schema()).unwrap();
        assert_eq!(value["title"], "T");
        assert!(value["sections"].is_array());
    }

    #[test]
    fn commas_inside_strings_survive() {
        let raw = r#"{"title": "Soil, Water, Life", "description": "D", "sections": []}"#;
        let value = auto_repair(raw, &schema()).unwrap();
        assert_eq!(value["title"], "Soil, Water, Life");
    }

    #[test]
    fn error_prose_is_not_repairable() {
        assert!(auto_repair("Error executing conversion: timeout", &schema()).is_none());
    }

    #[test]
    fn repair_is_deterministic() {
        let raw = "```json\n{\"Title\": \"T\", \"description\": \"D\", \"sections\": [1,]\n```";
        let first = auto_repair(raw, &schema());
        let second = auto_repair(raw, &schema());
        assert_eq!(first, second);
        assert!(first.is_some());
    }

    #[test]
    fn unbalanced_but_wrong_shape_is_rejected() {
        // Parses after repair, but misses required fields.
        assert!(auto_repair(r#"{"title": "T""#, &schema()).is_none());
    }
}
