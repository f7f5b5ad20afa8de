//! Lenient JSON recovery for LLM output
//!
//! Sub-agent replies are supposed to be a single JSON object, but models
//! routinely wrap them in markdown fences, prepend prose, use smart quotes,
//! or leave trailing commas. `repair_json` peels all of that off before
//! handing the text to serde.

use crate::types::{AppError, AppResult};
use serde_json::Value;

/// Parse a possibly messy LLM reply into a JSON value.
///
/// Strategy, in order:
/// 1. strip markdown code fences
/// 2. cut to the outermost `{...}` (or `[...]`) span
/// 3. try a strict parse
/// 4. normalize smart quotes, Python literals and trailing commas, retry
pub fn repair_json(raw: &str) -> AppResult<Value> {
    let candidate = extract_json_span(strip_code_fences(raw));

    if candidate.is_empty() {
        return Err(AppError::Protocol(format!(
            "No JSON object found in response: {}",
            truncate(raw, 200)
        )));
    }

    if let Ok(value) = serde_json::from_str::<Value>(candidate) {
        return Ok(value);
    }

    let repaired = remove_trailing_commas(&normalize_literals(candidate));
    serde_json::from_str::<Value>(&repaired).map_err(|e| {
        AppError::Protocol(format!(
            "Failed to parse JSON after repair: {} (input: {})",
            e,
            truncate(candidate, 200)
        ))
    })
}

/// Strip ```json ... ``` (or bare ```) fences, keeping the fenced body.
fn strip_code_fences(text: &str) -> &str {
    if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        // Skip an optional language tag on the fence line
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        if let Some(end) = body.find("```") {
            return body[..end].trim();
        }
        return body.trim();
    }
    text.trim()
}

/// Cut the text down to the outermost balanced JSON object or array.
fn extract_json_span(text: &str) -> &str {
    let open = text.find(['{', '[']);
    let Some(start) = open else { return "" };
    let opener = text.as_bytes()[start] as char;
    let closer = if opener == '{' { '}' } else { ']' };

    // Walk from the end so embedded prose after the object is dropped
    if let Some(end) = text.rfind(closer) {
        if end > start {
            return text[start..=end].trim();
        }
    }
    text[start..].trim()
}

/// Replace smart quotes and Python literals outside of string context.
fn normalize_literals(text: &str) -> String {
    let mut out = text
        .replace(['\u{201C}', '\u{201D}', '\u{201E}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");
    for (py, js) in [(": True", ": true"), (": False", ": false"), (": None", ": null")] {
        out = out.replace(py, js);
    }
    out
}

/// Drop commas that directly precede a closing brace or bracket.
fn remove_trailing_commas(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let chars: Vec<char> = text.chars().collect();

    for (i, &c) in chars.iter().enumerate() {
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
                let next_meaningful = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
                if matches!(next_meaningful, Some('}') | Some(']')) {
                    // trailing comma, skip it
                } else {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }
    out
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_json() {
        let v = repair_json(r#"{"a": 1, "b": "x"}"#).unwrap();
        assert_eq!(v["a"], 1);
        assert_eq!(v["b"], "x");
    }

    #[test]
    fn test_code_fenced_json() {
        let raw = "Here is the plan:\n```json\n{\"step_1\": {\"tool\": \"esmfold\"}}\n```\nDone.";
        let v = repair_json(raw).unwrap();
        assert_eq!(v["step_1"]["tool"], "esmfold");
    }

    #[test]
    fn test_embedded_prose() {
        let raw = "Sure! The connection is {\"connection\": {\"x\": 1}} as requested.";
        let v = repair_json(raw).unwrap();
        assert_eq!(v["connection"]["x"], 1);
    }

    #[test]
    fn test_trailing_commas() {
        let v = repair_json(r#"{"a": [1, 2, 3,], "b": {"c": 1,},}"#).unwrap();
        assert_eq!(v["a"].as_array().unwrap().len(), 3);
        assert_eq!(v["b"]["c"], 1);
    }

    #[test]
    fn test_smart_quotes() {
        let raw = "{\u{201C}sender\u{201D}: \u{201C}planner\u{201D}}";
        let v = repair_json(raw).unwrap();
        assert_eq!(v["sender"], "planner");
    }

    #[test]
    fn test_python_literals() {
        let v = repair_json(r#"{"executed": True, "result": None}"#).unwrap();
        assert_eq!(v["executed"], true);
        assert!(v["result"].is_null());
    }

    #[test]
    fn test_comma_inside_string_is_kept() {
        let v = repair_json(r#"{"text": "a, b, c,"}"#).unwrap();
        assert_eq!(v["text"], "a, b, c,");
    }

    #[test]
    fn test_no_json_at_all() {
        assert!(repair_json("I could not produce a plan.").is_err());
    }
}
