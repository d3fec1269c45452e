//! JSON extraction from model output
//!
//! Model responses carry JSON wrapped in prose, markdown fences, or envelope
//! objects, and are frequently slightly malformed. Extraction is a closed set
//! of strategies tried in order, each pure and returning `Option<Value>`;
//! parsing goes through a three-stage repair (direct → cleanup → structural).

use serde_json::Value;

/// Try each extraction strategy in order and return the first hit.
pub fn extract_json(text: &str) -> Option<Value> {
    let strategies: [fn(&str) -> Option<Value>; 5] = [
        from_envelope,
        from_code_fence,
        from_balanced_braces,
        from_greedy_span,
        from_full_text,
    ];
    strategies.iter().find_map(|strategy| strategy(text))
}

/// Parse with repair: direct parse, then cleanup of trailing commas and
/// comments, then structural repair (close dangling brackets and strings).
pub fn parse_with_repair(text: &str) -> Option<Value> {
    if let Ok(v) = serde_json::from_str(text) {
        return Some(v);
    }
    let cleaned = strip_comments_and_trailing_commas(text);
    if let Ok(v) = serde_json::from_str(&cleaned) {
        return Some(v);
    }
    let repaired = close_dangling(&cleaned);
    serde_json::from_str(&repaired).ok()
}

/// Strategy 1: `{"response": …}` / `{"result": …}` / `{"data": …}` envelopes.
fn from_envelope(text: &str) -> Option<Value> {
    let value = parse_with_repair(text.trim())?;
    let obj = value.as_object()?;
    for key in ["response", "result", "data", "output"] {
        if let Some(inner) = obj.get(key) {
            if inner.is_object() || inner.is_array() {
                return Some(inner.clone());
            }
        }
    }
    None
}

/// Strategy 2: fenced ```json blocks (bare fences accepted too).
fn from_code_fence(text: &str) -> Option<Value> {
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after = &rest[open + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        let close = body.find("```")?;
        let candidate = body[..close].trim();
        if let Some(v) = parse_with_repair(candidate) {
            if v.is_object() || v.is_array() {
                return Some(v);
            }
        }
        rest = &body[close + 3..];
    }
    None
}

/// Strategy 3: first balanced `{…}` or `[…]` span, brace-depth tracked and
/// string-aware.
fn from_balanced_braces(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let start = text.find(|c| c == '{' || c == '[')?;
    let (open, close) = if bytes[start] == b'{' {
        (b'{', b'}')
    } else {
        (b'[', b']')
    };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            _ if b == open => depth += 1,
            _ if b == close => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return parse_with_repair(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Strategy 4: greedy span from the first opening brace to the last closing
/// one. Catches truncation-damaged output the balanced scan rejects.
fn from_greedy_span(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    parse_with_repair(&text[start..=end])
}

/// Strategy 5: the whole text, repaired.
fn from_full_text(text: &str) -> Option<Value> {
    parse_with_repair(text.trim()).filter(|v| v.is_object() || v.is_array())
}

/// Remove `//`-comments and trailing commas outside of strings.
fn strip_comments_and_trailing_commas(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let bytes = text.as_bytes();
    let mut i = 0;
    let mut in_string = false;
    let mut escaped = false;

    while i < bytes.len() {
        let b = bytes[i];
        if in_string {
            out.push(b as char);
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        match b {
            b'"' => {
                in_string = true;
                out.push('"');
                i += 1;
            }
            b'/' if i + 1 < bytes.len() && bytes[i + 1] == b'/' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b',' => {
                // Trailing comma if the next non-whitespace byte closes a scope.
                let mut j = i + 1;
                while j < bytes.len() && (bytes[j] as char).is_whitespace() {
                    j += 1;
                }
                if j < bytes.len() && (bytes[j] == b'}' || bytes[j] == b']') {
                    i += 1;
                } else {
                    out.push(',');
                    i += 1;
                }
            }
            _ => {
                out.push(b as char);
                i += 1;
            }
        }
    }
    out
}

/// Close an unterminated string and any dangling brackets.
fn close_dangling(text: &str) -> String {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
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

    let mut out = text.trim_end().trim_end_matches(',').to_string();
    if in_string {
        out.push('"');
    }
    while let Some(close) = stack.pop() {
        out.push(close);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_json_parses() {
        let v = extract_json(r#"{"a": 1}"#).unwrap();
        assert_eq!(v, json!({"a": 1}));
    }

    #[test]
    fn envelope_unwraps() {
        let v = extract_json(r#"{"response": {"a": 1}, "model": "x"}"#).unwrap();
        assert_eq!(v, json!({"a": 1}));
    }

    #[test]
    fn code_fence_extracts() {
        let text = "Here you go:\n```json\n{\"a\": [1, 2]}\n```\nenjoy";
        let v = extract_json(text).unwrap();
        assert_eq!(v, json!({"a": [1, 2]}));
    }

    #[test]
    fn second_fence_used_when_first_is_not_json() {
        let text = "```\nnot json\n```\nand\n```json\n{\"ok\": true}\n```";
        let v = extract_json(text).unwrap();
        assert_eq!(v, json!({"ok": true}));
    }

    #[test]
    fn balanced_braces_inside_prose() {
        let text = r#"The answer is {"score": 0.9, "note": "has } inside"} which is good."#;
        let v = extract_json(text).unwrap();
        assert_eq!(v["score"], json!(0.9));
    }

    #[test]
    fn trailing_comma_repaired() {
        let v = extract_json("{\"a\": 1,}").unwrap();
        assert_eq!(v, json!({"a": 1}));
    }

    #[test]
    fn comments_stripped() {
        let text = "{\n  // the score\n  \"score\": 1\n}";
        let v = extract_json(text).unwrap();
        assert_eq!(v, json!({"score": 1}));
    }

    #[test]
    fn truncated_object_closed() {
        let v = extract_json(r#"{"a": {"b": 1"#).unwrap();
        assert_eq!(v, json!({"a": {"b": 1}}));
    }

    #[test]
    fn no_json_returns_none() {
        assert!(extract_json("there is nothing structured here").is_none());
        assert!(extract_json("").is_none());
    }

    #[test]
    fn scalar_text_is_not_extracted() {
        // Bare scalars are not useful extraction results.
        assert!(extract_json("42").is_none());
    }
}
