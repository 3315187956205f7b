//! Shared utility functions for the faber crate.

use serde_json::Value;

/// Truncate a string to at most `max_chars` characters, respecting char
/// boundaries. Used for phase-result summaries.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Parse the first JSON object embedded in free-form text.
///
/// Agents are asked to lead their reply with a JSON object, but the text
/// around it is unconstrained. Each `{` candidate is handed to a streaming
/// deserializer, which accepts a valid object prefix and ignores whatever
/// trails it; the first candidate that parses as an object wins. Brace
/// characters inside string literals never confuse the scan because the
/// deserializer, not the scanner, decides where the object ends.
pub fn first_json_object(text: &str) -> Option<Value> {
    for (index, _) in text.match_indices('{') {
        let mut stream =
            serde_json::Deserializer::from_str(&text[index..]).into_iter::<Value>();
        if let Some(Ok(value)) = stream.next() {
            if value.is_object() {
                return Some(value);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truncate_chars_short_input() {
        assert_eq!(truncate_chars("hello", 500), "hello");
    }

    #[test]
    fn test_truncate_chars_long_input() {
        let text = "a".repeat(600);
        assert_eq!(truncate_chars(&text, 500).len(), 500);
    }

    #[test]
    fn test_truncate_chars_multibyte() {
        // Must not panic on non-ASCII boundaries
        let text = "héllo wörld".repeat(100);
        let truncated = truncate_chars(&text, 500);
        assert_eq!(truncated.chars().count(), 500);
    }

    #[test]
    fn test_first_json_object_simple() {
        assert_eq!(
            first_json_object(r#"{"key": "value"}"#),
            Some(json!({"key": "value"}))
        );
    }

    #[test]
    fn test_first_json_object_with_prefix_and_suffix() {
        let text = r#"Decision follows: {"decision": "GO"} and some commentary"#;
        assert_eq!(first_json_object(text), Some(json!({"decision": "GO"})));
    }

    #[test]
    fn test_first_json_object_nested() {
        assert_eq!(
            first_json_object(r#"{"outer": {"inner": "value"}}"#),
            Some(json!({"outer": {"inner": "value"}}))
        );
    }

    #[test]
    fn test_first_json_object_braces_inside_strings() {
        // A close brace inside a string literal must not end the object.
        let text = r#"{"template": "use ${var} here", "ok": true}"#;
        assert_eq!(
            first_json_object(text),
            Some(json!({"template": "use ${var} here", "ok": true}))
        );
    }

    #[test]
    fn test_first_json_object_skips_broken_candidate() {
        // The first brace opens invalid JSON; the later object still parses.
        let text = r#"set {x} then {"branch_name": "feature/42"}"#;
        assert_eq!(
            first_json_object(text),
            Some(json!({"branch_name": "feature/42"}))
        );
    }

    #[test]
    fn test_first_json_object_no_json() {
        assert_eq!(first_json_object("No JSON here"), None);
    }

    #[test]
    fn test_first_json_object_unclosed() {
        assert_eq!(first_json_object(r#"{"key": "value""#), None);
    }

    #[test]
    fn test_first_json_object_ignores_non_object_values() {
        // Arrays and scalars are not lifted; only objects count.
        assert_eq!(first_json_object(r#"[1, 2, 3]"#), None);
    }
}
