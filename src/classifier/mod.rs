// Classifier contract: a text-completion service used for awareness and agentic planning

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

/// Text-in, text-out completion service.
///
/// Implementations are expected to return free text that may wrap a JSON
/// object or array; callers extract it with [`extract_json_object`] or
/// [`extract_json_array`].
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// First balanced `{...}` in `text` that parses as JSON.
pub fn extract_json_object(text: &str) -> Option<Value> {
    extract_balanced(text, '{', '}').filter(Value::is_object)
}

/// First balanced `[...]` in `text` that parses as JSON.
pub fn extract_json_array(text: &str) -> Option<Value> {
    extract_balanced(text, '[', ']').filter(Value::is_array)
}

/// Scan for each `open` delimiter and try the balanced span starting there.
/// String literals are skipped so braces inside them do not count.
fn extract_balanced(text: &str, open: char, close: char) -> Option<Value> {
    for (start, c) in text.char_indices() {
        if c != open {
            continue;
        }
        if let Some(end) = balanced_end(&text[start..], open, close) {
            if let Ok(value) = serde_json::from_str(&text[start..start + end]) {
                return Some(value);
            }
        }
    }
    None
}

/// Byte length of the balanced span at the start of `s`.
fn balanced_end(s: &str, open: char, close: char) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in s.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + c.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}
