use once_cell::sync::Lazy;
use regex::Regex;

// Model output is hostile input: reasoning models wrap answers in <think>
// blocks, JSON mode is not honored by every deployment, and prose leaks
// around the object. The ladder here is strict JSON -> think-tag stripping ->
// brace-matched object extraction; callers add their own raw-text fallback.

static THINK_AFTER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)</think>\s*(.*)").unwrap());
static THINK_BEFORE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)^(.*?)<think>").unwrap());

/// Drop a `<think>...</think>` reasoning block, keeping whatever follows the
/// closing tag (or precedes the opening one when the model never closed it).
pub fn strip_think_tags(text: &str) -> String {
    let lower = text.to_lowercase();
    if !lower.contains("<think>") && !lower.contains("</think>") {
        return text.to_string();
    }

    if let Some(caps) = THINK_AFTER_RE.captures(text) {
        let after = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
        if !after.is_empty() {
            return after.to_string();
        }
    }
    if let Some(caps) = THINK_BEFORE_RE.captures(text) {
        let before = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
        if !before.is_empty() {
            return before.to_string();
        }
    }
    text.to_string()
}

/// First brace-balanced `{...}` substring that parses as a JSON object.
pub fn extract_json_object(text: &str) -> Option<serde_json::Value> {
    let bytes: Vec<char> = text.chars().collect();
    let mut start = None;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in bytes.iter().enumerate() {
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
            '"' if start.is_some() => in_string = true,
            '{' => {
                if start.is_none() {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' => {
                if let Some(s) = start {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        let candidate: String = bytes[s..=i].iter().collect();
                        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&candidate) {
                            if value.is_object() {
                                return Some(value);
                            }
                        }
                        start = None;
                    }
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse a model reply into a JSON object, tolerating think-blocks and
/// surrounding prose. `None` means nothing object-shaped survived.
pub fn parse_llm_json(content: &str) -> Option<serde_json::Value> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(content) {
        if value.is_object() {
            return Some(value);
        }
    }

    let cleaned = strip_think_tags(content);
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&cleaned) {
        if value.is_object() {
            return Some(value);
        }
    }

    extract_json_object(&cleaned)
}

/// Clamp a JSON confidence field into `[0, 1]`, defaulting when absent.
pub fn confidence_from(value: &serde_json::Value, default: f64) -> f64 {
    value
        .get("confidence")
        .and_then(|v| v.as_f64())
        .unwrap_or(default)
        .clamp(0.0, 1.0)
}
