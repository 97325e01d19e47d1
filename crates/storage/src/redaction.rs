//! Secret scrubbing for everything that reaches an audit file or an error
//! response.
//!
//! Two layers: free-text patterns (API keys, bearer tokens, key=value
//! assignments) and structural redaction for JSON, where any key whose
//! lowercase name contains a sensitive marker has its value replaced
//! wholesale.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

const PLACEHOLDER: &str = "[REDACTED]";

const SENSITIVE_KEY_MARKERS: [&str; 6] = [
    "api_key",
    "apikey",
    "token",
    "authorization",
    "secret",
    "password",
];

fn text_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"sk-[A-Za-z0-9_-]{8,}",
            r"(?i)bearer\s+[A-Za-z0-9._~+/-]+=*",
            r"(?i)(api[_-]?key|token|authorization|secret|password)\s*[=:]\s*\S+",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Scrub secret-looking spans from free text.
pub fn redact_text(text: &str) -> String {
    let mut out = text.to_string();
    for pattern in text_patterns() {
        out = pattern.replace_all(&out, PLACEHOLDER).into_owned();
    }
    out
}

fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_lowercase();
    SENSITIVE_KEY_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}

/// Recursively scrub a JSON value: sensitive keys lose their whole value,
/// strings are pattern-scrubbed, containers recurse.
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                if is_sensitive_key(key) {
                    out.insert(key.clone(), Value::String(PLACEHOLDER.into()));
                } else {
                    out.insert(key.clone(), redact_value(item));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        Value::String(text) => Value::String(redact_text(text)),
        other => other.clone(),
    }
}

/// Render a payload as a single redacted JSON line.
pub fn redact_json_line(payload: &Value) -> String {
    redact_value(payload).to_string()
}
