//! Model output decoding: strict JSON first, then a lenient pass that strips
//! code fences and pulls out the first JSON-looking span.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static JSON_SPAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)(\{.*\}|\[.*\])").expect("valid regex"));

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("no JSON object or array found in model output:\n{raw}")]
    NoJson { raw: String },
    #[error("model output is not valid JSON ({reason}):\n{raw}")]
    Invalid { reason: String, raw: String },
    #[error("model returned {found}, expected {expected}")]
    Shape { expected: &'static str, found: String },
    #[error("model output did not decode after {attempts} attempts; last raw output:\n{raw}")]
    Exhausted { attempts: u32, raw: String },
}

impl DecodeError {
    pub fn raw(&self) -> Option<&str> {
        match self {
            DecodeError::NoJson { raw }
            | DecodeError::Invalid { raw, .. }
            | DecodeError::Exhausted { raw, .. } => Some(raw),
            DecodeError::Shape { .. } => None,
        }
    }
}

pub fn decode_json(text: &str) -> Result<Value, DecodeError> {
    if let Ok(value) = serde_json::from_str::<Value>(text.trim()) {
        return Ok(value);
    }
    decode_lenient(text)
}

fn decode_lenient(text: &str) -> Result<Value, DecodeError> {
    let stripped = strip_code_fences(text);
    if let Ok(value) = serde_json::from_str::<Value>(stripped) {
        return Ok(value);
    }
    let Some(span) = JSON_SPAN.find(stripped) else {
        return Err(DecodeError::NoJson {
            raw: text.to_string(),
        });
    };
    serde_json::from_str::<Value>(span.as_str()).map_err(|err| DecodeError::Invalid {
        reason: err.to_string(),
        raw: text.to_string(),
    })
}

/// Removes a leading ```lang fence line and a trailing ``` fence.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric()),
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

pub fn value_kind(value: &Value) -> String {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
    .to_string()
}
