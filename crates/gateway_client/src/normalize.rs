//! Provider-format normalizer.
//!
//! The gateway relays frames in whichever shape the upstream provider
//! produced. Three shapes are recognized, probed in priority order:
//!
//! 1. output-array: `{"output":[{"delta":{"content":"Hi"},"finish_reason":null}]}`
//! 2. choice-delta: `{"choices":[{"delta":{"content":"Hi"},"finish_reason":null}]}`
//! 3. discriminated events: `{"type":"content_delta","delta":{"text":"Hi"}}`
//!
//! Explicit `error` payloads are detected before any schema probe and
//! short-circuit the stream.

use serde_json::Value;

use crate::error::GatewayError;

/// Field names probed for answer text, most specific first.
const CONTENT_FIELDS: &[&str] = &["content", "text", "output_text", "completion"];

/// Field names probed for chain-of-thought text. Providers interleave
/// reasoning under keys distinct from the content keys.
const REASONING_FIELDS: &[&str] = &["reasoning", "reasoning_content", "thinking"];

/// Outcome of matching a provider error message against known phrasings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MessageClass {
    RateLimited,
    CreditsExhausted,
    UpstreamRejected,
    Generic,
}

/// Classify a human-readable provider message by substring.
///
/// Providers do not reliably supply machine-readable codes, so this matches
/// known phrasings and is expected to grow as upstream wording changes.
/// Callers must treat the result as a heuristic.
pub(crate) fn classify_provider_message(raw: &str) -> MessageClass {
    let lower = raw.to_lowercase();
    if lower.contains("rate limit")
        || lower.contains("rate_limit")
        || lower.contains("too many requests")
        || lower.contains("concurrency limit")
        || lower.contains("burst limit")
    {
        MessageClass::RateLimited
    } else if lower.contains("insufficient credits")
        || lower.contains("trial expired")
        || lower.contains("trial has expired")
        || lower.contains("plan limit")
    {
        MessageClass::CreditsExhausted
    } else if lower.contains("upstream") {
        MessageClass::UpstreamRejected
    } else {
        MessageClass::Generic
    }
}

/// Replace raw provider wording with an actionable message. Generic
/// messages pass through unchanged.
pub(crate) fn rewrite_provider_message(raw: &str) -> (MessageClass, String) {
    let class = classify_provider_message(raw);
    let message = match class {
        MessageClass::RateLimited => {
            "The gateway is rate limiting this key. Wait a moment and try again.".to_string()
        }
        MessageClass::CreditsExhausted => {
            "Your trial has expired or your credits are exhausted. Add credits to continue."
                .to_string()
        }
        MessageClass::UpstreamRejected => {
            "The upstream provider rejected the request. Try again or switch models.".to_string()
        }
        MessageClass::Generic => raw.to_string(),
    };
    (class, message)
}

/// Error carried inside a wire frame.
#[derive(Debug, Clone, PartialEq)]
pub struct WireError {
    pub message: String,
    pub kind: Option<String>,
    pub code: Option<String>,
}

impl WireError {
    fn from_message(message: impl Into<String>) -> Self {
        WireError {
            message: message.into(),
            kind: None,
            code: None,
        }
    }

    /// Map an in-band error into the library taxonomy, rewriting known
    /// phrasings on the way.
    pub(crate) fn into_gateway_error(self) -> GatewayError {
        let (class, message) = rewrite_provider_message(&self.message);
        match class {
            MessageClass::RateLimited => GatewayError::RateLimit(message),
            _ => GatewayError::Streaming {
                message,
                kind: self.kind,
                code: self.code,
            },
        }
    }
}

/// Canonical internal chunk produced from one wire frame.
///
/// A chunk carrying `error` is never delivered as ordinary output; the
/// driver converts it into a returned failure.
#[derive(Debug, Default, PartialEq)]
pub struct ParsedChunk {
    pub content: Option<String>,
    pub reasoning: Option<String>,
    pub done: bool,
    pub error: Option<WireError>,
    pub tool_call: Option<Value>,
    pub tool_result: Option<Value>,
}

impl ParsedChunk {
    fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.reasoning.is_none()
            && !self.done
            && self.error.is_none()
            && self.tool_call.is_none()
            && self.tool_result.is_none()
    }
}

/// Normalize one decoded frame into a [`ParsedChunk`], or `None` when the
/// frame carries nothing (priming frames, keep-alives, unknown shapes).
pub fn normalize(frame: &Value) -> Option<ParsedChunk> {
    if let Some(error) = detect_error(frame) {
        return Some(ParsedChunk {
            error: Some(error),
            ..Default::default()
        });
    }

    let chunk = if frame.get("output").is_some_and(Value::is_array) {
        output_array_chunk(frame)
    } else if frame.get("choices").is_some_and(Value::is_array) {
        choice_delta_chunk(frame)
    } else if frame.get("type").is_some_and(Value::is_string) {
        typed_event_chunk(frame)
    } else {
        None
    };

    chunk.filter(|c| !c.is_empty())
}

/// Explicit `error` payloads take precedence over every schema probe.
fn detect_error(frame: &Value) -> Option<WireError> {
    let error = frame.get("error")?;
    match error {
        Value::String(message) => Some(WireError::from_message(message.clone())),
        Value::Object(fields) => {
            let message = fields
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("The stream reported an error")
                .to_string();
            Some(WireError {
                message,
                kind: fields.get("type").and_then(Value::as_str).map(String::from),
                code: stringify_code(fields.get("code")),
            })
        }
        _ => None,
    }
}

fn stringify_code(code: Option<&Value>) -> Option<String> {
    match code? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Schema 1: `output` array whose first element carries the delta, or is
/// itself the delta.
fn output_array_chunk(frame: &Value) -> Option<ParsedChunk> {
    let first = frame.get("output")?.as_array()?.first()?;
    let delta = first.get("delta").filter(|d| !d.is_null()).unwrap_or(first);

    let content = extract_text(delta, CONTENT_FIELDS);
    let reasoning = extract_text(delta, REASONING_FIELDS);
    let finish = finish_reason(first).or_else(|| finish_reason(delta));

    if content.is_none() && reasoning.is_none() && finish.is_none() {
        return None;
    }

    Some(ParsedChunk {
        content,
        reasoning,
        done: finish.is_some(),
        ..Default::default()
    })
}

/// Schema 2: `choices` array with `delta` and/or `finish_reason`.
fn choice_delta_chunk(frame: &Value) -> Option<ParsedChunk> {
    let choice = frame.get("choices")?.as_array()?.first()?;
    let finish = finish_reason(choice);
    let delta = choice.get("delta").and_then(Value::as_object);

    // A delta announcing only the assistant role is a priming frame.
    if finish.is_none() {
        if let Some(delta) = delta {
            if !delta.is_empty() && delta.keys().all(|k| k == "role") {
                return None;
            }
        }
    }

    // An "error" finish without payload is the provider's failure sentinel.
    if finish.as_deref() == Some("error") {
        let has_payload = delta.is_some_and(|d| !d.is_empty());
        if !has_payload {
            return Some(ParsedChunk {
                error: Some(WireError::from_message(
                    "The stream ended with an error finish reason",
                )),
                ..Default::default()
            });
        }
    }

    let mut chunk = ParsedChunk {
        done: finish.as_deref().is_some_and(|f| f != "error"),
        ..Default::default()
    };

    if let Some(delta) = delta {
        let delta = Value::Object(delta.clone());
        chunk.content = extract_text(&delta, CONTENT_FIELDS);
        chunk.reasoning = extract_text(&delta, REASONING_FIELDS);
        chunk.tool_call = delta
            .get("tool_calls")
            .filter(|v| !v.is_null())
            .cloned();
    }

    Some(chunk)
}

/// Schema 3: discriminated events selected by a `type` field.
fn typed_event_chunk(frame: &Value) -> Option<ParsedChunk> {
    let event = frame.get("type")?.as_str()?;
    let body = frame.get("delta").unwrap_or(frame);

    match event {
        "content_delta" | "content_block_delta" => Some(ParsedChunk {
            content: extract_text(body, CONTENT_FIELDS),
            ..Default::default()
        }),
        "reasoning_delta" | "thinking_delta" => Some(ParsedChunk {
            reasoning: extract_text(body, REASONING_FIELDS)
                .or_else(|| extract_text(body, CONTENT_FIELDS)),
            ..Default::default()
        }),
        "completion" | "done" | "message_stop" => Some(ParsedChunk {
            done: true,
            ..Default::default()
        }),
        "error" => Some(ParsedChunk {
            error: Some(
                detect_error_body(frame)
                    .unwrap_or_else(|| WireError::from_message("The stream reported an error")),
            ),
            ..Default::default()
        }),
        "tool_call" => Some(ParsedChunk {
            tool_call: Some(frame.clone()),
            ..Default::default()
        }),
        "tool_result" => Some(ParsedChunk {
            tool_result: Some(frame.clone()),
            ..Default::default()
        }),
        _ => None,
    }
}

/// For `{"type":"error"}` events the payload may live under `error` or
/// `message` directly.
fn detect_error_body(frame: &Value) -> Option<WireError> {
    if let Some(error) = detect_error(frame) {
        return Some(error);
    }
    frame
        .get("message")
        .and_then(Value::as_str)
        .map(WireError::from_message)
}

fn finish_reason(value: &Value) -> Option<String> {
    value
        .get("finish_reason")
        .and_then(Value::as_str)
        .map(String::from)
}

/// Probe `value` for text under the given field names, first hit wins.
fn extract_text(value: &Value, fields: &[&str]) -> Option<String> {
    for field in fields {
        if let Some(found) = value.get(field) {
            if let Some(text) = flatten_text(found) {
                return Some(text);
            }
        }
    }
    None
}

/// Flatten an open-shaped text value (string | array | object) into a
/// single string. Nested shapes are concatenated in order; non-text leaves
/// yield nothing.
fn flatten_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(flatten_text).collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.concat())
            }
        }
        Value::Object(fields) => {
            for key in ["text", "content", "value"] {
                if let Some(found) = fields.get(key) {
                    if let Some(text) = flatten_text(found) {
                        return Some(text);
                    }
                }
            }
            None
        }
        _ => None,
    }
}
