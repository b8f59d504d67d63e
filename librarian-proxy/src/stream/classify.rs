//! Classification of raw upstream frames into [`StreamEvent`]s.
//!
//! Order of precedence for a frame:
//!
//! 1. a recognized `message_type` discriminant
//! 2. a `tool_call` field
//! 3. a `content` field
//! 4. anything else is [`StreamEvent::Ignored`]
//!
//! Unrecognized discriminants (usage statistics, tool returns, ...) fall
//! through to the structural checks.

use serde_json::Value;

/// Normalized event produced from one upstream frame.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Visible assistant text
    ContentDelta(String),
    /// Private reasoning channel; never surfaced to the caller
    ReasoningDelta(String),
    /// The agent invoked a tool
    ToolInvocation(Value),
    /// Normal end of the attempt
    TerminalStop,
    /// The attempt failed inside the runtime
    TerminalError(String),
    /// A frame the gateway has no use for
    Ignored,
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::TerminalStop | StreamEvent::TerminalError(_))
    }
}

const UNKNOWN_ERROR: &str = "Unknown error";

/// Classify one frame. Pure; safe to call on every element of the sequence.
pub fn classify(frame: &Value) -> StreamEvent {
    if let Some(kind) = frame.get("message_type").and_then(Value::as_str) {
        match kind {
            "assistant_message" => return StreamEvent::ContentDelta(extract_text(frame)),
            "reasoning_message" | "hidden_reasoning_message" => {
                let text = frame
                    .get("reasoning")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| extract_text(frame));
                return StreamEvent::ReasoningDelta(text);
            }
            "tool_call_message" => {
                return StreamEvent::ToolInvocation(
                    frame.get("tool_call").cloned().unwrap_or(Value::Null),
                )
            }
            "stop_reason" => return classify_stop(frame),
            "error" | "error_message" => return StreamEvent::TerminalError(error_message(frame)),
            _ => {}
        }
    }

    if let Some(call) = frame.get("tool_call") {
        return StreamEvent::ToolInvocation(call.clone());
    }
    if frame.get("content").is_some() {
        return StreamEvent::ContentDelta(extract_text(frame));
    }
    StreamEvent::Ignored
}

/// A stop frame carrying an error is an error, not a normal stop.
fn classify_stop(frame: &Value) -> StreamEvent {
    let reason = frame.get("stop_reason").and_then(Value::as_str);
    let has_error = frame.get("error").is_some_and(|e| !e.is_null());
    if reason == Some("error") || has_error {
        StreamEvent::TerminalError(error_message(frame))
    } else {
        StreamEvent::TerminalStop
    }
}

fn error_message(frame: &Value) -> String {
    match frame.get("error") {
        Some(Value::String(message)) => message.clone(),
        Some(Value::Object(detail)) => detail
            .get("message")
            .or_else(|| detail.get("detail"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Value::Object(detail.clone()).to_string()),
        _ => frame
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or(UNKNOWN_ERROR)
            .to_string(),
    }
}

/// Text of a `content` field: a plain string, or the concatenated `text` of
/// a list of parts.
pub fn extract_text(frame: &Value) -> String {
    match frame.get("content") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| match part {
                Value::String(text) => Some(text.as_str()),
                other => other.get("text").and_then(Value::as_str),
            })
            .collect(),
        _ => String::new(),
    }
}
