//! Caller-facing rendering of a terminal failure.
//!
//! A failure is rendered exactly once: a JSON error envelope with an HTTP
//! status for buffered delivery, or an error frame followed by `[DONE]` for
//! incremental delivery so client stream parsers always see a clean close.

use axum::{
    http::StatusCode,
    response::{sse::Event, IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use super::{AttemptFailure, ErrorClass};
use crate::stream::sse::DONE_SENTINEL;

/// Message used when every attempt was consumed without a verdict.
pub const EXHAUSTED_MESSAGE: &str = "Failed to generate response after retries";

/// Prefix for error events reported by the agent runtime.
pub const AGENT_ERROR_PREFIX: &str = "Letta agent error: ";

/// A failure ready to be sent to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct FormattedError {
    pub status: StatusCode,
    pub error_type: &'static str,
    pub message: String,
    pub code: Option<&'static str>,
}

impl FormattedError {
    pub fn server_error(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error_type: "server_error",
            message: message.into(),
            code: None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error_type: "invalid_request_error",
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    /// Render a classified failure.
    ///
    /// Error events raised by the agent itself keep the runtime's wording
    /// behind a fixed prefix whatever their class.
    pub fn from_failure(failure: &AttemptFailure, class: ErrorClass) -> Self {
        let detail = failure.to_string();
        match class {
            ErrorClass::ValidationError => Self::invalid_request(detail),
            _ if matches!(failure, AttemptFailure::Terminal(_)) => {
                Self::server_error(format!("{}{}", AGENT_ERROR_PREFIX, detail))
            }
            ErrorClass::ContextWindowFull => {
                Self::server_error(format!("Context window full: {}", detail))
            }
            ErrorClass::UpstreamProtocolError => {
                Self::server_error(format!("Upstream API error: {}", detail))
            }
            ErrorClass::ServerError => Self::server_error(format!("Server error: {}", detail)),
        }
    }

    /// Generic failure after all attempts were used up.
    pub fn exhausted() -> Self {
        Self::server_error(EXHAUSTED_MESSAGE)
    }

    /// `{"error": {"message", "type", "code"?}}`
    pub fn to_json(&self) -> Value {
        let mut error = json!({
            "message": self.message,
            "type": self.error_type,
        });
        if let Some(code) = self.code {
            error["code"] = json!(code);
        }
        json!({ "error": error })
    }

    /// Terminal frames for an event stream: the error, then `[DONE]`.
    pub fn to_events(&self) -> [Event; 2] {
        [Event::default().data(self.to_json().to_string()), Event::default().data(DONE_SENTINEL)]
    }
}

impl IntoResponse for FormattedError {
    fn into_response(self) -> Response {
        (self.status, Json(self.to_json())).into_response()
    }
}
