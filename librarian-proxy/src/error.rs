//! Error types for the librarian gateway.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::admission::AdmissionError;
use crate::recovery::FormattedError;

/// Errors surfaced at the HTTP boundary
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Malformed or unusable request body
    #[error("{0}")]
    InvalidRequest(String),

    /// Model name not in the registry
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    /// Model lookup on `/v1/models/{id}`
    #[error("Model '{0}' not found")]
    ModelNotFound(String),

    /// Requested output exceeds what the session can hold
    #[error("{0}")]
    ContextLengthExceeded(String),

    /// No processing slot
    #[error("{0}")]
    Admission(#[from] AdmissionError),

    /// Request ran and failed; already classified
    #[error("{}", .0.message)]
    Failed(FormattedError),

    /// Consumer went away; nothing to render to
    #[error("Client disconnected")]
    Disconnected,
}

impl ProxyError {
    /// The caller-facing rendering of this error
    pub fn formatted(&self) -> FormattedError {
        match self {
            ProxyError::InvalidRequest(_) | ProxyError::UnknownModel(_) => {
                FormattedError::invalid_request(self.to_string())
            }
            ProxyError::ModelNotFound(_) => FormattedError {
                status: StatusCode::NOT_FOUND,
                ..FormattedError::invalid_request(self.to_string()).with_code("model_not_found")
            },
            ProxyError::ContextLengthExceeded(_) => {
                FormattedError::invalid_request(self.to_string())
                    .with_code("context_length_exceeded")
            }
            ProxyError::Admission(_) => FormattedError {
                status: StatusCode::SERVICE_UNAVAILABLE,
                ..FormattedError::server_error(format!("Server error: {}", self))
            },
            ProxyError::Failed(formatted) => formatted.clone(),
            ProxyError::Disconnected => FormattedError::server_error(self.to_string()),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        self.formatted().into_response()
    }
}
