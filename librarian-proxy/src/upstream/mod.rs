//! Outbound collaborator: the session-oriented agent runtime.
//!
//! The RPCs the gateway needs from the runtime are captured by the
//! [`AgentRuntime`] trait:
//!
//! - list sessions (startup name resolution)
//! - retrieve a session's generation configuration
//! - replace a session's generation configuration
//! - open a streaming call that yields heterogeneous event frames
//! - compact a session's history to reclaim context-window space
//! - list, create and attach tools (request tool synchronization)
//!
//! [`LettaClient`] implements the trait over HTTP. Tests substitute a
//! scripted in-memory runtime.

pub mod letta;

#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::{Map, Value};

pub use letta::LettaClient;

/// Generation configuration of a session.
///
/// Kept as an opaque JSON object: the gateway only touches the fields named
/// in [`ConfigOverrides`] and writes everything else back untouched.
pub type GenerationConfig = Map<String, Value>;

/// Lazy, one-pass sequence of raw frames from a streaming call.
pub type EventStream = BoxStream<'static, Result<Value, UpstreamError>>;

/// Errors raised by the agent runtime client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    /// Transport-level failure (connect, reset, timeout)
    #[error("Failed to reach agent runtime: {0}")]
    Connection(String),

    /// The runtime answered with a non-success status
    #[error("Agent runtime returned status {status}: {message}")]
    Api { status: u16, message: String },

    /// The runtime answered with a body we could not decode
    #[error("Invalid response from agent runtime: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            UpstreamError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            UpstreamError::Api { status: status.as_u16(), message: err.to_string() }
        } else {
            UpstreamError::Connection(err.to_string())
        }
    }
}

/// Minimal view of a session returned by the list RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: String,
    pub name: Option<String>,
}

/// A tool registered with the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSummary {
    pub id: String,
    pub name: String,
}

/// A function tool to register with the runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments
    pub parameters: Value,
}

/// Role of a message forwarded to the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamRole {
    User,
    Assistant,
    Tool,
}

/// A message in the runtime's wire format.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct UpstreamMessage {
    pub role: UpstreamRole,
    pub content: Vec<TextPart>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

/// One text-bearing content part.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct TextPart {
    #[serde(rename = "type")]
    pub part_type: &'static str,
    pub text: String,
}

impl TextPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self { part_type: "text", text: text.into() }
    }
}

impl UpstreamMessage {
    pub fn new(role: UpstreamRole, text: impl Into<String>) -> Self {
        Self { role, content: vec![TextPart::text(text)], tool_call_id: None }
    }
}

/// Caller-requested generation overrides applied for the lifetime of a lease.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConfigOverrides {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

impl ConfigOverrides {
    /// True when the request does not change any generation parameter
    pub fn is_empty(&self) -> bool {
        self.temperature.is_none() && self.max_tokens.is_none()
    }

    /// Return a copy of `config` with the overridden fields replaced
    pub fn apply(&self, config: &GenerationConfig) -> GenerationConfig {
        let mut updated = config.clone();
        if let Some(temperature) = self.temperature {
            updated.insert("temperature".to_string(), Value::from(temperature));
        }
        if let Some(max_tokens) = self.max_tokens {
            updated.insert("max_tokens".to_string(), Value::from(max_tokens));
        }
        updated
    }
}

/// The RPC surface consumed from the agent runtime.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// List all sessions known to the runtime.
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, UpstreamError>;

    /// Read a session's current generation configuration.
    ///
    /// Returns `Ok(None)` when the session exists but carries no configuration.
    async fn retrieve_config(
        &self,
        session_id: &str,
    ) -> Result<Option<GenerationConfig>, UpstreamError>;

    /// Replace a session's generation configuration.
    async fn modify_config(
        &self,
        session_id: &str,
        config: &GenerationConfig,
    ) -> Result<(), UpstreamError>;

    /// Send messages to a session and stream back its event frames.
    async fn open_stream(
        &self,
        session_id: &str,
        messages: &[UpstreamMessage],
    ) -> Result<EventStream, UpstreamError>;

    /// Bound a session's retained history to `retain_messages` messages.
    async fn compact(&self, session_id: &str, retain_messages: usize)
        -> Result<(), UpstreamError>;

    /// List every tool registered with the runtime.
    async fn list_tools(&self) -> Result<Vec<ToolSummary>, UpstreamError>;

    /// Register a new tool.
    async fn create_tool(&self, tool: &ToolSpec) -> Result<ToolSummary, UpstreamError>;

    /// Make a registered tool available to a session.
    async fn attach_tool(&self, session_id: &str, tool_id: &str) -> Result<(), UpstreamError>;
}
