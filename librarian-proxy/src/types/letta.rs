//! Wire types for the Letta agent runtime REST API.
//!
//! Only the fields the gateway reads are modelled; everything else in an
//! agent document is ignored on the way in. `llm_config` stays an opaque
//! object so writing it back restores it byte-for-byte.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::upstream::UpstreamMessage;

/// Agent document returned by `GET /v1/agents/` and `GET /v1/agents/{id}`
#[derive(Debug, Clone, Deserialize)]
pub struct AgentState {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    /// Generation configuration
    #[serde(default)]
    pub llm_config: Option<Map<String, Value>>,
}

/// Body for `PATCH /v1/agents/{id}`
#[derive(Debug, Serialize)]
pub struct ModifyAgentRequest<'a> {
    pub llm_config: &'a Map<String, Value>,
}

/// Body for `POST /v1/agents/{id}/messages/stream`
#[derive(Debug, Serialize)]
pub struct StreamMessagesRequest<'a> {
    pub messages: &'a [UpstreamMessage],

    /// Token-level deltas instead of whole-step messages
    pub stream_tokens: bool,
}

/// Tool document returned by `GET /v1/tools/` and `POST /v1/tools/`
#[derive(Debug, Clone, Deserialize)]
pub struct ToolState {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,
}

/// Body for `POST /v1/tools/`
#[derive(Debug, Serialize)]
pub struct CreateToolRequest<'a> {
    pub name: &'a str,
    pub description: &'a str,
    pub json_schema: Value,
}
