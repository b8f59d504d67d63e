//! OpenAI-compatible API types.
//!
//! These types provide compatibility with the OpenAI Chat Completions API,
//! allowing existing OpenAI clients to talk to the gateway unchanged.
//!
//! Reference: https://platform.openai.com/docs/api-reference/chat

use serde::{Deserialize, Serialize};

/// Request body for POST /v1/chat/completions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    /// Logical model name, mapped to an upstream session
    pub model: String,

    /// Messages in the conversation
    pub messages: Vec<ChatMessage>,

    /// Sampling temperature (0.0-2.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Enable streaming
    #[serde(default)]
    pub stream: bool,

    /// User identifier for tracking
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Tools to make available on the session before the call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
}

/// Chat message in OpenAI format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role: "system", "user", "assistant", or "tool"
    pub role: Role,

    /// Message content (can be null for tool calls)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,

    /// Name of the author (for user/assistant)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// ID of the tool call this message responds to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(MessageContent::Text(content.into())),
            name: None,
            tool_call_id: None,
        }
    }

    /// Text of the message, with content parts joined in order
    pub fn text(&self) -> String {
        match &self.content {
            Some(MessageContent::Text(text)) => text.clone(),
            Some(MessageContent::Parts(parts)) => {
                parts.iter().filter_map(|p| p.text.as_deref()).collect()
            }
            None => String::new(),
        }
    }
}

/// Plain string or list of typed parts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// One content part; only `text` parts carry anything the gateway forwards
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub part_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// Tool definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    /// Type ("function" is the only kind synchronized)
    #[serde(rename = "type")]
    pub tool_type: String,

    /// Function definition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionDef>,
}

/// Function definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDef {
    /// Function name
    pub name: String,

    /// Description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// JSON Schema for parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

/// Request body for the legacy POST /v1/completions
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionRequest {
    #[serde(default)]
    pub model: String,

    #[serde(default)]
    pub prompt: Option<Prompt>,

    #[serde(default)]
    pub temperature: Option<f64>,

    #[serde(default)]
    pub max_tokens: Option<u32>,

    #[serde(default)]
    pub stream: bool,

    #[serde(default)]
    pub user: Option<String>,
}

/// Legacy prompt: one string or a list joined with newlines
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Prompt {
    Text(String),
    Batch(Vec<String>),
}

impl CompletionRequest {
    /// Rewrite as a single-user-message chat request
    pub fn into_chat(self) -> Option<ChatCompletionRequest> {
        let prompt = match self.prompt? {
            Prompt::Text(text) => text,
            Prompt::Batch(lines) => lines.join("\n"),
        };
        Some(ChatCompletionRequest {
            model: self.model,
            messages: vec![ChatMessage::new(Role::User, prompt)],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: self.stream,
            user: self.user,
            tools: None,
        })
    }
}

/// Response from POST /v1/chat/completions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    /// Unique ID for this completion
    pub id: String,

    /// Object type (always "chat.completion")
    pub object: String,

    /// Unix timestamp
    pub created: u64,

    /// Model name as requested
    pub model: String,

    /// Completion choices
    pub choices: Vec<Choice>,

    /// Token usage
    pub usage: Usage,
}

/// Completion choice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: Option<String>,
}

/// Generated message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub role: Role,
    pub content: String,
}

/// Token usage statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self { prompt_tokens, completion_tokens, total_tokens: prompt_tokens + completion_tokens }
    }
}

/// Streaming chunk for SSE
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,

    /// Object type (always "chat.completion.chunk")
    pub object: String,

    pub created: u64,

    pub model: String,

    pub choices: Vec<ChunkChoice>,

    /// Present on the final chunk only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// Streaming choice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,

    /// Delta (partial message)
    pub delta: Delta,

    /// Finish reason (only on last chunk)
    pub finish_reason: Option<String>,
}

/// Delta for streaming
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delta {
    /// Role (only on first chunk)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,

    /// Content fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Response from GET /v1/models
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsResponse {
    /// Object type (always "list")
    pub object: String,

    pub data: Vec<Model>,
}

/// Model info
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: String,

    /// Object type (always "model")
    pub object: String,

    pub created: u64,

    pub owned_by: String,
}

fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

fn now() -> u64 {
    chrono::Utc::now().timestamp() as u64
}

impl ChatCompletionResponse {
    pub fn new(model: impl Into<String>, content: impl Into<String>, usage: Usage) -> Self {
        Self {
            id: completion_id(),
            object: "chat.completion".to_string(),
            created: now(),
            model: model.into(),
            choices: vec![Choice {
                index: 0,
                message: AssistantMessage { role: Role::Assistant, content: content.into() },
                finish_reason: Some("stop".to_string()),
            }],
            usage,
        }
    }
}

/// Builds the chunks of one streamed completion under a shared id.
#[derive(Debug, Clone)]
pub struct ChunkBuilder {
    id: String,
    created: u64,
    model: String,
}

impl ChunkBuilder {
    pub fn new(model: impl Into<String>) -> Self {
        Self { id: completion_id(), created: now(), model: model.into() }
    }

    fn chunk(
        &self,
        delta: Delta,
        finish_reason: Option<String>,
        usage: Option<Usage>,
    ) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice { index: 0, delta, finish_reason }],
            usage,
        }
    }

    /// A content fragment
    pub fn content(&self, text: &str) -> ChatCompletionChunk {
        self.chunk(Delta { role: None, content: Some(text.to_string()) }, None, None)
    }

    /// The closing chunk with `finish_reason: "stop"` and usage
    pub fn finish(&self, usage: Usage) -> ChatCompletionChunk {
        self.chunk(Delta::default(), Some("stop".to_string()), Some(usage))
    }
}
