//! Token estimation and per-model context limits.
//!
//! Counts are approximate: roughly four characters per token, plus the
//! fixed per-message framing OpenAI charges for chat messages.

use crate::types::openai::{ChatMessage, Role};
use crate::upstream::GenerationConfig;

/// Framing tokens per chat message
const TOKENS_PER_MESSAGE: u32 = 4;

/// Tokens priming the assistant reply
const REPLY_PRIMING_TOKENS: u32 = 2;

/// Limit assumed for models missing from the table
const DEFAULT_CONTEXT_LIMIT: u32 = 8192;

/// Estimated token count of `text`.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count() as u32;
    chars.div_ceil(4)
}

/// Estimated prompt tokens for a conversation.
pub fn count_messages(messages: &[ChatMessage]) -> u32 {
    let body: u32 = messages
        .iter()
        .map(|m| {
            TOKENS_PER_MESSAGE
                + estimate_tokens(&m.role.to_string())
                + estimate_tokens(&m.text())
                + m.name.as_deref().map(estimate_tokens).unwrap_or(0)
        })
        .sum();
    body + REPLY_PRIMING_TOKENS
}

/// Estimated prompt tokens when the caller's system messages are replaced by
/// `system_context`.
///
/// The runtime never receives the system context, but it is still billed as
/// part of the prompt.
pub fn count_prompt(system_context: &str, messages: &[ChatMessage]) -> u32 {
    let counted: Vec<ChatMessage> = std::iter::once(ChatMessage::new(Role::System, system_context))
        .chain(messages.iter().filter(|m| m.role != Role::System).cloned())
        .collect();
    count_messages(&counted)
}

/// Context limit of a public model name.
pub fn context_limit(model: &str) -> u32 {
    match model {
        "gpt-3.5-turbo" => 4096,
        "gpt-4" => 8192,
        "gpt-4.1" | "gpt-4-turbo" | "gpt-4o" | "gpt-4o-mini" => 128_000,
        _ => DEFAULT_CONTEXT_LIMIT,
    }
}

/// `context_window` from a session's generation configuration, if present.
pub fn session_context_window(config: &GenerationConfig) -> Option<u32> {
    config
        .get("context_window")
        .and_then(|v| v.as_u64())
        .and_then(|v| u32::try_from(v).ok())
        .filter(|v| *v > 0)
}
