//! Conversion from OpenAI chat messages to the agent runtime's format.
//!
//! The runtime keeps its own history and persona, so system messages are
//! never forwarded: they are folded into a system context that only counts
//! toward prompt usage. Every other message is forwarded in request order.

use tracing::debug;

use crate::registry::ModelMode;
use crate::types::openai::{ChatMessage, Role};
use crate::upstream::{UpstreamMessage, UpstreamRole};

/// Marks a request as arriving through the API rather than a chat client
pub const API_INDICATOR: &str = "[API]";

/// Separator between merged system messages
const SYSTEM_SEPARATOR: &str = "\n\n";

/// Messages that cannot be forwarded
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranslateError {
    #[error("messages must not be empty")]
    Empty,

    #[error("messages must contain at least one non-system message")]
    OnlySystem,
}

/// A request's messages split for the runtime
#[derive(Debug, Clone, PartialEq)]
pub struct Translated {
    /// Non-system messages in upstream format
    pub messages: Vec<UpstreamMessage>,
    /// Caller system messages, merged
    pub system: Option<String>,
}

/// Convert OpenAI messages to upstream messages
pub fn to_upstream(messages: &[ChatMessage]) -> Result<Translated, TranslateError> {
    if messages.is_empty() {
        return Err(TranslateError::Empty);
    }

    let system: Vec<String> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(ChatMessage::text)
        .filter(|text| !text.trim().is_empty())
        .collect();

    let conversation: Vec<UpstreamMessage> = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .filter_map(convert_message)
        .collect();

    if conversation.is_empty() {
        return Err(TranslateError::OnlySystem);
    }

    debug!(
        messages = messages.len(),
        system_messages = system.len(),
        "Converting OpenAI messages to upstream format"
    );

    Ok(Translated {
        messages: conversation,
        system: (!system.is_empty()).then(|| system.join(SYSTEM_SEPARATOR)),
    })
}

/// System context billed for a request: the API indicator, the caller's
/// system text and the mode instruction.
pub fn system_context(system: Option<&str>, mode: ModelMode) -> String {
    match system {
        Some(system) => format!(
            "{API_INDICATOR}{SYSTEM_SEPARATOR}{system}{SYSTEM_SEPARATOR}{}",
            mode.instruction()
        ),
        None => format!("{API_INDICATOR}{SYSTEM_SEPARATOR}{}", mode.instruction()),
    }
}

/// Convert a single non-system message
fn convert_message(msg: &ChatMessage) -> Option<UpstreamMessage> {
    let role = match msg.role {
        Role::System => return None,
        Role::User => UpstreamRole::User,
        Role::Assistant => UpstreamRole::Assistant,
        Role::Tool => UpstreamRole::Tool,
    };
    let mut converted = UpstreamMessage::new(role, msg.text());
    if msg.role == Role::Tool {
        converted.tool_call_id = msg.tool_call_id.clone();
    }
    Some(converted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_basic_conversion() {
        let messages = vec![
            ChatMessage::new(Role::User, "Hello"),
            ChatMessage::new(Role::Assistant, "Hi there"),
            ChatMessage::new(Role::User, "How are you?"),
        ];

        let converted = to_upstream(&messages).unwrap().messages;
        assert_eq!(converted.len(), 3);
        assert_eq!(converted[0].role, UpstreamRole::User);
        assert_eq!(converted[0].content[0].text, "Hello");
        assert_eq!(converted[1].role, UpstreamRole::Assistant);
        assert_eq!(converted[2].content[0].text, "How are you?");
    }

    #[test]
    fn test_system_messages_not_forwarded() {
        let messages = vec![
            ChatMessage::new(Role::User, "Question"),
            ChatMessage::new(Role::System, "Be brief."),
            ChatMessage::new(Role::System, "Cite sources."),
        ];

        let translated = to_upstream(&messages).unwrap();
        assert_eq!(translated.messages.len(), 1);
        assert_eq!(translated.messages[0].role, UpstreamRole::User);
        assert_eq!(translated.system.as_deref(), Some("Be brief.\n\nCite sources."));
    }

    #[test]
    fn test_system_context() {
        let with_system = system_context(Some("Be brief."), ModelMode::Worker);
        assert!(with_system.starts_with("[API]\n\nBe brief.\n\n"));
        assert!(with_system.ends_with(ModelMode::Worker.instruction()));

        let bare = system_context(None, ModelMode::Persona);
        assert_eq!(bare, format!("[API]\n\n{}", ModelMode::Persona.instruction()));
    }

    #[test]
    fn test_tool_message_keeps_call_id() {
        let message: ChatMessage = serde_json::from_value(json!({
            "role": "tool",
            "content": "42",
            "tool_call_id": "call_1"
        }))
        .unwrap();
        let user: ChatMessage = serde_json::from_value(json!({
            "role": "user",
            "content": "ignored id",
            "tool_call_id": "call_2"
        }))
        .unwrap();

        let converted = to_upstream(&[message, user]).unwrap().messages;
        assert_eq!(converted[0].role, UpstreamRole::Tool);
        assert_eq!(converted[0].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(converted[1].tool_call_id, None);
    }

    #[test]
    fn test_wire_shape() {
        let converted = to_upstream(&[ChatMessage::new(Role::User, "2+2?")]).unwrap().messages;
        let value = serde_json::to_value(&converted[0]).unwrap();
        assert_eq!(value, json!({"role": "user", "content": [{"type": "text", "text": "2+2?"}]}));
    }

    #[test]
    fn test_rejected_inputs() {
        assert_eq!(to_upstream(&[]), Err(TranslateError::Empty));
        assert_eq!(
            to_upstream(&[ChatMessage::new(Role::System, "only rules")]),
            Err(TranslateError::OnlySystem)
        );
    }
}
