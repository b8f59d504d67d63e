//! Wire types.
//!
//! - `openai`: the inbound chat-completion protocol
//! - `letta`: request and response bodies of the agent runtime

pub mod letta;
pub mod openai;
