//! Upstream event streams.
//!
//! - `sse`: decodes the runtime's chunked SSE body into frames
//! - `classify`: maps each frame to a typed [`StreamEvent`]

mod classify;
pub mod sse;

pub use classify::{classify, extract_text, StreamEvent};
pub use sse::{SseDecoder, SseFrame};
