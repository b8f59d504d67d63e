//! HTTP route handlers for the librarian gateway.
//!
//! - `health`: health check and metrics endpoints
//! - `openai`: OpenAI-compatible API routes

pub mod health;
pub mod openai;

// Re-export handlers for convenience
pub use health::{health, metrics, metrics_prometheus};
pub use openai::{chat_completions, completions, get_model, list_models};
