//! Shared fixtures for the HTTP-level tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use futures::{stream, StreamExt};
use http_body_util::BodyExt;
use serde_json::{json, Value};

use librarian_proxy::upstream::{
    AgentRuntime, EventStream, GenerationConfig, SessionSummary, ToolSpec, ToolSummary,
    UpstreamError, UpstreamMessage,
};
use librarian_proxy::{build_router, AppState, ProxyConfig};

pub fn content(text: &str) -> Value {
    json!({"message_type": "assistant_message", "content": text})
}

pub fn reasoning(text: &str) -> Value {
    json!({"message_type": "reasoning_message", "reasoning": text})
}

pub fn stop() -> Value {
    json!({"message_type": "stop_reason", "stop_reason": "end_turn"})
}

pub fn error_frame(message: &str) -> Value {
    json!({"message_type": "error", "message": message})
}

/// In-memory runtime replaying queued frame scripts.
#[derive(Default)]
pub struct FakeRuntime {
    configs: Mutex<HashMap<String, GenerationConfig>>,
    scripts: Mutex<VecDeque<Vec<Value>>>,
    /// Sessions and message batches passed to `open_stream`
    pub sent: Mutex<Vec<(String, Vec<UpstreamMessage>)>>,
    pub compact_calls: AtomicUsize,
    pub tools: Mutex<Vec<ToolSummary>>,
    pub created_tools: Mutex<Vec<String>>,
    /// `(session_id, tool_id)` per attach call
    pub attached_tools: Mutex<Vec<(String, String)>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(self, session_id: &str, config: Value) -> Self {
        let config = config.as_object().cloned().unwrap_or_default();
        self.configs.lock().unwrap().insert(session_id.to_string(), config);
        self
    }

    pub fn push_frames(&self, frames: Vec<Value>) {
        self.scripts.lock().unwrap().push_back(frames);
    }

    pub fn config(&self, session_id: &str) -> Option<GenerationConfig> {
        self.configs.lock().unwrap().get(session_id).cloned()
    }
}

#[async_trait]
impl AgentRuntime for FakeRuntime {
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, UpstreamError> {
        Ok(Vec::new())
    }

    async fn retrieve_config(
        &self,
        session_id: &str,
    ) -> Result<Option<GenerationConfig>, UpstreamError> {
        Ok(self.config(session_id))
    }

    async fn modify_config(
        &self,
        session_id: &str,
        config: &GenerationConfig,
    ) -> Result<(), UpstreamError> {
        self.configs.lock().unwrap().insert(session_id.to_string(), config.clone());
        Ok(())
    }

    async fn open_stream(
        &self,
        session_id: &str,
        messages: &[UpstreamMessage],
    ) -> Result<EventStream, UpstreamError> {
        self.sent.lock().unwrap().push((session_id.to_string(), messages.to_vec()));
        let frames = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| vec![content("ok"), stop()]);
        Ok(stream::iter(frames.into_iter().map(Ok)).boxed())
    }

    async fn compact(&self, _session_id: &str, _retain: usize) -> Result<(), UpstreamError> {
        self.compact_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolSummary>, UpstreamError> {
        Ok(self.tools.lock().unwrap().clone())
    }

    async fn create_tool(&self, tool: &ToolSpec) -> Result<ToolSummary, UpstreamError> {
        let created = ToolSummary { id: format!("tool-{}", tool.name), name: tool.name.clone() };
        self.created_tools.lock().unwrap().push(tool.name.clone());
        self.tools.lock().unwrap().push(created.clone());
        Ok(created)
    }

    async fn attach_tool(&self, session_id: &str, tool_id: &str) -> Result<(), UpstreamError> {
        self.attached_tools.lock().unwrap().push((session_id.to_string(), tool_id.to_string()));
        Ok(())
    }
}

pub fn app_with(config: ProxyConfig, runtime: Arc<FakeRuntime>) -> axum::Router {
    let runtime: Arc<dyn AgentRuntime> = runtime;
    build_router(Arc::new(AppState::new(config, runtime)))
}

pub fn app(runtime: Arc<FakeRuntime>) -> axum::Router {
    app_with(ProxyConfig::with_base_url("http://letta.test"), runtime)
}

pub fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

/// Payloads of every `data:` line in an SSE body
pub fn sse_data(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.trim().to_string())
        .collect()
}
