//! Scripted in-memory runtime for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use serde_json::{json, Value};

use super::{
    AgentRuntime, EventStream, GenerationConfig, SessionSummary, ToolSpec, ToolSummary,
    UpstreamError, UpstreamMessage,
};

/// What one `open_stream` call produces
pub enum Script {
    Frames(Vec<Value>),
    OpenError(UpstreamError),
}

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

#[derive(Default)]
pub struct ScriptedRuntime {
    pub configs: Mutex<HashMap<String, GenerationConfig>>,
    pub sessions: Vec<SessionSummary>,
    scripts: Mutex<VecDeque<Script>>,
    /// Every config written, in order
    pub writes: Mutex<Vec<(String, GenerationConfig)>>,
    pub retrieve_calls: AtomicUsize,
    pub modify_calls: AtomicUsize,
    pub open_calls: AtomicUsize,
    pub compact_calls: AtomicUsize,
    pub fail_retrieve: AtomicBool,
    pub fail_modify: AtomicBool,
    pub fail_compact: AtomicBool,
    pub frame_delay: Option<Duration>,
    pub tools: Mutex<Vec<ToolSummary>>,
    pub created_tools: Mutex<Vec<ToolSpec>>,
    /// `(session_id, tool_id)` per attach call
    pub attached_tools: Mutex<Vec<(String, String)>>,
    pub fail_tools: AtomicBool,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(self, session_id: &str, config: Value) -> Self {
        let config = config.as_object().cloned().unwrap_or_default();
        self.configs.lock().unwrap().insert(session_id.to_string(), config);
        self
    }

    pub fn with_frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = Some(delay);
        self
    }

    pub fn with_tool(self, tool: ToolSummary) -> Self {
        self.tools.lock().unwrap().push(tool);
        self
    }

    pub fn push_script(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn push_frames(&self, frames: Vec<Value>) {
        self.push_script(Script::Frames(frames));
    }

    pub fn config(&self, session_id: &str) -> Option<GenerationConfig> {
        self.configs.lock().unwrap().get(session_id).cloned()
    }
}

#[async_trait]
impl AgentRuntime for ScriptedRuntime {
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, UpstreamError> {
        Ok(self.sessions.clone())
    }

    async fn retrieve_config(
        &self,
        session_id: &str,
    ) -> Result<Option<GenerationConfig>, UpstreamError> {
        self.retrieve_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_retrieve.load(Ordering::SeqCst) {
            return Err(UpstreamError::Connection("retrieve failed".into()));
        }
        Ok(self.config(session_id))
    }

    async fn modify_config(
        &self,
        session_id: &str,
        config: &GenerationConfig,
    ) -> Result<(), UpstreamError> {
        self.modify_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_modify.load(Ordering::SeqCst) {
            return Err(UpstreamError::Api { status: 500, message: "modify failed".into() });
        }
        self.writes.lock().unwrap().push((session_id.to_string(), config.clone()));
        self.configs.lock().unwrap().insert(session_id.to_string(), config.clone());
        Ok(())
    }

    async fn open_stream(
        &self,
        _session_id: &str,
        _messages: &[UpstreamMessage],
    ) -> Result<EventStream, UpstreamError> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Script::Frames(vec![content("ok"), stop()]));

        let frames = match script {
            Script::Frames(frames) => frames,
            Script::OpenError(e) => return Err(e),
        };
        let delay = self.frame_delay;
        Ok(stream::iter(frames)
            .then(move |frame| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(frame)
            })
            .boxed())
    }

    async fn compact(&self, _session_id: &str, _retain: usize) -> Result<(), UpstreamError> {
        self.compact_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_compact.load(Ordering::SeqCst) {
            return Err(UpstreamError::Api { status: 500, message: "summarize failed".into() });
        }
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolSummary>, UpstreamError> {
        if self.fail_tools.load(Ordering::SeqCst) {
            return Err(UpstreamError::Api { status: 500, message: "tools unavailable".into() });
        }
        Ok(self.tools.lock().unwrap().clone())
    }

    async fn create_tool(&self, tool: &ToolSpec) -> Result<ToolSummary, UpstreamError> {
        let created = ToolSummary { id: format!("tool-{}", tool.name), name: tool.name.clone() };
        self.created_tools.lock().unwrap().push(tool.clone());
        self.tools.lock().unwrap().push(created.clone());
        Ok(created)
    }

    async fn attach_tool(&self, session_id: &str, tool_id: &str) -> Result<(), UpstreamError> {
        self.attached_tools.lock().unwrap().push((session_id.to_string(), tool_id.to_string()));
        Ok(())
    }
}
