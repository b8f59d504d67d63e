//! Buffered and incremental delivery of a completion.
//!
//! Both modes run the request under the admission budget. Streaming runs in
//! its own task that feeds an SSE response through a channel; when the
//! client goes away the channel closes and the task drops its work, which
//! releases the slot and restores any lease.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::response::{
    sse::{Event, KeepAlive},
    IntoResponse, Response, Sse,
};
use futures::stream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{DeltaSink, Outcome, RequestPlan, SinkClosed};
use crate::error::ProxyError;
use crate::metrics::RequestTimer;
use crate::state::AppState;
use crate::stream::sse::DONE_SENTINEL;
use crate::tokens;
use crate::types::openai::{ChatCompletionResponse, ChunkBuilder, Role, Usage};

/// Events buffered between the request task and the response body
const EVENT_BUFFER: usize = 64;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// A completion ready to run
#[derive(Debug, Clone)]
pub struct Completion {
    /// Model name as requested
    pub model: String,
    pub plan: RequestPlan,
    /// Estimated prompt tokens of the original messages
    pub prompt_tokens: u32,
    pub caller: Option<String>,
}

fn into_result(outcome: Outcome) -> Result<String, ProxyError> {
    match outcome {
        Outcome::Completed(text) => Ok(text),
        Outcome::Failed(error) => Err(ProxyError::Failed(error)),
        Outcome::Disconnected => Err(ProxyError::Disconnected),
    }
}

/// Run to completion and build one response body.
pub async fn buffered(
    state: &AppState,
    job: Completion,
) -> Result<ChatCompletionResponse, ProxyError> {
    let timer = RequestTimer::new(&job.model);
    let plan = &job.plan;

    let run = move || async move { into_result(state.orchestrator.run_buffered(plan).await) };
    let result = state
        .admission
        .run_with_queue(&plan.session_id, plan.messages.clone(), job.caller.clone(), run)
        .await;

    match result {
        Ok(text) => {
            let usage = Usage::new(job.prompt_tokens, tokens::estimate_tokens(&text));
            timer.record_success(u64::from(usage.completion_tokens));
            Ok(ChatCompletionResponse::new(job.model, text, usage))
        }
        Err(e) => {
            timer.record_failure();
            Err(e)
        }
    }
}

/// Start the request in its own task and return the SSE response.
pub fn streaming(state: Arc<AppState>, job: Completion) -> Response {
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    tokio::spawn(run_stream(state, job, tx));

    let events = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (Ok::<_, Infallible>(event), rx))
    });

    Sse::new(events)
        .keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL).text("keep-alive"))
        .into_response()
}

/// Forwards content deltas as `chat.completion.chunk` frames.
struct ChunkSink {
    tx: mpsc::Sender<Event>,
    chunks: ChunkBuilder,
    role_sent: bool,
}

#[async_trait]
impl DeltaSink for ChunkSink {
    async fn send_delta(&mut self, text: &str) -> Result<(), SinkClosed> {
        let mut chunk = self.chunks.content(text);
        if !self.role_sent {
            chunk.choices[0].delta.role = Some(Role::Assistant);
            self.role_sent = true;
        }
        match Event::default().json_data(&chunk) {
            Ok(event) => self.tx.send(event).await.map_err(|_| SinkClosed),
            Err(e) => {
                warn!(error = %e, "Failed to encode chunk, skipping");
                Ok(())
            }
        }
    }
}

async fn run_stream(state: Arc<AppState>, job: Completion, tx: mpsc::Sender<Event>) {
    let timer = RequestTimer::new(&job.model);
    let chunks = ChunkBuilder::new(job.model.clone());
    let mut sink = ChunkSink { tx: tx.clone(), chunks: chunks.clone(), role_sent: false };
    let plan = &job.plan;

    let work = {
        let sink = &mut sink;
        let state = &state;
        state.admission.run_with_queue(
            &plan.session_id,
            plan.messages.clone(),
            job.caller.clone(),
            move || async move { into_result(state.orchestrator.run(plan, sink).await) },
        )
    };

    // Dropping `work` on disconnect releases the slot and the lease
    let result = tokio::select! {
        result = work => result,
        _ = tx.closed() => Err(ProxyError::Disconnected),
    };

    match result {
        Ok(text) => {
            let usage = Usage::new(job.prompt_tokens, tokens::estimate_tokens(&text));
            timer.record_success(u64::from(usage.completion_tokens));
            let finish = Event::default()
                .json_data(chunks.finish(usage))
                .unwrap_or_else(|_| Event::default().data("{}"));
            for event in [finish, Event::default().data(DONE_SENTINEL)] {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        }
        Err(ProxyError::Disconnected) => {
            debug!(model = %job.model, session_id = %plan.session_id, "Stream abandoned by client");
        }
        Err(e) => {
            timer.record_failure();
            for event in e.formatted().to_events() {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ProxyConfig;
    use crate::upstream::testing::{content, error_frame, reasoning, stop, ScriptedRuntime};
    use crate::upstream::{AgentRuntime, ConfigOverrides, UpstreamMessage, UpstreamRole};
    use http_body_util::BodyExt;
    use std::sync::atomic::Ordering;

    fn app(runtime: &Arc<ScriptedRuntime>) -> Arc<AppState> {
        let runtime: Arc<dyn AgentRuntime> = runtime.clone();
        Arc::new(AppState::new(ProxyConfig::with_base_url("http://letta.test"), runtime))
    }

    fn job() -> Completion {
        Completion {
            model: "gpt-4".to_string(),
            plan: RequestPlan {
                session_id: "agent-1".to_string(),
                messages: vec![UpstreamMessage::new(UpstreamRole::User, "2+2?")],
                overrides: ConfigOverrides::default(),
            },
            prompt_tokens: 8,
            caller: None,
        }
    }

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_buffered_usage() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.push_frames(vec![reasoning("thinking"), content("Four"), stop()]);
        let state = app(&runtime);

        let response = buffered(&state, job()).await.unwrap();

        assert_eq!(response.choices[0].message.content, "Four");
        assert_eq!(response.usage.prompt_tokens, 8);
        assert_eq!(response.usage.completion_tokens, 1);
        assert_eq!(response.usage.total_tokens, 9);
        assert_eq!(state.admission.load_stats().active_requests, 0);
    }

    #[tokio::test]
    async fn test_buffered_failure() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.push_frames(vec![error_frame("boom")]);
        let state = app(&runtime);

        let err = buffered(&state, job()).await.unwrap_err();

        assert!(matches!(err, ProxyError::Failed(_)));
        assert_eq!(state.admission.metrics().snapshot().requests_failed, 1);
    }

    #[tokio::test]
    async fn test_streaming_frames() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.push_frames(vec![content("Hello"), content(" world"), stop()]);

        let body = body_text(streaming(app(&runtime), job())).await;

        let data: Vec<&str> = body
            .lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .collect();
        assert_eq!(data.len(), 4);
        assert_eq!(data[3], "[DONE]");

        let first: serde_json::Value = serde_json::from_str(data[0]).unwrap();
        assert_eq!(first["object"], "chat.completion.chunk");
        assert_eq!(first["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(first["choices"][0]["delta"]["content"], "Hello");

        let second: serde_json::Value = serde_json::from_str(data[1]).unwrap();
        assert!(second["choices"][0]["delta"].get("role").is_none());

        let last: serde_json::Value = serde_json::from_str(data[2]).unwrap();
        assert_eq!(last["choices"][0]["finish_reason"], "stop");
        assert_eq!(last["usage"]["completion_tokens"], 3);
        assert_eq!(last["id"], first["id"]);
    }

    #[tokio::test]
    async fn test_streaming_error_frame() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.push_frames(vec![error_frame("boom")]);

        let body = body_text(streaming(app(&runtime), job())).await;

        let data: Vec<&str> = body
            .lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .collect();
        assert_eq!(data.len(), 2);
        let error: serde_json::Value = serde_json::from_str(data[0]).unwrap();
        assert_eq!(error["error"]["type"], "server_error");
        assert_eq!(error["error"]["message"], "Letta agent error: boom");
        assert_eq!(data[1], "[DONE]");
    }

    #[tokio::test]
    async fn test_streaming_disconnect_releases_slot() {
        let runtime = Arc::new(
            ScriptedRuntime::new().with_frame_delay(Duration::from_millis(50)),
        );
        runtime.push_frames(vec![content("a"), content("b"), content("c"), stop()]);
        let state = app(&runtime);

        let response = streaming(Arc::clone(&state), job());
        drop(response);

        for _ in 0..50 {
            if state.admission.load_stats().active_requests == 0
                && state.admission.metrics().snapshot().requests_received == 1
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stats = state.admission.load_stats();
        assert_eq!(stats.active_requests, 0);
        assert_eq!(stats.queue_size, 0);
        assert_eq!(stats.available_permits, stats.max_concurrent);
        assert!(runtime.open_calls.load(Ordering::SeqCst) <= 1);
    }
}
