//! Request orchestration.
//!
//! One request against one session:
//!
//! 1. open a configuration lease with the caller's overrides
//! 2. up to `max_attempts` times, open the upstream stream and consume it,
//!    forwarding content deltas and skipping reasoning
//! 3. on a failed attempt, let [`recovery::handle`] decide between
//!    compact-and-retry and giving up
//! 4. release the lease, whatever happened
//!
//! Buffered and incremental delivery share this loop. They differ only in
//! the [`DeltaSink`] that receives content as it is classified.

pub mod delivery;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::lease::LeaseManager;
use crate::recovery::{self, AttemptFailure, ErrorClass, FormattedError, RetryDecision};
use crate::state::{flag_or, parse_or, ConfigError};
use crate::stream::{classify, StreamEvent};
use crate::upstream::{AgentRuntime, ConfigOverrides, UpstreamMessage};

/// Retry and deadline settings
#[derive(Debug, Clone, serde::Serialize)]
pub struct OrchestratorConfig {
    /// Attempts per request, including the first
    pub max_attempts: u32,

    /// Compact and retry when the session's context window is full
    pub retry_on_context_full: bool,

    /// Messages kept by a compaction
    pub compaction_retain: usize,

    /// Deadline for the whole attempt loop; `None` is unbounded
    #[serde(serialize_with = "serialize_secs")]
    pub request_timeout: Option<Duration>,
}

fn serialize_secs<S: serde::Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(d) => s.serialize_some(&d.as_secs()),
        None => s.serialize_none(),
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            retry_on_context_full: true,
            compaction_retain: 10,
            request_timeout: Some(Duration::from_secs(300)),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_lookup<F>(lookup: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let max_attempts = parse_or(lookup, "LIBRARIAN_MAX_ATTEMPTS", defaults.max_attempts)?;
        if max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "LIBRARIAN_MAX_ATTEMPTS",
                value: "0".to_string(),
            });
        }
        let request_timeout_secs: u64 = parse_or(lookup, "LIBRARIAN_REQUEST_TIMEOUT", 300)?;

        Ok(Self {
            max_attempts,
            retry_on_context_full: flag_or(
                lookup,
                "LIBRARIAN_RETRY_ON_CONTEXT_FULL",
                defaults.retry_on_context_full,
            )?,
            compaction_retain: parse_or(
                lookup,
                "LIBRARIAN_COMPACTION_RETAIN",
                defaults.compaction_retain,
            )?,
            request_timeout: (request_timeout_secs > 0)
                .then(|| Duration::from_secs(request_timeout_secs)),
        })
    }
}

/// A translated request bound to its session
#[derive(Debug, Clone)]
pub struct RequestPlan {
    pub session_id: String,
    pub messages: Vec<UpstreamMessage>,
    pub overrides: ConfigOverrides,
}

/// How a request ended
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Visible text of the successful attempt
    Completed(String),
    /// Rendered once, by the delivery mode
    Failed(FormattedError),
    /// The consumer went away mid-stream
    Disconnected,
}

/// The delivering side is gone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkClosed;

/// Receives content deltas as soon as they are classified.
#[async_trait]
pub trait DeltaSink: Send {
    async fn send_delta(&mut self, text: &str) -> Result<(), SinkClosed>;
}

/// Sink for buffered delivery; the text is returned in the outcome.
pub struct Discard;

#[async_trait]
impl DeltaSink for Discard {
    async fn send_delta(&mut self, _text: &str) -> Result<(), SinkClosed> {
        Ok(())
    }
}

enum AttemptEnd {
    Finished,
    Disconnected,
}

/// Drives requests through lease, attempts and recovery.
#[derive(Clone)]
pub struct Orchestrator {
    runtime: Arc<dyn AgentRuntime>,
    leases: LeaseManager,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        runtime: Arc<dyn AgentRuntime>,
        leases: LeaseManager,
        config: OrchestratorConfig,
    ) -> Self {
        Self { runtime, leases, config }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    /// Run `plan`, collecting the visible text.
    pub async fn run_buffered(&self, plan: &RequestPlan) -> Outcome {
        self.run(plan, &mut Discard).await
    }

    /// Run `plan`, forwarding each content delta to `sink`.
    pub async fn run(&self, plan: &RequestPlan, sink: &mut dyn DeltaSink) -> Outcome {
        if plan.messages.is_empty() {
            let failure = AttemptFailure::Validation("messages must not be empty".to_string());
            let error = FormattedError::from_failure(&failure, ErrorClass::ValidationError);
            return Outcome::Failed(error);
        }

        let lease = self.leases.acquire(&plan.session_id, plan.overrides).await;

        let outcome = match self.config.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.attempts(plan, sink)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(
                        session_id = %plan.session_id,
                        timeout_secs = limit.as_secs(),
                        "Request deadline exceeded"
                    );
                    Outcome::Failed(FormattedError::server_error(format!(
                        "Server error: request timed out after {}s",
                        limit.as_secs()
                    )))
                }
            },
            None => self.attempts(plan, sink).await,
        };

        lease.release().await;
        outcome
    }

    async fn attempts(&self, plan: &RequestPlan, sink: &mut dyn DeltaSink) -> Outcome {
        let max_attempts = self.config.max_attempts;

        for attempt in 0..max_attempts {
            let mut text = String::new();
            let failure = match self.attempt(plan, sink, &mut text).await {
                Ok(AttemptEnd::Finished) => {
                    debug!(
                        session_id = %plan.session_id,
                        attempt = attempt + 1,
                        chars = text.len(),
                        "Attempt completed"
                    );
                    return Outcome::Completed(text);
                }
                Ok(AttemptEnd::Disconnected) => {
                    info!(
                        session_id = %plan.session_id,
                        "Client disconnected, abandoning upstream stream"
                    );
                    return Outcome::Disconnected;
                }
                Err(failure) => failure,
            };

            warn!(
                session_id = %plan.session_id,
                attempt = attempt + 1,
                max_attempts,
                error = %failure,
                "Attempt failed"
            );

            let decision = recovery::handle(
                &failure,
                &plan.session_id,
                attempt,
                max_attempts,
                self.config.retry_on_context_full,
                move |session_id| async move {
                    self.runtime.compact(&session_id, self.config.compaction_retain).await
                },
            )
            .await;

            match decision {
                RetryDecision::Retry => continue,
                RetryDecision::GiveUp(error) => return Outcome::Failed(error),
            }
        }

        // `handle` never retries the final attempt, so only a zero budget gets here
        debug_assert_eq!(max_attempts, 0, "attempt loop ended without a verdict");
        Outcome::Failed(FormattedError::exhausted())
    }

    /// One upstream call. Dropping the event stream stops consuming it.
    async fn attempt(
        &self,
        plan: &RequestPlan,
        sink: &mut dyn DeltaSink,
        text: &mut String,
    ) -> Result<AttemptEnd, AttemptFailure> {
        let mut events = self.runtime.open_stream(&plan.session_id, &plan.messages).await?;

        while let Some(frame) = events.next().await {
            match classify(&frame?) {
                StreamEvent::ContentDelta(delta) => {
                    if delta.is_empty() {
                        continue;
                    }
                    text.push_str(&delta);
                    if sink.send_delta(&delta).await.is_err() {
                        return Ok(AttemptEnd::Disconnected);
                    }
                }
                StreamEvent::ReasoningDelta(_) => {}
                StreamEvent::ToolInvocation(call) => {
                    debug!(
                        session_id = %plan.session_id,
                        tool_call = %call,
                        "Upstream tool invocation"
                    );
                }
                StreamEvent::TerminalStop => return Ok(AttemptEnd::Finished),
                StreamEvent::TerminalError(message) => {
                    return Err(AttemptFailure::Terminal(message));
                }
                StreamEvent::Ignored => {}
            }
        }

        // Sequence ended without a terminal event
        Ok(AttemptEnd::Finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::SessionLocks;
    use crate::upstream::testing::{content, error_frame, reasoning, stop, Script, ScriptedRuntime};
    use crate::upstream::{UpstreamError, UpstreamRole};
    use serde_json::json;
    use std::sync::atomic::Ordering;

    const SESSION: &str = "agent-1";

    fn orchestrator(runtime: &Arc<ScriptedRuntime>, config: OrchestratorConfig) -> Orchestrator {
        let runtime: Arc<dyn AgentRuntime> = runtime.clone();
        let leases = LeaseManager::new(Arc::clone(&runtime), SessionLocks::new());
        Orchestrator::new(runtime, leases, config)
    }

    fn plan(overrides: ConfigOverrides) -> RequestPlan {
        RequestPlan {
            session_id: SESSION.to_string(),
            messages: vec![UpstreamMessage::new(UpstreamRole::User, "2+2?")],
            overrides,
        }
    }

    /// Collects deltas; closes after `limit` of them
    struct Collect {
        deltas: Vec<String>,
        limit: Option<usize>,
    }

    #[async_trait]
    impl DeltaSink for Collect {
        async fn send_delta(&mut self, text: &str) -> Result<(), SinkClosed> {
            if self.limit.is_some_and(|limit| self.deltas.len() >= limit) {
                return Err(SinkClosed);
            }
            self.deltas.push(text.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_config_from_lookup() {
        let config = OrchestratorConfig::from_lookup(&|key: &str| match key {
            "LIBRARIAN_MAX_ATTEMPTS" => Some("3".to_string()),
            "LIBRARIAN_REQUEST_TIMEOUT" => Some("0".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.request_timeout, None);
        assert_eq!(config.compaction_retain, 10);

        let err = OrchestratorConfig::from_lookup(&|key: &str| {
            (key == "LIBRARIAN_MAX_ATTEMPTS").then(|| "0".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "LIBRARIAN_MAX_ATTEMPTS", .. }));
    }

    #[tokio::test]
    async fn test_reasoning_is_filtered() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.push_frames(vec![reasoning("x"), content("Hello"), content(" world"), stop()]);
        let orchestrator = orchestrator(&runtime, OrchestratorConfig::default());

        let mut sink = Collect { deltas: Vec::new(), limit: None };
        let outcome = orchestrator.run(&plan(ConfigOverrides::default()), &mut sink).await;

        assert_eq!(outcome, Outcome::Completed("Hello world".to_string()));
        assert_eq!(sink.deltas, vec!["Hello", " world"]);
    }

    #[tokio::test]
    async fn test_context_full_retried_once() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.push_frames(vec![error_frame("Context window is full")]);
        runtime.push_frames(vec![content("recovered"), stop()]);
        let orchestrator = orchestrator(&runtime, OrchestratorConfig::default());

        let outcome = orchestrator.run_buffered(&plan(ConfigOverrides::default())).await;

        assert_eq!(outcome, Outcome::Completed("recovered".to_string()));
        assert_eq!(runtime.compact_calls.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.open_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_bound() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.push_frames(vec![error_frame("Context window is full")]);
        runtime.push_frames(vec![error_frame("Context window is full")]);
        let orchestrator = orchestrator(&runtime, OrchestratorConfig::default());

        let outcome = orchestrator.run_buffered(&plan(ConfigOverrides::default())).await;

        let Outcome::Failed(error) = outcome else {
            panic!("expected failure, got {:?}", outcome);
        };
        assert_eq!(error.error_type, "server_error");
        assert!(error.message.contains("Context window"));
        assert_eq!(runtime.compact_calls.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.open_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_server_error_not_retried() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.push_frames(vec![content("partial"), error_frame("internal failure")]);
        let orchestrator = orchestrator(&runtime, OrchestratorConfig::default());

        let outcome = orchestrator.run_buffered(&plan(ConfigOverrides::default())).await;

        assert_eq!(
            outcome,
            Outcome::Failed(FormattedError::server_error("Letta agent error: internal failure"))
        );
        assert_eq!(runtime.compact_calls.load(Ordering::SeqCst), 0);
        assert_eq!(runtime.open_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_error_classified() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.push_script(Script::OpenError(UpstreamError::Api {
            status: 422,
            message: "bad request".into(),
        }));
        let orchestrator = orchestrator(&runtime, OrchestratorConfig::default());

        let outcome = orchestrator.run_buffered(&plan(ConfigOverrides::default())).await;
        let Outcome::Failed(error) = outcome else {
            panic!("expected failure");
        };
        assert!(error.message.starts_with("Upstream API error:"));
    }

    #[tokio::test]
    async fn test_zero_attempt_budget_is_exhausted() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let orchestrator =
            orchestrator(&runtime, OrchestratorConfig { max_attempts: 0, ..Default::default() });

        let outcome = orchestrator.run_buffered(&plan(ConfigOverrides::default())).await;

        assert_eq!(outcome, Outcome::Failed(FormattedError::exhausted()));
        assert_eq!(runtime.open_calls.load(Ordering::SeqCst), 0);
        assert_eq!(runtime.compact_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_validation_fast_path() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let orchestrator =
            orchestrator(&runtime, OrchestratorConfig { max_attempts: 5, ..Default::default() });
        let mut empty = plan(ConfigOverrides::default());
        empty.messages.clear();

        let Outcome::Failed(error) = orchestrator.run_buffered(&empty).await else {
            panic!("expected failure");
        };

        assert_eq!(error.error_type, "invalid_request_error");
        assert_eq!(runtime.open_calls.load(Ordering::SeqCst), 0);
        assert_eq!(runtime.compact_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_compaction_failure_surfaces_original() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.fail_compact.store(true, Ordering::SeqCst);
        runtime.push_frames(vec![error_frame("maximum context length exceeded")]);
        let orchestrator = orchestrator(&runtime, OrchestratorConfig::default());

        let outcome = orchestrator.run_buffered(&plan(ConfigOverrides::default())).await;
        let Outcome::Failed(error) = outcome else {
            panic!("expected failure");
        };

        assert!(error.message.contains("maximum context length exceeded"));
        assert!(!error.message.contains("summarize failed"));
        assert_eq!(runtime.open_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovery_disabled() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.push_frames(vec![error_frame("Context window is full")]);
        let config = OrchestratorConfig { retry_on_context_full: false, ..Default::default() };
        let orchestrator = orchestrator(&runtime, config);

        let outcome = orchestrator.run_buffered(&plan(ConfigOverrides::default())).await;

        assert!(matches!(outcome, Outcome::Failed(_)));
        assert_eq!(runtime.compact_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_lease_restored_after_failure() {
        let runtime = Arc::new(
            ScriptedRuntime::new()
                .with_config(SESSION, json!({"temperature": 0.7, "max_tokens": 1000})),
        );
        runtime.push_frames(vec![error_frame("internal failure")]);
        let orchestrator = orchestrator(&runtime, OrchestratorConfig::default());
        let overrides = ConfigOverrides { temperature: Some(0.9), max_tokens: None };

        let outcome = orchestrator.run_buffered(&plan(overrides)).await;

        assert!(matches!(outcome, Outcome::Failed(_)));
        let restored = runtime.config(SESSION).unwrap();
        assert_eq!(
            serde_json::Value::Object(restored),
            json!({"temperature": 0.7, "max_tokens": 1000})
        );
        assert_eq!(runtime.modify_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_disconnect_stops_consuming() {
        let runtime = Arc::new(
            ScriptedRuntime::new().with_config(SESSION, json!({"temperature": 0.7})),
        );
        runtime.push_frames(vec![content("a"), content("b"), content("c"), stop()]);
        let orchestrator = orchestrator(&runtime, OrchestratorConfig::default());
        let overrides = ConfigOverrides { temperature: Some(1.2), max_tokens: None };

        let mut sink = Collect { deltas: Vec::new(), limit: Some(1) };
        let outcome = orchestrator.run(&plan(overrides), &mut sink).await;

        assert_eq!(outcome, Outcome::Disconnected);
        assert_eq!(sink.deltas, vec!["a"]);
        assert_eq!(runtime.open_calls.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.config(SESSION).unwrap()["temperature"], json!(0.7));
    }

    #[tokio::test]
    async fn test_request_deadline() {
        let runtime = Arc::new(
            ScriptedRuntime::new().with_frame_delay(Duration::from_millis(200)),
        );
        runtime.push_frames(vec![content("slow"), stop()]);
        let config = OrchestratorConfig {
            request_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let orchestrator = orchestrator(&runtime, config);

        let outcome = orchestrator.run_buffered(&plan(ConfigOverrides::default())).await;
        let Outcome::Failed(error) = outcome else {
            panic!("expected timeout");
        };
        assert!(error.message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_end_without_terminal_frame() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.push_frames(vec![content("no stop frame")]);
        let orchestrator = orchestrator(&runtime, OrchestratorConfig::default());

        let outcome = orchestrator.run_buffered(&plan(ConfigOverrides::default())).await;
        assert_eq!(outcome, Outcome::Completed("no stop frame".to_string()));
    }
}
