//! Failure classification and the retry decision.
//!
//! Context-window exhaustion is detected by substring matching against the
//! error text; the runtime does not expose a structured code for it. The
//! heuristic lives in [`matches_context_window`] and nowhere else.
//!
//! Nothing here holds state between calls.

mod format;

use std::fmt;
use std::future::Future;

use tracing::{error, warn};

pub use format::{FormattedError, AGENT_ERROR_PREFIX, EXHAUSTED_MESSAGE};

use crate::metrics;
use crate::upstream::UpstreamError;

/// Phrases that identify a full context window, matched case-insensitively.
///
/// Generic phrases such as "max_tokens" are left out: they also appear in
/// ordinary parameter errors, which must not trigger compaction.
const CONTEXT_WINDOW_VOCABULARY: &[&str] = &[
    "context window",
    "context_window",
    "context is full",
    "token limit exceeded",
    "maximum context length",
    "context_length_exceeded",
    "context length exceeded",
    "context overflow",
];

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Recoverable by compacting the session and retrying
    ContextWindowFull,
    /// The runtime rejected the call or returned something undecodable
    UpstreamProtocolError,
    /// Caller mistake; retrying cannot help
    ValidationError,
    ServerError,
}

/// Why an attempt did not complete.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AttemptFailure {
    /// The runtime ended the event sequence with an error event
    #[error("{0}")]
    Terminal(String),
    /// An RPC to the runtime failed
    #[error("{0}")]
    Upstream(#[from] UpstreamError),
    /// The request was rejected before reaching the runtime
    #[error("{0}")]
    Validation(String),
}

/// True when `text` reads like a context-window exhaustion error.
pub fn matches_context_window(text: &str) -> bool {
    let text = text.to_lowercase();
    CONTEXT_WINDOW_VOCABULARY.iter().any(|phrase| text.contains(phrase))
}

pub fn classify(failure: &AttemptFailure) -> ErrorClass {
    match failure {
        AttemptFailure::Validation(_) => ErrorClass::ValidationError,
        other if matches_context_window(&other.to_string()) => ErrorClass::ContextWindowFull,
        AttemptFailure::Upstream(UpstreamError::Api { .. } | UpstreamError::Decode(_)) => {
            ErrorClass::UpstreamProtocolError
        }
        _ => ErrorClass::ServerError,
    }
}

/// Whether `failure` at `attempt` (0-based) may be retried, before any
/// recovery action is taken.
pub fn is_retryable(
    failure: &AttemptFailure,
    attempt: u32,
    max_attempts: u32,
    allow_context_recovery: bool,
) -> bool {
    if attempt + 1 >= max_attempts {
        return false;
    }
    match classify(failure) {
        ErrorClass::ContextWindowFull => allow_context_recovery,
        _ => false,
    }
}

/// Outcome of [`handle`].
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Recovery succeeded; run the attempt again
    Retry,
    /// Stop and surface this error
    GiveUp(FormattedError),
}

/// Decide what to do about a failed attempt, compacting the session first
/// when the failure is a recoverable context-window error.
///
/// A failed compaction is never retried, and the caller sees the original
/// failure rather than the compaction error.
pub async fn handle<F, Fut, E>(
    failure: &AttemptFailure,
    session_id: &str,
    attempt: u32,
    max_attempts: u32,
    allow_context_recovery: bool,
    compact: F,
) -> RetryDecision
where
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: fmt::Display,
{
    let class = classify(failure);
    if !is_retryable(failure, attempt, max_attempts, allow_context_recovery) {
        return RetryDecision::GiveUp(FormattedError::from_failure(failure, class));
    }

    warn!(
        session_id,
        attempt = attempt + 1,
        max_attempts,
        "Context window full, compacting session before retry"
    );
    match compact(session_id.to_string()).await {
        Ok(()) => {
            metrics::record_compaction(true);
            metrics::record_retry();
            RetryDecision::Retry
        }
        Err(e) => {
            metrics::record_compaction(false);
            error!(session_id, error = %e, "Compaction failed, not retrying");
            RetryDecision::GiveUp(FormattedError::from_failure(failure, class))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn terminal(message: &str) -> AttemptFailure {
        AttemptFailure::Terminal(message.to_string())
    }

    #[test]
    fn test_failure_display_is_bare_message() {
        let upstream = UpstreamError::Connection("refused".into());
        let failure: AttemptFailure = upstream.clone().into();

        assert!(matches!(failure, AttemptFailure::Upstream(_)));
        assert_eq!(failure.to_string(), upstream.to_string());
        assert_eq!(terminal("quota spent").to_string(), "quota spent");
        assert_eq!(AttemptFailure::Validation("bad role".into()).to_string(), "bad role");
    }

    #[test]
    fn test_context_window_vocabulary() {
        for message in [
            "Context window is full",
            "error: context_window exceeded",
            "The context is full",
            "Token limit exceeded for model",
            "This model's maximum context length is 8192 tokens",
            "code=context_length_exceeded",
            "Context overflow detected",
        ] {
            assert_eq!(classify(&terminal(message)), ErrorClass::ContextWindowFull, "{}", message);
        }
    }

    #[test]
    fn test_parameter_errors_are_not_context_errors() {
        // Known near-miss: mentions max_tokens but is not about the window
        let failure = terminal("max_tokens must be a positive integer");
        assert_eq!(classify(&failure), ErrorClass::ServerError);
    }

    #[test]
    fn test_upstream_classes() {
        let api =
            AttemptFailure::Upstream(UpstreamError::Api { status: 422, message: "bad".into() });
        let decode = AttemptFailure::Upstream(UpstreamError::Decode("eof".into()));
        let conn = AttemptFailure::Upstream(UpstreamError::Connection("refused".into()));
        let full = AttemptFailure::Upstream(UpstreamError::Api {
            status: 400,
            message: "Context window exceeded".into(),
        });

        assert_eq!(classify(&api), ErrorClass::UpstreamProtocolError);
        assert_eq!(classify(&decode), ErrorClass::UpstreamProtocolError);
        assert_eq!(classify(&conn), ErrorClass::ServerError);
        assert_eq!(classify(&full), ErrorClass::ContextWindowFull);
    }

    #[test]
    fn test_validation_wins_over_vocabulary() {
        let failure = AttemptFailure::Validation("max_tokens exceeds context window".into());
        assert_eq!(classify(&failure), ErrorClass::ValidationError);
        assert!(!is_retryable(&failure, 0, 5, true));
    }

    #[test]
    fn test_retry_eligibility() {
        let full = terminal("context window full");
        assert!(is_retryable(&full, 0, 2, true));
        assert!(!is_retryable(&full, 1, 2, true));
        assert!(!is_retryable(&full, 0, 2, false));
        assert!(!is_retryable(&full, 0, 1, true));
        assert!(!is_retryable(&terminal("boom"), 0, 2, true));
    }

    #[tokio::test]
    async fn test_handle_compacts_then_retries() {
        let calls = AtomicUsize::new(0);
        let decision = handle(&terminal("context window full"), "agent-1", 0, 2, true, |session| {
            calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(session, "agent-1");
            async { Ok::<(), String>(()) }
        })
        .await;

        assert_eq!(decision, RetryDecision::Retry);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handle_last_attempt_does_not_compact() {
        let calls = AtomicUsize::new(0);
        let decision = handle(&terminal("context window full"), "agent-1", 1, 2, true, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<(), String>(()) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        match decision {
            RetryDecision::GiveUp(e) => assert!(e.message.starts_with(AGENT_ERROR_PREFIX)),
            other => panic!("expected give up, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handle_failed_compaction_surfaces_original() {
        let decision = handle(&terminal("context window full"), "agent-1", 0, 2, true, |_| async {
            Err::<(), _>("summarize endpoint unavailable")
        })
        .await;

        match decision {
            RetryDecision::GiveUp(e) => {
                assert_eq!(e.message, "Letta agent error: context window full");
                assert!(!e.message.contains("summarize"));
            }
            other => panic!("expected give up, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handle_validation_never_compacts() {
        let calls = AtomicUsize::new(0);
        let failure = AttemptFailure::Validation("Unknown model: x".into());
        let decision = handle(&failure, "agent-1", 0, 10, true, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<(), String>(()) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(
            decision,
            RetryDecision::GiveUp(e) if e.error_type == "invalid_request_error"
        ));
    }
}
