//! FIFO admission under a fixed concurrency budget.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use super::config::AdmissionConfig;
use super::metrics::AdmissionMetrics;
use crate::metrics;

/// Identifier handed out by [`AdmissionController::enqueue`]. Never reused.
pub type EntryId = u64;

/// Error types for admission
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("Timed out after {0:?} waiting for a processing slot")]
    QueueTimeout(Duration),

    #[error("Request {0} is not queued")]
    UnknownEntry(EntryId),

    #[error("Admission controller is shut down")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// A request known to the controller.
#[derive(Debug)]
pub struct QueueEntry<P> {
    pub id: EntryId,
    pub session_id: String,
    pub payload: P,
    pub caller: Option<String>,
    /// Unix timestamp, for status reports
    pub enqueued_unix: i64,
    enqueued_at: Instant,
    pub status: EntryStatus,
}

/// Point-in-time view of one entry
#[derive(Debug, Clone, serde::Serialize)]
pub struct EntryReport {
    pub id: EntryId,
    pub session_id: String,
    pub status: EntryStatus,
    pub enqueued_at: i64,
    /// 0-based position among pending entries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
}

/// Live load figures
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct LoadStats {
    pub queue_size: usize,
    pub active_requests: usize,
    pub total_replicas: usize,
    pub max_concurrent: usize,
    pub available_permits: usize,
}

struct QueueState<P> {
    pending: VecDeque<QueueEntry<P>>,
    active: HashMap<EntryId, QueueEntry<P>>,
    /// session id -> recorded replica intents
    replicas: HashMap<String, Vec<String>>,
}

/// Gates how many requests process at once.
///
/// Entries wait in enqueue order; the semaphore is FIFO-fair, so slots are
/// handed out in the order callers started waiting. Queue bookkeeping sits
/// behind one short-lived lock that is never held across an await.
pub struct AdmissionController<P> {
    config: AdmissionConfig,
    state: Mutex<QueueState<P>>,
    semaphore: Arc<Semaphore>,
    metrics: Arc<AdmissionMetrics>,
    next_id: AtomicU64,
}

impl<P> AdmissionController<P> {
    pub fn new(config: AdmissionConfig, metrics: Arc<AdmissionMetrics>) -> Self {
        info!(
            max_concurrent = config.max_concurrent,
            duplication_threshold = config.duplication_threshold,
            auto_duplication = config.enable_auto_duplication,
            "Admission controller initialized"
        );
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                active: HashMap::new(),
                replicas: HashMap::new(),
            }),
            metrics,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    pub fn metrics(&self) -> &AdmissionMetrics {
        &self.metrics
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState<P>> {
        // Bookkeeping stays consistent across a panic in another holder
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a request to the pending queue.
    pub fn enqueue(&self, session_id: &str, payload: P, caller: Option<String>) -> EntryId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = QueueEntry {
            id,
            session_id: session_id.to_string(),
            payload,
            caller,
            enqueued_unix: chrono::Utc::now().timestamp(),
            enqueued_at: Instant::now(),
            status: EntryStatus::Pending,
        };

        let mut state = self.lock_state();
        state.pending.push_back(entry);
        let depth = state.pending.len();
        self.metrics.record_received(depth);
        metrics::set_queue_size(depth);
        debug!(id, session_id, queue_depth = depth, "Request enqueued");

        self.check_overload(&mut state);
        id
    }

    /// Record replica intents for sessions carrying too much of the active load.
    /// Advisory only; nothing waits on a replica.
    fn check_overload(&self, state: &mut QueueState<P>) {
        let threshold = self.config.duplication_threshold;
        if !self.config.enable_auto_duplication
            || threshold == 0
            || state.active.len() < threshold
        {
            return;
        }

        let mut loads: HashMap<&str, usize> = HashMap::new();
        for entry in state.active.values() {
            *loads.entry(entry.session_id.as_str()).or_default() += 1;
        }
        let per_session = (threshold / 2).max(1);
        let hot: Vec<String> = loads
            .into_iter()
            .filter(|(_, load)| *load >= per_session)
            .map(|(session, _)| session.to_string())
            .collect();

        for session_id in hot {
            let intents = state.replicas.entry(session_id.clone()).or_default();
            if intents.len() >= self.config.max_replicas_per_session {
                continue;
            }
            let replica = format!("{}_replica_{}", session_id, intents.len() + 1);
            info!(
                session_id = %session_id,
                replica = %replica,
                "Recorded replica intent for hot session"
            );
            intents.push(replica);
            self.metrics.record_replica_intent();
            metrics::record_replica_intent();
        }
    }

    /// Wait for a slot, then run `work` with entry `id` marked processing.
    ///
    /// The slot is released and the entry dropped from the active set on
    /// every exit path, including cancellation of the returned future.
    /// Errors from `work` are returned unchanged.
    pub async fn run_under_budget<F, Fut, T, E>(&self, id: EntryId, work: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<AdmissionError>,
    {
        if !self.lock_state().pending.iter().any(|e| e.id == id) {
            return Err(AdmissionError::UnknownEntry(id).into());
        }

        let waiting = PendingGuard { controller: self, id, armed: true };
        let permit = self.acquire_permit().await.map_err(|e| {
            if let AdmissionError::QueueTimeout(waited) = e {
                warn!(id, waited = ?waited, "Request timed out waiting for a slot");
                self.metrics.record_timeout();
                metrics::record_queue_timeout();
            }
            e
        })?;

        let slot = waiting.admit(permit).ok_or(AdmissionError::UnknownEntry(id))?;
        let result = work().await;
        slot.finish(result.is_ok());
        result
    }

    /// [`enqueue`](Self::enqueue) followed by [`run_under_budget`](Self::run_under_budget).
    pub async fn run_with_queue<F, Fut, T, E>(
        &self,
        session_id: &str,
        payload: P,
        caller: Option<String>,
        work: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<AdmissionError>,
    {
        let id = self.enqueue(session_id, payload, caller);
        self.run_under_budget(id, work).await
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit, AdmissionError> {
        let acquire = Arc::clone(&self.semaphore).acquire_owned();
        let permit = match self.config.queue_timeout {
            Some(limit) => tokio::time::timeout(limit, acquire)
                .await
                .map_err(|_| AdmissionError::QueueTimeout(limit))?,
            None => acquire.await,
        };
        permit.map_err(|_| AdmissionError::Closed)
    }

    /// Status of an entry that is still pending or processing.
    pub fn entry_status(&self, id: EntryId) -> Option<EntryReport> {
        let state = self.lock_state();
        if let Some(entry) = state.active.get(&id) {
            return Some(EntryReport {
                id,
                session_id: entry.session_id.clone(),
                status: entry.status,
                enqueued_at: entry.enqueued_unix,
                queue_position: None,
            });
        }
        state.pending.iter().enumerate().find(|(_, e)| e.id == id).map(|(position, entry)| {
            EntryReport {
                id,
                session_id: entry.session_id.clone(),
                status: entry.status,
                enqueued_at: entry.enqueued_unix,
                queue_position: Some(position),
            }
        })
    }

    pub fn load_stats(&self) -> LoadStats {
        let state = self.lock_state();
        LoadStats {
            queue_size: state.pending.len(),
            active_requests: state.active.len(),
            total_replicas: state.replicas.values().map(Vec::len).sum(),
            max_concurrent: self.config.max_concurrent,
            available_permits: self.semaphore.available_permits(),
        }
    }

    /// Replica intents recorded for a session
    pub fn replica_intents(&self, session_id: &str) -> Vec<String> {
        self.lock_state().replicas.get(session_id).cloned().unwrap_or_default()
    }

    /// Stop admitting; waiting and future requests fail with [`AdmissionError::Closed`].
    pub fn close(&self) {
        self.semaphore.close();
    }
}

/// Removes a still-pending entry if the wait is abandoned.
struct PendingGuard<'a, P> {
    controller: &'a AdmissionController<P>,
    id: EntryId,
    armed: bool,
}

impl<'a, P> PendingGuard<'a, P> {
    /// Move the entry from pending to active.
    fn admit(mut self, permit: OwnedSemaphorePermit) -> Option<ActiveSlot<'a, P>> {
        self.armed = false;
        let controller = self.controller;
        let mut state = controller.lock_state();

        let position = state.pending.iter().position(|e| e.id == self.id)?;
        let mut entry = state.pending.remove(position)?;
        entry.status = EntryStatus::Processing;
        let waited = entry.enqueued_at.elapsed();
        state.active.insert(self.id, entry);

        controller.metrics.record_admitted(waited);
        metrics::record_queue_wait(waited.as_secs_f64());
        metrics::set_queue_size(state.pending.len());
        metrics::set_active_requests(state.active.len());
        debug!(
            id = self.id,
            active = state.active.len(),
            wait_ms = waited.as_millis() as u64,
            "Request admitted"
        );

        Some(ActiveSlot {
            controller,
            id: self.id,
            admitted_at: Instant::now(),
            succeeded: false,
            _permit: permit,
        })
    }
}

impl<P> Drop for PendingGuard<'_, P> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.controller.lock_state();
        state.pending.retain(|e| e.id != self.id);
        metrics::set_queue_size(state.pending.len());
    }
}

/// An admitted entry holding one unit of the budget.
struct ActiveSlot<'a, P> {
    controller: &'a AdmissionController<P>,
    id: EntryId,
    admitted_at: Instant,
    succeeded: bool,
    _permit: OwnedSemaphorePermit,
}

impl<P> ActiveSlot<'_, P> {
    fn finish(mut self, succeeded: bool) {
        self.succeeded = succeeded;
    }
}

impl<P> Drop for ActiveSlot<'_, P> {
    fn drop(&mut self) {
        let mut state = self.controller.lock_state();
        if let Some(mut entry) = state.active.remove(&self.id) {
            entry.status =
                if self.succeeded { EntryStatus::Completed } else { EntryStatus::Failed };
            debug!(id = self.id, status = ?entry.status, "Request finished");
        }
        metrics::set_active_requests(state.active.len());
        self.controller.metrics.record_finished(self.succeeded, self.admitted_at.elapsed());
        // The permit is released after this, when `_permit` drops
    }
}
