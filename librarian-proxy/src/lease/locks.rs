//! Per-session lock table.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Default interval between cleanup runs (10 minutes).
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(600);

/// Maps session id to (lock, last_access_time).
type LockStorage = DashMap<String, (Arc<Mutex<()>>, Instant)>;

/// Per-session async mutex with idle eviction.
///
/// Different sessions lock independently while operations on the same
/// session are serialized. Insertion is atomic through the map's entry API,
/// so two first-time requests for one session always share a lock.
#[derive(Clone, Default)]
pub struct SessionLocks {
    locks: Arc<LockStorage>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the lock for a session, refreshing its access time.
    pub fn get(&self, session_id: &str) -> Arc<Mutex<()>> {
        let now = Instant::now();
        self.locks
            .entry(session_id.to_string())
            .and_modify(|(_, last_access)| *last_access = now)
            .or_insert_with(|| (Arc::new(Mutex::new(())), now))
            .0
            .clone()
    }

    /// Remove entries idle for longer than `max_age` that nobody references.
    ///
    /// The reference check and the removal happen under the same shard lock,
    /// so a concurrent [`SessionLocks::get`] either keeps the entry alive or
    /// creates a fresh one after it is gone.
    pub fn cleanup_stale(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let candidates: Vec<String> = self
            .locks
            .iter()
            .filter(|entry| now.duration_since(entry.value().1) > max_age)
            .map(|entry| entry.key().clone())
            .collect();

        candidates
            .into_iter()
            .filter(|key| {
                self.locks
                    .remove_if(key, |_, (lock, last_access)| {
                        Arc::strong_count(lock) == 1 && now.duration_since(*last_access) > max_age
                    })
                    .is_some()
            })
            .count()
    }

    /// Spawn a background task that periodically evicts idle entries.
    pub fn spawn_cleanup_task(self, interval: Duration, max_age: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = self.cleanup_stale(max_age);
                if removed > 0 {
                    debug!(removed, remaining = self.len(), "Evicted idle session locks");
                }
            }
        });
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
