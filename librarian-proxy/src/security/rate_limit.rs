//! Per-client sliding-window rate limiting.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, info};

/// How often idle clients are swept from the table
const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Sliding-window limiter keyed by client address.
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    requests: DashMap<String, VecDeque<Instant>>,
    last_cleanup: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        info!(max_requests, window_secs = window.as_secs(), "Rate limiter initialized");
        Self {
            max_requests,
            window,
            requests: DashMap::new(),
            last_cleanup: Mutex::new(Instant::now()),
        }
    }

    /// Record a request from `client`.
    ///
    /// Returns `Err(retry_after_secs)` when the client already made
    /// `max_requests` within the window; rejected requests are not recorded.
    pub fn check(&self, client: &str) -> Result<(), u64> {
        self.check_at(client, Instant::now())
    }

    fn check_at(&self, client: &str, now: Instant) -> Result<(), u64> {
        self.maybe_cleanup(now);

        let mut history = self.requests.entry(client.to_string()).or_default();
        while history.front().is_some_and(|t| now.duration_since(*t) >= self.window) {
            history.pop_front();
        }

        if history.len() >= self.max_requests {
            let retry_after = match history.front() {
                Some(oldest) => {
                    self.window.saturating_sub(now.duration_since(*oldest)).as_secs() + 1
                }
                None => self.window.as_secs(),
            };
            return Err(retry_after);
        }

        history.push_back(now);
        Ok(())
    }

    fn maybe_cleanup(&self, now: Instant) {
        {
            let mut last = self.last_cleanup.lock().unwrap_or_else(PoisonError::into_inner);
            if now.duration_since(*last) < CLEANUP_INTERVAL {
                return;
            }
            *last = now;
        }

        let before = self.requests.len();
        self.requests.retain(|_, history| {
            history.back().is_some_and(|t| now.duration_since(*t) < self.window)
        });
        let removed = before.saturating_sub(self.requests.len());
        if removed > 0 {
            debug!(removed, "Rate limiter cleanup removed inactive clients");
        }
    }

    /// Number of clients currently tracked
    pub fn tracked_clients(&self) -> usize {
        self.requests.len()
    }
}
