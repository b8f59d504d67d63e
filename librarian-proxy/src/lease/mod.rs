//! Session configuration leases.
//!
//! A request that overrides generation parameters (temperature, output cap)
//! must change the session's configuration for the duration of its upstream
//! calls and put it back afterwards. [`LeaseManager::acquire`] takes the
//! session's lock, snapshots the configuration and pushes the overridden
//! copy; [`ConfigLease::release`] pushes the snapshot back and unlocks.
//!
//! Requests without overrides get a no-op lease: no lock, no RPC.
//!
//! Everything on this path fails open. If the configuration cannot be read
//! or written the request proceeds against the session's existing
//! configuration, and a failed restore is logged without failing the
//! request.

mod locks;

use std::future::Future;
use std::sync::Arc;

use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

pub use locks::{SessionLocks, DEFAULT_CLEANUP_INTERVAL};

use crate::metrics;
use crate::upstream::{AgentRuntime, ConfigOverrides, GenerationConfig};

/// Hands out configuration leases against one runtime.
#[derive(Clone)]
pub struct LeaseManager {
    runtime: Arc<dyn AgentRuntime>,
    locks: SessionLocks,
}

impl LeaseManager {
    pub fn new(runtime: Arc<dyn AgentRuntime>, locks: SessionLocks) -> Self {
        Self { runtime, locks }
    }

    pub fn locks(&self) -> &SessionLocks {
        &self.locks
    }

    /// Open a lease on `session_id` with the given overrides.
    ///
    /// Blocks while another lease on the same session is open.
    pub async fn acquire(&self, session_id: &str, overrides: ConfigOverrides) -> ConfigLease {
        if overrides.is_empty() {
            return ConfigLease::noop(session_id);
        }

        let guard = self.locks.get(session_id).lock_owned().await;

        let original = match self.runtime.retrieve_config(session_id).await {
            Ok(Some(config)) => config,
            Ok(None) => {
                warn!(session_id, "Session has no generation config, skipping overrides");
                return ConfigLease::noop(session_id);
            }
            Err(e) => {
                warn!(session_id, error = %e, "Failed to read session config, skipping overrides");
                return ConfigLease::noop(session_id);
            }
        };

        let updated = overrides.apply(&original);
        if let Err(e) = self.runtime.modify_config(session_id, &updated).await {
            warn!(session_id, error = %e, "Failed to apply overrides, using existing config");
            return ConfigLease::noop(session_id);
        }

        info!(
            session_id,
            temperature = ?overrides.temperature,
            max_tokens = ?overrides.max_tokens,
            "Applied session config overrides"
        );

        ConfigLease {
            session_id: session_id.to_string(),
            held: Some(HeldLease { guard, original, runtime: Arc::clone(&self.runtime) }),
        }
    }

    /// Run `work` under a lease and release it afterwards, whatever `work`
    /// returns.
    pub async fn with_lease<F, Fut, T>(
        &self,
        session_id: &str,
        overrides: ConfigOverrides,
        work: F,
    ) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lease = self.acquire(session_id, overrides).await;
        let output = work().await;
        lease.release().await;
        output
    }
}

/// An open (or no-op) configuration lease.
///
/// Dropping a held lease without calling [`ConfigLease::release`] (a
/// cancelled request, a panic in the caller) schedules the restore on the
/// current runtime; the session stays locked until it has run.
#[must_use = "a held lease keeps the session locked until released"]
pub struct ConfigLease {
    session_id: String,
    held: Option<HeldLease>,
}

struct HeldLease {
    guard: OwnedMutexGuard<()>,
    original: GenerationConfig,
    runtime: Arc<dyn AgentRuntime>,
}

impl HeldLease {
    async fn restore(self, session_id: &str) {
        match self.runtime.modify_config(session_id, &self.original).await {
            Ok(()) => debug!(session_id, "Restored session config"),
            Err(e) => {
                metrics::record_lease_restore_failure();
                error!(session_id, error = %e, "Failed to restore session config");
            }
        }
        drop(self.guard);
    }
}

impl ConfigLease {
    fn noop(session_id: &str) -> Self {
        Self { session_id: session_id.to_string(), held: None }
    }

    /// True when overrides are applied and the session lock is held
    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }

    /// Restore the snapshot and unlock the session.
    pub async fn release(mut self) {
        if let Some(held) = self.held.take() {
            held.restore(&self.session_id).await;
        }
    }
}

impl Drop for ConfigLease {
    fn drop(&mut self) {
        let Some(held) = self.held.take() else {
            return;
        };
        let session_id = std::mem::take(&mut self.session_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(
                    session_id = %session_id,
                    "Lease dropped without release, restoring in background"
                );
                handle.spawn(async move { held.restore(&session_id).await });
            }
            Err(_) => {
                metrics::record_lease_restore_failure();
                error!(
                    session_id = %session_id,
                    "Lease dropped outside a runtime, config not restored"
                );
            }
        }
    }
}
