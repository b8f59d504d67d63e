//! Admission control for upstream sessions.
//!
//! Sessions are expensive, stateful resources, so the number of requests
//! processing against the runtime at once is bounded.
//!
//! ```text
//!   incoming requests
//!          │
//!   ┌──────▼──────┐
//!   │   pending   │ ← FIFO, enqueue order
//!   └──────┬──────┘
//!          │
//!   ┌──────▼──────┐
//!   │  semaphore  │ ← max_concurrent slots, optional queue timeout
//!   └──────┬──────┘
//!          │
//!   ┌──────▼──────┐
//!   │   active    │ ← per-session load feeds the replica-intent signal
//!   └─────────────┘
//! ```
//!
//! There is no priority and no reordering. Completion order is whatever the
//! upstream calls produce.

mod config;
mod controller;
mod metrics;

pub use config::AdmissionConfig;
pub use controller::{
    AdmissionController, AdmissionError, EntryId, EntryReport, EntryStatus, LoadStats, QueueEntry,
};
pub use metrics::{AdmissionMetrics, MetricsSnapshot};
