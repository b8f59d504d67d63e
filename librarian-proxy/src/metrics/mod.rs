//! Metrics module for the Librarian gateway
//!
//! Provides Prometheus metrics for monitoring and observability.

pub mod prometheus;

pub use prometheus::{
    encode_metrics, record_compaction, record_lease_restore_failure, record_queue_timeout,
    record_queue_wait, record_replica_intent, record_retry, record_security_rejection,
    register_metrics, set_active_requests, set_backend_healthy, set_queue_size, RequestTimer,
    MAX_CONCURRENT_REQUESTS,
};
