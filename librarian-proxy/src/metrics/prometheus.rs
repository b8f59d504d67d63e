//! Prometheus metrics for the Librarian gateway
//!
//! Exposes metrics in Prometheus format on `/metrics/prometheus`.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    /// Global Prometheus registry for gateway metrics
    pub static ref REGISTRY: Registry = Registry::new();

    // ============== Request Metrics ==============

    /// Completed requests by model and outcome
    pub static ref REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("requests_total", "Total number of chat completion requests")
            .namespace("librarian"),
        &["model", "status"]
    ).expect("metric can be created");

    /// Request duration histogram with model label
    pub static ref REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "request_duration_seconds",
            "Request duration in seconds"
        )
        .namespace("librarian")
        .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
        &["model"]
    ).expect("metric can be created");

    /// Estimated completion tokens returned to callers
    pub static ref COMPLETION_TOKENS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("completion_tokens_total", "Total estimated completion tokens")
            .namespace("librarian"),
        &["model"]
    ).expect("metric can be created");

    // ============== Admission Metrics ==============

    /// Current queue size gauge
    pub static ref QUEUE_SIZE: Gauge = Gauge::with_opts(
        Opts::new("queue_size", "Current number of requests waiting for admission")
            .namespace("librarian")
    ).expect("metric can be created");

    /// Queue wait time histogram
    pub static ref QUEUE_WAIT_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "queue_wait_seconds",
            "Time spent waiting for an admission slot"
        )
        .namespace("librarian")
        .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0])
    ).expect("metric can be created");

    /// Active requests gauge (currently admitted)
    pub static ref ACTIVE_REQUESTS: Gauge = Gauge::with_opts(
        Opts::new("active_requests", "Number of requests currently being processed")
            .namespace("librarian")
    ).expect("metric can be created");

    /// Admission budget
    pub static ref MAX_CONCURRENT_REQUESTS: Gauge = Gauge::with_opts(
        Opts::new("max_concurrent_requests", "Maximum concurrent requests allowed")
            .namespace("librarian")
    ).expect("metric can be created");

    /// Requests that gave up waiting for a slot
    pub static ref QUEUE_TIMEOUTS_TOTAL: Counter = Counter::with_opts(
        Opts::new("queue_timeouts_total", "Total requests that timed out waiting for admission")
            .namespace("librarian")
    ).expect("metric can be created");

    /// Replica intents recorded by the overload signal
    pub static ref REPLICA_INTENTS_TOTAL: Counter = Counter::with_opts(
        Opts::new("replica_intents_total", "Total session replica intents recorded")
            .namespace("librarian")
    ).expect("metric can be created");

    // ============== Recovery Metrics ==============

    /// Compaction calls by outcome
    pub static ref COMPACTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("compactions_total", "Total session compactions attempted")
            .namespace("librarian"),
        &["outcome"]
    ).expect("metric can be created");

    /// Upstream calls retried after recovery
    pub static ref RETRIES_TOTAL: Counter = Counter::with_opts(
        Opts::new("retries_total", "Total upstream calls retried")
            .namespace("librarian")
    ).expect("metric can be created");

    /// Session configurations that could not be restored
    pub static ref LEASE_RESTORE_FAILURES_TOTAL: Counter = Counter::with_opts(
        Opts::new("lease_restore_failures_total", "Total failed session configuration restores")
            .namespace("librarian")
    ).expect("metric can be created");

    // ============== Perimeter Metrics ==============

    /// Requests rejected by the security layer
    pub static ref SECURITY_REJECTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("security_rejections_total", "Total requests rejected by the security layer")
            .namespace("librarian"),
        &["reason"]
    ).expect("metric can be created");

    // ============== Backend Metrics ==============

    /// Agent runtime health status (1 = healthy, 0 = unhealthy)
    pub static ref BACKEND_HEALTHY: Gauge = Gauge::with_opts(
        Opts::new("backend_healthy", "Backend health status (1=healthy, 0=unhealthy)")
            .namespace("librarian")
    ).expect("metric can be created");
}

/// Register all metrics with the global registry.
/// Should be called once at startup.
pub fn register_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REQUEST_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(COMPLETION_TOKENS_TOTAL.clone()))?;

    REGISTRY.register(Box::new(QUEUE_SIZE.clone()))?;
    REGISTRY.register(Box::new(QUEUE_WAIT_SECONDS.clone()))?;
    REGISTRY.register(Box::new(ACTIVE_REQUESTS.clone()))?;
    REGISTRY.register(Box::new(MAX_CONCURRENT_REQUESTS.clone()))?;
    REGISTRY.register(Box::new(QUEUE_TIMEOUTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REPLICA_INTENTS_TOTAL.clone()))?;

    REGISTRY.register(Box::new(COMPACTIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RETRIES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(LEASE_RESTORE_FAILURES_TOTAL.clone()))?;

    REGISTRY.register(Box::new(SECURITY_REJECTIONS_TOTAL.clone()))?;

    REGISTRY.register(Box::new(BACKEND_HEALTHY.clone()))?;

    Ok(())
}

/// Encode all metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_else(|e| format!("# Error encoding metrics: {}", e))
}

/// Tracks one chat completion from admission to its final outcome.
/// A timer dropped without [`RequestTimer::finish`] counts as `cancelled`.
pub struct RequestTimer {
    model: String,
    start: std::time::Instant,
    finished: bool,
}

impl RequestTimer {
    pub fn new(model: &str) -> Self {
        Self { model: model.to_string(), start: std::time::Instant::now(), finished: false }
    }

    /// Record a successful completion.
    pub fn record_success(mut self, completion_tokens: u64) {
        COMPLETION_TOKENS_TOTAL
            .with_label_values(&[&self.model])
            .inc_by(completion_tokens as f64);
        self.record("success");
    }

    /// Record a request that ended in a formatted error.
    pub fn record_failure(mut self) {
        self.record("error");
    }

    fn record(&mut self, status: &str) {
        self.finished = true;
        REQUEST_DURATION_SECONDS
            .with_label_values(&[&self.model])
            .observe(self.start.elapsed().as_secs_f64());
        REQUESTS_TOTAL.with_label_values(&[&self.model, status]).inc();
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        if !self.finished {
            self.record("cancelled");
        }
    }
}

/// Record queue wait time.
pub fn record_queue_wait(wait_secs: f64) {
    QUEUE_WAIT_SECONDS.observe(wait_secs);
}

/// Update queue size gauge.
pub fn set_queue_size(size: usize) {
    QUEUE_SIZE.set(size as f64);
}

/// Update active requests gauge.
pub fn set_active_requests(active: usize) {
    ACTIVE_REQUESTS.set(active as f64);
}

/// Record an admission timeout.
pub fn record_queue_timeout() {
    QUEUE_TIMEOUTS_TOTAL.inc();
}

/// Record a replica intent.
pub fn record_replica_intent() {
    REPLICA_INTENTS_TOTAL.inc();
}

/// Record a compaction attempt (`succeeded` or `failed`).
pub fn record_compaction(succeeded: bool) {
    let outcome = if succeeded { "succeeded" } else { "failed" };
    COMPACTIONS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record an upstream retry.
pub fn record_retry() {
    RETRIES_TOTAL.inc();
}

/// Record a failed configuration restore.
pub fn record_lease_restore_failure() {
    LEASE_RESTORE_FAILURES_TOTAL.inc();
}

/// Record a perimeter rejection.
pub fn record_security_rejection(reason: &str) {
    SECURITY_REJECTIONS_TOTAL.with_label_values(&[reason]).inc();
}

/// Set backend health status.
pub fn set_backend_healthy(healthy: bool) {
    BACKEND_HEALTHY.set(if healthy { 1.0 } else { 0.0 });
}
