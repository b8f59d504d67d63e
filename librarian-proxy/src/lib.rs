//! Librarian Proxy Library
//!
//! OpenAI-compatible gateway in front of a stateful, session-oriented agent
//! runtime. Each public model name is backed by one long-lived agent
//! session; the gateway applies per-request generation settings for the
//! duration of a call, recovers from full context windows by compacting
//! and retrying, and bounds upstream concurrency with a queue.

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

pub mod admission;
pub mod error;
pub mod lease;
pub mod metrics;
pub mod orchestrator;
pub mod recovery;
pub mod registry;
pub mod routes;
pub mod security;
pub mod state;
pub mod stream;
pub mod tokens;
pub mod tools;
pub mod translate;
pub mod types;
pub mod upstream;

pub use state::{AppState, ProxyConfig};

use lease::DEFAULT_CLEANUP_INTERVAL;
use upstream::LettaClient;

/// Initialize Prometheus metrics registry.
/// Should be called once before starting the server.
pub fn init_metrics() {
    if let Err(e) = metrics::register_metrics() {
        warn!("Failed to register Prometheus metrics: {}", e);
    }
}

/// Build the HTTP router over shared state.
///
/// The security perimeter runs before every handler except `/health`.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(routes::health))
        .route("/metrics", get(routes::metrics))
        .route("/metrics/prometheus", get(routes::metrics_prometheus))
        // OpenAI-compatible endpoints
        .route("/v1/models", get(routes::list_models))
        .route("/v1/models/:model", get(routes::get_model))
        .route("/v1/chat/completions", post(routes::chat_completions))
        .route("/v1/completions", post(routes::completions))
        // Middleware
        .layer(middleware::from_fn_with_state(state.clone(), security::enforce))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the gateway.
///
/// Starts the HTTP server and blocks until it's shut down. The runtime does
/// not have to be reachable at startup; model names that cannot be resolved
/// to session ids are used as ids unchanged.
///
/// # Example
/// ```no_run
/// use librarian_proxy::{run_server, ProxyConfig};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = ProxyConfig::with_base_url("http://localhost:8283");
///     run_server(config).await
/// }
/// ```
pub async fn run_server(config: ProxyConfig) -> anyhow::Result<()> {
    init_metrics();
    metrics::MAX_CONCURRENT_REQUESTS.set(config.admission.max_concurrent as f64);

    info!(
        letta_url = %config.letta_base_url,
        max_concurrent = config.admission.max_concurrent,
        "Starting Librarian Proxy v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = LettaClient::new(
        config.letta_base_url.clone(),
        config.letta_api_key.clone(),
        config.letta_timeout,
    )?;

    match client.health_check().await {
        Ok(()) => {
            metrics::set_backend_healthy(true);
            info!("Connected to Letta at {}", config.letta_base_url);
        }
        Err(e) => {
            metrics::set_backend_healthy(false);
            warn!(
                "Could not connect to Letta at {}: {}. \
                 Proxy will start anyway and retry on requests.",
                config.letta_base_url, e
            );
        }
    }

    let addr = config.bind_address();
    let lock_idle = config.lock_idle;

    let mut state = AppState::new(config, Arc::new(client));
    let resolved = state.registry.resolve_names(state.runtime.as_ref()).await;
    info!(resolved, models = state.registry.list().len(), "Model registry ready");

    state
        .orchestrator
        .leases()
        .locks()
        .clone()
        .spawn_cleanup_task(DEFAULT_CLEANUP_INTERVAL, lock_idle);

    let state = Arc::new(state);
    if state.perimeter.is_enabled() {
        info!(
            ip_filtering = state.config.security.enable_ip_filtering,
            api_key = state.config.security.api_key_required,
            rate_limit = state.config.security.rate_limit_enabled,
            "Security perimeter enabled"
        );
    }

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Librarian Proxy listening on http://{}", addr);
    info!("OpenAI API: http://{}/v1/chat/completions", addr);
    info!("Health:     http://{}/health", addr);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}
