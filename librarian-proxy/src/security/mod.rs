//! Optional perimeter in front of every route except `/health`.
//!
//! Checks run in order: IP filter, API key, rate limit. Each is off unless
//! enabled. Nothing here shares state with request processing.

mod rate_limit;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{info, warn};

pub use rate_limit::RateLimiter;

use crate::metrics;
use crate::recovery::FormattedError;
use crate::state::{flag_or, list_or_empty, parse_or, AppState, ConfigError};

/// Paths that skip every check
const OPEN_PATHS: &[&str] = &["/health"];

/// Perimeter settings
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub enable_ip_filtering: bool,
    pub allowed_ips: Vec<String>,
    pub blocked_ips: Vec<String>,
    pub api_key_required: bool,
    pub api_key: Option<String>,
    pub rate_limit_enabled: bool,
    pub rate_limit_requests: usize,
    pub rate_limit_window: Duration,
    pub log_security_events: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enable_ip_filtering: false,
            allowed_ips: Vec::new(),
            blocked_ips: Vec::new(),
            api_key_required: false,
            api_key: None,
            rate_limit_enabled: false,
            rate_limit_requests: 100,
            rate_limit_window: Duration::from_secs(60),
            log_security_events: true,
        }
    }
}

impl SecurityConfig {
    pub fn from_lookup<F>(lookup: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Ok(Self {
            enable_ip_filtering: flag_or(lookup, "LIBRARIAN_ENABLE_IP_FILTERING", false)?,
            allowed_ips: list_or_empty(lookup, "LIBRARIAN_ALLOWED_IPS"),
            blocked_ips: list_or_empty(lookup, "LIBRARIAN_BLOCKED_IPS"),
            api_key_required: flag_or(lookup, "LIBRARIAN_API_KEY_REQUIRED", false)?,
            api_key: lookup("LIBRARIAN_API_KEY").filter(|k| !k.is_empty()),
            rate_limit_enabled: flag_or(lookup, "LIBRARIAN_RATE_LIMIT_ENABLED", false)?,
            rate_limit_requests: parse_or(
                lookup,
                "LIBRARIAN_RATE_LIMIT_REQUESTS",
                defaults.rate_limit_requests,
            )?,
            rate_limit_window: Duration::from_secs(parse_or(
                lookup,
                "LIBRARIAN_RATE_LIMIT_WINDOW",
                60,
            )?),
            log_security_events: flag_or(lookup, "LIBRARIAN_LOG_SECURITY_EVENTS", true)?,
        })
    }
}

/// Why a request was turned away
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    IpFiltered(String),
    InvalidApiKey(&'static str),
    RateLimited { retry_after: u64 },
}

impl Rejection {
    fn metric_label(&self) -> &'static str {
        match self {
            Rejection::IpFiltered(_) => "ip_filtered",
            Rejection::InvalidApiKey(_) => "invalid_api_key",
            Rejection::RateLimited { .. } => "rate_limited",
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let (status, error_type, message, code) = match &self {
            Rejection::IpFiltered(_) => {
                (StatusCode::FORBIDDEN, "forbidden_error", "IP address not allowed", "ip_filtered")
            }
            Rejection::InvalidApiKey(_) => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "Invalid or missing API key",
                "invalid_api_key",
            ),
            Rejection::RateLimited { .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limit_error",
                "Rate limit exceeded",
                "rate_limit_exceeded",
            ),
        };
        let mut response =
            FormattedError { status, error_type, message: message.to_string(), code: Some(code) }
                .into_response();
        if let Rejection::RateLimited { retry_after } = self {
            response.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        }
        response
    }
}

/// The configured checks and the limiter state they need
pub struct Perimeter {
    config: SecurityConfig,
    allowed: HashSet<String>,
    blocked: HashSet<String>,
    limiter: Option<RateLimiter>,
}

impl Perimeter {
    pub fn new(config: SecurityConfig) -> Self {
        if config.api_key_required && config.api_key.is_none() {
            warn!(
                "API key authentication is required but LIBRARIAN_API_KEY is not set; \
                 all requests will be rejected"
            );
        }
        let limiter = config
            .rate_limit_enabled
            .then(|| RateLimiter::new(config.rate_limit_requests, config.rate_limit_window));
        info!(
            ip_filtering = config.enable_ip_filtering,
            api_key_required = config.api_key_required,
            rate_limiting = config.rate_limit_enabled,
            "Security perimeter initialized"
        );
        Self {
            allowed: config.allowed_ips.iter().cloned().collect(),
            blocked: config.blocked_ips.iter().cloned().collect(),
            limiter,
            config,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enable_ip_filtering || self.config.api_key_required || self.limiter.is_some()
    }

    /// Allow list wins when set; the block list applies either way.
    fn check_ip(&self, ip: &str) -> Result<(), Rejection> {
        if !self.config.enable_ip_filtering {
            return Ok(());
        }
        if !self.allowed.is_empty() && !self.allowed.contains(ip) {
            return Err(Rejection::IpFiltered(format!("IP {} not in allowed list", ip)));
        }
        if self.blocked.contains(ip) {
            return Err(Rejection::IpFiltered(format!("IP {} is in blocked list", ip)));
        }
        Ok(())
    }

    fn check_api_key(&self, headers: &HeaderMap) -> Result<(), Rejection> {
        if !self.config.api_key_required {
            return Ok(());
        }
        let Some(expected) = &self.config.api_key else {
            return Err(Rejection::InvalidApiKey("API key required but not configured"));
        };
        let Some(value) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
            return Err(Rejection::InvalidApiKey("Missing Authorization header"));
        };
        let Some((scheme, key)) = value.trim().split_once(' ') else {
            return Err(Rejection::InvalidApiKey("Invalid Authorization header format"));
        };
        if !scheme.eq_ignore_ascii_case("bearer") {
            return Err(Rejection::InvalidApiKey("Authorization scheme must be 'Bearer'"));
        }
        if key != expected {
            return Err(Rejection::InvalidApiKey("Invalid API key"));
        }
        Ok(())
    }

    /// Run every enabled check for a request from `ip`.
    pub fn check(&self, ip: &str, headers: &HeaderMap) -> Result<(), Rejection> {
        self.check_ip(ip)?;
        self.check_api_key(headers)?;
        if let Some(limiter) = &self.limiter {
            limiter.check(ip).map_err(|retry_after| Rejection::RateLimited { retry_after })?;
        }
        Ok(())
    }
}

/// Client address: first `X-Forwarded-For` entry, then `X-Real-IP`, then the socket.
pub fn client_ip(request: &Request) -> String {
    let headers = request.headers();
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = real_ip {
        return ip.to_string();
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Middleware applying the perimeter to every route outside [`OPEN_PATHS`].
pub async fn enforce(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    if OPEN_PATHS.contains(&request.uri().path()) || !state.perimeter.is_enabled() {
        return next.run(request).await;
    }

    let ip = client_ip(&request);
    let verdict = state.perimeter.check(&ip, request.headers());
    match verdict {
        Ok(()) => next.run(request).await,
        Err(rejection) => {
            metrics::record_security_rejection(rejection.metric_label());
            if state.perimeter.config.log_security_events {
                warn!(
                    client_ip = %ip,
                    rejection = ?rejection,
                    path = %request.uri().path(),
                    "Request rejected by security perimeter"
                );
            }
            rejection.into_response()
        }
    }
}
