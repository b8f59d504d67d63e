//! Application state and configuration for the librarian gateway.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::admission::{AdmissionConfig, AdmissionController, AdmissionMetrics};
use crate::lease::{LeaseManager, SessionLocks};
use crate::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::registry::{ModelRegistry, SessionNames};
use crate::security::{Perimeter, SecurityConfig};
use crate::upstream::{AgentRuntime, UpstreamMessage};

/// A setting that is missing or does not parse
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Parse `key` with `FromStr`, or return `default` when unset or blank.
pub(crate) fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().map_err(|_| ConfigError::Invalid { key, value: raw })
        }
        _ => Ok(default),
    }
}

/// Boolean flag: 1/true/yes/on or 0/false/no/off, case-insensitive.
pub(crate) fn flag_or<F>(lookup: &F, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "" => Ok(default),
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid { key, value: raw }),
    }
}

/// Comma-separated list; blanks are skipped.
pub(crate) fn list_or_empty<F>(lookup: &F, key: &str) -> Vec<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Non-empty string setting
fn string_opt<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to bind
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Agent runtime base URL
    pub letta_base_url: String,

    /// Bearer token for the agent runtime
    pub letta_api_key: Option<String>,

    /// Timeout for non-streaming runtime calls
    pub letta_timeout: Duration,

    /// Idle age after which unused session locks are evicted
    pub lock_idle: Duration,

    /// Default tracing filter level
    pub log_level: String,

    pub sessions: SessionNames,
    pub admission: AdmissionConfig,
    pub orchestrator: OrchestratorConfig,
    pub security: SecurityConfig,
}

impl ProxyConfig {
    /// Create config from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|key: &str| std::env::var(key).ok())
    }

    /// Create config from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let letta_base_url =
            string_opt(lookup, "LETTA_BASE_URL").ok_or(ConfigError::Missing("LETTA_BASE_URL"))?;

        Ok(Self {
            host: string_opt(lookup, "LIBRARIAN_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parse_or(lookup, "LIBRARIAN_PORT", 8000)?,
            letta_base_url,
            letta_api_key: string_opt(lookup, "LETTA_API_KEY"),
            letta_timeout: Duration::from_secs(parse_or(lookup, "LETTA_TIMEOUT", 30)?),
            lock_idle: Duration::from_secs(parse_or(lookup, "LIBRARIAN_LOCK_IDLE_SECS", 7200)?),
            log_level: string_opt(lookup, "LIBRARIAN_LOG_LEVEL")
                .unwrap_or_else(|| "info".to_string()),
            sessions: SessionNames::from_lookup(lookup),
            admission: AdmissionConfig::from_lookup(lookup)?,
            orchestrator: OrchestratorConfig::from_lookup(lookup)?,
            security: SecurityConfig::from_lookup(lookup)?,
        })
    }

    /// Config pointing at `base_url` with every other setting at its default
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            letta_base_url: base_url.into(),
            letta_api_key: None,
            letta_timeout: Duration::from_secs(30),
            lock_idle: Duration::from_secs(7200),
            log_level: "info".to_string(),
            sessions: SessionNames::default(),
            admission: AdmissionConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            security: SecurityConfig::default(),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Application state shared across all handlers
pub struct AppState {
    /// Agent runtime client
    pub runtime: Arc<dyn AgentRuntime>,

    /// Runs requests against the runtime
    pub orchestrator: Orchestrator,

    /// Concurrency budget in front of the orchestrator
    pub admission: AdmissionController<Vec<UpstreamMessage>>,

    /// Model name to session mapping
    pub registry: ModelRegistry,

    /// IP filter, API key and rate limiter
    pub perimeter: Perimeter,

    /// Configuration
    pub config: ProxyConfig,
}

impl AppState {
    /// Create new application state
    pub fn new(config: ProxyConfig, runtime: Arc<dyn AgentRuntime>) -> Self {
        let leases = LeaseManager::new(Arc::clone(&runtime), SessionLocks::new());
        Self {
            orchestrator: Orchestrator::new(
                Arc::clone(&runtime),
                leases,
                config.orchestrator.clone(),
            ),
            admission: AdmissionController::new(
                config.admission.clone(),
                Arc::new(AdmissionMetrics::new()),
            ),
            registry: ModelRegistry::from_names(&config.sessions),
            perimeter: Perimeter::new(config.security.clone()),
            runtime,
            config,
        }
    }
}
