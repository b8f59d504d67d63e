//! Configuration for the admission controller.

use std::time::Duration;

use crate::state::{flag_or, parse_or, ConfigError};

/// Configuration for the admission controller
#[derive(Debug, Clone, serde::Serialize)]
pub struct AdmissionConfig {
    /// Maximum number of requests processing at once
    pub max_concurrent: usize,

    /// Maximum time a request may wait for a slot; `None` waits forever
    #[serde(serialize_with = "serialize_secs")]
    pub queue_timeout: Option<Duration>,

    /// Active request count at which the overload signal starts looking
    /// for hot sessions
    pub duplication_threshold: usize,

    /// Record replica intents for hot sessions
    pub enable_auto_duplication: bool,

    /// Cap on replica intents recorded per session
    pub max_replicas_per_session: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            queue_timeout: Some(Duration::from_secs(300)), // 5 minutes
            duplication_threshold: 8,
            enable_auto_duplication: true,
            max_replicas_per_session: 3,
        }
    }
}

impl AdmissionConfig {
    /// Read settings through `lookup`, falling back to defaults.
    pub fn from_lookup<F>(lookup: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let max_concurrent = parse_or(lookup, "LIBRARIAN_MAX_CONCURRENT", defaults.max_concurrent)?;
        if max_concurrent == 0 {
            return Err(ConfigError::Invalid {
                key: "LIBRARIAN_MAX_CONCURRENT",
                value: "0".to_string(),
            });
        }

        let queue_timeout_secs: u64 = parse_or(lookup, "LIBRARIAN_QUEUE_TIMEOUT", 300)?;

        Ok(Self {
            max_concurrent,
            queue_timeout: (queue_timeout_secs > 0)
                .then(|| Duration::from_secs(queue_timeout_secs)),
            duplication_threshold: parse_or(
                lookup,
                "LIBRARIAN_DUPLICATION_THRESHOLD",
                defaults.duplication_threshold,
            )?,
            enable_auto_duplication: flag_or(
                lookup,
                "LIBRARIAN_ENABLE_AUTO_DUPLICATION",
                defaults.enable_auto_duplication,
            )?,
            max_replicas_per_session: parse_or(
                lookup,
                "LIBRARIAN_MAX_CLONES_PER_AGENT",
                defaults.max_replicas_per_session,
            )?,
        })
    }
}

fn serialize_secs<S: serde::Serializer>(
    value: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(d) => serializer.serialize_u64(d.as_secs()),
        None => serializer.serialize_none(),
    }
}
