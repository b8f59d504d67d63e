//! Public model names and the upstream sessions behind them.

use tracing::{info, warn};

use crate::types::openai::Model;
use crate::upstream::AgentRuntime;

/// Fixed creation timestamp reported for every model
const MODEL_CREATED: u64 = 1_700_000_000;

const MODEL_OWNER: &str = "librarian";

/// Session ids issued by the runtime carry this prefix; anything else is a name.
const SESSION_ID_PREFIX: &str = "agent-";

/// Session (id or name) configured for each public model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionNames {
    /// Session behind `gpt-3.5-turbo`
    pub worker: String,
    /// Session behind `gpt-4`
    pub persona: String,
    /// Session behind `gpt-4-turbo`
    pub persona_turbo: String,
}

impl Default for SessionNames {
    fn default() -> Self {
        Self {
            worker: "librarian-worker".to_string(),
            persona: "librarian-persona".to_string(),
            persona_turbo: "librarian-persona-turbo".to_string(),
        }
    }
}

impl SessionNames {
    pub fn from_lookup<F>(lookup: &F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let read = |key: &str, default: String| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or(default)
        };
        Self {
            worker: read("LIBRARIAN_WORKER_AGENT", defaults.worker),
            persona: read("LIBRARIAN_PERSONA_AGENT", defaults.persona),
            persona_turbo: read("LIBRARIAN_PERSONA_TURBO_AGENT", defaults.persona_turbo),
        }
    }
}

/// How the session behind a model behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelMode {
    /// Procedural, technical answers
    Worker,
    /// Expressive, interpretive answers
    Persona,
}

impl ModelMode {
    /// Instruction selecting this mode, appended to the request's system context
    pub fn instruction(self) -> &'static str {
        match self {
            ModelMode::Worker => {
                "Respond in Worker Mode: procedural and technical, focused on completing the task."
            }
            ModelMode::Persona => {
                "Respond in Persona Mode: expressive and interpretive, in your own voice."
            }
        }
    }
}

/// One public model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelEntry {
    pub name: String,
    pub session_id: String,
    pub mode: ModelMode,
}

impl ModelEntry {
    pub fn to_model(&self) -> Model {
        Model {
            id: self.name.clone(),
            object: "model".to_string(),
            created: MODEL_CREATED,
            owned_by: MODEL_OWNER.to_string(),
        }
    }
}

/// Maps public model names to upstream sessions
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: Vec<ModelEntry>,
}

impl ModelRegistry {
    pub fn from_names(names: &SessionNames) -> Self {
        let entry = |name: &str, session: &str, mode| ModelEntry {
            name: name.to_string(),
            session_id: session.to_string(),
            mode,
        };
        Self {
            models: vec![
                entry("gpt-3.5-turbo", &names.worker, ModelMode::Worker),
                entry("gpt-4", &names.persona, ModelMode::Persona),
                entry("gpt-4-turbo", &names.persona_turbo, ModelMode::Persona),
            ],
        }
    }

    pub fn get(&self, model: &str) -> Option<&ModelEntry> {
        self.models.iter().find(|m| m.name == model)
    }

    pub fn list(&self) -> &[ModelEntry] {
        &self.models
    }

    /// Replace configured session names with the ids the runtime knows them by.
    ///
    /// Entries that already hold an id are left alone. Names that cannot be
    /// resolved stay as configured and are logged. Returns how many entries
    /// were resolved.
    pub async fn resolve_names(&mut self, runtime: &dyn AgentRuntime) -> usize {
        if self.models.iter().all(|m| m.session_id.starts_with(SESSION_ID_PREFIX)) {
            return 0;
        }

        let sessions = match runtime.list_sessions().await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(error = %e, "Could not list sessions, leaving session names unresolved");
                return 0;
            }
        };

        let mut resolved = 0;
        let unresolved =
            self.models.iter_mut().filter(|m| !m.session_id.starts_with(SESSION_ID_PREFIX));
        for model in unresolved {
            match sessions.iter().find(|s| s.name.as_deref() == Some(model.session_id.as_str())) {
                Some(session) => {
                    info!(
                        model = %model.name,
                        name = %model.session_id,
                        session_id = %session.id,
                        "Resolved session name"
                    );
                    model.session_id = session.id.clone();
                    resolved += 1;
                }
                None => {
                    warn!(
                        model = %model.name,
                        name = %model.session_id,
                        "No session with this name"
                    );
                }
            }
        }
        resolved
    }
}
