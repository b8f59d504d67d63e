//! OpenAI-compatible API routes.
//!
//! These routes let existing OpenAI clients and SDKs talk to agent sessions.
//! Each public model name maps to one upstream session.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::ProxyError;
use crate::orchestrator::delivery::{self, Completion};
use crate::orchestrator::RequestPlan;
use crate::state::AppState;
use crate::tokens;
use crate::tools;
use crate::translate;
use crate::types::openai::{ChatCompletionRequest, CompletionRequest, Model, ModelsResponse};
use crate::upstream::ConfigOverrides;

/// Chat completions endpoint
///
/// POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response, ProxyError> {
    let Json(request) = payload.map_err(|e| ProxyError::InvalidRequest(e.body_text()))?;
    complete(state, request).await
}

/// Legacy completions endpoint
///
/// POST /v1/completions
///
/// Wraps `prompt` in a single user message and runs it as a chat completion.
pub async fn completions(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CompletionRequest>, JsonRejection>,
) -> Result<Response, ProxyError> {
    let Json(request) = payload.map_err(|e| ProxyError::InvalidRequest(e.body_text()))?;
    debug!(model = %request.model, "Handling POST /v1/completions");

    let chat = request.into_chat().ok_or_else(|| {
        ProxyError::InvalidRequest("Legacy completions format not supported".to_string())
    })?;
    complete(state, chat).await
}

async fn complete(
    state: Arc<AppState>,
    request: ChatCompletionRequest,
) -> Result<Response, ProxyError> {
    info!(
        model = %request.model,
        messages = request.messages.len(),
        stream = request.stream,
        "Handling POST /v1/chat/completions"
    );

    let entry = state
        .registry
        .get(&request.model)
        .ok_or_else(|| ProxyError::UnknownModel(request.model.clone()))?;
    let session_id = entry.session_id.clone();

    let translated = translate::to_upstream(&request.messages)
        .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;
    let system = translate::system_context(translated.system.as_deref(), entry.mode);
    let prompt_tokens = tokens::count_prompt(&system, &request.messages);

    if let Some(max_tokens) = request.max_tokens {
        check_capacity(&state, &session_id, &request.model, prompt_tokens, max_tokens).await?;
    }

    if let Some(request_tools) = request.tools.as_deref().filter(|t| !t.is_empty()) {
        if let Err(e) = tools::sync_tools(state.runtime.as_ref(), &session_id, request_tools).await
        {
            warn!(session_id = %session_id, error = %e, "Tool sync failed, continuing without");
        }
    }

    let job = Completion {
        model: request.model.clone(),
        plan: RequestPlan {
            session_id,
            messages: translated.messages,
            overrides: ConfigOverrides {
                temperature: request.temperature,
                max_tokens: request.max_tokens,
            },
        },
        prompt_tokens,
        caller: request.user.clone(),
    };

    if request.stream {
        Ok(delivery::streaming(state, job))
    } else {
        let response = delivery::buffered(&state, job).await?;
        Ok(Json(response).into_response())
    }
}

/// Reject a `max_tokens` larger than the session can ever hold.
///
/// A prompt that merely overflows what is left is let through; compaction
/// deals with a full window. If the session cannot be read the request is
/// allowed.
async fn check_capacity(
    state: &AppState,
    session_id: &str,
    model: &str,
    prompt_tokens: u32,
    max_tokens: u32,
) -> Result<(), ProxyError> {
    let window = match state.runtime.retrieve_config(session_id).await {
        Ok(config) => config
            .as_ref()
            .and_then(tokens::session_context_window)
            .unwrap_or_else(|| tokens::context_limit(model)),
        Err(e) => {
            warn!(session_id, error = %e, "Failed to check token capacity, allowing request");
            return Ok(());
        }
    };

    if max_tokens > window {
        return Err(ProxyError::ContextLengthExceeded(format!(
            "Requested max_tokens ({}) exceeds model's maximum capability ({} tokens).",
            max_tokens, window
        )));
    }

    let needed = prompt_tokens.saturating_add(max_tokens);
    if needed > window {
        info!(
            session_id,
            needed,
            window,
            "Request may exceed context capacity, relying on compaction"
        );
    }
    Ok(())
}

/// List models endpoint
///
/// GET /v1/models
pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelsResponse> {
    debug!("Handling GET /v1/models");

    let data: Vec<Model> = state.registry.list().iter().map(|m| m.to_model()).collect();
    Json(ModelsResponse { object: "list".to_string(), data })
}

/// Get model info
///
/// GET /v1/models/{model}
pub async fn get_model(
    State(state): State<Arc<AppState>>,
    Path(model_id): Path<String>,
) -> Result<Json<Model>, ProxyError> {
    debug!(model_id = %model_id, "Handling GET /v1/models/{{model}}");

    state
        .registry
        .get(&model_id)
        .map(|m| Json(m.to_model()))
        .ok_or(ProxyError::ModelNotFound(model_id))
}
