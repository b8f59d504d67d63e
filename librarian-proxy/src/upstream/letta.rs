//! HTTP client for a Letta agent runtime.
//!
//! Sessions are Letta agents; the generation configuration is the agent's
//! `llm_config`. Streaming calls use the runtime's SSE endpoint with
//! token-level deltas.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{future, Stream, StreamExt};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument};

use super::{
    AgentRuntime, EventStream, GenerationConfig, SessionSummary, ToolSpec, ToolSummary,
    UpstreamError, UpstreamMessage,
};
use crate::stream::SseDecoder;
use crate::types::letta::{
    AgentState, CreateToolRequest, ModifyAgentRequest, StreamMessagesRequest, ToolState,
};

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Letta runtime client
#[derive(Clone)]
pub struct LettaClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    /// Applied to every call except the streaming one
    timeout: Duration,
}

impl LettaClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, UpstreamError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        info!(url = %base_url, "Creating Letta client");

        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| UpstreamError::Connection(e.to_string()))?;

        Ok(Self { client, base_url, api_key, timeout })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let builder = self.client.request(method, url);
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Check the runtime's health endpoint
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), UpstreamError> {
        let response = self
            .request(Method::GET, "/v1/health/")
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to connect to Letta");
                UpstreamError::from(e)
            })?;
        check_status(response).await?;
        info!("Letta is healthy");
        Ok(())
    }

    async fn get_agent(&self, session_id: &str) -> Result<AgentState, UpstreamError> {
        let response = self
            .request(Method::GET, &format!("/v1/agents/{}", session_id))
            .timeout(self.timeout)
            .send()
            .await?;
        let agent = check_status(response).await?.json::<AgentState>().await?;
        Ok(agent)
    }
}

/// Turn a non-success response into [`UpstreamError::Api`], preferring the
/// runtime's `detail` message over the raw body.
async fn check_status(response: Response) -> Result<Response, UpstreamError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.get("detail").and_then(Value::as_str).map(str::to_string))
        .unwrap_or(body);
    error!(status = %status, message = %message, "Letta returned error");
    Err(UpstreamError::Api { status: status.as_u16(), message })
}

#[async_trait]
impl AgentRuntime for LettaClient {
    #[instrument(skip(self))]
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, UpstreamError> {
        let response = self.request(Method::GET, "/v1/agents/").timeout(self.timeout).send().await?;
        let agents = check_status(response).await?.json::<Vec<AgentState>>().await?;
        debug!(count = agents.len(), "Listed agents");

        Ok(agents.into_iter().map(|a| SessionSummary { id: a.id, name: a.name }).collect())
    }

    #[instrument(skip(self))]
    async fn retrieve_config(
        &self,
        session_id: &str,
    ) -> Result<Option<GenerationConfig>, UpstreamError> {
        Ok(self.get_agent(session_id).await?.llm_config)
    }

    #[instrument(skip(self, config))]
    async fn modify_config(
        &self,
        session_id: &str,
        config: &GenerationConfig,
    ) -> Result<(), UpstreamError> {
        let response = self
            .request(Method::PATCH, &format!("/v1/agents/{}", session_id))
            .timeout(self.timeout)
            .json(&ModifyAgentRequest { llm_config: config })
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    #[instrument(skip(self, messages), fields(messages = messages.len()))]
    async fn open_stream(
        &self,
        session_id: &str,
        messages: &[UpstreamMessage],
    ) -> Result<EventStream, UpstreamError> {
        // No total timeout: the body stays open for the whole generation
        let response = self
            .request(Method::POST, &format!("/v1/agents/{}/messages/stream", session_id))
            .json(&StreamMessagesRequest { messages, stream_tokens: true })
            .send()
            .await?;
        let response = check_status(response).await?;

        let body: ByteStream = Box::pin(response.bytes_stream());
        let frames = SseDecoder::new(body)
            .take_while(|frame| future::ready(!matches!(frame, Ok(f) if f.is_done())))
            .filter_map(|frame| {
                future::ready(match frame {
                    Ok(frame) => match serde_json::from_str::<Value>(&frame.data) {
                        Ok(value) => Some(Ok(value)),
                        Err(e) => {
                            debug!(error = %e, data = %frame.data, "Skipping undecodable frame");
                            None
                        }
                    },
                    Err(e) => Some(Err(UpstreamError::from(e))),
                })
            });

        Ok(frames.boxed())
    }

    #[instrument(skip(self))]
    async fn compact(&self, session_id: &str, retain_messages: usize) -> Result<(), UpstreamError> {
        let response = self
            .request(Method::POST, &format!("/v1/agents/{}/summarize", session_id))
            .query(&[("max_message_length", retain_messages)])
            .timeout(self.timeout)
            .send()
            .await?;
        check_status(response).await?;
        info!(session_id, "Compacted session history");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_tools(&self) -> Result<Vec<ToolSummary>, UpstreamError> {
        let response = self.request(Method::GET, "/v1/tools/").timeout(self.timeout).send().await?;
        let tools = check_status(response).await?.json::<Vec<ToolState>>().await?;
        debug!(count = tools.len(), "Listed tools");

        Ok(tools
            .into_iter()
            .filter_map(|t| t.name.map(|name| ToolSummary { id: t.id, name }))
            .collect())
    }

    #[instrument(skip(self, tool), fields(tool = %tool.name))]
    async fn create_tool(&self, tool: &ToolSpec) -> Result<ToolSummary, UpstreamError> {
        let body = CreateToolRequest {
            name: &tool.name,
            description: &tool.description,
            json_schema: json!({
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.parameters,
            }),
        };
        let response = self
            .request(Method::POST, "/v1/tools/")
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?;
        let created = check_status(response).await?.json::<ToolState>().await?;
        info!(tool_id = %created.id, "Created tool");

        Ok(ToolSummary { id: created.id, name: created.name.unwrap_or_else(|| tool.name.clone()) })
    }

    #[instrument(skip(self))]
    async fn attach_tool(&self, session_id: &str, tool_id: &str) -> Result<(), UpstreamError> {
        let response = self
            .request(Method::PATCH, &format!("/v1/agents/{}/tools/attach/{}", session_id, tool_id))
            .timeout(self.timeout)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}
