//! Synchronization of request tool definitions with the agent runtime.
//!
//! Function tools named in a request are registered with the runtime when
//! missing and attached to the target session before the call.

use serde_json::json;
use tracing::{debug, info};

use crate::types::openai::Tool;
use crate::upstream::{AgentRuntime, ToolSpec, UpstreamError};

const FUNCTION_TOOL: &str = "function";

/// Function tools of a request, in request order
pub fn function_specs(tools: &[Tool]) -> Vec<ToolSpec> {
    tools
        .iter()
        .filter(|t| t.tool_type == FUNCTION_TOOL)
        .filter_map(|t| t.function.as_ref())
        .map(|f| ToolSpec {
            name: f.name.clone(),
            description: f.description.clone().unwrap_or_default(),
            parameters: f.parameters.clone().unwrap_or_else(|| json!({})),
        })
        .collect()
}

/// Make every function tool in `tools` available to `session_id`.
///
/// Tools the runtime does not know yet are created; all of them are then
/// attached. Stops at the first failing RPC. Returns how many tools were
/// attached.
pub async fn sync_tools(
    runtime: &dyn AgentRuntime,
    session_id: &str,
    tools: &[Tool],
) -> Result<usize, UpstreamError> {
    let specs = function_specs(tools);
    if specs.is_empty() {
        return Ok(0);
    }

    let mut known = runtime.list_tools().await?;
    for spec in &specs {
        let tool_id = match known.iter().find(|t| t.name == spec.name) {
            Some(existing) => existing.id.clone(),
            None => {
                let created = runtime.create_tool(spec).await?;
                info!(tool = %spec.name, tool_id = %created.id, "Created tool");
                let id = created.id.clone();
                known.push(created);
                id
            }
        };
        runtime.attach_tool(session_id, &tool_id).await?;
        debug!(tool = %spec.name, session_id, "Attached tool");
    }

    info!(tools = specs.len(), session_id, "Synchronized tools");
    Ok(specs.len())
}
