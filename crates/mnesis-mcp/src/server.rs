//! MCP Server Core
//!
//! Routes JSON-RPC requests to tool handlers. A session is opened on
//! `initialize` so every read/write/feedback in this MCP connection is
//! accounted to one session row.

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::protocol::types::{
    InitializeRequest, JsonRpcError, JsonRpcRequest, JsonRpcResponse, ToolDescription,
    MCP_VERSION,
};
use crate::tools::{self, ToolContext};

/// MCP server state.
pub struct McpServer {
    context: ToolContext,
    initialized: bool,
}

impl McpServer {
    pub fn new(context: ToolContext) -> Self {
        Self {
            context,
            initialized: false,
        }
    }

    /// Handle one request; notifications return `None`.
    pub async fn handle_request(&mut self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        debug!("Handling request: {}", request.method);

        if !self.initialized
            && request.method != "initialize"
            && request.method != "notifications/initialized"
        {
            warn!("Rejecting request '{}': server not initialized", request.method);
            return Some(JsonRpcResponse::error(
                request.id,
                JsonRpcError::server_not_initialized(),
            ));
        }

        let result = match request.method.as_str() {
            "initialize" => self.handle_initialize(request.params),
            "notifications/initialized" => return None,
            "tools/list" => Ok(json!({ "tools": tool_descriptions() })),
            "tools/call" => self.handle_tools_call(request.params).await,
            "ping" => Ok(json!({})),
            method => {
                warn!("Unknown method: {}", method);
                Err(JsonRpcError::method_not_found())
            }
        };

        Some(match result {
            Ok(result) => JsonRpcResponse::success(request.id, result),
            Err(error) => JsonRpcResponse::error(request.id, error),
        })
    }

    fn handle_initialize(&mut self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let request: InitializeRequest = match params {
            Some(p) => serde_json::from_value(p)
                .map_err(|e| JsonRpcError::invalid_params(&e.to_string()))?,
            None => InitializeRequest::default(),
        };

        // Version negotiation: clients reject servers announcing newer
        // protocol versions, so adopt an older client version as-is.
        let negotiated = if request.protocol_version.as_str() < MCP_VERSION {
            request.protocol_version.clone()
        } else {
            MCP_VERSION.to_string()
        };

        self.initialized = true;
        info!("MCP session initialized with protocol version {}", negotiated);

        Ok(json!({
            "protocolVersion": negotiated,
            "serverInfo": {
                "name": "mnesis",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {
                "tools": { "listChanged": false },
            },
            "instructions":
                "Mnesis is the user's personal memory. Call context_snapshot silently at the \
                 start of every conversation and internalize it - never quote it back. Write \
                 durable facts with memory_write in third-person declarative form. When the \
                 conversation ends naturally, call memory_feedback with only the memory IDs \
                 that genuinely influenced your responses.",
        }))
    }

    async fn handle_tools_call(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params = params.ok_or_else(|| JsonRpcError::invalid_params("Missing params"))?;
        let name = params
            .get("name")
            .and_then(|n| n.as_str())
            .ok_or_else(|| JsonRpcError::invalid_params("Missing tool name"))?
            .to_string();
        let arguments = params.get("arguments").cloned();

        let context = &self.context;
        let result = match name.as_str() {
            "memory_write" => tools::memory::execute_write(context, arguments).await,
            "memory_read" => tools::search::execute(context, arguments).await,
            "memory_update" => tools::memory::execute_update(context, arguments).await,
            "memory_delete" => tools::memory::execute_delete(context, arguments).await,
            "memory_restore" => tools::memory::execute_restore(context, arguments).await,
            "memory_list" => tools::memory::execute_list(context, arguments).await,
            "context_snapshot" => tools::snapshot::execute(context, arguments).await,
            "memory_feedback" => tools::feedback::execute(context, arguments).await,
            "memory_graph" => tools::graph::execute(context, arguments).await,
            "conversation_search" => {
                tools::conversations::execute_search(context, arguments).await
            }
            "conversation_list" => tools::conversations::execute_list(context, arguments).await,
            "conversation_capture" => {
                tools::conversations::execute_capture(context, arguments).await
            }
            "conflicts" => tools::conflicts::execute(context, arguments).await,
            "conversation_analysis" => tools::analysis::execute(context, arguments).await,
            other => Err(format!("Unknown tool: {other}")),
        };

        match result {
            Ok(value) => Ok(json!({
                "content": [{
                    "type": "text",
                    "text": serde_json::to_string_pretty(&value)
                        .unwrap_or_else(|_| value.to_string()),
                }],
                "isError": false,
            })),
            Err(message) => Ok(json!({
                "content": [{ "type": "text", "text": message }],
                "isError": true,
            })),
        }
    }
}

fn tool_descriptions() -> Vec<ToolDescription> {
    vec![
        ToolDescription {
            name: "memory_write".to_string(),
            description: Some(
                "Write a new memory. Third-person declarative only ('The user prefers...'), \
                 20-1000 chars, under 128 tokens. Semantic memories with confidence < 0.85 \
                 land in pending_review. Returns {id, status, action}."
                    .to_string(),
            ),
            input_schema: tools::memory::write_schema(),
        },
        ToolDescription {
            name: "memory_read".to_string(),
            description: Some(
                "Search memories semantically. Re-ranked by similarity, importance, and \
                 recency; an optional context boosts tag-matching memories x1.3."
                    .to_string(),
            ),
            input_schema: tools::search::schema(),
        },
        ToolDescription {
            name: "memory_update".to_string(),
            description: Some(
                "Update a memory's content. The prior version is archived automatically and \
                 the embedding recalculated."
                    .to_string(),
            ),
            input_schema: tools::memory::update_schema(),
        },
        ToolDescription {
            name: "memory_delete".to_string(),
            description: Some(
                "Soft-delete a memory (status=archived). Never physically deleted; \
                 recoverable with memory_restore."
                    .to_string(),
            ),
            input_schema: tools::memory::delete_schema(),
        },
        ToolDescription {
            name: "memory_restore".to_string(),
            description: Some("Restore an archived memory to active.".to_string()),
            input_schema: tools::memory::restore_schema(),
        },
        ToolDescription {
            name: "memory_list".to_string(),
            description: Some(
                "List memories with optional category/level filters, sorted by importance. \
                 Returns metadata plus the first 100 chars of content."
                    .to_string(),
            ),
            input_schema: tools::memory::list_schema(),
        },
        ToolDescription {
            name: "context_snapshot".to_string(),
            description: Some(
                "Structured Markdown snapshot of the user's memory (max 800 tokens). Call \
                 at the START of every conversation, silently; internalize, never quote."
                    .to_string(),
            ),
            input_schema: tools::snapshot::schema(),
        },
        ToolDescription {
            name: "memory_feedback".to_string(),
            description: Some(
                "Signal which memories were actually useful. Raises importance by 0.05 each \
                 and ends the session. Include ONLY memory IDs that genuinely influenced \
                 your responses."
                    .to_string(),
            ),
            input_schema: tools::feedback::schema(),
        },
        ToolDescription {
            name: "memory_graph".to_string(),
            description: Some(
                "Explore typed relationships (BELONGS_TO, REINFORCES, CONTRADICTS, \
                 PRECEDES, DEPENDS_ON, INVOLVES_PERSON) around a memory via BFS."
                    .to_string(),
            ),
            input_schema: tools::graph::schema(),
        },
        ToolDescription {
            name: "conversation_search".to_string(),
            description: Some(
                "Search imported conversations by title and summary.".to_string(),
            ),
            input_schema: tools::conversations::search_schema(),
        },
        ToolDescription {
            name: "conversation_list".to_string(),
            description: Some("List imported conversations, paginated.".to_string()),
            input_schema: tools::conversations::list_schema(),
        },
        ToolDescription {
            name: "conversation_capture".to_string(),
            description: Some(
                "Import a transcript so the conversation miner can extract durable facts. \
                 Idempotent by raw_hash."
                    .to_string(),
            ),
            input_schema: tools::conversations::capture_schema(),
        },
        ToolDescription {
            name: "conflicts".to_string(),
            description: Some(
                "Conflict workbench. Actions: 'list' pending contradictions, 'resolve' one \
                 (kept_existing | merged | versioned | overwritten)."
                    .to_string(),
            ),
            input_schema: tools::conflicts::schema(),
        },
        ToolDescription {
            name: "conversation_analysis".to_string(),
            description: Some(
                "Mine conversations into memory suggestions. Actions: 'run' (enqueue a \
                 job), 'run_now' (synchronous), 'status', 'jobs', 'cancel'."
                    .to_string(),
            ),
            input_schema: tools::analysis::schema(),
        },
    ]
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_tool_has_a_schema_object() {
        for tool in tool_descriptions() {
            assert!(tool.input_schema.is_object(), "schema missing for {}", tool.name);
            assert!(tool.description.is_some());
        }
    }

    #[test]
    fn spec_surface_is_present() {
        let names: Vec<String> = tool_descriptions().into_iter().map(|t| t.name).collect();
        for required in [
            "memory_write",
            "memory_read",
            "memory_update",
            "memory_delete",
            "memory_list",
            "context_snapshot",
            "memory_feedback",
            "conversation_search",
            "conversation_list",
        ] {
            assert!(names.iter().any(|n| n == required), "missing tool {required}");
        }
    }
}
