// JSON-RPC method dispatch for the MCP surface

use crate::protocol::{
    InitializeResult, JsonRpcError, JsonRpcRequest, JsonRpcResponse, ListToolsResult,
};
use crate::tools::ToolRegistry;
use serde_json::{json, Value};

/// MCP server: routes decoded JSON-RPC requests to their handlers.
///
/// The dispatcher never touches the rate counters; that is the HTTP layer's
/// job.
pub struct McpServer {
    registry: ToolRegistry,
}

impl McpServer {
    pub fn new(registry: ToolRegistry) -> Self {
        Self { registry }
    }

    /// Handle one decoded request. Notifications produce no response.
    pub async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        tracing::debug!(method = %request.method, "dispatching request");

        let id = request.id.clone().unwrap_or(Value::Null);

        let response = match request.method.as_str() {
            "initialize" => JsonRpcResponse::success(id, InitializeResult::current()),

            // Notification, no response
            "notifications/initialized" => return None,

            "ping" => JsonRpcResponse::success(id, json!({})),

            "tools/list" => JsonRpcResponse::success(
                id,
                ListToolsResult {
                    tools: self.registry.list_schemas(),
                },
            ),

            "tools/call" => self.handle_tools_call(id, request.params).await,

            other => JsonRpcResponse::error(id, JsonRpcError::method_not_found(other)),
        };

        Some(response)
    }

    async fn handle_tools_call(&self, id: Value, params: Option<Value>) -> JsonRpcResponse {
        let params = params.unwrap_or(Value::Null);

        let name = match params.get("name").and_then(|n| n.as_str()) {
            Some(name) => name,
            None => return JsonRpcResponse::error(id, JsonRpcError::invalid_params()),
        };

        let tool = match self.registry.get(name) {
            Some(tool) => tool,
            None => {
                return JsonRpcResponse::error(
                    id,
                    JsonRpcError::custom(-32602, format!("Unknown tool: {}", name)),
                )
            }
        };

        let arguments = match params.get("arguments") {
            Some(Value::Null) | None => json!({}),
            Some(value) => value.clone(),
        };

        match tool.execute(arguments).await {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(e) => JsonRpcResponse::error(id, JsonRpcError::internal_error(e.to_string())),
        }
    }
}
