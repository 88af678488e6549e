//! ToolRouter: dispatches model tool calls to MCP servers.
//!
//! The ToolRouter sits between the model's tool-call decisions and the
//! server ecosystem. It handles:
//! - Resolution (registered call context first, then the function bridge)
//! - Availability checks so unknown tools never reach a server
//! - Execution through a [`ToolExecutor`]
//! - Rendering results (and failures) as text the model can read

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::inference::types::ToolCall;
use crate::mcp_client::{McpClient, McpError, RegisteredTool, ToolCallResult};

use super::function_bridge::FunctionBridge;

// ─── Executor Seam ──────────────────────────────────────────────────────────

/// What the orchestrator needs from the tool side.
///
/// [`McpClient`] is the production implementation; tests substitute fakes.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Flattened view of every tool on a connected server.
    fn available_tools(&self) -> Vec<RegisteredTool>;

    async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallResult, McpError>;

    /// Re-fetch capability snapshots. Returns per-server failures.
    async fn refresh_tools(&self) -> Vec<(String, McpError)>;
}

#[async_trait]
impl ToolExecutor for McpClient {
    fn available_tools(&self) -> Vec<RegisteredTool> {
        self.get_available_tools()
    }

    async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallResult, McpError> {
        McpClient::call_tool(self, server, tool, arguments).await
    }

    async fn refresh_tools(&self) -> Vec<(String, McpError)> {
        self.refresh_all().await
    }
}

// ─── ToolRouter ─────────────────────────────────────────────────────────────

pub struct ToolRouter {
    executor: Arc<dyn ToolExecutor>,
    /// Results longer than this many bytes are truncated for the model.
    max_result_chars: usize,
}

impl ToolRouter {
    pub fn new(executor: Arc<dyn ToolExecutor>, max_result_chars: usize) -> Self {
        Self {
            executor,
            max_result_chars,
        }
    }

    pub fn executor(&self) -> &Arc<dyn ToolExecutor> {
        &self.executor
    }

    /// Execute one model tool call. Never fails: every problem becomes an
    /// unsuccessful [`ToolCallResult`].
    pub async fn dispatch_single(
        &self,
        tool_call: &ToolCall,
        bridge: &FunctionBridge,
    ) -> ToolCallResult {
        let start = Instant::now();

        // 1. Resolve: registered context first, then the name decode
        let resolved = match bridge.context(&tool_call.id) {
            Some(ctx) => Some((ctx.server_name.clone(), ctx.tool().to_string())),
            None => bridge.resolve(&tool_call.name),
        };
        let Some((server, tool)) = resolved else {
            return error_result(
                &tool_call.name,
                start,
                &format!("unknown tool '{}'", tool_call.name),
            );
        };
        let tool_id = format!("{server}:{tool}");

        // 2. Availability
        let available = self
            .executor
            .available_tools()
            .iter()
            .any(|t| t.server == server && t.tool.name == tool);
        if !available {
            tracing::warn!(tool = %tool_id, call_id = %tool_call.id, "model called an unavailable tool");
            return error_result(
                &tool_id,
                start,
                &McpError::UnknownTool { name: tool_id.clone() }.to_string(),
            );
        }

        // 3. Execute
        tracing::info!(tool = %tool_id, call_id = %tool_call.id, "executing tool call");
        match self
            .executor
            .call_tool(&server, &tool, tool_call.arguments.clone())
            .await
        {
            Ok(result) => {
                tracing::info!(
                    tool = %tool_id,
                    success = result.success,
                    elapsed_ms = result.execution_time_ms,
                    "tool call finished"
                );
                result
            }
            Err(e) => {
                tracing::warn!(tool = %tool_id, error = %e, "tool call failed");
                error_result(&tool_id, start, &e.to_string())
            }
        }
    }

    /// Text for the tool message answering this result.
    pub fn render_result(&self, result: &ToolCallResult) -> String {
        truncate_tool_result(&result.model_text(), &result.tool_name, self.max_result_chars)
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn error_result(tool_name: &str, start: Instant, error_msg: &str) -> ToolCallResult {
    ToolCallResult {
        tool_name: tool_name.to_string(),
        success: false,
        result: None,
        error: Some(error_msg.to_string()),
        execution_time_ms: start.elapsed().as_millis() as u64,
    }
}

/// Cap a tool result at `max_chars` bytes, cutting on a char boundary and
/// appending a notice so the model knows the output is partial.
pub fn truncate_tool_result(result: &str, tool_name: &str, max_chars: usize) -> String {
    if result.len() <= max_chars {
        return result.to_string();
    }

    let truncated = truncate_utf8(result, max_chars);
    tracing::warn!(
        tool = %tool_name,
        original_len = result.len(),
        truncated_to = truncated.len(),
        "tool result truncated"
    );
    format!(
        "{truncated}\n\n[... truncated: showing first {} of {} chars]",
        truncated.len(),
        result.len()
    )
}

/// Longest prefix of `s` no longer than `max_bytes` that ends on a char boundary.
pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ─── Tests ──────────────────────────────────────────────────────────────────
