//! Function Bridge: translates between protocol tool ids and model
//! function names, and tracks tool calls until they are answered.
//!
//! The protocol names tools `server:tool`; function-calling APIs forbid `:`
//! in function names, so the model sees `server_tool`. Decoding splits on the
//! first underscore, which is ambiguous when a server name itself contains
//! one (`task_list_add` could be `task:list_add` or `task_list:add`).
//! The bridge therefore remembers every name it emitted and prefers that
//! mapping, and the orchestrator prefers a call's registered context over
//! any decode.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::inference::types::ToolDefinition;
use crate::mcp_client::RegisteredTool;

/// Separator in protocol tool ids.
pub const PROTOCOL_SEPARATOR: char = ':';

/// Separator in model-facing function names.
pub const API_SEPARATOR: char = '_';

// ─── Name Codec ─────────────────────────────────────────────────────────────

/// `("fs", "read_file")` → `"fs_read_file"`.
pub fn to_api_name(server: &str, tool: &str) -> String {
    format!("{server}{API_SEPARATOR}{tool}")
}

/// `"fs_read_file"` → `"fs:read_file"`, splitting on the first underscore.
///
/// Best effort: wrong whenever the server name contains `_`.
pub fn from_api_name(api_name: &str) -> Option<String> {
    let (server, tool) = api_name.split_once(API_SEPARATOR)?;
    if server.is_empty() || tool.is_empty() {
        return None;
    }
    Some(format!("{server}{PROTOCOL_SEPARATOR}{tool}"))
}

/// `"fs:read_file"` → `("fs", "read_file")`.
pub fn split_tool_id(tool_id: &str) -> Option<(&str, &str)> {
    let (server, tool) = tool_id.split_once(PROTOCOL_SEPARATOR)?;
    if server.is_empty() || tool.is_empty() {
        return None;
    }
    Some((server, tool))
}

// ─── Call Tracking ──────────────────────────────────────────────────────────

/// An outstanding tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallContext {
    /// Call id issued by the model; the response must echo it.
    pub id: String,
    /// Protocol form, `server:tool`.
    pub tool_name: String,
    pub server_name: String,
    pub arguments: serde_json::Value,
    pub created_at: Instant,
}

impl ToolCallContext {
    /// The bare tool name, without the server prefix.
    pub fn tool(&self) -> &str {
        split_tool_id(&self.tool_name).map_or(self.tool_name.as_str(), |(_, t)| t)
    }
}

/// Name codec state plus the table of outstanding calls.
#[derive(Debug, Default)]
pub struct FunctionBridge {
    calls: HashMap<String, ToolCallContext>,
    /// `api name → (server, tool)` for every definition last emitted.
    known: HashMap<String, (String, String)>,
}

impl FunctionBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build function definitions for the model and remember the mapping.
    ///
    /// If two tools encode to the same function name, the first (in
    /// registry order) wins and the other is not offered.
    pub fn tool_definitions(&mut self, tools: &[RegisteredTool]) -> Vec<ToolDefinition> {
        self.known.clear();
        let mut defs = Vec::with_capacity(tools.len());

        for registered in tools {
            let api_name = to_api_name(&registered.server, &registered.tool.name);
            if let Some((server, tool)) = self.known.get(&api_name) {
                tracing::warn!(
                    api_name = %api_name,
                    kept = %format!("{server}:{tool}"),
                    dropped = %registered.tool_id(),
                    "function name collision; tool not offered to the model"
                );
                continue;
            }

            self.known.insert(
                api_name.clone(),
                (registered.server.clone(), registered.tool.name.clone()),
            );
            defs.push(ToolDefinition::function(
                &api_name,
                registered.tool.description.as_deref().unwrap_or_default(),
                registered.tool.input_schema.clone(),
            ));
        }

        defs
    }

    /// Resolve a model function name to `(server, tool)`.
    ///
    /// Uses the emitted mapping when available, else the first-underscore split.
    pub fn resolve(&self, api_name: &str) -> Option<(String, String)> {
        if let Some(pair) = self.known.get(api_name) {
            return Some(pair.clone());
        }
        let tool_id = from_api_name(api_name)?;
        split_tool_id(&tool_id).map(|(s, t)| (s.to_string(), t.to_string()))
    }

    pub fn register_call(
        &mut self,
        id: &str,
        tool_name: &str,
        server_name: &str,
        arguments: serde_json::Value,
    ) {
        self.calls.insert(
            id.to_string(),
            ToolCallContext {
                id: id.to_string(),
                tool_name: tool_name.to_string(),
                server_name: server_name.to_string(),
                arguments,
                created_at: Instant::now(),
            },
        );
    }

    pub fn complete_call(&mut self, id: &str) -> Option<ToolCallContext> {
        self.calls.remove(id)
    }

    pub fn context(&self, id: &str) -> Option<&ToolCallContext> {
        self.calls.get(id)
    }

    pub fn outstanding(&self) -> usize {
        self.calls.len()
    }

    /// Drop calls registered more than `max_age` ago. Returns how many.
    pub fn cleanup_older_than(&mut self, max_age: Duration) -> usize {
        let before = self.calls.len();
        self.calls
            .retain(|_, ctx| ctx.created_at.elapsed() <= max_age);
        let removed = before - self.calls.len();
        if removed > 0 {
            tracing::debug!(removed, "swept abandoned tool call contexts");
        }
        removed
    }

    pub fn clear(&mut self) {
        self.calls.clear();
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
