//! Shared types for the agent core.
//!
//! Conversation messages, orchestrator state, and the events emitted while
//! tool calls execute.

use serde::{Deserialize, Serialize};

use crate::inference::types::{Role, ToolCall};

// ─── Conversation Messages ──────────────────────────────────────────────────

/// A single message in conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    /// Text content. Empty for assistant messages that only carry tool calls.
    pub content: String,
    /// Tool calls requested by the assistant (assistant messages only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// For `tool` role: the id of the call this message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tag for system/context blocks that are replaced in place.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    /// Author name: the function name for tool results, `"system"` for
    /// synthetic ones, or the model-provided name for assistant turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    fn new(role: Role, content: &str) -> Self {
        Self {
            role,
            content: content.to_string(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            context_id: None,
            name: None,
        }
    }

    pub fn user(content: &str) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: &str, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::new(Role::Assistant, content)
        }
    }

    pub fn tool(tool_call_id: &str, content: &str) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.to_string()),
            ..Self::new(Role::Tool, content)
        }
    }

    /// A tagged system block managed with `add_system_context`.
    pub fn context(context_id: &str, content: &str) -> Self {
        Self {
            context_id: Some(context_id.to_string()),
            ..Self::new(Role::System, content)
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn is_context(&self) -> bool {
        self.context_id.is_some()
    }

    pub fn has_tool_calls(&self) -> bool {
        self.role == Role::Assistant && !self.tool_calls.is_empty()
    }
}

// ─── Orchestrator ───────────────────────────────────────────────────────────

/// Where the tool-calling loop stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    /// No unresolved tool calls.
    Idle,
    /// The latest assistant message has tool calls without responses.
    AwaitingToolResults,
}

/// How `process_and_continue` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LoopOutcome {
    /// The model stopped requesting tools.
    Completed { rounds: usize },
    /// The round cap was hit; a synthetic error response was appended for
    /// each call still pending.
    RoundLimitReached { rounds: usize },
}

/// Emitted by the orchestrator for observers (UI, logging).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    ToolCallStarted {
        call_id: String,
        tool_name: String,
    },
    ToolCallCompleted {
        call_id: String,
        tool_name: String,
        success: bool,
        execution_time_ms: u64,
    },
    RoundLimitReached {
        rounds: usize,
    },
}
