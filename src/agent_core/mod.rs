//! Agent Core: the tool-calling conversation loop.
//!
//! Submodules:
//! - `conversation`: Message history, context blocks, ordering validation
//! - `function_bridge`: `server:tool` ↔ `server_tool` codec and outstanding calls
//! - `tool_router`: Dispatches model tool calls to MCP servers
//! - `orchestrator`: The model ↔ tool state machine
//! - `types`: Shared types across the agent core
//! - `errors`: Agent-level error types

pub mod conversation;
pub mod errors;
pub mod function_bridge;
pub mod orchestrator;
pub mod tool_router;
pub mod types;

// Re-exports for convenience
pub use conversation::Conversation;
pub use errors::{AgentError, OrderingError};
pub use function_bridge::{from_api_name, split_tool_id, to_api_name, FunctionBridge, ToolCallContext};
pub use orchestrator::ConversationOrchestrator;
pub use tool_router::{ToolExecutor, ToolRouter};
pub use types::{LoopOutcome, Message, OrchestratorEvent, OrchestratorState};
