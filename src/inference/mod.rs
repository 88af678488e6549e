//! Inference: the contract between the conversation loop and a chat model.
//!
//! This module defines:
//! - OpenAI Chat Completions wire types (messages, tool definitions, tool calls)
//! - The [`ChatCompletion`] collaborator trait the orchestrator calls
//! - Parsing of non-streaming completion responses
//!
//! The model itself is external: anything that speaks the OpenAI Chat
//! Completions shape can sit behind the trait.

pub mod errors;
pub mod provider;
pub mod types;

// Re-exports for convenience
pub use errors::InferenceError;
pub use provider::{parse_completion_response, ChatCompletion};
pub use types::{
    AssistantReply, ChatCompletionRequest, ChatMessage, Role, ToolCall, ToolCallResponse,
    ToolDefinition,
};
