//! Agent Core error types.

use thiserror::Error;

use crate::inference::InferenceError;
use crate::mcp_client::McpError;

/// Errors that can occur during agent core operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Tool server failure surfaced to the caller.
    #[error(transparent)]
    Mcp(#[from] McpError),

    /// The chat-completion collaborator failed.
    #[error(transparent)]
    Inference(#[from] InferenceError),

    /// The transcript would be rejected by the chat-completion API.
    #[error("conversation ordering violated: {0}")]
    Ordering(#[from] OrderingError),

    /// A tool id was not of the form `server:tool`.
    #[error("invalid tool id '{tool_id}': expected 'server:tool'")]
    InvalidToolId { tool_id: String },
}

/// A tool-call/tool-response pairing violation.
///
/// Indices refer to positions in the conversation's message list.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderingError {
    /// A tool call has no response after its assistant message.
    #[error("tool call '{call_id}' (assistant message {assistant_index}) has no response")]
    MissingResponse {
        call_id: String,
        assistant_index: usize,
    },

    /// A response for another call of the same batch appears out of order.
    #[error("message {index}: expected response to '{expected}', found response to '{found}'")]
    ReorderedResponse {
        expected: String,
        found: String,
        index: usize,
    },

    /// A non-tool message sits between tool calls and their responses.
    #[error("message {index} ({role}) interleaved before the response to '{call_id}'")]
    InterleavedMessage {
        call_id: String,
        index: usize,
        role: String,
    },

    /// A tool response that answers no call of the preceding assistant message.
    #[error("message {index}: tool response '{tool_call_id}' does not answer a pending call")]
    OrphanToolResponse { tool_call_id: String, index: usize },
}
