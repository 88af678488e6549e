//! MCP Client error types.

use thiserror::Error;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// A server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// The initialization handshake failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed {
        name: String,
        reason: String,
    },

    /// JSON-RPC communication error (malformed message, I/O error).
    #[error("transport error for server '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// Non-2xx response from an HTTP server.
    #[error("HTTP {status} from server '{server}': {body}")]
    HttpStatus {
        server: String,
        status: u16,
        body: String,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A request did not receive its response within the timeout.
    #[error("request '{method}' to server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// The server does not implement a mandatory capability.
    #[error("server '{server}' does not support required capability '{capability}'")]
    CapabilityMissing {
        server: String,
        capability: String,
    },

    /// No configuration or connection exists for this server.
    #[error("unknown server: '{name}'")]
    UnknownServer {
        name: String,
    },

    /// Tool not found in the capability registry.
    #[error("unknown tool: '{name}'")]
    UnknownTool {
        name: String,
    },

    /// Tool call arguments failed schema validation.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments {
        tool: String,
        reason: String,
    },

    /// Server process exited while the connection was in use.
    #[error("server '{name}' crashed: {reason}")]
    ServerCrashed {
        name: String,
        reason: String,
    },

    /// The connection was closed by its owner.
    #[error("connection to server '{name}' is closed")]
    Closed {
        name: String,
    },

    /// Configuration error (missing servers, bad config file).
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },

    /// All capability refresh attempts for a server failed.
    #[error("server '{name}' refresh failed after {attempts} attempts: {reason}")]
    RefreshExhausted {
        name: String,
        attempts: u32,
        reason: String,
    },
}

impl McpError {
    /// Whether the server reported that the requested method does not exist.
    ///
    /// Servers signal this with JSON-RPC code `-32601`; some older servers
    /// return a generic code with a "not found"/"not supported" message.
    pub fn is_method_not_supported(&self) -> bool {
        match self {
            McpError::ServerError { code, message, .. } => {
                if *code == super::types::error_codes::METHOD_NOT_FOUND {
                    return true;
                }
                let lower = message.to_lowercase();
                lower.contains("method not found") || lower.contains("not supported")
            }
            _ => false,
        }
    }

    /// Whether a capability refresh that failed with this error may succeed
    /// on a later attempt.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            McpError::TransportError { .. }
                | McpError::Timeout { .. }
                | McpError::HttpStatus { status: 500..=599, .. }
                | McpError::ServerError { .. }
        ) && !self.is_method_not_supported()
    }
}
