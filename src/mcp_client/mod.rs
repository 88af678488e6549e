//! MCP Client: JSON-RPC transport and server management.
//!
//! This module handles:
//! - A shared, reference-counted pool of server child processes
//! - JSON-RPC 2.0 over process stdio or HTTP, correlated by request id
//! - Per-server sessions with lazy `initialize` and paginated listing
//! - The capability registry (tools, resources, prompts, connection status)
//! - Tool call routing, validation, and execution
//!
//! The MCP Client is used by the agent core's tool router to dispatch tool
//! calls from the model to the appropriate MCP server.

pub mod client;
pub mod connection;
pub mod errors;
pub mod process_pool;
pub mod registry;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports for convenience
pub use client::McpClient;
pub use connection::ServerConnection;
pub use errors::McpError;
pub use process_pool::{ProcessHandle, ProcessPool};
pub use registry::{
    CapabilityRegistry, ConnectionStatus, RegisteredTool, RegistryEvent, RetryPolicy,
};
pub use transport::{HttpTransport, StdioTransport, Transport};
pub use types::{McpToolDefinition, ServerConfig, ToolCallResult, TransportKind};
