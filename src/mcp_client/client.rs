//! MCP Client: high-level interface over every configured server.
//!
//! Owns the connections, the shared process pool, and the capability
//! registry, and routes tool/resource/prompt operations to the right server.
//! All methods take `&self`; the client is meant to be shared behind an `Arc`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use super::connection::ServerConnection;
use super::errors::McpError;
use super::process_pool::ProcessPool;
use super::registry::{CapabilityRegistry, ConnectionStatus, RegisteredTool, RetryPolicy};
use super::transport::DEFAULT_REQUEST_TIMEOUT;
use super::types::{ServerConfig, ToolCallResult};

// ─── McpClient ───────────────────────────────────────────────────────────────

/// Manages connections to all configured MCP servers.
pub struct McpClient {
    configs: BTreeMap<String, ServerConfig>,
    pool: ProcessPool,
    registry: Arc<CapabilityRegistry>,
    connections: RwLock<HashMap<String, Arc<ServerConnection>>>,
    request_timeout: Duration,
    retry: RetryPolicy,
}

impl McpClient {
    /// Create a client for `configs`. No server is started until
    /// [`connect_all`](Self::connect_all) or [`connect_server`](Self::connect_server).
    pub fn new(configs: BTreeMap<String, ServerConfig>, pool: ProcessPool) -> Self {
        let registry = Arc::new(CapabilityRegistry::new());
        for name in configs.keys() {
            registry.register_server(name);
        }
        Self {
            configs,
            pool,
            registry,
            connections: RwLock::new(HashMap::new()),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &ProcessPool {
        &self.pool
    }

    fn connection(&self, name: &str) -> Result<Arc<ServerConnection>, McpError> {
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        match connections.get(name) {
            Some(conn) if !conn.is_closed() => Ok(Arc::clone(conn)),
            _ if self.configs.contains_key(name) => Err(McpError::Closed {
                name: name.to_string(),
            }),
            _ => Err(McpError::UnknownServer {
                name: name.to_string(),
            }),
        }
    }

    fn take_connection(&self, name: &str) -> Option<Arc<ServerConnection>> {
        self.connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Connect every configured server concurrently.
    ///
    /// Returns the servers that failed (partial startup is OK).
    pub async fn connect_all(&self) -> Vec<(String, McpError)> {
        let names: Vec<String> = self.configs.keys().cloned().collect();
        let results = futures::future::join_all(names.iter().map(|n| self.connect_server(n))).await;

        let errors: Vec<(String, McpError)> = names
            .into_iter()
            .zip(results)
            .filter_map(|(name, r)| r.err().map(|e| (name, e)))
            .collect();

        tracing::info!(
            connected = self.connected_servers().len(),
            failed = errors.len(),
            tools = self.registry.tool_count(),
            "MCP servers connected"
        );
        errors
    }

    /// Open, initialize, and list capabilities for one server.
    ///
    /// A no-op if the server is already connected.
    pub async fn connect_server(&self, name: &str) -> Result<(), McpError> {
        let config = self.configs.get(name).ok_or(McpError::UnknownServer {
            name: name.to_string(),
        })?;

        if self.connection(name).is_ok() {
            return Ok(());
        }

        self.registry.set_status(name, ConnectionStatus::Connecting);

        let conn = match ServerConnection::open(name, config, &self.pool, self.request_timeout).await
        {
            Ok(conn) => Arc::new(conn),
            Err(e) => {
                self.registry.set_status(
                    name,
                    ConnectionStatus::Error {
                        reason: e.to_string(),
                    },
                );
                return Err(e);
            }
        };

        if let Err(e) = conn.initialize().await {
            self.registry.set_status(
                name,
                ConnectionStatus::Error {
                    reason: e.to_string(),
                },
            );
            conn.close().await;
            return Err(e);
        }

        if let Err(e) = self.registry.refresh_with_retry(&conn, &self.retry).await {
            conn.close().await;
            return Err(e);
        }

        let previous = self
            .connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), conn);
        if let Some(previous) = previous {
            previous.close().await;
        }

        Ok(())
    }

    /// Close one server's connection and mark it disconnected.
    pub async fn disconnect_server(&self, name: &str) {
        if let Some(conn) = self.take_connection(name) {
            conn.close().await;
        }
        if self.configs.contains_key(name) {
            self.registry.set_status(name, ConnectionStatus::Disconnected);
        }
    }

    /// Close every connection. Shared processes exit once their last
    /// holder is gone.
    pub async fn shutdown_all(&self) {
        let names: Vec<String> = self.configs.keys().cloned().collect();
        for name in names {
            self.disconnect_server(&name).await;
        }
        tracing::info!(stats = ?self.pool.stats(), "all MCP servers shut down");
    }

    /// Re-list one server's capabilities.
    pub async fn refresh_server(&self, name: &str) -> Result<(), McpError> {
        let conn = self.connection(name)?;
        let result = self.registry.refresh_with_retry(&conn, &self.retry).await;
        if let Err(McpError::CapabilityMissing { .. }) = &result {
            // The connection closed itself; forget it.
            self.take_connection(name);
        }
        result
    }

    /// Re-list capabilities of every connected server.
    pub async fn refresh_all(&self) -> Vec<(String, McpError)> {
        let names = self.connected_servers();
        let results = futures::future::join_all(names.iter().map(|n| self.refresh_server(n))).await;
        names
            .into_iter()
            .zip(results)
            .filter_map(|(name, r)| r.err().map(|e| (name, e)))
            .collect()
    }

    // ─── Operations ──────────────────────────────────────────────────────

    /// Execute a tool on a server.
    ///
    /// JSON-RPC errors and `isError` results come back as an unsuccessful
    /// [`ToolCallResult`]; transport-level failures are returned as `Err`.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallResult, McpError> {
        let start = Instant::now();
        let tool_id = format!("{server}:{tool}");

        let conn = self.connection(server)?;
        self.registry.validate_tool_call(server, tool, &arguments)?;

        tracing::debug!(tool = %tool_id, "calling tool");

        let outcome = conn.call_tool(tool, arguments).await;
        let elapsed = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) if result.is_error => Ok(ToolCallResult {
                tool_name: tool_id,
                success: false,
                result: None,
                error: Some(result.text()),
                execution_time_ms: elapsed,
            }),
            Ok(result) => Ok(ToolCallResult {
                tool_name: tool_id,
                success: true,
                result: Some(result.text()),
                error: None,
                execution_time_ms: elapsed,
            }),
            Err(McpError::ServerError { code, message, .. }) => Ok(ToolCallResult {
                tool_name: tool_id,
                success: false,
                result: None,
                error: Some(format!("[{code}] {message}")),
                execution_time_ms: elapsed,
            }),
            Err(e @ McpError::ServerCrashed { .. }) => {
                tracing::error!(server = %server, error = %e, "server crashed during tool call");
                if let Some(conn) = self.take_connection(server) {
                    conn.close().await;
                }
                self.registry.set_status(
                    server,
                    ConnectionStatus::Error {
                        reason: e.to_string(),
                    },
                );
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn read_resource(&self, server: &str, uri: &str) -> Result<serde_json::Value, McpError> {
        self.connection(server)?.read_resource(uri).await
    }

    pub async fn get_prompt(
        &self,
        server: &str,
        name: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        self.connection(server)?.get_prompt(name, arguments).await
    }

    // ─── Status ──────────────────────────────────────────────────────────

    pub fn get_available_tools(&self) -> Vec<RegisteredTool> {
        self.registry.get_all_tools()
    }

    pub fn find_server_for_tool(&self, tool_name: &str) -> Option<String> {
        self.registry.find_server_for_tool(tool_name)
    }

    pub fn is_server_connected(&self, name: &str) -> bool {
        self.connection(name).is_ok()
    }

    /// Names of servers with an open connection, sorted.
    pub fn connected_servers(&self) -> Vec<String> {
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = connections
            .iter()
            .filter(|(_, c)| !c.is_closed())
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        names
    }

    /// Names of all configured servers (including those that failed to start).
    pub fn configured_servers(&self) -> Vec<String> {
        self.configs.keys().cloned().collect()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
