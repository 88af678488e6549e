//! Capability registry: the latest known tools, resources, and prompts of
//! every configured server, plus its connection status.
//!
//! Each server's capabilities live in an immutable [`ServerSnapshot`] behind
//! an `Arc`. A refresh builds a complete new snapshot and swaps it in under
//! a short write lock, so readers always see either the old set or the new
//! set, never a mix.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::connection::ServerConnection;
use super::errors::McpError;
use super::types::{McpToolDefinition, PromptDescriptor, ResourceDescriptor};

/// Capacity of the registry event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

// ─── Status & Snapshots ──────────────────────────────────────────────────────

/// Connection status of one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error { reason: String },
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

/// Everything known about one server at one point in time.
#[derive(Debug, Clone, Serialize)]
pub struct ServerSnapshot {
    pub status: ConnectionStatus,
    pub tools: Vec<McpToolDefinition>,
    pub resources: Vec<ResourceDescriptor>,
    pub prompts: Vec<PromptDescriptor>,
    pub updated_at: DateTime<Utc>,
}

impl ServerSnapshot {
    fn empty(status: ConnectionStatus) -> Self {
        Self {
            status,
            tools: Vec::new(),
            resources: Vec::new(),
            prompts: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

/// A tool together with the server that provides it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegisteredTool {
    pub server: String,
    pub tool: McpToolDefinition,
}

impl RegisteredTool {
    /// Protocol-level identifier, `"server:tool"`.
    pub fn tool_id(&self) -> String {
        format!("{}:{}", self.server, self.tool.name)
    }
}

/// Emitted on status transitions and snapshot swaps.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    StatusChanged {
        server: String,
        status: ConnectionStatus,
    },
    CapabilitiesUpdated {
        server: String,
        tool_count: usize,
    },
}

// ─── Retry Policy ────────────────────────────────────────────────────────────

/// Backoff schedule for capability refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

/// Delay before retry number `attempt` (0-based): exponential growth from
/// `base_delay_ms`, plus up to 50% random jitter, capped at `max_delay_ms`.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exp = policy
        .base_delay_ms
        .saturating_mul(1u64 << attempt.min(20))
        .min(policy.max_delay_ms);
    let jitter = if exp > 1 { fastrand::u64(0..=exp / 2) } else { 0 };
    Duration::from_millis(exp.saturating_add(jitter).min(policy.max_delay_ms))
}

// ─── CapabilityRegistry ──────────────────────────────────────────────────────

type Capabilities = (
    Vec<McpToolDefinition>,
    Vec<ResourceDescriptor>,
    Vec<PromptDescriptor>,
);

/// Per-server capability snapshots, ordered by server name.
pub struct CapabilityRegistry {
    servers: RwLock<BTreeMap<String, Arc<ServerSnapshot>>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            servers: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<ServerSnapshot>>> {
        self.servers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Arc<ServerSnapshot>>> {
        self.servers.write().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: RegistryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Add a server in `Disconnected` state if it is not already known.
    pub fn register_server(&self, name: &str) {
        let mut servers = self.write();
        servers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ServerSnapshot::empty(ConnectionStatus::Disconnected)));
    }

    /// Set a server's status. `Disconnected` and `Error` clear its capabilities.
    pub fn set_status(&self, name: &str, status: ConnectionStatus) {
        let changed = {
            let mut servers = self.write();
            let previous = servers.get(name).cloned();
            if previous.as_ref().map(|s| &s.status) == Some(&status) {
                false
            } else {
                let snapshot = match (&status, previous) {
                    (ConnectionStatus::Connecting | ConnectionStatus::Connected, Some(prev)) => {
                        ServerSnapshot {
                            status: status.clone(),
                            ..(*prev).clone()
                        }
                    }
                    _ => ServerSnapshot::empty(status.clone()),
                };
                servers.insert(name.to_string(), Arc::new(snapshot));
                true
            }
        };

        if changed {
            match &status {
                ConnectionStatus::Error { reason } => {
                    tracing::warn!(server = %name, reason = %reason, "server status: error");
                }
                other => tracing::info!(server = %name, status = ?other, "server status changed"),
            }
            self.emit(RegistryEvent::StatusChanged {
                server: name.to_string(),
                status,
            });
        }
    }

    /// Atomically replace a server's capabilities and mark it connected.
    pub fn replace_capabilities(
        &self,
        name: &str,
        tools: Vec<McpToolDefinition>,
        resources: Vec<ResourceDescriptor>,
        prompts: Vec<PromptDescriptor>,
    ) {
        let tool_count = tools.len();
        let snapshot = Arc::new(ServerSnapshot {
            status: ConnectionStatus::Connected,
            tools,
            resources,
            prompts,
            updated_at: Utc::now(),
        });

        let previous = self.write().insert(name.to_string(), snapshot);
        let was_connected = previous.is_some_and(|p| p.status.is_connected());

        tracing::info!(server = %name, tools = tool_count, "capabilities updated");
        if !was_connected {
            self.emit(RegistryEvent::StatusChanged {
                server: name.to_string(),
                status: ConnectionStatus::Connected,
            });
        }
        self.emit(RegistryEvent::CapabilitiesUpdated {
            server: name.to_string(),
            tool_count,
        });
    }

    async fn fetch(conn: &ServerConnection) -> Result<Capabilities, McpError> {
        let tools = conn.list_tools().await?;
        let resources = conn.list_resources().await?;
        let prompts = conn.list_prompts().await?;
        Ok((tools, resources, prompts))
    }

    /// Re-list a server's capabilities once and swap them in.
    ///
    /// On failure the server is marked `Error` with empty capabilities.
    pub async fn refresh(&self, conn: &ServerConnection) -> Result<(), McpError> {
        match Self::fetch(conn).await {
            Ok((tools, resources, prompts)) => {
                self.replace_capabilities(conn.name(), tools, resources, prompts);
                Ok(())
            }
            Err(e) => {
                self.set_status(
                    conn.name(),
                    ConnectionStatus::Error {
                        reason: e.to_string(),
                    },
                );
                Err(e)
            }
        }
    }

    /// Like [`refresh`](Self::refresh), retrying transient failures with
    /// exponential backoff. The previous snapshot stays visible while
    /// retries are pending.
    pub async fn refresh_with_retry(
        &self,
        conn: &ServerConnection,
        policy: &RetryPolicy,
    ) -> Result<(), McpError> {
        let attempts = policy.max_attempts.max(1);
        let mut attempt = 0;

        let err = loop {
            match Self::fetch(conn).await {
                Ok((tools, resources, prompts)) => {
                    self.replace_capabilities(conn.name(), tools, resources, prompts);
                    return Ok(());
                }
                Err(e) if e.is_retriable() && attempt + 1 < attempts => {
                    let delay = backoff_delay(policy, attempt);
                    tracing::warn!(
                        server = %conn.name(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "capability refresh failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => break e,
            }
        };

        self.set_status(
            conn.name(),
            ConnectionStatus::Error {
                reason: err.to_string(),
            },
        );

        if err.is_retriable() {
            Err(McpError::RefreshExhausted {
                name: conn.name().to_string(),
                attempts: attempt + 1,
                reason: err.to_string(),
            })
        } else {
            Err(err)
        }
    }

    // ─── Queries ─────────────────────────────────────────────────────────

    pub fn snapshot(&self, name: &str) -> Option<Arc<ServerSnapshot>> {
        self.read().get(name).cloned()
    }

    pub fn status(&self, name: &str) -> Option<ConnectionStatus> {
        self.read().get(name).map(|s| s.status.clone())
    }

    pub fn server_names(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn connected_servers(&self) -> Vec<String> {
        self.read()
            .iter()
            .filter(|(_, s)| s.status.is_connected())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Tool definition on a specific connected server.
    pub fn get_tool(&self, server: &str, tool: &str) -> Option<McpToolDefinition> {
        self.read()
            .get(server)
            .filter(|s| s.status.is_connected())
            .and_then(|s| s.tools.iter().find(|t| t.name == tool).cloned())
    }

    /// First connected server, in name order, that offers `tool_name`.
    pub fn find_server_for_tool(&self, tool_name: &str) -> Option<String> {
        self.read()
            .iter()
            .filter(|(_, s)| s.status.is_connected())
            .find(|(_, s)| s.tools.iter().any(|t| t.name == tool_name))
            .map(|(name, _)| name.clone())
    }

    /// All tools of all connected servers, ordered by server name.
    pub fn get_all_tools(&self) -> Vec<RegisteredTool> {
        self.read()
            .iter()
            .filter(|(_, s)| s.status.is_connected())
            .flat_map(|(server, s)| {
                s.tools.iter().map(move |tool| RegisteredTool {
                    server: server.clone(),
                    tool: tool.clone(),
                })
            })
            .collect()
    }

    pub fn tool_count(&self) -> usize {
        self.read()
            .values()
            .filter(|s| s.status.is_connected())
            .map(|s| s.tools.len())
            .sum()
    }

    /// Validate a tool call: tool exists and arguments carry every required
    /// top-level field. Full JSON Schema validation is left to the server.
    pub fn validate_tool_call(
        &self,
        server: &str,
        tool: &str,
        arguments: &serde_json::Value,
    ) -> Result<(), McpError> {
        let def = self.get_tool(server, tool).ok_or(McpError::UnknownTool {
            name: format!("{server}:{tool}"),
        })?;

        if let Some(required) = def.input_schema.get("required").and_then(|r| r.as_array()) {
            let args_obj = arguments.as_object();
            for field_name in required.iter().filter_map(|f| f.as_str()) {
                let has_field = args_obj.is_some_and(|obj| obj.contains_key(field_name));
                if !has_field {
                    return Err(McpError::InvalidArguments {
                        tool: format!("{server}:{tool}"),
                        reason: format!("missing required field: '{field_name}'"),
                    });
                }
            }
        }

        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::test_support::{tool_json, FakeTransport, Reply};
    use serde_json::json;

    fn tool(name: &str, required: &str) -> McpToolDefinition {
        serde_json::from_value(tool_json(name, required)).unwrap()
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
        }
    }

    fn connected(registry: &CapabilityRegistry, server: &str, tools: Vec<McpToolDefinition>) {
        registry.register_server(server);
        registry.replace_capabilities(server, tools, vec![], vec![]);
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
        };
        for _ in 0..50 {
            let d0 = backoff_delay(&policy, 0).as_millis();
            assert!((100..=150).contains(&d0), "attempt 0 delay {d0}");
            let d2 = backoff_delay(&policy, 2).as_millis();
            assert!((400..=600).contains(&d2), "attempt 2 delay {d2}");
            assert!(backoff_delay(&policy, 30).as_millis() <= 1_000);
        }
    }

    #[test]
    fn test_find_server_for_tool_prefers_name_order() {
        let registry = CapabilityRegistry::new();
        connected(&registry, "zeta", vec![tool("search", "q")]);
        connected(&registry, "alpha", vec![tool("search", "q")]);

        assert_eq!(registry.find_server_for_tool("search").as_deref(), Some("alpha"));
        assert_eq!(registry.find_server_for_tool("missing"), None);
    }

    #[test]
    fn test_get_all_tools_skips_unconnected_servers() {
        let registry = CapabilityRegistry::new();
        connected(&registry, "fs", vec![tool("read_file", "path"), tool("write_file", "path")]);
        connected(&registry, "web", vec![tool("fetch", "url")]);
        registry.set_status("web", ConnectionStatus::Error { reason: "down".into() });

        let tools = registry.get_all_tools();
        let ids: Vec<String> = tools.iter().map(|t| t.tool_id()).collect();
        assert_eq!(ids, vec!["fs:read_file", "fs:write_file"]);
        assert_eq!(registry.tool_count(), 2);
        assert!(registry.snapshot("web").unwrap().tools.is_empty());
    }

    #[test]
    fn test_validate_tool_call_checks_required_fields() {
        let registry = CapabilityRegistry::new();
        connected(&registry, "fs", vec![tool("read_file", "path")]);

        assert!(registry
            .validate_tool_call("fs", "read_file", &json!({"path": "/tmp/a"}))
            .is_ok());

        let err = registry
            .validate_tool_call("fs", "read_file", &json!({}))
            .unwrap_err();
        assert!(matches!(err, McpError::InvalidArguments { .. }));

        let err = registry
            .validate_tool_call("fs", "delete_everything", &json!({}))
            .unwrap_err();
        assert!(matches!(err, McpError::UnknownTool { .. }));
    }

    #[test]
    fn test_status_events_are_broadcast() {
        let registry = CapabilityRegistry::new();
        let mut rx = registry.subscribe();

        registry.register_server("fs");
        registry.set_status("fs", ConnectionStatus::Connecting);
        registry.set_status("fs", ConnectionStatus::Connecting);
        registry.replace_capabilities("fs", vec![tool("read_file", "path")], vec![], vec![]);

        assert_eq!(
            rx.try_recv().unwrap(),
            RegistryEvent::StatusChanged {
                server: "fs".into(),
                status: ConnectionStatus::Connecting
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            RegistryEvent::StatusChanged {
                server: "fs".into(),
                status: ConnectionStatus::Connected
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            RegistryEvent::CapabilitiesUpdated {
                server: "fs".into(),
                tool_count: 1
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_refresh_swaps_whole_snapshot() {
        let registry = CapabilityRegistry::new();
        let fake = Arc::new(FakeTransport::new("fs").with_tools(json!([tool_json("read_file", "path")])));
        let conn = ServerConnection::new("fs", fake.clone());

        registry.refresh(&conn).await.unwrap();
        let before = registry.snapshot("fs").unwrap();
        assert_eq!(before.tools.len(), 1);

        fake.set_replies(
            "tools/list",
            vec![Reply::Result(json!({"tools": [
                tool_json("read_file", "path"),
                tool_json("write_file", "path")
            ]}))],
        );
        registry.refresh(&conn).await.unwrap();

        // A reader holding the old snapshot still sees the old, complete set.
        assert_eq!(before.tools.len(), 1);
        assert_eq!(registry.snapshot("fs").unwrap().tools.len(), 2);
    }

    #[tokio::test]
    async fn test_refresh_retries_transient_failures() {
        let registry = CapabilityRegistry::new();
        let fake = Arc::new(
            FakeTransport::new("fs")
                .reply("tools/list", Reply::TransportFailure)
                .reply("tools/list", Reply::Result(json!({"tools": [tool_json("read_file", "path")]}))),
        );
        let conn = ServerConnection::new("fs", fake.clone());

        registry.refresh_with_retry(&conn, &fast_policy()).await.unwrap();
        assert_eq!(fake.request_count("tools/list"), 2);
        assert!(registry.status("fs").unwrap().is_connected());
    }

    #[tokio::test]
    async fn test_refresh_gives_up_after_max_attempts() {
        let registry = CapabilityRegistry::new();
        let fake = Arc::new(FakeTransport::new("fs").reply("tools/list", Reply::TransportFailure));
        let conn = ServerConnection::new("fs", fake.clone());

        let err = registry
            .refresh_with_retry(&conn, &fast_policy())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::RefreshExhausted { attempts: 3, .. }));
        assert_eq!(fake.request_count("tools/list"), 3);
        assert!(matches!(
            registry.status("fs"),
            Some(ConnectionStatus::Error { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_tools_capability_is_not_retried() {
        let registry = CapabilityRegistry::new();
        let fake = Arc::new(FakeTransport::new("fs"));
        let conn = ServerConnection::new("fs", fake.clone());

        let err = registry
            .refresh_with_retry(&conn, &fast_policy())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::CapabilityMissing { .. }));
        assert_eq!(fake.request_count("tools/list"), 1);
        assert!(registry.get_all_tools().is_empty());
    }
}
