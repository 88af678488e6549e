//! One logical session with one MCP server.
//!
//! Wraps a [`Transport`] with the MCP lifecycle: a lazy, at-most-once
//! `initialize` handshake, paginated capability listing, and tool/resource/
//! prompt operations. Resources and prompts are optional capabilities;
//! tools are mandatory.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::OnceCell;

use super::errors::McpError;
use super::process_pool::ProcessPool;
use super::transport::{extract_result, HttpTransport, StdioTransport, Transport};
use super::types::{
    CallToolResult, InitializeResult, McpToolDefinition, PromptDescriptor, PromptsPage,
    ResourceDescriptor, ResourcesPage, ServerConfig, ToolsPage, TransportKind, PROTOCOL_VERSION,
};

/// Upper bound on pages followed for a single listing.
const MAX_LIST_PAGES: usize = 64;

// ─── Pagination ──────────────────────────────────────────────────────────────

trait Page: DeserializeOwned {
    type Item;
    fn into_parts(self) -> (Vec<Self::Item>, Option<String>);
}

impl Page for ToolsPage {
    type Item = McpToolDefinition;
    fn into_parts(self) -> (Vec<Self::Item>, Option<String>) {
        (self.tools, self.next_cursor)
    }
}

impl Page for ResourcesPage {
    type Item = ResourceDescriptor;
    fn into_parts(self) -> (Vec<Self::Item>, Option<String>) {
        (self.resources, self.next_cursor)
    }
}

impl Page for PromptsPage {
    type Item = PromptDescriptor;
    fn into_parts(self) -> (Vec<Self::Item>, Option<String>) {
        (self.prompts, self.next_cursor)
    }
}

// ─── ServerConnection ────────────────────────────────────────────────────────

/// A session with one server over one transport.
pub struct ServerConnection {
    name: String,
    transport: Arc<dyn Transport>,
    init: OnceCell<InitializeResult>,
    closed: AtomicBool,
}

impl ServerConnection {
    /// Wrap an existing transport.
    pub fn new(name: &str, transport: Arc<dyn Transport>) -> Self {
        Self {
            name: name.to_string(),
            transport,
            init: OnceCell::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Open the transport described by `config`. Does not initialize.
    pub async fn open(
        name: &str,
        config: &ServerConfig,
        pool: &ProcessPool,
        request_timeout: Duration,
    ) -> Result<Self, McpError> {
        config.validate(name)?;

        let transport: Arc<dyn Transport> = match config.transport {
            TransportKind::Stdio => Arc::new(
                StdioTransport::connect(pool, name, config)
                    .await?
                    .with_timeout(request_timeout),
            ),
            TransportKind::Http => {
                let url = config.url.as_deref().ok_or(McpError::ConfigError {
                    reason: format!("server '{name}' has no url"),
                })?;
                Arc::new(HttpTransport::new(name, url, request_timeout)?)
            }
        };

        Ok(Self::new(name, transport))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_initialized(&self) -> bool {
        self.init.initialized()
    }

    /// Handshake result, once initialized.
    pub fn server_info(&self) -> Option<&InitializeResult> {
        self.init.get()
    }

    fn ensure_open(&self) -> Result<(), McpError> {
        if self.is_closed() {
            return Err(McpError::Closed {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    /// Perform the `initialize` handshake. Runs at most once per connection;
    /// concurrent callers share the in-flight attempt. A failed attempt may
    /// be retried.
    pub async fn initialize(&self) -> Result<&InitializeResult, McpError> {
        self.ensure_open()?;
        self.init.get_or_try_init(|| self.handshake()).await
    }

    async fn handshake(&self) -> Result<InitializeResult, McpError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            }
        });

        let init_failed = |e: McpError| McpError::InitFailed {
            name: self.name.clone(),
            reason: e.to_string(),
        };

        let response = self
            .transport
            .request("initialize", Some(params))
            .await
            .map_err(init_failed)?;
        let result = extract_result(response).map_err(init_failed)?;
        let init: InitializeResult =
            serde_json::from_value(result).map_err(|e| McpError::InitFailed {
                name: self.name.clone(),
                reason: format!("malformed initialize result: {e}"),
            })?;

        self.transport
            .notify("notifications/initialized", None)
            .await
            .map_err(init_failed)?;

        tracing::info!(
            server = %self.name,
            protocol_version = init.protocol_version.as_deref().unwrap_or("unknown"),
            "server initialized"
        );

        Ok(init)
    }

    /// Issue a request, initializing first if needed.
    async fn call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        self.initialize().await?;
        let response = self.transport.request(method, params).await?;
        extract_result(response)
    }

    async fn list_all<P: Page>(&self, method: &str) -> Result<Vec<P::Item>, McpError> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let value = self.call(method, params).await?;
            let page: P = serde_json::from_value(value).map_err(|e| McpError::TransportError {
                server: self.name.clone(),
                reason: format!("malformed {method} result: {e}"),
            })?;

            let (mut batch, next) = page.into_parts();
            items.append(&mut batch);

            match next {
                Some(next) if !next.is_empty() && cursor.as_deref() != Some(next.as_str()) => {
                    cursor = Some(next);
                }
                _ => return Ok(items),
            }
        }

        tracing::warn!(server = %self.name, method = %method, "pagination limit reached");
        Ok(items)
    }

    /// List tools. Tools are mandatory: a server that does not implement
    /// `tools/list` fails with `CapabilityMissing` and the connection is closed.
    pub async fn list_tools(&self) -> Result<Vec<McpToolDefinition>, McpError> {
        match self.list_all::<ToolsPage>("tools/list").await {
            Ok(tools) => Ok(tools),
            Err(e) if e.is_method_not_supported() => {
                tracing::warn!(server = %self.name, "server does not support tools/list; closing");
                self.close().await;
                Err(McpError::CapabilityMissing {
                    server: self.name.clone(),
                    capability: "tools".into(),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// List resources; empty if the server does not support them.
    pub async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>, McpError> {
        match self.list_all::<ResourcesPage>("resources/list").await {
            Err(e) if e.is_method_not_supported() => {
                tracing::debug!(server = %self.name, "resources not supported");
                Ok(Vec::new())
            }
            other => other,
        }
    }

    /// List prompts; empty if the server does not support them.
    pub async fn list_prompts(&self) -> Result<Vec<PromptDescriptor>, McpError> {
        match self.list_all::<PromptsPage>("prompts/list").await {
            Err(e) if e.is_method_not_supported() => {
                tracing::debug!(server = %self.name, "prompts not supported");
                Ok(Vec::new())
            }
            other => other,
        }
    }

    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<CallToolResult, McpError> {
        let value = self
            .call(
                "tools/call",
                Some(json!({ "name": tool_name, "arguments": arguments })),
            )
            .await?;

        serde_json::from_value(value).map_err(|e| McpError::TransportError {
            server: self.name.clone(),
            reason: format!("malformed tools/call result: {e}"),
        })
    }

    pub async fn read_resource(&self, uri: &str) -> Result<serde_json::Value, McpError> {
        self.call("resources/read", Some(json!({ "uri": uri }))).await
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        let mut params = json!({ "name": name });
        if let Some(args) = arguments {
            params["arguments"] = args;
        }
        self.call("prompts/get", Some(params)).await
    }

    /// Release the transport. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.transport.close().await;
        tracing::info!(server = %self.name, "connection closed");
    }
}
