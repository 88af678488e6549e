//! JSON-RPC transports.
//!
//! Handles low-level communication with MCP servers:
//! - Request id allocation and the pending-request table
//! - Line-delimited JSON over a pooled child process's stdin/stdout
//! - One-POST-per-request JSON over HTTP
//!
//! Requests are correlated by id, never by position, so several callers
//! (possibly several connections sharing one process) can have requests in
//! flight at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::errors::McpError;
use super::process_pool::{format_stderr_suffix, ManagedProcess, ProcessHandle, ProcessPool};
use super::types::{
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ServerConfig, TransportKind,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// How long a request waits for its response before it is abandoned.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// TCP connection timeout for HTTP servers.
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
///
/// Global rather than per-connection: connections sharing one process also
/// share its pending table, so ids must not collide across them.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Pending Requests ────────────────────────────────────────────────────────

/// Table of requests awaiting a response, keyed by request id.
///
/// Each id is inserted at most once and removed exactly once: by the
/// matching response, by timeout eviction, or by `fail_all` when the
/// underlying process exits.
#[derive(Clone, Default)]
pub struct PendingRequests {
    inner: Arc<Mutex<HashMap<String, oneshot::Sender<JsonRpcResponse>>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<JsonRpcResponse>>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a request id. Returns `None` if the id is already pending.
    pub fn register(&self, key: &str) -> Option<oneshot::Receiver<JsonRpcResponse>> {
        let mut map = self.lock();
        if map.contains_key(key) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        map.insert(key.to_string(), tx);
        Some(rx)
    }

    /// Deliver a response to its waiter. Returns `false` for stray responses.
    pub fn resolve(&self, key: &str, response: JsonRpcResponse) -> bool {
        let sender = self.lock().remove(key);
        match sender {
            // The waiter may have timed out between removal and send; the
            // entry is gone either way.
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Remove a request without resolving it.
    pub fn evict(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every waiter; their receivers observe a closed channel.
    pub fn fail_all(&self) -> usize {
        let mut map = self.lock();
        let count = map.len();
        map.clear();
        count
    }

    /// Wait for the response to `key`, evicting the entry on timeout.
    pub async fn await_response(
        &self,
        server: &str,
        method: &str,
        key: &str,
        rx: oneshot::Receiver<JsonRpcResponse>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, McpError> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(McpError::ServerCrashed {
                name: server.to_string(),
                reason: format!("process exited before responding to '{method}'"),
            }),
            Err(_) => {
                self.evict(key);
                tracing::warn!(
                    server = %server,
                    method = %method,
                    request_id = %key,
                    timeout_ms = timeout.as_millis() as u64,
                    "request timed out; pending entry evicted"
                );
                Err(McpError::Timeout {
                    server: server.to_string(),
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

/// Route one stdout line from a server process.
///
/// Responses are delivered to their pending waiter. Server-initiated
/// requests/notifications and non-JSON lines (log output) are skipped.
pub(crate) fn dispatch_line(server: &str, pending: &PendingRequests, line: &str) {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return;
    }

    let value: serde_json::Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(_) => {
            tracing::debug!(server = %server, line = %trimmed, "skipping non-JSON stdout line");
            return;
        }
    };

    if let Some(method) = value.get("method").and_then(|m| m.as_str()) {
        tracing::debug!(server = %server, method = %method, "ignoring server-initiated message");
        return;
    }

    let response: JsonRpcResponse = match serde_json::from_value(value) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(server = %server, error = %e, "malformed JSON-RPC response");
            return;
        }
    };

    match response.request_key() {
        Some(key) => {
            if !pending.resolve(&key, response) {
                tracing::warn!(
                    server = %server,
                    request_id = %key,
                    "dropping response with no pending request (late or unknown id)"
                );
            }
        }
        None => {
            tracing::warn!(server = %server, "dropping response without a usable id");
        }
    }
}

// ─── Transport Trait ─────────────────────────────────────────────────────────

/// A channel that carries JSON-RPC envelopes to one server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for its correlated response.
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError>;

    /// Send a notification (no response expected).
    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError>;

    /// Release the underlying channel. Idempotent.
    async fn close(&self);

    fn kind(&self) -> TransportKind;
}

// ─── Stdio Transport ─────────────────────────────────────────────────────────

/// JSON-RPC over a pooled child process's stdio.
pub struct StdioTransport {
    server_name: String,
    handle: ProcessHandle,
    timeout: Duration,
}

impl StdioTransport {
    /// Acquire (or share) the server process described by `config`.
    pub async fn connect(
        pool: &ProcessPool,
        server_name: &str,
        config: &ServerConfig,
    ) -> Result<Self, McpError> {
        let command = config.command.as_deref().ok_or(McpError::ConfigError {
            reason: format!("server '{server_name}' has no command"),
        })?;
        let handle = pool
            .acquire(server_name, command, &config.args, &config.env)
            .await?;
        Ok(Self {
            server_name: server_name.to_string(),
            handle,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Override the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn handle(&self) -> &ProcessHandle {
        &self.handle
    }

    fn process(&self) -> Result<Arc<ManagedProcess>, McpError> {
        if self.handle.is_released() {
            return Err(McpError::Closed {
                name: self.server_name.clone(),
            });
        }
        self.handle.process().ok_or_else(|| McpError::ServerCrashed {
            name: self.server_name.clone(),
            reason: "server process is no longer running".into(),
        })
    }

    async fn write_json<T: serde::Serialize>(
        &self,
        process: &ManagedProcess,
        message: &T,
    ) -> Result<(), McpError> {
        let json = serde_json::to_string(message).map_err(|e| McpError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to serialize message: {e}"),
        })?;
        process
            .write_line(&json)
            .await
            .map_err(|e| McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to write to stdin: {e}"),
            })
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let process = self.process()?;
        let id = next_request_id();
        let key = id.to_string();
        let req = JsonRpcRequest::new(id, method, params);

        let rx = process
            .pending()
            .register(&key)
            .ok_or_else(|| McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("request id {key} is already pending"),
            })?;

        if let Err(e) = self.write_json(&process, &req).await {
            process.pending().evict(&key);
            return Err(e);
        }

        tracing::debug!(server = %self.server_name, method = %method, request_id = id, "request sent");

        process
            .pending()
            .await_response(&self.server_name, method, &key, rx, self.timeout)
            .await
            .map_err(|e| match e {
                McpError::ServerCrashed { name, reason } => McpError::ServerCrashed {
                    name,
                    reason: format!("{reason}{}", format_stderr_suffix(&process.stderr_tail())),
                },
                other => other,
            })
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let process = self.process()?;
        let notification = JsonRpcNotification::new(method, params);
        self.write_json(&process, &notification).await
    }

    async fn close(&self) {
        self.handle.release().await;
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }
}

// ─── HTTP Transport ──────────────────────────────────────────────────────────

/// JSON-RPC over plain HTTP POST: one request per call, no persistent
/// connection state.
pub struct HttpTransport {
    server_name: String,
    url: String,
    http: reqwest::Client,
    timeout: Duration,
    closed: AtomicBool,
}

impl HttpTransport {
    pub fn new(server_name: &str, url: &str, timeout: Duration) -> Result<Self, McpError> {
        let http = reqwest::Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .timeout(timeout)
            .build()
            .map_err(|e| McpError::TransportError {
                server: server_name.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            server_name: server_name.to_string(),
            url: url.to_string(),
            http,
            timeout,
            closed: AtomicBool::new(false),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn ensure_open(&self) -> Result<(), McpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::Closed {
                name: self.server_name.clone(),
            });
        }
        Ok(())
    }

    async fn post<T: serde::Serialize + Sync>(
        &self,
        method: &str,
        body: &T,
    ) -> Result<String, McpError> {
        let response = self
            .http
            .post(&self.url)
            .header("Accept", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    McpError::Timeout {
                        server: self.server_name.clone(),
                        method: method.to_string(),
                        timeout_ms: self.timeout.as_millis() as u64,
                    }
                } else {
                    McpError::TransportError {
                        server: self.server_name.clone(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| McpError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to read response body: {e}"),
        })?;

        if !status.is_success() {
            return Err(McpError::HttpStatus {
                server: self.server_name.clone(),
                status: status.as_u16(),
                body: text,
            });
        }

        Ok(text)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        self.ensure_open()?;
        let id = next_request_id();
        let req = JsonRpcRequest::new(id, method, params);

        let body = self.post(method, &req).await?;
        let response: JsonRpcResponse =
            serde_json::from_str(&body).map_err(|e| McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("malformed JSON-RPC response: {e}"),
            })?;

        // Error responses may legitimately carry a null id.
        match response.request_key() {
            Some(key) if key != id.to_string() => Err(McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("response id {key} does not match request id {id}"),
            }),
            None if response.error.is_none() => Err(McpError::TransportError {
                server: self.server_name.clone(),
                reason: "response is missing its id".into(),
            }),
            _ => Ok(response),
        }
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        self.ensure_open()?;
        let notification = JsonRpcNotification::new(method, params);
        self.post(method, &notification).await.map(|_| ())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: super::types::error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::test_support::{mcp_http_responder, FakeHttpServer, FAKE_SERVER_SCRIPT};

    fn response(id: serde_json::Value, result: serde_json::Value) -> JsonRpcResponse {
        JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    #[test]
    fn test_next_request_id_is_monotonic() {
        let id1 = next_request_id();
        let id2 = next_request_id();
        assert!(id2 > id1);
    }

    #[test]
    fn test_default_timeout_is_thirty_seconds() {
        assert_eq!(DEFAULT_REQUEST_TIMEOUT, Duration::from_secs(30));
    }

    #[test]
    fn test_pending_register_rejects_duplicate_id() {
        let pending = PendingRequests::new();
        assert!(pending.register("1").is_some());
        assert!(pending.register("1").is_none());
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_pending_resolve_delivers_and_removes() {
        let pending = PendingRequests::new();
        let rx = pending.register("5").unwrap();
        assert!(pending.resolve("5", response(serde_json::json!(5), serde_json::json!({"ok": true}))));
        assert!(pending.is_empty());

        let resp = rx.await.unwrap();
        assert_eq!(resp.result.unwrap()["ok"], true);
    }

    #[tokio::test]
    async fn test_timeout_evicts_entry_and_late_response_is_stray() {
        let pending = PendingRequests::new();
        let rx = pending.register("9").unwrap();

        let err = pending
            .await_response("fs", "tools/list", "9", rx, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Timeout { ref method, .. } if method == "tools/list"));
        assert!(!pending.contains("9"));

        // A late response must not resurrect or corrupt anything.
        assert!(!pending.resolve("9", response(serde_json::json!(9), serde_json::json!({}))));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_fail_all_reports_crash_to_waiters() {
        let pending = PendingRequests::new();
        let rx = pending.register("3").unwrap();
        assert_eq!(pending.fail_all(), 1);

        let err = pending
            .await_response("fs", "tools/call", "3", rx, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ServerCrashed { .. }));
    }

    #[tokio::test]
    async fn test_dispatch_line_routes_by_id() {
        let pending = PendingRequests::new();
        let rx_a = pending.register("10").unwrap();
        let rx_b = pending.register("11").unwrap();

        // Out of issue order, with noise in between.
        dispatch_line("fs", &pending, r#"{"jsonrpc":"2.0","id":11,"result":{"n":"b"}}"#);
        dispatch_line("fs", &pending, "server booting...");
        dispatch_line("fs", &pending, r#"{"jsonrpc":"2.0","method":"notifications/progress"}"#);
        dispatch_line("fs", &pending, r#"{"jsonrpc":"2.0","id":"10","result":{"n":"a"}}"#);

        assert_eq!(rx_a.await.unwrap().result.unwrap()["n"], "a");
        assert_eq!(rx_b.await.unwrap().result.unwrap()["n"], "b");
        assert!(pending.is_empty());
    }

    #[test]
    fn test_extract_result_success() {
        let resp = response(serde_json::json!(1), serde_json::json!({"text": "hello"}));
        let result = extract_result(resp).unwrap();
        assert_eq!(result["text"], "hello");
    }

    #[test]
    fn test_extract_result_error() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: serde_json::json!(1),
            result: None,
            error: Some(super::super::types::JsonRpcError {
                code: -32601,
                message: "Method not found".into(),
                data: None,
            }),
        };
        let err = extract_result(resp).unwrap_err();
        match err {
            McpError::ServerError { code, message, .. } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            _ => panic!("expected ServerError"),
        }
    }

    #[test]
    fn test_extract_result_missing_both() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: serde_json::json!(1),
            result: None,
            error: None,
        };
        let err = extract_result(resp).unwrap_err();
        assert!(matches!(err, McpError::ServerError { .. }));
    }

    #[tokio::test]
    async fn test_stdio_request_round_trip() {
        let pool = ProcessPool::new();
        let config = ServerConfig::stdio("sh", &["-c", FAKE_SERVER_SCRIPT]);
        let transport = StdioTransport::connect(&pool, "fake", &config).await.unwrap();

        let resp = transport.request("initialize", None).await.unwrap();
        let result = extract_result(resp).unwrap();
        assert_eq!(result["serverInfo"]["name"], "fake");

        transport.close().await;
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_stdio_timeout_leaves_no_stale_entry() {
        let pool = ProcessPool::new();
        let config = ServerConfig::stdio("sh", &["-c", "cat > /dev/null"]);
        let transport = StdioTransport::connect(&pool, "silent", &config)
            .await
            .unwrap()
            .with_timeout(Duration::from_millis(100));

        let err = transport.request("tools/list", None).await.unwrap_err();
        assert!(matches!(err, McpError::Timeout { .. }));

        // The timeout is fatal to the call only: the process is still shared.
        let process = transport.handle().process().unwrap();
        assert!(process.pending().is_empty());
        assert!(!process.has_exited());

        transport.close().await;
    }

    #[tokio::test]
    async fn test_stdio_close_is_idempotent() {
        let pool = ProcessPool::new();
        let config = ServerConfig::stdio("cat", &[]);
        let transport = StdioTransport::connect(&pool, "cat", &config).await.unwrap();

        transport.close().await;
        transport.close().await;
        assert!(pool.is_empty());

        let err = transport.request("tools/list", None).await.unwrap_err();
        assert!(matches!(err, McpError::Closed { .. }));
    }

    #[tokio::test]
    async fn test_http_transport_closed_rejects_requests() {
        let transport =
            HttpTransport::new("web", "http://127.0.0.1:9/mcp", Duration::from_secs(1)).unwrap();
        transport.close().await;
        let err = transport.request("tools/list", None).await.unwrap_err();
        assert!(matches!(err, McpError::Closed { .. }));
        assert_eq!(transport.kind(), TransportKind::Http);
    }

    #[tokio::test]
    async fn test_http_transport_connection_refused_is_transport_error() {
        // Port 9 (discard) is essentially never listening on loopback.
        let transport =
            HttpTransport::new("web", "http://127.0.0.1:9/mcp", Duration::from_secs(2)).unwrap();
        let err = transport.request("tools/list", None).await.unwrap_err();
        assert!(matches!(
            err,
            McpError::TransportError { .. } | McpError::Timeout { .. }
        ));
    }

    #[tokio::test]
    async fn test_http_transport_posts_one_envelope_per_request() {
        let server = FakeHttpServer::start(mcp_http_responder).await;
        let transport = HttpTransport::new("web", &server.url, Duration::from_secs(5)).unwrap();

        let resp = transport.request("initialize", None).await.unwrap();
        assert_eq!(extract_result(resp).unwrap()["serverInfo"]["name"], "web");

        // An empty 202 is a valid answer to a notification.
        transport
            .notify("notifications/initialized", None)
            .await
            .unwrap();

        let bodies = server.bodies();
        assert_eq!(bodies.len(), 2);
        assert_eq!(bodies[0]["jsonrpc"], "2.0");
        assert_eq!(bodies[0]["method"], "initialize");
        assert!(bodies[0]["id"].is_u64());
        assert_eq!(bodies[1]["method"], "notifications/initialized");
        assert!(bodies[1].get("id").is_none());
    }

    #[tokio::test]
    async fn test_http_transport_rejects_mismatched_id() {
        let server = FakeHttpServer::start(|request| {
            let id = request["id"].as_u64().unwrap_or_default() + 1000;
            (
                200,
                serde_json::json!({"jsonrpc": "2.0", "id": id, "result": {}}).to_string(),
            )
        })
        .await;
        let transport = HttpTransport::new("web", &server.url, Duration::from_secs(5)).unwrap();

        let err = transport.request("tools/list", None).await.unwrap_err();
        match err {
            McpError::TransportError { reason, .. } => {
                assert!(reason.contains("does not match"), "{reason}")
            }
            other => panic!("expected TransportError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_http_transport_non_success_status() {
        let server = FakeHttpServer::start(|_| (503, "overloaded".to_string())).await;
        let transport = HttpTransport::new("web", &server.url, Duration::from_secs(5)).unwrap();

        let err = transport.request("tools/list", None).await.unwrap_err();
        match err {
            McpError::HttpStatus { status, body, .. } => {
                assert_eq!(status, 503);
                assert_eq!(body, "overloaded");
            }
            other => panic!("expected HttpStatus, got {other:?}"),
        }

        let err = transport.notify("notifications/initialized", None).await.unwrap_err();
        assert!(matches!(err, McpError::HttpStatus { status: 503, .. }));
    }
}
