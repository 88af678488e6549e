//! Fakes shared by the mcp_client and agent_core tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use super::errors::McpError;
use super::transport::Transport;
use super::types::{JsonRpcError, JsonRpcResponse, TransportKind};

/// A tiny MCP server in POSIX sh: answers initialize, tools/list and
/// tools/call, and reports -32601 for everything else.
pub(crate) const FAKE_SERVER_SCRIPT: &str = r##"
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9][0-9]*\).*/\1/p')
  [ -z "$id" ] && continue
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"fake","version":"0.1.0"}}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","description":"Echo text back","inputSchema":{"type":"object","properties":{"text":{"type":"string"}},"required":["text"]}}]}}\n' "$id" ;;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"echoed"}],"isError":false}}\n' "$id" ;;
    *)
      printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32601,"message":"Method not found"}}\n' "$id" ;;
  esac
done
"##;

/// [`FAKE_SERVER_SCRIPT`], except the process exits as soon as it reads a
/// `tools/call`, leaving that request unanswered.
pub(crate) fn crash_on_call_script() -> String {
    let answer = r#"printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"echoed"}],"isError":false}}\n' "$id" ;;"#;
    FAKE_SERVER_SCRIPT.replace(answer, "exit 0 ;;")
}

/// Scripted reply for one request.
#[derive(Clone)]
pub(crate) enum Reply {
    Result(Value),
    RpcError(i32, String),
    TransportFailure,
}

/// In-memory transport with per-method scripted replies.
///
/// Each method has a queue; the last reply in a queue repeats forever.
/// Methods with no script answer `-32601`, except `initialize`.
pub(crate) struct FakeTransport {
    server: String,
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    requests: Mutex<Vec<(String, Option<Value>)>>,
    notifications: Mutex<Vec<String>>,
    closes: AtomicUsize,
}

impl FakeTransport {
    pub(crate) fn new(server: &str) -> Self {
        let mut replies = HashMap::new();
        replies.insert(
            "initialize".to_string(),
            VecDeque::from([Reply::Result(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": server, "version": "0.1.0"}
            }))]),
        );
        Self {
            server: server.to_string(),
            replies: Mutex::new(replies),
            requests: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        }
    }

    /// Queue a reply for `method`.
    pub(crate) fn reply(self, method: &str, reply: Reply) -> Self {
        self.replies
            .lock()
            .unwrap()
            .entry(method.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    /// Replace the whole queue for `method`.
    pub(crate) fn set_replies(&self, method: &str, replies: Vec<Reply>) {
        self.replies
            .lock()
            .unwrap()
            .insert(method.to_string(), replies.into());
    }

    pub(crate) fn with_tools(self, tools: Value) -> Self {
        self.reply("tools/list", Reply::Result(json!({ "tools": tools })))
    }

    pub(crate) fn request_count(&self, method: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .count()
    }

    pub(crate) fn last_params(&self, method: &str) -> Option<Value> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(m, _)| m == method)
            .and_then(|(_, p)| p.clone())
    }

    pub(crate) fn notifications(&self) -> Vec<String> {
        self.notifications.lock().unwrap().clone()
    }

    pub(crate) fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn next_reply(&self, method: &str) -> Reply {
        let mut replies = self.replies.lock().unwrap();
        match replies.get_mut(method) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) if !queue.is_empty() => queue[0].clone(),
            _ => Reply::RpcError(-32601, "Method not found".into()),
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse, McpError> {
        self.requests
            .lock()
            .unwrap()
            .push((method.to_string(), params));

        let (result, error) = match self.next_reply(method) {
            Reply::Result(v) => (Some(v), None),
            Reply::RpcError(code, message) => (
                None,
                Some(JsonRpcError {
                    code,
                    message,
                    data: None,
                }),
            ),
            Reply::TransportFailure => {
                return Err(McpError::TransportError {
                    server: self.server.clone(),
                    reason: "broken pipe".into(),
                })
            }
        };

        Ok(JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: json!(1),
            result,
            error,
        })
    }

    async fn notify(&self, method: &str, _params: Option<Value>) -> Result<(), McpError> {
        self.notifications.lock().unwrap().push(method.to_string());
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }
}

/// A tool definition with one required string argument.
pub(crate) fn tool_json(name: &str, required: &str) -> Value {
    json!({
        "name": name,
        "description": format!("{name} tool"),
        "inputSchema": {
            "type": "object",
            "properties": { required: {"type": "string"} },
            "required": [required]
        }
    })
}

// ─── HTTP ────────────────────────────────────────────────────────────────────

type HttpResponder = dyn Fn(&Value) -> (u16, String) + Send + Sync;

/// Minimal HTTP/1.1 server on a loopback port. Every POST body is parsed as
/// JSON, recorded, and answered with whatever `respond` returns.
pub(crate) struct FakeHttpServer {
    pub(crate) url: String,
    bodies: Arc<Mutex<Vec<Value>>>,
}

impl FakeHttpServer {
    pub(crate) async fn start(
        respond: impl Fn(&Value) -> (u16, String) + Send + Sync + 'static,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/mcp", listener.local_addr().unwrap());
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let respond: Arc<HttpResponder> = Arc::new(respond);

        let seen = Arc::clone(&bodies);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let respond = Arc::clone(&respond);
                let seen = Arc::clone(&seen);
                tokio::spawn(async move {
                    let _ = serve_connection(stream, respond, seen).await;
                });
            }
        });

        Self { url, bodies }
    }

    /// Every request body received so far, in arrival order.
    pub(crate) fn bodies(&self) -> Vec<Value> {
        self.bodies.lock().unwrap().clone()
    }
}

async fn serve_connection(
    stream: TcpStream,
    respond: Arc<HttpResponder>,
    seen: Arc<Mutex<Vec<Value>>>,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }

        let mut content_length = 0usize;
        loop {
            line.clear();
            reader.read_line(&mut line).await?;
            let header = line.trim_end();
            if header.is_empty() {
                break;
            }
            if let Some((key, value)) = header.split_once(':') {
                if key.eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().unwrap_or(0);
                }
            }
        }

        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).await?;
        let request: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        seen.lock().unwrap().push(request.clone());

        let (status, reply) = respond(&request);
        let reason = match status {
            200 => "OK",
            202 => "Accepted",
            503 => "Service Unavailable",
            _ => "Status",
        };
        let head = format!(
            "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
            reply.len()
        );
        let stream = reader.get_mut();
        stream.write_all(head.as_bytes()).await?;
        stream.write_all(reply.as_bytes()).await?;
        stream.flush().await?;
    }
}

/// Answers the MCP handshake and listing calls over HTTP. `tools/call`
/// returns the text `http-ok`; notifications get an empty 202.
pub(crate) fn mcp_http_responder(request: &Value) -> (u16, String) {
    let Some(id) = request.get("id").cloned() else {
        return (202, String::new());
    };
    let method = request["method"].as_str().unwrap_or_default();
    let body = match method {
        "initialize" => json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "web", "version": "0.1.0"}
            }
        }),
        "tools/list" => json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {"tools": [{
                "name": "fetch",
                "description": "Fetch a page",
                "inputSchema": {"type": "object", "properties": {}}
            }]}
        }),
        "tools/call" => json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {"content": [{"type": "text", "text": "http-ok"}], "isError": false}
        }),
        _ => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": -32601, "message": "Method not found"}
        }),
    };
    (200, body.to_string())
}
