//! In-memory test doubles: a paired transport, a scripted MCP server, and a
//! connector that hands out either.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::errors::McpError;
use super::transport::{AuthHeader, Connector, Transport};
use super::types::{
    error_codes, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, RequestId, ServerConfig, Tool,
};

// ─── Memory Transport ───────────────────────────────────────────────────────

/// Client half of an in-memory pipe.
pub struct MemoryTransport {
    inbound: Mutex<Option<mpsc::Receiver<JsonRpcMessage>>>,
    outbound: mpsc::UnboundedSender<JsonRpcMessage>,
    closed: AtomicBool,
}

/// Server half of an in-memory pipe.
pub struct ServerEnd {
    pub outgoing: mpsc::Sender<JsonRpcMessage>,
    pub incoming: mpsc::UnboundedReceiver<JsonRpcMessage>,
}

impl ServerEnd {
    pub async fn respond(&self, id: RequestId, result: Value) {
        let _ = self
            .outgoing
            .send(JsonRpcMessage::Response(JsonRpcResponse::success(id, result)))
            .await;
    }

    pub async fn fail(&self, id: RequestId, error: JsonRpcError) {
        let _ = self
            .outgoing
            .send(JsonRpcMessage::Response(JsonRpcResponse::failure(id, error)))
            .await;
    }

    pub async fn notify(&self, method: &str, params: Value) {
        let _ = self
            .outgoing
            .send(JsonRpcMessage::Notification(JsonRpcNotification::new(
                method,
                Some(params),
            )))
            .await;
    }

    pub async fn request(&self, id: RequestId, method: &str, params: Option<Value>) {
        let _ = self
            .outgoing
            .send(JsonRpcMessage::Request(JsonRpcRequest::new(id, method, params)))
            .await;
    }
}

/// Create a connected client transport / server end pair.
pub fn memory_pair() -> (Arc<MemoryTransport>, ServerEnd) {
    let (to_client, from_server) = mpsc::channel(64);
    let (to_server, from_client) = mpsc::unbounded_channel();
    let transport = Arc::new(MemoryTransport {
        inbound: Mutex::new(Some(from_server)),
        outbound: to_server,
        closed: AtomicBool::new(false),
    });
    let server = ServerEnd {
        outgoing: to_client,
        incoming: from_client,
    };
    (transport, server)
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn start(&self) -> Result<mpsc::Receiver<JsonRpcMessage>, McpError> {
        self.inbound
            .lock()
            .map_err(|_| transport_error("poisoned"))?
            .take()
            .ok_or_else(|| transport_error("already started"))
    }

    async fn send(&self, message: &JsonRpcMessage) -> Result<(), McpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(transport_error("closed"));
        }
        self.outbound
            .send(message.clone())
            .map_err(|_| transport_error("peer gone"))
    }

    async fn close(&self) -> Result<(), McpError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// A transport whose `start` always fails with the given error.
pub struct FailingTransport {
    make_error: Box<dyn Fn() -> McpError + Send + Sync>,
}

impl FailingTransport {
    pub fn unauthorized(server: &str) -> Self {
        let server = server.to_string();
        Self {
            make_error: Box::new(move || McpError::AuthenticationRequired {
                server: server.clone(),
            }),
        }
    }
}

#[async_trait]
impl Transport for FailingTransport {
    async fn start(&self) -> Result<mpsc::Receiver<JsonRpcMessage>, McpError> {
        Err((self.make_error)())
    }

    async fn send(&self, _message: &JsonRpcMessage) -> Result<(), McpError> {
        Err((self.make_error)())
    }

    async fn close(&self) -> Result<(), McpError> {
        Ok(())
    }
}

fn transport_error(reason: &str) -> McpError {
    McpError::TransportError {
        server: "memory".into(),
        reason: reason.into(),
    }
}

// ─── Fake MCP Server ────────────────────────────────────────────────────────

/// Scripted MCP server behaviour.
#[derive(Clone)]
pub struct FakeServer {
    pub capabilities: Value,
    pub tools: Vec<Tool>,
    pub completions_supported: bool,
    /// When false, `tools/list` fails with an internal error.
    pub tools_list_supported: bool,
    /// Every method received, in order.
    pub received: Arc<Mutex<Vec<String>>>,
}

impl Default for FakeServer {
    fn default() -> Self {
        Self {
            capabilities: json!({ "tools": {} }),
            tools: Vec::new(),
            completions_supported: true,
            tools_list_supported: true,
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl FakeServer {
    pub fn with_tools(names: &[&str]) -> Self {
        Self {
            tools: names.iter().map(|n| tool(n)).collect(),
            ..Self::default()
        }
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Serve requests on `end` until the client goes away.
    pub fn spawn(self, mut end: ServerEnd) {
        tokio::spawn(async move {
            while let Some(message) = end.incoming.recv().await {
                let (id, method, params) = match message {
                    JsonRpcMessage::Request(r) => (Some(r.id), r.method, r.params),
                    JsonRpcMessage::Notification(n) => (None, n.method, n.params),
                    JsonRpcMessage::Response(_) => continue,
                };
                if let Ok(mut received) = self.received.lock() {
                    received.push(method.clone());
                }
                let Some(id) = id else { continue };
                match self.answer(&method, params.unwrap_or(Value::Null)) {
                    Ok(result) => end.respond(id, result).await,
                    Err(error) => end.fail(id, error).await,
                }
            }
        });
    }

    fn answer(&self, method: &str, params: Value) -> Result<Value, JsonRpcError> {
        match method {
            "initialize" => Ok(json!({
                "protocolVersion": "2025-03-26",
                "capabilities": self.capabilities,
                "serverInfo": { "name": "fake", "version": "0.0.1" }
            })),
            "ping" => Ok(json!({})),
            "tools/list" if self.tools_list_supported => Ok(json!({ "tools": self.tools })),
            "tools/list" => Err(JsonRpcError::new(
                error_codes::INTERNAL_ERROR,
                "tool listing unavailable",
            )),
            "tools/call" => {
                let name = params["name"].as_str().unwrap_or_default();
                if !self.tools.iter().any(|t| t.name == name) {
                    return Err(JsonRpcError::new(
                        error_codes::INVALID_PARAMS,
                        format!("Unknown tool: {name}"),
                    ));
                }
                Ok(json!({
                    "content": [{ "type": "text", "text": format!("{name}:{}", params["arguments"]) }]
                }))
            }
            "resources/list" => Ok(json!({
                "resources": [{ "uri": "file:///readme.md", "name": "readme" }]
            })),
            "resources/read" => Ok(json!({
                "contents": [{ "uri": params["uri"], "text": "hello" }]
            })),
            "prompts/list" => Ok(json!({ "prompts": [{ "name": "greet" }] })),
            "prompts/get" => Ok(json!({
                "messages": [{ "role": "user", "content": { "type": "text", "text": "hi" } }]
            })),
            "completion/complete" if self.completions_supported => Ok(json!({
                "completion": { "values": ["alpha", "beta"], "hasMore": false }
            })),
            other => Err(JsonRpcError::new(
                error_codes::METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            )),
        }
    }
}

/// Tool descriptor with an empty object schema.
pub fn tool(name: &str) -> Tool {
    Tool {
        name: name.to_string(),
        description: Some(format!("{name} tool")),
        input_schema: json!({ "type": "object", "properties": {} }),
    }
}

// ─── Stub Connector ─────────────────────────────────────────────────────────

/// Connector that serves fake servers keyed by the first arg / url.
#[derive(Default)]
pub struct StubConnector {
    pub healthy: AtomicBool,
    servers: Mutex<HashMap<String, FakeServer>>,
    /// Servers that answer 401 unless given this bearer token.
    required_tokens: Mutex<HashMap<String, String>>,
    pub opened: AtomicUsize,
    /// Opens left to refuse before serving again.
    failing_opens: AtomicUsize,
    pub last_auth: Mutex<Option<AuthHeader>>,
}

impl StubConnector {
    pub fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            ..Self::default()
        }
    }

    pub fn unhealthy() -> Self {
        Self::default()
    }

    /// Register a fake server under `name`.
    pub fn serve(&self, name: &str, server: FakeServer) {
        if let Ok(mut servers) = self.servers.lock() {
            servers.insert(name.to_string(), server);
        }
    }

    /// Require `Bearer {token}` for `name`.
    pub fn require_token(&self, name: &str, token: &str) {
        if let Ok(mut tokens) = self.required_tokens.lock() {
            tokens.insert(name.to_string(), format!("Bearer {token}"));
        }
    }

    /// Refuse the next `count` opens with a connection error.
    pub fn fail_next_opens(&self, count: usize) {
        self.failing_opens.store(count, Ordering::SeqCst);
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for StubConnector {
    async fn check_health(&self) -> Result<(), McpError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(McpError::ProxyUnavailable {
                proxy: "stub".into(),
                reason: "connection refused".into(),
            })
        }
    }

    async fn open(
        &self,
        server_name: &str,
        _config: &ServerConfig,
        auth: Option<&AuthHeader>,
    ) -> Result<Arc<dyn Transport>, McpError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_auth.lock() {
            *last = auth.cloned();
        }
        if self
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(McpError::ConnectionError {
                server: server_name.to_string(),
                reason: "refused".into(),
            });
        }

        let required = self
            .required_tokens
            .lock()
            .ok()
            .and_then(|t| t.get(server_name).cloned());
        if let Some(required) = required {
            if auth.map(|a| a.value.as_str()) != Some(required.as_str()) {
                return Ok(Arc::new(FailingTransport::unauthorized(server_name)));
            }
        }

        let server = self
            .servers
            .lock()
            .ok()
            .and_then(|s| s.get(server_name).cloned())
            .ok_or_else(|| McpError::ConnectionError {
                server: server_name.to_string(),
                reason: "no fake server registered".into(),
            })?;

        let (transport, end) = memory_pair();
        server.spawn(end);
        Ok(transport)
    }
}
