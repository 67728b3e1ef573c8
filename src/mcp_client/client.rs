//! MCP Client: one logical connection to one MCP server.
//!
//! Owns transport selection (through a [`Connector`]), authentication header
//! injection, the initialize handshake, capability capture, and timed request
//! dispatch. Every request and notification lands in the request history.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::auth::{AuthOutcome, CredentialProvider};
use super::errors::McpError;
use super::history::{RequestHistory, RequestHistoryEntry};
use super::session::{method_not_found, CallOptions, InboundHandler, RpcSession};
use super::transport::{AuthHeader, Connector};
use super::types::{
    CallToolResult, CompleteResult, CompletionReference, ConnectionStatus, GetPromptResult,
    Implementation, InitializeResult, JsonRpcError, ListPromptsResult, ListResourceTemplatesResult,
    ListResourcesResult, ListToolsResult, LoggingLevel, Prompt, ReadResourceResult, Resource,
    Root, ServerCapabilities, ServerConfig, Tool, PROTOCOL_VERSION,
};

/// Name sent as `clientInfo.name`.
pub const CLIENT_NAME: &str = "mcpscope";

// ─── Hooks ──────────────────────────────────────────────────────────────────

/// Answers `sampling/createMessage` requests from servers.
#[async_trait]
pub trait SamplingHandler: Send + Sync {
    async fn create_message(
        &self,
        server_name: &str,
        params: Value,
        cancel: CancellationToken,
    ) -> Result<Value, JsonRpcError>;
}

/// Supplies the roots answered to `roots/list`.
#[async_trait]
pub trait RootsProvider: Send + Sync {
    async fn list_roots(&self) -> Vec<Root>;
}

/// Observes server notifications. Must not block.
pub trait NotificationSink: Send + Sync {
    fn on_notification(&self, server_name: &str, method: &str, params: Option<&Value>);
}

/// Callbacks installed on every connection a client makes.
#[derive(Clone, Default)]
pub struct ClientHooks {
    pub sampling: Option<Arc<dyn SamplingHandler>>,
    pub roots: Option<Arc<dyn RootsProvider>>,
    pub notifications: Option<Arc<dyn NotificationSink>>,
}

// ─── Settings ───────────────────────────────────────────────────────────────

/// Request and authentication defaults for a client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub request_timeout: Duration,
    pub max_total_timeout: Duration,
    pub reset_timeout_on_progress: bool,
    /// Header carrying the bearer token.
    pub auth_header_name: String,
    /// Explicit token; preferred over stored OAuth tokens.
    pub bearer_token: Option<String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(10_000),
            max_total_timeout: Duration::from_millis(60_000),
            reset_timeout_on_progress: true,
            auth_header_name: "Authorization".into(),
            bearer_token: None,
        }
    }
}

impl ClientSettings {
    /// Call options carrying these defaults.
    pub fn call_options(&self) -> CallOptions {
        CallOptions {
            timeout: self.request_timeout,
            max_total_timeout: self.max_total_timeout,
            reset_timeout_on_progress: self.reset_timeout_on_progress,
            cancel: None,
            on_progress: None,
        }
    }
}

// ─── Connection State ───────────────────────────────────────────────────────

/// Capabilities exist only inside the `Connected` variant.
enum ConnectionState {
    Disconnected,
    Connected {
        session: Arc<RpcSession>,
        capabilities: ServerCapabilities,
        server_info: Option<Implementation>,
        instructions: Option<String>,
    },
    Error {
        reason: String,
    },
    ErrorConnectingToProxy,
}

impl ConnectionState {
    fn status(&self) -> ConnectionStatus {
        match self {
            ConnectionState::Disconnected => ConnectionStatus::Disconnected,
            ConnectionState::Connected { .. } => ConnectionStatus::Connected,
            ConnectionState::Error { .. } => ConnectionStatus::Error,
            ConnectionState::ErrorConnectingToProxy => ConnectionStatus::ErrorConnectingToProxy,
        }
    }
}

struct Established {
    session: Arc<RpcSession>,
    init: InitializeResult,
}

// ─── McpClient ──────────────────────────────────────────────────────────────

/// Protocol client for a single server.
pub struct McpClient {
    server_name: String,
    config: ServerConfig,
    connector: Arc<dyn Connector>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    settings: ClientSettings,
    hooks: ClientHooks,
    state: Arc<RwLock<ConnectionState>>,
    history: RequestHistory,
    next_seq: AtomicU64,
    completions_enabled: AtomicBool,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("server_name", &self.server_name)
            .field("transport", &self.config.transport_label())
            .field("history_len", &self.history.len())
            .finish()
    }
}

impl McpClient {
    pub fn new(
        server_name: &str,
        config: ServerConfig,
        connector: Arc<dyn Connector>,
        credentials: Option<Arc<dyn CredentialProvider>>,
        settings: ClientSettings,
        hooks: ClientHooks,
    ) -> Self {
        Self {
            server_name: server_name.to_string(),
            config,
            connector,
            credentials,
            settings,
            hooks,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            history: RequestHistory::new(),
            next_seq: AtomicU64::new(0),
            completions_enabled: AtomicBool::new(true),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.state.read().await.status()
    }

    pub async fn is_connected(&self) -> bool {
        self.status().await == ConnectionStatus::Connected
    }

    /// Capabilities of the live connection; `None` unless connected.
    pub async fn capabilities(&self) -> Option<ServerCapabilities> {
        match &*self.state.read().await {
            ConnectionState::Connected { capabilities, .. } => Some(capabilities.clone()),
            _ => None,
        }
    }

    pub async fn server_info(&self) -> Option<Implementation> {
        match &*self.state.read().await {
            ConnectionState::Connected { server_info, .. } => server_info.clone(),
            _ => None,
        }
    }

    /// Server-supplied usage instructions from the handshake.
    pub async fn instructions(&self) -> Option<String> {
        match &*self.state.read().await {
            ConnectionState::Connected { instructions, .. } => instructions.clone(),
            _ => None,
        }
    }

    /// Reason for the last failed connect, if the client is in `error`.
    pub async fn last_error(&self) -> Option<String> {
        match &*self.state.read().await {
            ConnectionState::Error { reason } => Some(reason.clone()),
            _ => None,
        }
    }

    /// Every recorded request and notification, in issue order.
    pub fn history(&self) -> Vec<RequestHistoryEntry> {
        self.history.entries()
    }

    /// Default call options for this client.
    pub fn call_options(&self) -> CallOptions {
        self.settings.call_options()
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Connect, allowing one authorization retry after a 401.
    pub async fn connect(&self) -> Result<(), McpError> {
        self.connect_with_budget(1).await
    }

    /// Connect with an explicit authorization retry budget.
    pub fn connect_with_budget(
        &self,
        retry_budget: u32,
    ) -> Pin<Box<dyn Future<Output = Result<(), McpError>> + Send + '_>> {
        Box::pin(async move {
            if self.is_connected().await {
                return Ok(());
            }

            if let Err(e) = self.connector.check_health().await {
                tracing::warn!(server = %self.server_name, error = %e, "proxy health check failed");
                *self.state.write().await = ConnectionState::ErrorConnectingToProxy;
                return Err(e);
            }

            let auth = self.auth_header().await;
            match self.establish(auth.as_ref()).await {
                Ok(established) => {
                    self.install(established).await;
                    Ok(())
                }
                Err(e) if e.is_unauthorized() && self.config.url().is_some() => {
                    self.handle_unauthorized(retry_budget).await
                }
                Err(e) => {
                    let err = match e {
                        McpError::ConnectionError { .. } | McpError::AuthenticationRequired { .. } => e,
                        other => McpError::ConnectionError {
                            server: self.server_name.clone(),
                            reason: other.to_string(),
                        },
                    };
                    self.fail(&err).await;
                    Err(err)
                }
            }
        })
    }

    async fn handle_unauthorized(&self, retry_budget: u32) -> Result<(), McpError> {
        let url = self.config.url().unwrap_or_default().to_string();

        if retry_budget > 0 {
            if let Some(credentials) = &self.credentials {
                match credentials.authorize(&url).await {
                    AuthOutcome::Authorized => {
                        tracing::info!(server = %self.server_name, "authorized, retrying connect");
                        return self.connect_with_budget(retry_budget - 1).await;
                    }
                    AuthOutcome::Redirect { authorization_url } => {
                        tracing::info!(
                            server = %self.server_name,
                            url = %authorization_url,
                            "authorization continues in browser"
                        );
                        return Err(McpError::AuthorizationRedirect {
                            server: self.server_name.clone(),
                            authorization_url,
                        });
                    }
                    AuthOutcome::Denied => {}
                }
            }
        }

        let err = McpError::ConnectionError {
            server: self.server_name.clone(),
            reason: "authentication required".into(),
        };
        self.fail(&err).await;
        Err(err)
    }

    async fn fail(&self, err: &McpError) {
        tracing::warn!(server = %self.server_name, error = %err, "connect failed");
        *self.state.write().await = ConnectionState::Error {
            reason: err.to_string(),
        };
    }

    /// Open the transport and run the initialize handshake.
    async fn establish(&self, auth: Option<&AuthHeader>) -> Result<Established, McpError> {
        let transport = self
            .connector
            .open(&self.server_name, &self.config, auth)
            .await?;

        let handler = Arc::new(ClientInbound {
            server_name: self.server_name.clone(),
            hooks: self.hooks.clone(),
        });
        let session = Arc::new(RpcSession::start(&self.server_name, transport, handler).await?);

        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": self.client_capabilities(),
            "clientInfo": { "name": CLIENT_NAME, "version": env!("CARGO_PKG_VERSION") },
        });

        let handshake = async {
            let result = self
                .exchange(
                    Some(Arc::clone(&session)),
                    "initialize",
                    Some(params),
                    &self.call_options(),
                )
                .await?;
            let init: InitializeResult =
                serde_json::from_value(result).map_err(|e| McpError::ConnectionError {
                    server: self.server_name.clone(),
                    reason: format!("invalid initialize result: {e}"),
                })?;
            self.dispatch_notification(Some(&session), "notifications/initialized", None)
                .await?;
            Ok(init)
        };

        match handshake.await {
            Ok(init) => Ok(Established { session, init }),
            Err(e) => {
                if let Err(close_err) = session.close().await {
                    tracing::debug!(server = %self.server_name, error = %close_err, "close after failed handshake");
                }
                Err(e)
            }
        }
    }

    async fn install(&self, established: Established) {
        let Established { session, init } = established;
        tracing::info!(
            server = %self.server_name,
            transport = self.config.transport_label(),
            protocol = init.protocol_version.as_deref().unwrap_or("unknown"),
            "connected"
        );

        self.completions_enabled.store(true, Ordering::SeqCst);
        *self.state.write().await = ConnectionState::Connected {
            session: Arc::clone(&session),
            capabilities: init.capabilities,
            server_info: init.server_info,
            instructions: init.instructions,
        };

        // Flip to `error` if the transport dies underneath us.
        let state = Arc::clone(&self.state);
        let server = self.server_name.clone();
        tokio::spawn(async move {
            session.closed().cancelled().await;
            let mut state = state.write().await;
            let current = matches!(
                &*state,
                ConnectionState::Connected { session: live, .. } if Arc::ptr_eq(live, &session)
            );
            if current {
                tracing::warn!(server = %server, "connection lost");
                *state = ConnectionState::Error {
                    reason: "connection closed".into(),
                };
            }
        });
    }

    /// Close the connection. A no-op when already disconnected.
    pub async fn disconnect(&self) {
        let previous =
            std::mem::replace(&mut *self.state.write().await, ConnectionState::Disconnected);

        match previous {
            ConnectionState::Disconnected => return,
            ConnectionState::Connected { session, .. } => {
                if let Err(e) = session.close().await {
                    tracing::debug!(server = %self.server_name, error = %e, "error closing transport");
                }
            }
            ConnectionState::Error { .. } | ConnectionState::ErrorConnectingToProxy => {}
        }

        if let (Some(url), Some(credentials)) = (self.config.url(), &self.credentials) {
            credentials.clear(url).await;
        }
        tracing::info!(server = %self.server_name, "disconnected");
    }

    async fn auth_header(&self) -> Option<AuthHeader> {
        let url = self.config.url()?;
        let header = &self.settings.auth_header_name;

        if let Some(token) = &self.settings.bearer_token {
            return Some(AuthHeader::bearer(header, token));
        }
        let token = self.credentials.as_ref()?.access_token(url).await?;
        Some(AuthHeader::bearer(header, &token))
    }

    fn client_capabilities(&self) -> Value {
        let mut caps = serde_json::Map::new();
        if self.hooks.sampling.is_some() {
            caps.insert("sampling".into(), json!({}));
        }
        if self.hooks.roots.is_some() {
            caps.insert("roots".into(), json!({ "listChanged": true }));
        }
        Value::Object(caps)
    }

    // ─── Requests ────────────────────────────────────────────────────────

    async fn session(&self) -> Option<Arc<RpcSession>> {
        match &*self.state.read().await {
            ConnectionState::Connected { session, .. } => Some(Arc::clone(session)),
            _ => None,
        }
    }

    /// Send a request with explicit options.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        options: &CallOptions,
    ) -> Result<Value, McpError> {
        let session = self.session().await;
        self.exchange(session, method, params, options).await
    }

    /// Send a request and decode its result.
    pub async fn request_as<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
        options: &CallOptions,
    ) -> Result<T, McpError> {
        let value = self.request(method, params, options).await?;
        serde_json::from_value(value).map_err(|e| McpError::ServerError {
            code: super::types::error_codes::INVALID_PARAMS,
            message: format!("unexpected '{method}' result: {e}"),
            data: None,
        })
    }

    /// Send a notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let session = self.session().await;
        self.dispatch_notification(session.as_ref(), method, params)
            .await
    }

    async fn exchange(
        &self,
        session: Option<Arc<RpcSession>>,
        method: &str,
        params: Option<Value>,
        options: &CallOptions,
    ) -> Result<Value, McpError> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let request = history_request(method, params.as_ref());
        let timestamp = chrono::Utc::now();
        let start = Instant::now();

        let result = match session {
            Some(session) => session.request(method, params, options).await,
            None => Err(McpError::NotConnected {
                name: self.server_name.clone(),
            }),
        };

        let latency_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => tracing::debug!(server = %self.server_name, method, latency_ms, "request ok"),
            Err(e) => tracing::debug!(server = %self.server_name, method, latency_ms, error = %e, "request failed"),
        }
        self.history.record(
            seq,
            RequestHistoryEntry {
                request,
                response: result.as_ref().ok().cloned(),
                error: result.as_ref().err().map(|e| e.to_string()),
                timestamp,
                latency_ms: Some(latency_ms),
            },
        );
        result
    }

    async fn dispatch_notification(
        &self,
        session: Option<&Arc<RpcSession>>,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), McpError> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let request = history_request(method, params.as_ref());
        let timestamp = chrono::Utc::now();

        let result = match session {
            Some(session) => session.notify(method, params).await,
            None => Err(McpError::NotConnected {
                name: self.server_name.clone(),
            }),
        };

        if let Err(e) = &result {
            tracing::warn!(server = %self.server_name, method, error = %e, "notification failed");
        }
        self.history.record(
            seq,
            RequestHistoryEntry {
                request,
                response: None,
                error: result.as_ref().err().map(|e| e.to_string()),
                timestamp,
                latency_ms: None,
            },
        );
        result
    }

    async fn list_all<P, I>(
        &self,
        method: &str,
        into_page: impl Fn(P) -> (Vec<I>, Option<String>),
    ) -> Result<Vec<I>, McpError>
    where
        P: DeserializeOwned,
    {
        let options = self.call_options();
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let page: P = self.request_as(method, params, &options).await?;
            let (mut batch, next) = into_page(page);
            items.append(&mut batch);
            match next {
                Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
                _ => return Ok(items),
            }
        }
    }

    // ─── Capability Operations ───────────────────────────────────────────

    pub async fn ping(&self) -> Result<(), McpError> {
        self.request("ping", None, &self.call_options())
            .await
            .map(|_| ())
    }

    /// Every tool the server offers, following pagination.
    pub async fn list_tools(&self) -> Result<Vec<Tool>, McpError> {
        self.list_all("tools/list", |page: ListToolsResult| {
            (page.tools, page.next_cursor)
        })
        .await
    }

    /// Call a tool. `options` overrides the client defaults.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        options: Option<CallOptions>,
    ) -> Result<CallToolResult, McpError> {
        let options = options.unwrap_or_else(|| self.call_options());
        self.request_as(
            "tools/call",
            Some(json!({ "name": name, "arguments": arguments })),
            &options,
        )
        .await
    }

    pub async fn list_resources(&self) -> Result<Vec<Resource>, McpError> {
        self.list_all("resources/list", |page: ListResourcesResult| {
            (page.resources, page.next_cursor)
        })
        .await
    }

    pub async fn list_resource_templates(&self) -> Result<Vec<Value>, McpError> {
        self.list_all(
            "resources/templates/list",
            |page: ListResourceTemplatesResult| (page.resource_templates, page.next_cursor),
        )
        .await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, McpError> {
        self.request_as(
            "resources/read",
            Some(json!({ "uri": uri })),
            &self.call_options(),
        )
        .await
    }

    pub async fn subscribe_resource(&self, uri: &str) -> Result<(), McpError> {
        self.request("resources/subscribe", Some(json!({ "uri": uri })), &self.call_options())
            .await
            .map(|_| ())
    }

    pub async fn unsubscribe_resource(&self, uri: &str) -> Result<(), McpError> {
        self.request("resources/unsubscribe", Some(json!({ "uri": uri })), &self.call_options())
            .await
            .map(|_| ())
    }

    pub async fn list_prompts(&self) -> Result<Vec<Prompt>, McpError> {
        self.list_all("prompts/list", |page: ListPromptsResult| {
            (page.prompts, page.next_cursor)
        })
        .await
    }

    pub async fn get_prompt(&self, name: &str, arguments: Value) -> Result<GetPromptResult, McpError> {
        self.request_as(
            "prompts/get",
            Some(json!({ "name": name, "arguments": arguments })),
            &self.call_options(),
        )
        .await
    }

    pub async fn set_logging_level(&self, level: LoggingLevel) -> Result<(), McpError> {
        self.request("logging/setLevel", Some(json!({ "level": level })), &self.call_options())
            .await
            .map(|_| ())
    }

    /// Argument completion.
    ///
    /// If the server answers "method not found", completions stay disabled
    /// for the rest of this connection and an empty result is returned.
    pub async fn complete(
        &self,
        reference: &CompletionReference,
        argument_name: &str,
        value: &str,
        cancel: Option<CancellationToken>,
    ) -> Result<CompleteResult, McpError> {
        if !self.completions_enabled.load(Ordering::SeqCst) {
            return Ok(CompleteResult::default());
        }

        let mut options = self.call_options();
        options.cancel = cancel;
        let params = json!({
            "ref": reference,
            "argument": { "name": argument_name, "value": value },
        });

        match self.request_as("completion/complete", Some(params), &options).await {
            Ok(result) => Ok(result),
            Err(e) if e.is_method_not_found() => {
                tracing::info!(server = %self.server_name, "server does not support completions");
                self.completions_enabled.store(false, Ordering::SeqCst);
                Ok(CompleteResult::default())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn send_roots_list_changed(&self) -> Result<(), McpError> {
        self.notify("notifications/roots/list_changed", None).await
    }
}

fn history_request(method: &str, params: Option<&Value>) -> Value {
    match params {
        Some(params) => json!({ "method": method, "params": params }),
        None => json!({ "method": method }),
    }
}

// ─── Inbound Traffic ────────────────────────────────────────────────────────

/// Routes server-initiated traffic to the client hooks.
struct ClientInbound {
    server_name: String,
    hooks: ClientHooks,
}

#[async_trait]
impl InboundHandler for ClientInbound {
    async fn handle_request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: CancellationToken,
    ) -> Result<Value, JsonRpcError> {
        match (method, &self.hooks.sampling, &self.hooks.roots) {
            ("sampling/createMessage", Some(sampling), _) => {
                sampling
                    .create_message(&self.server_name, params.unwrap_or(Value::Null), cancel)
                    .await
            }
            ("roots/list", _, Some(roots)) => {
                let roots = roots.list_roots().await;
                Ok(json!({ "roots": roots }))
            }
            _ => Err(method_not_found(method)),
        }
    }

    async fn handle_notification(&self, method: &str, params: Option<Value>) {
        match method {
            "notifications/message" => {
                let level = params
                    .as_ref()
                    .and_then(|p| p.get("level"))
                    .and_then(|l| l.as_str())
                    .unwrap_or("info");
                let data = params
                    .as_ref()
                    .and_then(|p| p.get("data"))
                    .cloned()
                    .unwrap_or(Value::Null);
                match level {
                    "debug" => tracing::debug!(server = %self.server_name, data = %data, "server log"),
                    "info" | "notice" => {
                        tracing::info!(server = %self.server_name, data = %data, "server log")
                    }
                    "warning" => tracing::warn!(server = %self.server_name, data = %data, "server log"),
                    _ => tracing::error!(server = %self.server_name, level, data = %data, "server log"),
                }
            }
            "notifications/stderr" => {
                let content = params
                    .as_ref()
                    .and_then(|p| p.get("content"))
                    .and_then(|c| c.as_str())
                    .unwrap_or_default();
                tracing::info!(server = %self.server_name, stderr = content, "server stderr");
            }
            other => tracing::debug!(server = %self.server_name, method = other, "notification"),
        }

        if let Some(sink) = &self.hooks.notifications {
            sink.on_notification(&self.server_name, method, params.as_ref());
        }
    }
}
