//! JSON-RPC session: request/response correlation over a [`Transport`].
//!
//! One reader task owns the inbound side of the transport and dispatches:
//! responses to the waiting request, progress notifications to the request
//! that asked for them, and everything else to the [`InboundHandler`].
//!
//! Requests are bounded by a per-request timeout that progress notifications
//! may reset, and by a total ceiling that nothing extends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::errors::McpError;
use super::transport::Transport;
use super::types::{
    error_codes, extract_result, JsonRpcError, JsonRpcMessage, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, RequestId,
};

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Default ceiling across progress-driven timeout resets.
pub const DEFAULT_MAX_TOTAL_TIMEOUT: Duration = Duration::from_millis(60_000);

// ─── Call Options ───────────────────────────────────────────────────────────

/// A `notifications/progress` payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Progress {
    pub progress: f64,
    #[serde(default)]
    pub total: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProgressNotification {
    progress_token: RequestId,
    #[serde(flatten)]
    progress: Progress,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelledNotification {
    request_id: RequestId,
    #[serde(default)]
    reason: Option<String>,
}

/// Callback invoked for each progress notification of a request.
pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

/// Per-call timeout, progress and cancellation settings.
#[derive(Clone)]
pub struct CallOptions {
    pub timeout: Duration,
    pub max_total_timeout: Duration,
    pub reset_timeout_on_progress: bool,
    pub cancel: Option<CancellationToken>,
    pub on_progress: Option<ProgressCallback>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REQUEST_TIMEOUT,
            max_total_timeout: DEFAULT_MAX_TOTAL_TIMEOUT,
            reset_timeout_on_progress: true,
            cancel: None,
            on_progress: None,
        }
    }
}

impl CallOptions {
    /// Attach a cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Attach a progress callback.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    fn wants_progress(&self) -> bool {
        self.on_progress.is_some() || self.reset_timeout_on_progress
    }
}

impl std::fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOptions")
            .field("timeout", &self.timeout)
            .field("max_total_timeout", &self.max_total_timeout)
            .field("reset_timeout_on_progress", &self.reset_timeout_on_progress)
            .field("cancel", &self.cancel.is_some())
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

// ─── Inbound Handling ───────────────────────────────────────────────────────

/// Receives server-initiated requests and notifications.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Answer a server request. `cancel` fires if the server cancels it.
    async fn handle_request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: CancellationToken,
    ) -> Result<Value, JsonRpcError>;

    /// React to a server notification.
    async fn handle_notification(&self, method: &str, params: Option<Value>);
}

// ─── Session ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct SessionState {
    pending: Mutex<HashMap<RequestId, oneshot::Sender<JsonRpcResponse>>>,
    progress: Mutex<HashMap<RequestId, mpsc::UnboundedSender<Progress>>>,
    inbound: Mutex<HashMap<RequestId, CancellationToken>>,
    closed: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A live JSON-RPC session with one server.
pub struct RpcSession {
    server_name: String,
    transport: Arc<dyn Transport>,
    next_id: AtomicI64,
    state: Arc<SessionState>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl RpcSession {
    /// Start the transport and the reader task.
    pub async fn start(
        server_name: &str,
        transport: Arc<dyn Transport>,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<Self, McpError> {
        let rx = transport.start().await?;
        let state = Arc::new(SessionState::default());

        let reader = tokio::spawn(read_loop(
            server_name.to_string(),
            rx,
            Arc::clone(&transport),
            Arc::clone(&state),
            handler,
        ));

        Ok(Self {
            server_name: server_name.to_string(),
            transport,
            next_id: AtomicI64::new(0),
            state,
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.is_cancelled()
    }

    /// Token that fires when the connection ends.
    pub fn closed(&self) -> CancellationToken {
        self.state.closed.clone()
    }

    /// Send a request and wait for its result.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        options: &CallOptions,
    ) -> Result<Value, McpError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, mut rx) = oneshot::channel();
        lock(&self.state.pending).insert(id.clone(), tx);

        let mut params = params;
        let mut progress_rx = None;
        if options.wants_progress() && params.as_ref().map_or(true, Value::is_object) {
            params = attach_progress_token(params, &id);
            let (ptx, prx) = mpsc::unbounded_channel();
            lock(&self.state.progress).insert(id.clone(), ptx);
            progress_rx = Some(prx);
        }

        let request = JsonRpcMessage::Request(JsonRpcRequest::new(id.clone(), method, params));

        // The clock starts before the send: a transport may hold the response
        // inside `send` (a JSON-bodied HTTP POST).
        let start = Instant::now();
        let hard_deadline = start + options.max_total_timeout;
        let mut deadline = (start + options.timeout).min(hard_deadline);
        let cancel = options.cancel.clone().unwrap_or_default();

        let send = self.transport.send(&request);
        tokio::pin!(send);
        let mut sent = false;

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(McpError::Cancelled),
                result = &mut send, if !sent => {
                    sent = true;
                    if let Err(e) = result {
                        break Err(e);
                    }
                }
                response = &mut rx => {
                    break match response {
                        Ok(response) => extract_result(response),
                        Err(_) => Err(self.closed_error()),
                    };
                }
                Some(progress) = next_progress(&mut progress_rx) => {
                    if let Some(callback) = &options.on_progress {
                        callback(progress);
                    }
                    if options.reset_timeout_on_progress {
                        deadline = (Instant::now() + options.timeout).min(hard_deadline);
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let limit = if deadline >= hard_deadline {
                        options.max_total_timeout
                    } else {
                        options.timeout
                    };
                    break Err(McpError::Timeout {
                        method: method.to_string(),
                        timeout_ms: limit.as_millis() as u64,
                    });
                }
            }
        };

        self.forget(&id);

        let reason = match &outcome {
            Err(McpError::Cancelled) => Some("Request cancelled"),
            Err(McpError::Timeout { .. }) => Some("Request timed out"),
            _ => None,
        };
        if let Some(reason) = reason {
            tracing::debug!(server = %self.server_name, method, id = %id, reason, "abandoning request");
            let note = JsonRpcMessage::Notification(JsonRpcNotification::new(
                "notifications/cancelled",
                Some(json!({ "requestId": id, "reason": reason })),
            ));
            // Best effort, off the caller's path: the server may be the one hanging.
            let transport = Arc::clone(&self.transport);
            let server = self.server_name.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.send(&note).await {
                    tracing::debug!(server = %server, error = %e, "failed to send cancellation");
                }
            });
        }

        outcome
    }

    /// Send a notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let note = JsonRpcNotification::new(method, params);
        self.transport
            .send(&JsonRpcMessage::Notification(note))
            .await
    }

    /// Close the transport and fail every waiting request.
    pub async fn close(&self) -> Result<(), McpError> {
        self.state.closed.cancel();
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
        lock(&self.state.pending).clear();
        lock(&self.state.progress).clear();
        for (_, token) in lock(&self.state.inbound).drain() {
            token.cancel();
        }
        self.transport.close().await
    }

    fn forget(&self, id: &RequestId) {
        lock(&self.state.pending).remove(id);
        lock(&self.state.progress).remove(id);
    }

    fn closed_error(&self) -> McpError {
        McpError::TransportError {
            server: self.server_name.clone(),
            reason: "connection closed".into(),
        }
    }
}

/// Put `_meta.progressToken` into the params. Params that cannot carry a
/// token (non-object params or `_meta`) are returned unchanged.
fn attach_progress_token(params: Option<Value>, id: &RequestId) -> Option<Value> {
    let mut params = params.unwrap_or_else(|| json!({}));
    if let Some(meta) = params
        .as_object_mut()
        .map(|obj| obj.entry("_meta").or_insert_with(|| json!({})))
        .and_then(Value::as_object_mut)
    {
        meta.insert("progressToken".into(), json!(id));
    }
    Some(params)
}

async fn next_progress(rx: &mut Option<mpsc::UnboundedReceiver<Progress>>) -> Option<Progress> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn read_loop(
    server_name: String,
    mut rx: mpsc::Receiver<JsonRpcMessage>,
    transport: Arc<dyn Transport>,
    state: Arc<SessionState>,
    handler: Arc<dyn InboundHandler>,
) {
    while let Some(message) = rx.recv().await {
        match message {
            JsonRpcMessage::Response(response) => {
                let waiter = lock(&state.pending).remove(&response.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => tracing::debug!(
                        server = %server_name,
                        id = %response.id,
                        "response for unknown request"
                    ),
                }
            }
            JsonRpcMessage::Notification(note) => match note.method.as_str() {
                "notifications/progress" => route_progress(&server_name, &state, note.params),
                "notifications/cancelled" => {
                    if let Some(cancelled) = note
                        .params
                        .and_then(|p| serde_json::from_value::<CancelledNotification>(p).ok())
                    {
                        tracing::debug!(
                            server = %server_name,
                            id = %cancelled.request_id,
                            reason = ?cancelled.reason,
                            "server cancelled request"
                        );
                        if let Some(token) = lock(&state.inbound).remove(&cancelled.request_id) {
                            token.cancel();
                        }
                    }
                }
                method => handler.handle_notification(method, note.params).await,
            },
            JsonRpcMessage::Request(request) => {
                if request.method == "ping" {
                    let response = JsonRpcResponse::success(request.id, json!({}));
                    if let Err(e) = transport.send(&JsonRpcMessage::Response(response)).await {
                        tracing::warn!(server = %server_name, error = %e, "failed to answer ping");
                    }
                    continue;
                }
                spawn_inbound(
                    server_name.clone(),
                    request,
                    Arc::clone(&transport),
                    Arc::clone(&state),
                    Arc::clone(&handler),
                );
            }
        }
    }

    tracing::info!(server = %server_name, "connection closed");
    state.closed.cancel();
    lock(&state.pending).clear();
    lock(&state.progress).clear();
}

fn route_progress(server_name: &str, state: &SessionState, params: Option<Value>) {
    let Some(note) = params.and_then(|p| serde_json::from_value::<ProgressNotification>(p).ok())
    else {
        tracing::debug!(server = %server_name, "malformed progress notification");
        return;
    };
    if let Some(tx) = lock(&state.progress).get(&note.progress_token) {
        let _ = tx.send(note.progress);
    }
}

fn spawn_inbound(
    server_name: String,
    request: JsonRpcRequest,
    transport: Arc<dyn Transport>,
    state: Arc<SessionState>,
    handler: Arc<dyn InboundHandler>,
) {
    let token = CancellationToken::new();
    lock(&state.inbound).insert(request.id.clone(), token.clone());

    tokio::spawn(async move {
        let JsonRpcRequest { id, method, params, .. } = request;
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            result = handler.handle_request(&method, params, token.clone()) => Some(result),
        };
        lock(&state.inbound).remove(&id);

        // A cancelled request gets no response.
        let Some(result) = result else {
            tracing::debug!(server = %server_name, method = %method, "inbound request cancelled");
            return;
        };
        let response = match result {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(error) => JsonRpcResponse::failure(id, error),
        };
        if let Err(e) = transport.send(&JsonRpcMessage::Response(response)).await {
            tracing::warn!(server = %server_name, method = %method, error = %e, "failed to answer request");
        }
    });
}

/// Standard error for inbound methods nobody handles.
pub fn method_not_found(method: &str) -> JsonRpcError {
    JsonRpcError::new(
        error_codes::METHOD_NOT_FOUND,
        format!("Method not found: {method}"),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::mcp_client::testing::{memory_pair, ServerEnd};

    struct NullHandler;

    #[async_trait]
    impl InboundHandler for NullHandler {
        async fn handle_request(
            &self,
            method: &str,
            _params: Option<Value>,
            cancel: CancellationToken,
        ) -> Result<Value, JsonRpcError> {
            if method == "slow" {
                cancel.cancelled().await;
            }
            Err(method_not_found(method))
        }

        async fn handle_notification(&self, _method: &str, _params: Option<Value>) {}
    }

    async fn session() -> (RpcSession, ServerEnd) {
        let (transport, server) = memory_pair();
        let session = RpcSession::start("test", transport, Arc::new(NullHandler))
            .await
            .unwrap();
        (session, server)
    }

    fn expect_request(message: JsonRpcMessage) -> JsonRpcRequest {
        match message {
            JsonRpcMessage::Request(r) => r,
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_request_receives_result() {
        let (session, mut server) = session().await;

        let options = CallOptions::default();
        let call = session.request("tools/list", None, &options);
        let reply = async {
            let req = expect_request(server.incoming.recv().await.unwrap());
            assert_eq!(req.method, "tools/list");
            server.respond(req.id, json!({ "tools": [] })).await;
        };
        let (result, _) = tokio::join!(call, reply);
        assert_eq!(result.unwrap(), json!({ "tools": [] }));
    }

    #[tokio::test]
    async fn test_out_of_order_responses_are_matched() {
        let (session, mut server) = session().await;
        let options = CallOptions::default();

        let first = session.request("a", None, &options);
        let second = session.request("b", None, &options);
        let reply = async {
            let a = expect_request(server.incoming.recv().await.unwrap());
            let b = expect_request(server.incoming.recv().await.unwrap());
            server.respond(b.id, json!("B")).await;
            server.respond(a.id, json!("A")).await;
        };
        let (a, b, _) = tokio::join!(first, second, reply);
        assert_eq!(a.unwrap(), json!("A"));
        assert_eq!(b.unwrap(), json!("B"));
    }

    #[tokio::test]
    async fn test_error_response_surfaces_server_error() {
        let (session, mut server) = session().await;
        let options = CallOptions::default();
        let call = session.request("nope", None, &options);
        let reply = async {
            let req = expect_request(server.incoming.recv().await.unwrap());
            server
                .fail(req.id, JsonRpcError::new(error_codes::METHOD_NOT_FOUND, "nope"))
                .await;
        };
        let (result, _) = tokio::join!(call, reply);
        assert!(result.unwrap_err().is_method_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_sends_cancelled_notification() {
        let (session, mut server) = session().await;
        let options = CallOptions {
            timeout: Duration::from_millis(100),
            reset_timeout_on_progress: false,
            ..CallOptions::default()
        };

        let err = session.request("slow", None, &options).await.unwrap_err();
        match err {
            McpError::Timeout { method, timeout_ms } => {
                assert_eq!(method, "slow");
                assert_eq!(timeout_ms, 100);
            }
            other => panic!("expected timeout, got {other:?}"),
        }

        let _request = server.incoming.recv().await.unwrap();
        match server.incoming.recv().await.unwrap() {
            JsonRpcMessage::Notification(n) => {
                assert_eq!(n.method, "notifications/cancelled");
                assert_eq!(n.params.unwrap()["reason"], "Request timed out");
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_resets_timeout_but_not_ceiling() {
        let (session, mut server) = session().await;
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let options = CallOptions {
            timeout: Duration::from_millis(100),
            max_total_timeout: Duration::from_millis(250),
            reset_timeout_on_progress: true,
            cancel: None,
            on_progress: Some(Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        };

        let call = session.request("long", None, &options);
        let drive = async {
            let req = expect_request(server.incoming.recv().await.unwrap());
            let token = req.params.as_ref().unwrap()["_meta"]["progressToken"].clone();
            // Keep sending progress every 80ms; only the ceiling can stop us.
            for step in 0..5 {
                tokio::time::sleep(Duration::from_millis(80)).await;
                server
                    .notify(
                        "notifications/progress",
                        json!({ "progressToken": token, "progress": step }),
                    )
                    .await;
            }
        };
        let (result, _) = tokio::join!(call, drive);
        match result.unwrap_err() {
            McpError::Timeout { timeout_ms, .. } => assert_eq!(timeout_ms, 250),
            other => panic!("expected ceiling timeout, got {other:?}"),
        }
        assert!(seen.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_cancel_token_aborts_request() {
        let (session, mut server) = session().await;
        let cancel = CancellationToken::new();
        let options = CallOptions::default().with_cancel(cancel.clone());

        let call = session.request("tools/call", Some(json!({ "name": "x" })), &options);
        let trigger = async {
            let _ = server.incoming.recv().await.unwrap();
            cancel.cancel();
        };
        let (result, _) = tokio::join!(call, trigger);
        assert!(matches!(result, Err(McpError::Cancelled)));

        match server.incoming.recv().await.unwrap() {
            JsonRpcMessage::Notification(n) => assert_eq!(n.method, "notifications/cancelled"),
            other => panic!("expected cancellation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_inbound_ping_and_unknown_method() {
        let (_session, mut server) = session().await;

        server.request(RequestId::Number(100), "ping", None).await;
        match server.incoming.recv().await.unwrap() {
            JsonRpcMessage::Response(r) => {
                assert_eq!(r.id, RequestId::Number(100));
                assert_eq!(r.result, Some(json!({})));
            }
            other => panic!("expected response, got {other:?}"),
        }

        server
            .request(RequestId::String("x".into()), "elicitation/create", None)
            .await;
        match server.incoming.recv().await.unwrap() {
            JsonRpcMessage::Response(r) => {
                assert_eq!(r.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_inbound_cancellation_suppresses_response() {
        let (_session, mut server) = session().await;

        server.request(RequestId::Number(5), "slow", None).await;
        server
            .notify("notifications/cancelled", json!({ "requestId": 5 }))
            .await;
        server.request(RequestId::Number(6), "ping", None).await;

        // The only reply is the ping; the slow request was cancelled.
        match server.incoming.recv().await.unwrap() {
            JsonRpcMessage::Response(r) => assert_eq!(r.id, RequestId::Number(6)),
            other => panic!("expected ping response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_closed_connection_fails_requests() {
        let (session, server) = session().await;
        drop(server);
        session.closed().cancelled().await;
        let err = session
            .request("ping", None, &CallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::TransportError { .. }));
    }

    #[test]
    fn test_attach_progress_token() {
        let params = attach_progress_token(Some(json!({ "name": "t" })), &RequestId::Number(3))
            .unwrap();
        assert_eq!(params["_meta"]["progressToken"], 3);
        assert_eq!(params["name"], "t");

        let empty = attach_progress_token(None, &RequestId::Number(1)).unwrap();
        assert_eq!(empty["_meta"]["progressToken"], 1);

        let unchanged = attach_progress_token(
            Some(json!({ "name": "t", "_meta": "x" })),
            &RequestId::Number(1),
        )
        .unwrap();
        assert_eq!(unchanged, json!({ "name": "t", "_meta": "x" }));
    }

    /// Accepts HTTP connections and never answers them.
    async fn silent_http_server() -> reqwest::Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        reqwest::Url::parse(&format!("http://{addr}/mcp")).unwrap()
    }

    async fn http_session(endpoint: reqwest::Url) -> RpcSession {
        use crate::mcp_client::streamable_http::{ReconnectionOptions, StreamableHttpTransport};

        let transport = Arc::new(StreamableHttpTransport::new(
            "silent",
            endpoint,
            reqwest::Client::new(),
            reqwest::header::HeaderMap::new(),
            ReconnectionOptions::default(),
        ));
        RpcSession::start("silent", transport, Arc::new(NullHandler))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_unanswered_http_post_times_out() {
        let session = http_session(silent_http_server().await).await;
        let options = CallOptions {
            timeout: Duration::from_millis(200),
            max_total_timeout: Duration::from_millis(400),
            ..CallOptions::default()
        };

        let result = tokio::time::timeout(
            Duration::from_secs(3),
            session.request("tools/call", Some(json!({ "name": "x" })), &options),
        )
        .await
        .expect("request should finish on its own deadline");
        match result.unwrap_err() {
            McpError::Timeout { method, timeout_ms } => {
                assert_eq!(method, "tools/call");
                assert_eq!(timeout_ms, 200);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_aborts_unanswered_http_post() {
        let session = http_session(silent_http_server().await).await;
        let cancel = CancellationToken::new();
        let options = CallOptions::default().with_cancel(cancel.clone());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(3),
            session.request("tools/call", Some(json!({ "name": "x" })), &options),
        )
        .await
        .expect("cancel should end the request");
        assert!(matches!(result, Err(McpError::Cancelled)));
    }
}
