//! Streamable HTTP transport.
//!
//! Every outbound message is a POST. The server answers with `202 Accepted`,
//! a JSON body, or an SSE stream of messages. The `mcp-session-id` header
//! from the initialize response is echoed on every later request. After the
//! handshake an optional standalone GET stream carries server-initiated
//! messages; it reconnects with bounded exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::errors::McpError;
use super::sse::{pump_events, SseDecoder};
use super::transport::{status_error, Transport, INBOUND_CHANNEL_CAPACITY};
use super::types::JsonRpcMessage;

/// Session header name.
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

// ─── Reconnection ───────────────────────────────────────────────────────────

/// Backoff policy for the standalone GET stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectionOptions {
    pub initial_delay: Duration,
    pub growth_factor: f64,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for ReconnectionOptions {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            growth_factor: 1.5,
            max_delay: Duration::from_millis(30_000),
            max_retries: 2,
        }
    }
}

impl ReconnectionOptions {
    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.growth_factor.powi(attempt as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

// ─── Transport ──────────────────────────────────────────────────────────────

struct Shared {
    server_name: String,
    endpoint: Url,
    http: reqwest::Client,
    headers: HeaderMap,
    session_id: RwLock<Option<String>>,
}

impl Shared {
    async fn request_headers(&self) -> HeaderMap {
        let mut headers = self.headers.clone();
        if let Some(sid) = self.session_id.read().await.as_deref() {
            if let Ok(value) = sid.parse() {
                headers.insert(SESSION_ID_HEADER, value);
            }
        }
        headers
    }

    fn transport_error(&self, reason: impl Into<String>) -> McpError {
        McpError::TransportError {
            server: self.server_name.clone(),
            reason: reason.into(),
        }
    }
}

/// MCP streamable HTTP client transport.
pub struct StreamableHttpTransport {
    shared: Arc<Shared>,
    reconnection: ReconnectionOptions,
    inbound: Mutex<Option<mpsc::Sender<JsonRpcMessage>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl StreamableHttpTransport {
    pub fn new(
        server_name: &str,
        endpoint: Url,
        http: reqwest::Client,
        headers: HeaderMap,
        reconnection: ReconnectionOptions,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                server_name: server_name.to_string(),
                endpoint,
                http,
                headers,
                session_id: RwLock::new(None),
            }),
            reconnection,
            inbound: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Session id assigned by the server, if any.
    pub async fn session_id(&self) -> Option<String> {
        self.shared.session_id.read().await.clone()
    }

    async fn sender(&self) -> Result<mpsc::Sender<JsonRpcMessage>, McpError> {
        self.inbound
            .lock()
            .await
            .clone()
            .ok_or_else(|| self.shared.transport_error("transport not started"))
    }

    async fn spawn(&self, task: impl std::future::Future<Output = ()> + Send + 'static) {
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = task => {}
            }
        });
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn start(&self) -> Result<mpsc::Receiver<JsonRpcMessage>, McpError> {
        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        *self.inbound.lock().await = Some(tx);
        Ok(rx)
    }

    async fn send(&self, message: &JsonRpcMessage) -> Result<(), McpError> {
        let tx = self.sender().await?;
        let shared = &self.shared;

        let response = shared
            .http
            .post(shared.endpoint.clone())
            .headers(shared.request_headers().await)
            .header(ACCEPT, "application/json, text/event-stream")
            .json(message)
            .send()
            .await
            .map_err(|e| shared.transport_error(e.to_string()))?;

        let status = response.status();
        if let Some(sid) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut current = shared.session_id.write().await;
            if current.as_deref() != Some(sid) {
                tracing::debug!(server = %shared.server_name, session_id = sid, "mcp session id");
                *current = Some(sid.to_string());
            }
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(&shared.server_name, status, &body));
        }

        if message.method() == Some("notifications/initialized") {
            let shared = Arc::clone(&self.shared);
            let options = self.reconnection.clone();
            let cancel = self.cancel.clone();
            let tx = tx.clone();
            self.spawn(run_standalone_stream(shared, options, cancel, tx))
                .await;
        }

        if status == StatusCode::ACCEPTED {
            return Ok(());
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.contains("text/event-stream") {
            let server = shared.server_name.clone();
            let stream = Box::pin(response.bytes_stream());
            self.spawn(async move {
                pump_events(&server, stream, SseDecoder::new(), &tx).await;
            })
            .await;
            return Ok(());
        }

        if content_type.contains("application/json") {
            let body = response
                .text()
                .await
                .map_err(|e| shared.transport_error(e.to_string()))?;
            for message in parse_json_body(&body)
                .map_err(|e| shared.transport_error(format!("invalid JSON response: {e}")))?
            {
                if tx.send(message).await.is_err() {
                    break;
                }
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), McpError> {
        self.cancel.cancel();
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.inbound.lock().await.take();

        let shared = &self.shared;
        let Some(sid) = shared.session_id.write().await.take() else {
            return Ok(());
        };

        let result = shared
            .http
            .delete(shared.endpoint.clone())
            .headers(shared.headers.clone())
            .header(SESSION_ID_HEADER, sid)
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() || resp.status() == StatusCode::METHOD_NOT_ALLOWED => {}
            Ok(resp) => {
                tracing::debug!(server = %shared.server_name, status = %resp.status(), "session delete refused");
            }
            Err(e) => {
                tracing::debug!(server = %shared.server_name, error = %e, "session delete failed");
            }
        }
        Ok(())
    }
}

/// A JSON response body holds either one message or a batch.
fn parse_json_body(body: &str) -> Result<Vec<JsonRpcMessage>, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(body)?;
    match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(serde_json::from_value)
            .collect(),
        other => Ok(vec![serde_json::from_value(other)?]),
    }
}

/// Keep the server-initiated GET stream open, retrying with backoff.
async fn run_standalone_stream(
    shared: Arc<Shared>,
    options: ReconnectionOptions,
    cancel: CancellationToken,
    tx: mpsc::Sender<JsonRpcMessage>,
) {
    let mut attempt: u32 = 0;
    loop {
        let result = shared
            .http
            .get(shared.endpoint.clone())
            .headers(shared.request_headers().await)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await;

        match result {
            Ok(resp) if resp.status() == StatusCode::METHOD_NOT_ALLOWED => {
                tracing::debug!(server = %shared.server_name, "server offers no standalone stream");
                return;
            }
            Ok(resp) if resp.status().is_success() => {
                attempt = 0;
                let stream = Box::pin(resp.bytes_stream());
                pump_events(&shared.server_name, stream, SseDecoder::new(), &tx).await;
                if tx.is_closed() {
                    return;
                }
            }
            Ok(resp) => {
                tracing::warn!(
                    server = %shared.server_name,
                    status = %resp.status(),
                    "standalone stream refused"
                );
            }
            Err(e) => {
                tracing::warn!(server = %shared.server_name, error = %e, "standalone stream failed");
            }
        }

        if attempt >= options.max_retries {
            tracing::warn!(
                server = %shared.server_name,
                retries = attempt,
                "giving up on standalone stream"
            );
            return;
        }
        let delay = options.delay_for_attempt(attempt);
        attempt += 1;
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_reconnection_options() {
        let options = ReconnectionOptions::default();
        assert_eq!(options.initial_delay, Duration::from_millis(1000));
        assert_eq!(options.max_delay, Duration::from_millis(30_000));
        assert_eq!(options.max_retries, 2);
        assert!((options.growth_factor - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let options = ReconnectionOptions::default();
        assert_eq!(options.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(options.delay_for_attempt(1), Duration::from_millis(1500));
        assert_eq!(options.delay_for_attempt(2), Duration::from_millis(2250));
        assert_eq!(options.delay_for_attempt(20), Duration::from_millis(30_000));
    }

    #[test]
    fn test_parse_json_body_single_and_batch() {
        let single = parse_json_body(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#).unwrap();
        assert_eq!(single.len(), 1);

        let batch = parse_json_body(
            r#"[{"jsonrpc":"2.0","method":"notifications/progress","params":{"progressToken":1,"progress":1}},
                {"jsonrpc":"2.0","id":1,"result":{}}]"#,
        )
        .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].method(), Some("notifications/progress"));
    }

    #[tokio::test]
    async fn test_send_before_start_fails() {
        let transport = StreamableHttpTransport::new(
            "s",
            Url::parse("http://localhost:1/mcp").unwrap(),
            reqwest::Client::new(),
            HeaderMap::new(),
            ReconnectionOptions::default(),
        );
        let message = JsonRpcMessage::Notification(
            crate::mcp_client::types::JsonRpcNotification::new("ping", None),
        );
        assert!(transport.send(&message).await.is_err());
        assert!(transport.session_id().await.is_none());
    }

    #[tokio::test]
    async fn test_close_without_session_is_noop() {
        let transport = StreamableHttpTransport::new(
            "s",
            Url::parse("http://localhost:1/mcp").unwrap(),
            reqwest::Client::new(),
            HeaderMap::new(),
            ReconnectionOptions::default(),
        );
        transport.start().await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();
    }
}
