//! Server-Sent Events framing and the SSE transport.
//!
//! The SSE transport serves both stdio servers (spawned by the proxy) and
//! remote SSE servers. The proxy's first `endpoint` event names the URL that
//! outbound messages are POSTed to; every later `message` event carries one
//! JSON-RPC message from the server.

use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, ACCEPT};
use reqwest::Url;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::transport::{status_error, Transport, INBOUND_CHANNEL_CAPACITY};
use super::types::JsonRpcMessage;

/// How long to wait for the proxy to announce the POST endpoint.
const ENDPOINT_TIMEOUT: Duration = Duration::from_secs(30);

// ─── SSE Decoder ────────────────────────────────────────────────────────────

/// One decoded SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// The `event:` field; `None` means the default `message` type.
    pub event: Option<String>,
    /// All `data:` lines joined with `\n`.
    pub data: String,
}

impl SseEvent {
    /// Whether this event carries a JSON-RPC message.
    pub fn is_message(&self) -> bool {
        matches!(self.event.as_deref(), None | Some("message"))
    }
}

/// Incremental SSE decoder; buffers partial events across chunk boundaries.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes and return every event it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some((end, sep_len)) = find_boundary(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..end + sep_len).collect();
            if let Some(event) = parse_block(&String::from_utf8_lossy(&block[..end])) {
                events.push(event);
            }
        }
        events
    }

    /// Flush whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        parse_block(String::from_utf8_lossy(&rest).trim_end())
    }
}

/// Position and length of the first blank-line separator.
fn find_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();

    for line in block.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            _ => {}
        }
    }

    if data.is_empty() {
        return None;
    }
    Some(SseEvent {
        event,
        data: data.join("\n"),
    })
}

/// Decode a `message` event and hand it to the session.
///
/// Returns `false` once the receiving side has gone away.
pub(crate) async fn forward_event(
    server: &str,
    event: SseEvent,
    tx: &mpsc::Sender<JsonRpcMessage>,
) -> bool {
    if !event.is_message() {
        tracing::debug!(server = %server, event = ?event.event, "ignoring sse event");
        return true;
    }
    match serde_json::from_str::<JsonRpcMessage>(&event.data) {
        Ok(message) => tx.send(message).await.is_ok(),
        Err(e) => {
            tracing::warn!(server = %server, error = %e, "dropping malformed message");
            true
        }
    }
}

/// Drain an SSE byte stream into the session channel until either side ends.
pub(crate) async fn pump_events<S, B>(
    server: &str,
    mut stream: S,
    mut decoder: SseDecoder,
    tx: &mpsc::Sender<JsonRpcMessage>,
) where
    S: Stream<Item = Result<B, reqwest::Error>> + Unpin,
    B: AsRef<[u8]>,
{
    while let Some(chunk) = stream.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "event stream read error");
                return;
            }
        };
        for event in decoder.push(bytes.as_ref()) {
            if !forward_event(server, event, tx).await {
                return;
            }
        }
    }
    if let Some(event) = decoder.finish() {
        forward_event(server, event, tx).await;
    }
}

// ─── SSE Transport ──────────────────────────────────────────────────────────

/// Transport over a proxy SSE stream plus POSTed messages.
pub struct SseTransport {
    server_name: String,
    stream_url: Url,
    http: reqwest::Client,
    headers: HeaderMap,
    post_url: RwLock<Option<Url>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SseTransport {
    pub fn new(server_name: &str, stream_url: Url, http: reqwest::Client, headers: HeaderMap) -> Self {
        Self {
            server_name: server_name.to_string(),
            stream_url,
            http,
            headers,
            post_url: RwLock::new(None),
            reader: Mutex::new(None),
        }
    }

    fn connection_error(&self, reason: impl Into<String>) -> McpError {
        McpError::ConnectionError {
            server: self.server_name.clone(),
            reason: reason.into(),
        }
    }

    /// Read until the `endpoint` event; returns the POST URL and any
    /// events that arrived alongside it.
    async fn await_endpoint<S, B>(
        &self,
        stream: &mut S,
        decoder: &mut SseDecoder,
    ) -> Result<(Url, Vec<SseEvent>), McpError>
    where
        S: Stream<Item = Result<B, reqwest::Error>> + Unpin,
        B: AsRef<[u8]>,
    {
        let mut early = Vec::new();
        loop {
            let chunk = match stream.next().await {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => return Err(self.connection_error(e.to_string())),
                None => {
                    return Err(self.connection_error("stream closed before endpoint event"))
                }
            };

            let mut events = decoder.push(chunk.as_ref()).into_iter();
            while let Some(event) = events.next() {
                if event.event.as_deref() == Some("endpoint") {
                    let url = self.stream_url.join(event.data.trim()).map_err(|e| {
                        self.connection_error(format!("invalid endpoint '{}': {e}", event.data))
                    })?;
                    early.extend(events);
                    return Ok((url, early));
                }
                early.push(event);
            }
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn start(&self) -> Result<mpsc::Receiver<JsonRpcMessage>, McpError> {
        let response = self
            .http
            .get(self.stream_url.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| self.connection_error(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(&self.server_name, status, &body));
        }

        let mut stream = Box::pin(response.bytes_stream());
        let mut decoder = SseDecoder::new();
        let (post_url, early) = tokio::time::timeout(
            ENDPOINT_TIMEOUT,
            self.await_endpoint(&mut stream, &mut decoder),
        )
        .await
        .map_err(|_| self.connection_error("timed out waiting for endpoint event"))??;

        tracing::debug!(server = %self.server_name, endpoint = %post_url, "sse endpoint received");
        *self.post_url.write().await = Some(post_url);

        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let server = self.server_name.clone();
        let handle = tokio::spawn(async move {
            for event in early {
                if !forward_event(&server, event, &tx).await {
                    return;
                }
            }
            pump_events(&server, stream, decoder, &tx).await;
            tracing::info!(server = %server, "sse stream closed");
        });
        *self.reader.lock().await = Some(handle);

        Ok(rx)
    }

    async fn send(&self, message: &JsonRpcMessage) -> Result<(), McpError> {
        let url = self
            .post_url
            .read()
            .await
            .clone()
            .ok_or_else(|| McpError::TransportError {
                server: self.server_name.clone(),
                reason: "transport not started".into(),
            })?;

        let response = self
            .http
            .post(url)
            .headers(self.headers.clone())
            .json(message)
            .send()
            .await
            .map_err(|e| McpError::TransportError {
                server: self.server_name.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(&self.server_name, status, &body));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), McpError> {
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
        *self.post_url.write().await = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_splits_events() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"event: endpoint\ndata: /message?sessionId=1\n\ndata: {}\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.as_deref(), Some("endpoint"));
        assert_eq!(events[0].data, "/message?sessionId=1");
        assert!(events[1].is_message());
    }

    #[test]
    fn test_decoder_buffers_partial_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"jsonrpc\":").is_empty());
        let events = decoder.push(b"\"2.0\"}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"jsonrpc\":\"2.0\"}");
    }

    #[test]
    fn test_decoder_handles_crlf_and_comments() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b": keep-alive\r\n\r\nevent: message\r\ndata: a\r\ndata: b\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "a\nb");
    }

    #[test]
    fn test_decoder_multibyte_split() {
        let mut decoder = SseDecoder::new();
        let bytes = "data: héllo\n\n".as_bytes();
        // Split inside the two-byte 'é'.
        assert!(decoder.push(&bytes[..8]).is_empty());
        let events = decoder.push(&bytes[8..]);
        assert_eq!(events[0].data, "héllo");
    }

    #[test]
    fn test_decoder_finish_flushes_tail() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: tail").is_empty());
        let event = decoder.finish().unwrap();
        assert_eq!(event.data, "tail");
        assert!(decoder.finish().is_none());
    }

    #[tokio::test]
    async fn test_forward_event_parses_message() {
        let (tx, mut rx) = mpsc::channel(4);
        let event = SseEvent {
            event: None,
            data: r#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#.into(),
        };
        assert!(forward_event("s", event, &tx).await);
        let message = rx.recv().await.unwrap();
        assert_eq!(message.method(), Some("notifications/tools/list_changed"));
    }

    #[tokio::test]
    async fn test_forward_event_skips_garbage() {
        let (tx, mut rx) = mpsc::channel(4);
        let event = SseEvent {
            event: Some("message".into()),
            data: "not json".into(),
        };
        assert!(forward_event("s", event, &tx).await);
        drop(tx);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_send_before_start_fails() {
        let transport = SseTransport::new(
            "s",
            Url::parse("http://localhost:1/sse").unwrap(),
            reqwest::Client::new(),
            HeaderMap::new(),
        );
        let message = JsonRpcMessage::Notification(
            crate::mcp_client::types::JsonRpcNotification::new("ping", None),
        );
        assert!(matches!(
            transport.send(&message).await,
            Err(McpError::TransportError { .. })
        ));
    }
}
