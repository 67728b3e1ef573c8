//! Transport abstraction and the proxy connector.
//!
//! Every server is reached through the MCP proxy: stdio servers are spawned
//! by the proxy and tunnelled over SSE, remote servers are forwarded over SSE
//! or streamable HTTP. A [`Connector`] turns a [`ServerConfig`] into a live
//! [`Transport`]; the JSON-RPC session on top does not care which kind it got.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Url;
use serde::Deserialize;
use tokio::sync::mpsc;

use super::errors::McpError;
use super::sse::SseTransport;
use super::streamable_http::{ReconnectionOptions, StreamableHttpTransport};
use super::types::{HttpTransportKind, JsonRpcMessage, ServerConfig};

/// Timeout for establishing a TCP connection to the proxy.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the health probe.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Header carrying the proxy session token.
pub const PROXY_AUTH_HEADER: &str = "X-MCP-Proxy-Auth";

/// Capacity of the inbound message channel handed to the session.
pub const INBOUND_CHANNEL_CAPACITY: usize = 256;

// ─── Contracts ──────────────────────────────────────────────────────────────

/// A bidirectional JSON-RPC message pipe to one server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection and return the stream of inbound messages.
    ///
    /// Called exactly once, before any `send`.
    async fn start(&self) -> Result<mpsc::Receiver<JsonRpcMessage>, McpError>;

    /// Send one message to the server.
    async fn send(&self, message: &JsonRpcMessage) -> Result<(), McpError>;

    /// Tear the connection down. Must be safe to call more than once.
    async fn close(&self) -> Result<(), McpError>;
}

/// Authentication header attached to every request for a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthHeader {
    pub name: String,
    pub value: String,
}

impl AuthHeader {
    /// `{name}: Bearer {token}`.
    pub fn bearer(name: &str, token: &str) -> Self {
        Self {
            name: name.to_string(),
            value: format!("Bearer {token}"),
        }
    }
}

/// Builds transports for server configurations.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Fail with `ProxyUnavailable` unless the proxy answers healthy.
    async fn check_health(&self) -> Result<(), McpError>;

    /// Build a transport for `config`. The transport is not started.
    async fn open(
        &self,
        server_name: &str,
        config: &ServerConfig,
        auth: Option<&AuthHeader>,
    ) -> Result<Arc<dyn Transport>, McpError>;
}

// ─── Proxy Connector ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
}

/// Connector that routes every server through the MCP proxy.
pub struct ProxyConnector {
    base_url: Url,
    proxy_auth_token: Option<String>,
    http: reqwest::Client,
    reconnection: ReconnectionOptions,
}

impl ProxyConnector {
    /// Create a connector for the proxy at `base_url`.
    pub fn new(base_url: &str, proxy_auth_token: Option<String>) -> Result<Self, McpError> {
        let mut base_url = Url::parse(base_url).map_err(|e| McpError::InvalidConfig {
            reason: format!("invalid proxy url '{base_url}': {e}"),
        })?;
        // Endpoints are joined relative to the base, so it must end in '/'.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        // No overall request timeout: SSE streams stay open indefinitely.
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| McpError::InvalidConfig {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            base_url,
            proxy_auth_token,
            http,
            reconnection: ReconnectionOptions::default(),
        })
    }

    /// The proxy base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Proxy URL that serves the given server configuration.
    pub fn endpoint_url(&self, config: &ServerConfig) -> Result<Url, McpError> {
        build_endpoint_url(&self.base_url, config)
    }

    fn headers_for(
        &self,
        config: &ServerConfig,
        auth: Option<&AuthHeader>,
    ) -> Result<HeaderMap, McpError> {
        let mut headers = HeaderMap::new();

        if let ServerConfig::Http(http) = config {
            for (name, value) in &http.request_options.headers {
                insert_header(&mut headers, name, value)?;
            }
        }
        if let Some(auth) = auth {
            insert_header(&mut headers, &auth.name, &auth.value)?;
        }
        if let Some(token) = &self.proxy_auth_token {
            insert_header(&mut headers, PROXY_AUTH_HEADER, &format!("Bearer {token}"))?;
        }
        Ok(headers)
    }
}

#[async_trait]
impl Connector for ProxyConnector {
    async fn check_health(&self) -> Result<(), McpError> {
        let proxy = self.base_url.to_string();
        let url = self
            .base_url
            .join("health")
            .map_err(|e| McpError::ProxyUnavailable {
                proxy: proxy.clone(),
                reason: e.to_string(),
            })?;

        let mut request = self.http.get(url).timeout(HEALTH_TIMEOUT);
        if let Some(token) = &self.proxy_auth_token {
            request = request.header(PROXY_AUTH_HEADER, format!("Bearer {token}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| McpError::ProxyUnavailable {
                proxy: proxy.clone(),
                reason: e.to_string(),
            })?;

        let health: HealthResponse =
            response
                .json()
                .await
                .map_err(|e| McpError::ProxyUnavailable {
                    proxy: proxy.clone(),
                    reason: format!("invalid health response: {e}"),
                })?;

        if health.status != "ok" {
            return Err(McpError::ProxyUnavailable {
                proxy,
                reason: format!("health status '{}'", health.status),
            });
        }
        Ok(())
    }

    async fn open(
        &self,
        server_name: &str,
        config: &ServerConfig,
        auth: Option<&AuthHeader>,
    ) -> Result<Arc<dyn Transport>, McpError> {
        let url = self.endpoint_url(config)?;
        let headers = self.headers_for(config, auth)?;

        tracing::info!(
            server = %server_name,
            transport = config.transport_label(),
            url = %url,
            "opening transport"
        );

        let transport: Arc<dyn Transport> = match config {
            ServerConfig::Http(http) if http.transport == HttpTransportKind::StreamableHttp => {
                Arc::new(StreamableHttpTransport::new(
                    server_name,
                    url,
                    self.http.clone(),
                    headers,
                    self.reconnection.clone(),
                ))
            }
            _ => Arc::new(SseTransport::new(
                server_name,
                url,
                self.http.clone(),
                headers,
            )),
        };
        Ok(transport)
    }
}

/// Build the proxy endpoint for a server configuration.
///
/// Stdio arguments travel space-joined, the environment as a JSON object.
pub fn build_endpoint_url(base: &Url, config: &ServerConfig) -> Result<Url, McpError> {
    let path = match config {
        ServerConfig::Stdio(_) => "stdio",
        ServerConfig::Http(http) => match http.transport {
            HttpTransportKind::Sse => "sse",
            HttpTransportKind::StreamableHttp => "mcp",
        },
    };

    let mut url = base.join(path).map_err(|e| McpError::InvalidConfig {
        reason: format!("cannot build proxy url: {e}"),
    })?;

    {
        let mut query = url.query_pairs_mut();
        match config {
            ServerConfig::Stdio(stdio) => {
                let env = serde_json::to_string(&stdio.env).map_err(|e| {
                    McpError::InvalidConfig {
                        reason: format!("cannot encode env: {e}"),
                    }
                })?;
                query
                    .append_pair("command", &stdio.command)
                    .append_pair("args", &stdio.args.join(" "))
                    .append_pair("env", &env)
                    .append_pair("transportType", "stdio");
            }
            ServerConfig::Http(http) => {
                query
                    .append_pair("url", &http.url)
                    .append_pair("transportType", http.transport.as_str());
            }
        }
    }
    Ok(url)
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) -> Result<(), McpError> {
    let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| McpError::InvalidConfig {
        reason: format!("invalid header name '{name}': {e}"),
    })?;
    let value = HeaderValue::from_str(value).map_err(|e| McpError::InvalidConfig {
        reason: format!("invalid header value for '{name}': {e}"),
    })?;
    headers.insert(name, value);
    Ok(())
}

/// Map an HTTP error status to the matching `McpError`.
pub(crate) fn status_error(server: &str, status: reqwest::StatusCode, body: &str) -> McpError {
    if status == reqwest::StatusCode::UNAUTHORIZED {
        McpError::AuthenticationRequired {
            server: server.to_string(),
        }
    } else {
        McpError::TransportError {
            server: server.to_string(),
            reason: format!("HTTP {status}: {}", truncate(body, 200)),
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::mcp_client::types::{HttpConfig, RequestOptions, StdioConfig};

    fn base() -> Url {
        Url::parse("http://localhost:6277/").unwrap()
    }

    #[test]
    fn test_stdio_endpoint_url() {
        let mut env = HashMap::new();
        env.insert("API_KEY".to_string(), "secret".to_string());
        let config = ServerConfig::Stdio(StdioConfig {
            command: "npx".into(),
            args: vec!["-y".into(), "@modelcontextprotocol/server-everything".into()],
            env,
        });

        let url = build_endpoint_url(&base(), &config).unwrap();
        assert_eq!(url.path(), "/stdio");
        let pairs: HashMap<String, String> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["command"], "npx");
        assert_eq!(pairs["args"], "-y @modelcontextprotocol/server-everything");
        assert_eq!(pairs["transportType"], "stdio");
        let env: HashMap<String, String> = serde_json::from_str(&pairs["env"]).unwrap();
        assert_eq!(env["API_KEY"], "secret");
    }

    #[test]
    fn test_sse_endpoint_url() {
        let config = ServerConfig::http("https://remote.example/sse", HttpTransportKind::Sse);
        let url = build_endpoint_url(&base(), &config).unwrap();
        assert_eq!(url.path(), "/sse");
        let pairs: HashMap<String, String> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["url"], "https://remote.example/sse");
        assert_eq!(pairs["transportType"], "sse");
    }

    #[test]
    fn test_streamable_endpoint_url() {
        let config = ServerConfig::http(
            "https://remote.example/mcp",
            HttpTransportKind::StreamableHttp,
        );
        let url = build_endpoint_url(&base(), &config).unwrap();
        assert_eq!(url.path(), "/mcp");
        assert!(url.as_str().contains("transportType=streamable-http"));
    }

    #[test]
    fn test_headers_include_auth_and_proxy_token() {
        let connector =
            ProxyConnector::new("http://localhost:6277", Some("proxy-tok".into())).unwrap();
        let mut headers = HashMap::new();
        headers.insert("X-Custom".to_string(), "1".to_string());
        let config = ServerConfig::Http(HttpConfig {
            url: "https://remote.example/mcp".into(),
            transport: HttpTransportKind::StreamableHttp,
            request_options: RequestOptions { headers },
        });
        let auth = AuthHeader::bearer("Authorization", "abc");

        let map = connector.headers_for(&config, Some(&auth)).unwrap();
        assert_eq!(map["authorization"], "Bearer abc");
        assert_eq!(map["x-mcp-proxy-auth"], "Bearer proxy-tok");
        assert_eq!(map["x-custom"], "1");
    }

    #[test]
    fn test_proxy_base_path_is_preserved() {
        let connector = ProxyConnector::new("http://host:9000/proxy", None).unwrap();
        let config = ServerConfig::http("https://r.example/mcp", HttpTransportKind::Sse);
        let url = connector.endpoint_url(&config).unwrap();
        assert_eq!(url.path(), "/proxy/sse");
    }

    #[test]
    fn test_invalid_proxy_url() {
        assert!(matches!(
            ProxyConnector::new("not a url", None),
            Err(McpError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_status_error_maps_401() {
        let err = status_error("s", reqwest::StatusCode::UNAUTHORIZED, "");
        assert!(err.is_unauthorized());
        let err = status_error("s", reqwest::StatusCode::BAD_GATEWAY, "upstream down");
        assert!(err.to_string().contains("502"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("ok", 10), "ok");
    }
}
