//! MCP Client error types.

use thiserror::Error;

use super::types::error_codes;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// The fronting proxy did not answer its health check.
    #[error("proxy at {proxy} is unavailable: {reason}")]
    ProxyUnavailable { proxy: String, reason: String },

    /// The server (or proxy) answered HTTP 401.
    #[error("server '{server}' requires authentication")]
    AuthenticationRequired { server: String },

    /// Authorization continues in an external browser flow.
    ///
    /// Not a terminal failure: the caller resumes with `connect` once the
    /// redirect completes.
    #[error("server '{server}' authorization continues at {authorization_url}")]
    AuthorizationRedirect {
        server: String,
        authorization_url: String,
    },

    /// A connection attempt failed. The caller decides whether to retry.
    #[error("connection to '{server}' failed: {reason}")]
    ConnectionError { server: String, reason: String },

    /// Low-level I/O or framing failure on an established transport.
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The server does not implement an optional feature.
    #[error("method not supported by server: {method}")]
    MethodNotSupported { method: String },

    /// No configuration exists for this server name.
    #[error("server not found: '{name}'")]
    ServerNotFound { name: String },

    /// No connected server advertises this tool.
    #[error("tool not found: '{name}'")]
    ToolNotFound { name: String },

    /// The server is configured but has no live connection.
    #[error("server '{name}' is not connected")]
    NotConnected { name: String },

    /// A request exceeded its per-request or total timeout.
    #[error("request '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Server configuration is malformed.
    #[error("invalid server config: {reason}")]
    InvalidConfig { reason: String },
}

impl McpError {
    /// Whether this failure is an HTTP 401 that may be cured by authorizing.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, McpError::AuthenticationRequired { .. })
    }

    /// Whether the server rejected the method as unknown (`-32601`).
    pub fn is_method_not_found(&self) -> bool {
        matches!(
            self,
            McpError::ServerError { code, .. } if *code == error_codes::METHOD_NOT_FOUND
        ) || matches!(self, McpError::MethodNotSupported { .. })
    }
}
