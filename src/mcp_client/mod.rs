//! MCP Client — connections to MCP servers through the MCP proxy.
//!
//! This module handles:
//! - Transports: stdio and SSE servers over the proxy's SSE stream,
//!   remote servers over streamable HTTP
//! - JSON-RPC 2.0 sessions with timeouts, progress and cancellation
//! - The per-server protocol client and its request history
//! - OAuth credentials for HTTP servers
//! - The multi-server connection registry and its tools cache

pub mod auth;
pub mod client;
pub mod errors;
pub mod history;
pub mod registry;
pub mod session;
pub mod sse;
pub mod streamable_http;
pub mod transport;
pub mod types;

#[cfg(test)]
pub mod testing;

// Re-exports for convenience
pub use auth::{AuthOutcome, CredentialProvider, TokenStore};
pub use client::{
    ClientHooks, ClientSettings, McpClient, NotificationSink, RootsProvider, SamplingHandler,
};
pub use errors::McpError;
pub use history::RequestHistoryEntry;
pub use registry::{plan_connection, ConnectPlan, ConnectionRegistry, ServerEvent};
pub use session::{CallOptions, Progress};
pub use transport::{Connector, ProxyConnector, Transport};
pub use types::{ConnectionStatus, Root, ServerConfig, Tool};
