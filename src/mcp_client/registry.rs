//! Connection registry: named server configurations and their clients.
//!
//! Owns at most one [`McpClient`] per server name, aggregates connection
//! status, and caches each connected server's tool list so that listing
//! tools never touches the network.
//!
//! Callers must not overlap `connect`/`disconnect` for the same name.
//! Different servers are fully independent.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};

use super::auth::CredentialProvider;
use super::client::{ClientHooks, ClientSettings, McpClient, NotificationSink};
use super::errors::McpError;
use super::session::CallOptions;
use super::transport::Connector;
use super::types::{
    CallToolResult, ConnectionStatus, GetPromptResult, Prompt, ReadResourceResult, Resource,
    ServerConfig, Tool,
};

/// Capacity of the server event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

// ─── Events ─────────────────────────────────────────────────────────────────

/// Something changed on a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Connected { server: String },
    Disconnected { server: String },
    ToolsListChanged { server: String },
    ResourcesListChanged { server: String },
    PromptsListChanged { server: String },
}

/// Turns list-changed notifications into [`ServerEvent`]s, then forwards
/// to the caller's sink.
struct EventSink {
    events: broadcast::Sender<ServerEvent>,
    inner: Option<Arc<dyn NotificationSink>>,
}

impl NotificationSink for EventSink {
    fn on_notification(&self, server_name: &str, method: &str, params: Option<&Value>) {
        let server = server_name.to_string();
        let event = match method {
            "notifications/tools/list_changed" => Some(ServerEvent::ToolsListChanged { server }),
            "notifications/resources/list_changed" => {
                Some(ServerEvent::ResourcesListChanged { server })
            }
            "notifications/prompts/list_changed" => Some(ServerEvent::PromptsListChanged { server }),
            _ => None,
        };
        if let Some(event) = event {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
        if let Some(inner) = &self.inner {
            inner.on_notification(server_name, method, params);
        }
    }
}

// ─── Connection Planning ────────────────────────────────────────────────────

/// What `connect_to_server` does with an existing client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPlan {
    /// Already connected with the current config.
    Reuse,
    /// Reconnect the existing client; rebuild it if that fails.
    Reconnect,
    /// Build a fresh client.
    Create,
}

/// Decide how to reach `connected` from the current client state.
pub fn plan_connection(existing_status: Option<ConnectionStatus>, config_changed: bool) -> ConnectPlan {
    match existing_status {
        None => ConnectPlan::Create,
        Some(_) if config_changed => ConnectPlan::Create,
        Some(ConnectionStatus::Connected) => ConnectPlan::Reuse,
        Some(_) => ConnectPlan::Reconnect,
    }
}

// ─── ConnectionRegistry ─────────────────────────────────────────────────────

/// Registry of named MCP servers.
pub struct ConnectionRegistry {
    configs: RwLock<IndexMap<String, ServerConfig>>,
    clients: RwLock<HashMap<String, Arc<McpClient>>>,
    tools: RwLock<HashMap<String, Vec<Tool>>>,
    connector: Arc<dyn Connector>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    settings: ClientSettings,
    hooks: ClientHooks,
    events: broadcast::Sender<ServerEvent>,
}

impl ConnectionRegistry {
    pub fn new(
        connector: Arc<dyn Connector>,
        credentials: Option<Arc<dyn CredentialProvider>>,
        settings: ClientSettings,
        hooks: ClientHooks,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let hooks = ClientHooks {
            notifications: Some(Arc::new(EventSink {
                events: events.clone(),
                inner: hooks.notifications.clone(),
            })),
            ..hooks
        };
        Self {
            configs: RwLock::new(IndexMap::new()),
            clients: RwLock::new(HashMap::new()),
            tools: RwLock::new(HashMap::new()),
            connector,
            credentials,
            settings,
            hooks,
            events,
        }
    }

    /// Receive server events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Request options every client of this registry starts from.
    pub fn call_options(&self) -> CallOptions {
        self.settings.call_options()
    }

    fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    // ─── Configuration ───────────────────────────────────────────────────

    /// Insert or overwrite a server configuration. Does not connect.
    pub async fn add_server(&self, name: &str, config: ServerConfig) {
        let replaced = self
            .configs
            .write()
            .await
            .insert(name.to_string(), config)
            .is_some();
        tracing::info!(server = name, replaced, "server configured");
    }

    /// Configured server names, in configuration order.
    pub async fn server_names(&self) -> Vec<String> {
        self.configs.read().await.keys().cloned().collect()
    }

    pub async fn server_config(&self, name: &str) -> Option<ServerConfig> {
        self.configs.read().await.get(name).cloned()
    }

    /// Status of one server; `None` if it is not configured.
    pub async fn connection_status(&self, name: &str) -> Option<ConnectionStatus> {
        if !self.configs.read().await.contains_key(name) {
            return None;
        }
        match self.client(name).await {
            Some(client) => Some(client.status().await),
            None => Some(ConnectionStatus::Disconnected),
        }
    }

    /// The client for `name`, if one has been created.
    pub async fn client(&self, name: &str) -> Option<Arc<McpClient>> {
        self.clients.read().await.get(name).cloned()
    }

    // ─── Connections ─────────────────────────────────────────────────────

    /// Connect one server and cache its tools.
    ///
    /// A failed connect leaves no tools entry for the server. A failed
    /// `tools/list` after a successful connect caches an empty list and
    /// still returns the client: the server is usable for resources and
    /// prompts, and `refresh_tools` can retry the listing.
    pub async fn connect_to_server(&self, name: &str) -> Result<Arc<McpClient>, McpError> {
        let config = self
            .server_config(name)
            .await
            .ok_or_else(|| McpError::ServerNotFound {
                name: name.to_string(),
            })?;

        let existing = self.client(name).await;
        let (existing_status, config_changed) = match &existing {
            Some(client) => (Some(client.status().await), client.config() != &config),
            None => (None, false),
        };

        let plan = plan_connection(existing_status, config_changed);
        tracing::debug!(server = name, ?plan, "connecting");

        if let (ConnectPlan::Reuse, Some(client)) = (plan, &existing) {
            return Ok(Arc::clone(client));
        }

        let client = match self.establish(name, config, plan, existing).await {
            Ok(client) => client,
            Err(e) => {
                self.tools.write().await.remove(name);
                return Err(e);
            }
        };

        let tools = match client.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                tracing::warn!(server = name, error = %e, "failed to fetch tools, caching none");
                Vec::new()
            }
        };
        tracing::info!(server = name, tools = tools.len(), "server ready");
        self.tools.write().await.insert(name.to_string(), tools);
        self.emit(ServerEvent::Connected {
            server: name.to_string(),
        });
        Ok(client)
    }

    /// Reconnect the existing client or build a new one, per `plan`.
    async fn establish(
        &self,
        name: &str,
        config: ServerConfig,
        plan: ConnectPlan,
        existing: Option<Arc<McpClient>>,
    ) -> Result<Arc<McpClient>, McpError> {
        match (plan, existing) {
            (ConnectPlan::Reconnect, Some(client)) => match client.connect().await {
                Ok(()) => Ok(client),
                Err(e @ McpError::AuthorizationRedirect { .. }) => Err(e),
                Err(e) => {
                    tracing::warn!(server = name, error = %e, "reconnect failed, rebuilding client");
                    self.create_and_connect(name, config).await
                }
            },
            (_, existing) => {
                if let Some(old) = existing {
                    old.disconnect().await;
                }
                self.create_and_connect(name, config).await
            }
        }
    }

    async fn create_and_connect(
        &self,
        name: &str,
        config: ServerConfig,
    ) -> Result<Arc<McpClient>, McpError> {
        let client = Arc::new(McpClient::new(
            name,
            config,
            Arc::clone(&self.connector),
            self.credentials.clone(),
            self.settings.clone(),
            self.hooks.clone(),
        ));
        // Stored before connecting so a failure still reports its status.
        self.clients
            .write()
            .await
            .insert(name.to_string(), Arc::clone(&client));
        client.connect().await?;
        Ok(client)
    }

    /// Connect every configured server concurrently.
    ///
    /// Best effort: returns the servers that failed.
    pub async fn connect_to_all_servers(&self) -> Vec<(String, McpError)> {
        let names = self.server_names().await;
        let attempts = names.iter().map(|name| async move {
            let result = self.connect_to_server(name).await;
            (name.clone(), result)
        });

        let mut errors = Vec::new();
        for (name, result) in futures::future::join_all(attempts).await {
            if let Err(e) = result {
                tracing::warn!(server = %name, error = %e, "failed to connect");
                errors.push((name, e));
            }
        }
        errors
    }

    /// Disconnect one server. Its configuration is kept.
    pub async fn disconnect_from_server(&self, name: &str) -> Result<(), McpError> {
        if !self.configs.read().await.contains_key(name) {
            return Err(McpError::ServerNotFound {
                name: name.to_string(),
            });
        }
        if let Some(client) = self.client(name).await {
            client.disconnect().await;
        }
        self.tools.write().await.remove(name);
        self.emit(ServerEvent::Disconnected {
            server: name.to_string(),
        });
        Ok(())
    }

    /// Disconnect every server that has a client.
    pub async fn disconnect_from_all_servers(&self) {
        let names: Vec<String> = self.clients.read().await.keys().cloned().collect();
        let attempts = names.iter().map(|name| self.disconnect_from_server(name));
        for result in futures::future::join_all(attempts).await {
            if let Err(e) = result {
                tracing::debug!(error = %e, "disconnect skipped");
            }
        }
    }

    /// Disconnect and forget a server entirely. Returns whether it existed.
    pub async fn remove_server(&self, name: &str) -> bool {
        let client = self.clients.write().await.remove(name);
        if let Some(client) = client {
            client.disconnect().await;
        }
        self.tools.write().await.remove(name);
        let existed = self.configs.write().await.shift_remove(name).is_some();
        if existed {
            tracing::info!(server = name, "server removed");
            self.emit(ServerEvent::Disconnected {
                server: name.to_string(),
            });
        }
        existed
    }

    // ─── Tools Cache ─────────────────────────────────────────────────────

    /// Cached tools of every connected server, in configuration order.
    pub async fn get_all_tools(&self) -> Vec<(String, Vec<Tool>)> {
        let names = self.server_names().await;
        let mut result = Vec::new();
        for name in names {
            let Some(client) = self.client(&name).await else {
                continue;
            };
            if !client.is_connected().await {
                continue;
            }
            if let Some(tools) = self.tools.read().await.get(&name) {
                result.push((name, tools.clone()));
            }
        }
        result
    }

    /// Re-fetch one server's tool list, replacing the cached entry.
    pub async fn refresh_tools(&self, name: &str) -> Result<usize, McpError> {
        let client = self.connected_client(name).await?;
        let tools = client.list_tools().await?;
        let count = tools.len();
        self.tools.write().await.insert(name.to_string(), tools);
        tracing::info!(server = name, tools = count, "tools refreshed");
        Ok(count)
    }

    // ─── Routed Operations ───────────────────────────────────────────────

    async fn connected_client(&self, name: &str) -> Result<Arc<McpClient>, McpError> {
        if !self.configs.read().await.contains_key(name) {
            return Err(McpError::ServerNotFound {
                name: name.to_string(),
            });
        }
        self.client(name).await.ok_or_else(|| McpError::NotConnected {
            name: name.to_string(),
        })
    }

    pub async fn call_tool_on_server(
        &self,
        name: &str,
        tool_name: &str,
        arguments: Value,
        options: Option<CallOptions>,
    ) -> Result<CallToolResult, McpError> {
        let client = self.connected_client(name).await?;
        client.call_tool(tool_name, arguments, options).await
    }

    pub async fn read_resource_from_server(
        &self,
        name: &str,
        uri: &str,
    ) -> Result<ReadResourceResult, McpError> {
        self.connected_client(name).await?.read_resource(uri).await
    }

    pub async fn get_prompt_from_server(
        &self,
        name: &str,
        prompt: &str,
        arguments: Value,
    ) -> Result<GetPromptResult, McpError> {
        self.connected_client(name)
            .await?
            .get_prompt(prompt, arguments)
            .await
    }

    pub async fn list_resources_on_server(&self, name: &str) -> Result<Vec<Resource>, McpError> {
        self.connected_client(name).await?.list_resources().await
    }

    pub async fn list_prompts_on_server(&self, name: &str) -> Result<Vec<Prompt>, McpError> {
        self.connected_client(name).await?.list_prompts().await
    }

    /// Server that would serve `tool_name`: first connected match in
    /// configuration order.
    pub async fn find_tool_server(&self, tool_name: &str) -> Option<String> {
        self.get_all_tools()
            .await
            .into_iter()
            .find(|(_, tools)| tools.iter().any(|t| t.name == tool_name))
            .map(|(server, _)| server)
    }

    /// Call a tool on whichever connected server advertises it first.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Value,
        options: Option<CallOptions>,
    ) -> Result<CallToolResult, McpError> {
        let server = self
            .find_tool_server(tool_name)
            .await
            .ok_or_else(|| McpError::ToolNotFound {
                name: tool_name.to_string(),
            })?;
        tracing::debug!(server = %server, tool = tool_name, "routing tool call");
        self.call_tool_on_server(&server, tool_name, arguments, options)
            .await
    }

    /// `error` if any server errored, `connected` if all are, otherwise
    /// `disconnected`. An empty registry is `disconnected`.
    pub async fn get_overall_connection_status(&self) -> ConnectionStatus {
        let names = self.server_names().await;
        if names.is_empty() {
            return ConnectionStatus::Disconnected;
        }

        let mut all_connected = true;
        for name in &names {
            let status = match self.client(name).await {
                Some(client) => client.status().await,
                None => ConnectionStatus::Disconnected,
            };
            if status.is_error() {
                return ConnectionStatus::Error;
            }
            all_connected &= status == ConnectionStatus::Connected;
        }

        if all_connected {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        }
    }
}
